/*!
 * Adapter Settings
 * Name, power and visibility editing for local adapters
 */

use serde::{Deserialize, Serialize};

use crate::model::Adapter;

pub const MIN_VISIBLE_MINUTES: u32 = 1;
pub const MAX_VISIBLE_MINUTES: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Visibility {
    Hidden,
    AlwaysVisible,
    Temporary { minutes: u32 },
}

impl Visibility {
    pub fn of(adapter: &Adapter) -> Self {
        if !adapter.discoverable {
            Self::Hidden
        } else if adapter.discoverable_timeout == 0 {
            Self::AlwaysVisible
        } else {
            Self::Temporary {
                minutes: clamp_minutes(adapter.discoverable_timeout / 60),
            }
        }
    }

    pub fn discoverable(&self) -> bool {
        !matches!(self, Self::Hidden)
    }

    /// Discoverable timeout in seconds. Hidden leaves the timeout untouched.
    pub fn timeout_secs(&self) -> Option<u32> {
        match self {
            Self::Hidden => None,
            Self::AlwaysVisible => Some(0),
            Self::Temporary { minutes } => Some(clamp_minutes(*minutes) * 60),
        }
    }

    fn normalized(self) -> Self {
        match self {
            Self::Temporary { minutes } => Self::Temporary {
                minutes: clamp_minutes(minutes),
            },
            other => other,
        }
    }
}

fn clamp_minutes(minutes: u32) -> u32 {
    minutes.clamp(MIN_VISIBLE_MINUTES, MAX_VISIBLE_MINUTES)
}

/// A single remote property write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterChange {
    Name(String),
    Powered(bool),
    Discoverable(bool),
    DiscoverableTimeout(u32),
}

impl AdapterChange {
    /// BlueZ property written by this change.
    pub fn property(&self) -> &'static str {
        match self {
            Self::Name(_) => "Alias",
            Self::Powered(_) => "Powered",
            Self::Discoverable(_) => "Discoverable",
            Self::DiscoverableTimeout(_) => "DiscoverableTimeout",
        }
    }
}

/// Partial update as sent by clients. Missing fields keep the current value,
/// or the default value when `defaults` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AdapterUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub powered: Option<bool>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
    #[serde(default)]
    pub defaults: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterSettings {
    pub name: String,
    pub powered: bool,
    pub visibility: Visibility,
}

impl AdapterSettings {
    pub fn from_adapter(adapter: &Adapter) -> Self {
        Self {
            name: adapter.name.clone(),
            powered: adapter.powered,
            visibility: Visibility::of(adapter),
        }
    }

    pub fn defaults(adapter: &Adapter) -> Self {
        let name = if adapter.system_name.is_empty() {
            adapter.name.clone()
        } else {
            adapter.system_name.clone()
        };
        Self {
            name,
            powered: true,
            visibility: Visibility::AlwaysVisible,
        }
    }

    pub fn resolve(adapter: &Adapter, update: &AdapterUpdate) -> Self {
        let mut settings = if update.defaults {
            Self::defaults(adapter)
        } else {
            Self::from_adapter(adapter)
        };
        if let Some(name) = &update.name {
            settings.name = name.clone();
        }
        if let Some(powered) = update.powered {
            settings.powered = powered;
        }
        if let Some(visibility) = update.visibility {
            settings.visibility = visibility;
        }
        settings
    }

    /// The writes needed to bring `adapter` to these settings, nothing more.
    pub fn changes_against(&self, adapter: &Adapter) -> Vec<AdapterChange> {
        let mut changes = Vec::new();

        if self.name != adapter.name && !self.name.trim().is_empty() {
            changes.push(AdapterChange::Name(self.name.clone()));
        }

        let wanted = self.visibility.normalized();
        if wanted != Visibility::of(adapter) {
            if wanted.discoverable() != adapter.discoverable {
                changes.push(AdapterChange::Discoverable(wanted.discoverable()));
            }
            if let Some(timeout) = wanted.timeout_secs() {
                if timeout != adapter.discoverable_timeout {
                    changes.push(AdapterChange::DiscoverableTimeout(timeout));
                }
            }
        }

        if self.powered != adapter.powered {
            changes.push(AdapterChange::Powered(self.powered));
        }

        changes
    }
}

/// Returns the `hciN` part of an adapter or device path such as
/// `/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF`; empty if there is none.
pub fn hci_name(ubi: &str) -> &str {
    let Some(start) = ubi.find("/hci") else {
        return "";
    };
    let rest = &ubi[start + 1..];
    match rest.find('/') {
        Some(end) => &rest[..end],
        None => rest,
    }
}

/// Display title, e.g. `thinkpad (00:11:22:33:44:55) - hci0`.
pub fn title(adapter: &Adapter) -> String {
    let name = if adapter.system_name.is_empty() {
        &adapter.name
    } else {
        &adapter.system_name
    };
    match hci_name(&adapter.ubi) {
        "" => format!("{} ({})", name, adapter.address),
        hci => format!("{} ({}) - {}", name, adapter.address, hci),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(discoverable: bool, timeout: u32) -> Adapter {
        Adapter {
            ubi: "/org/bluez/hci0".into(),
            name: "desk".into(),
            system_name: "thinkpad".into(),
            address: "00:11:22:33:44:55".into(),
            powered: true,
            discoverable,
            discoverable_timeout: timeout,
            discovering: false,
        }
    }

    #[test]
    fn visibility_is_derived_from_adapter() {
        assert_eq!(Visibility::of(&adapter(false, 120)), Visibility::Hidden);
        assert_eq!(Visibility::of(&adapter(true, 0)), Visibility::AlwaysVisible);
        assert_eq!(Visibility::of(&adapter(true, 180)), Visibility::Temporary { minutes: 3 });
        assert_eq!(Visibility::of(&adapter(true, 30)), Visibility::Temporary { minutes: 1 });
        assert_eq!(Visibility::of(&adapter(true, 7200)), Visibility::Temporary { minutes: 30 });
    }

    #[test]
    fn unchanged_settings_produce_no_writes() {
        for current in [adapter(false, 120), adapter(true, 0), adapter(true, 90)] {
            let settings = AdapterSettings::from_adapter(&current);
            assert!(settings.changes_against(&current).is_empty(), "{current:?}");
        }
    }

    #[test]
    fn temporary_visibility_writes_timeout_in_seconds() {
        let current = adapter(false, 0);
        let mut settings = AdapterSettings::from_adapter(&current);
        settings.visibility = Visibility::Temporary { minutes: 5 };

        assert_eq!(
            settings.changes_against(&current),
            vec![AdapterChange::Discoverable(true), AdapterChange::DiscoverableTimeout(300)]
        );
    }

    #[test]
    fn hiding_keeps_timeout() {
        let current = adapter(true, 300);
        let mut settings = AdapterSettings::from_adapter(&current);
        settings.visibility = Visibility::Hidden;

        assert_eq!(settings.changes_against(&current), vec![AdapterChange::Discoverable(false)]);
    }

    #[test]
    fn defaults_restore_system_name() {
        let mut current = adapter(false, 60);
        current.powered = false;
        let update = AdapterUpdate {
            defaults: true,
            ..Default::default()
        };

        let settings = AdapterSettings::resolve(&current, &update);
        assert_eq!(
            settings.changes_against(&current),
            vec![
                AdapterChange::Name("thinkpad".into()),
                AdapterChange::Discoverable(true),
                AdapterChange::DiscoverableTimeout(0),
                AdapterChange::Powered(true),
            ]
        );
    }

    #[test]
    fn blank_name_is_not_written() {
        let current = adapter(true, 0);
        let update = AdapterUpdate {
            name: Some("  ".into()),
            ..Default::default()
        };
        assert!(AdapterSettings::resolve(&current, &update).changes_against(&current).is_empty());
    }

    #[test]
    fn hci_name_is_parsed_from_paths() {
        assert_eq!(hci_name("/org/bluez/hci0"), "hci0");
        assert_eq!(hci_name("/org/bluez/hci1/dev_AA_BB_CC_DD_EE_FF"), "hci1");
        assert_eq!(hci_name("/org/bluez"), "");
    }

    #[test]
    fn title_includes_hci() {
        assert_eq!(title(&adapter(true, 0)), "thinkpad (00:11:22:33:44:55) - hci0");
    }
}
