/*!
 * Saved Adapter State
 * Power state of each adapter, kept across daemon restarts
 */

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::adapter_settings::AdapterChange;
use crate::model::{Adapter, Ubi};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterState {
    pub powered: bool,
}

/// Keyed by adapter address, since object paths change when adapters are
/// plugged in a different order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SavedState {
    pub adapters: BTreeMap<String, AdapterState>,
}

impl SavedState {
    /// A missing file is an empty state.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        match fs::read_to_string(path.as_ref()) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Records the current state of `adapters`, keeping entries for adapters
    /// that are not present right now.
    pub fn remember(&mut self, adapters: &[Adapter]) {
        for adapter in adapters.iter().filter(|adapter| !adapter.address.is_empty()) {
            self.adapters.insert(
                adapter.address.to_uppercase(),
                AdapterState {
                    powered: adapter.powered,
                },
            );
        }
    }

    /// Writes needed to bring `adapters` back to the saved state.
    pub fn changes(&self, adapters: &[Adapter]) -> Vec<(Ubi, AdapterChange)> {
        adapters
            .iter()
            .filter_map(|adapter| {
                let saved = self.adapters.get(&adapter.address.to_uppercase())?;
                (saved.powered != adapter.powered)
                    .then(|| (adapter.ubi.clone(), AdapterChange::Powered(saved.powered)))
            })
            .collect()
    }
}
