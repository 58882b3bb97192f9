/*!
 * Terminal Output
 * Human readable rendering of daemon responses
 */

use serde_json::Value;

use crate::client::{ActionEntry, AdapterEntry, DeviceInfo, PendingRequest, Response, Session};

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn join_lines(entries: impl Iterator<Item = String>) -> String {
    entries.collect::<Vec<_>>().join("\n")
}

/// `{"kind":"confirmation","passkey":1}` style values read as `confirmation (passkey=1)`.
fn describe(value: &Value, tag: &str) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Object(fields) => match fields.get(tag).and_then(Value::as_str) {
            Some(name) => {
                let details: Vec<String> = fields
                    .iter()
                    .filter(|(key, _)| key.as_str() != tag)
                    .map(|(key, value)| format!("{}={}", key, describe(value, tag)))
                    .collect();
                if details.is_empty() {
                    name.to_string()
                } else {
                    format!("{} ({})", name, details.join(", "))
                }
            }
            // Externally tagged, e.g. `{"other":"pbap"}`.
            None => fields
                .iter()
                .map(|(key, value)| format!("{} ({})", key, describe(value, tag)))
                .collect::<Vec<_>>()
                .join(", "),
        },
        Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}

pub fn device(info: &DeviceInfo) -> String {
    if info.address.is_empty() {
        return "Unknown device".to_string();
    }
    let mut lines = vec![
        format!("{} [{}]", info.name, info.address),
        format!("  icon:  {}", info.icon),
        format!("  path:  {}", info.ubi),
    ];
    if !info.uuids.is_empty() {
        lines.push("  uuids:".to_string());
        lines.extend(info.uuids.split(',').map(|uuid| format!("    {}", uuid)));
    }
    lines.join("\n")
}

pub fn adapter(entry: &AdapterEntry) -> String {
    let visibility = match (entry.discoverable, entry.discoverable_timeout) {
        (false, _) => "hidden".to_string(),
        (true, 0) => "always visible".to_string(),
        (true, secs) => format!("visible for {} min", secs / 60),
    };
    format!(
        "{}{}\n  name: {}  powered: {}  visibility: {}  discovering: {}",
        entry.title,
        if entry.usable { " *" } else { "" },
        entry.name,
        yes_no(entry.powered),
        visibility,
        yes_no(entry.discovering),
    )
}

pub fn session(session: &Session) -> String {
    let device = if session.device_address.is_empty() {
        "unknown device"
    } else {
        session.device_address.as_str()
    };
    format!(
        "{}  {}  {}  {}  since {}",
        session.id,
        device,
        describe(&session.kind, ""),
        describe(&session.transfer, "state"),
        session.created_at.format("%H:%M:%S"),
    )
}

pub fn pending(request: &PendingRequest) -> String {
    format!(
        "{}  {} agent  {}  {}",
        request.id,
        request.source,
        if request.address.is_empty() { "-" } else { request.address.as_str() },
        describe(&request.kind, "kind"),
    )
}

pub fn action(entry: &ActionEntry) -> String {
    format!("{:<20} {}", entry.action, describe(&entry.plan, "status"))
}

/// Renders any response for a terminal.
pub fn render(response: &Response) -> String {
    match response {
        Response::Online {
            online,
            obex_online,
            discovering,
        } => format!(
            "bluetooth: {}\nobex:      {}\ndiscovery: {}",
            if *online { "online" } else { "offline" },
            if *obex_online { "online" } else { "offline" },
            if *discovering { "active" } else { "idle" },
        ),
        Response::Devices { devices } if devices.is_empty() => "No devices".to_string(),
        Response::Devices { devices } => join_lines(devices.values().map(device)),
        Response::Device { device: info } => device(info),
        Response::Adapters { adapters } if adapters.is_empty() => "No adapters".to_string(),
        Response::Adapters { adapters } => join_lines(adapters.iter().map(adapter)),
        Response::Sessions { sessions } if sessions.is_empty() => "No sessions".to_string(),
        Response::Sessions { sessions } => join_lines(sessions.iter().map(session)),
        Response::PendingRequests { requests } if requests.is_empty() => {
            "No pending requests".to_string()
        }
        Response::PendingRequests { requests } => join_lines(requests.iter().map(pending)),
        Response::Actions { address, actions } if actions.is_empty() => {
            format!("No actions for {}", address)
        }
        Response::Actions { actions, .. } => join_lines(actions.iter().map(action)),
        Response::Success { message } => message.clone(),
        Response::Error { message } => format!("Error: {}", message),
    }
}
