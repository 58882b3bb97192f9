use dbus::arg::{ArgType, PropMap, RefArg};

use crate::model::{PropValue, Properties};

fn convert(value: &dyn RefArg) -> Option<PropValue> {
    match value.arg_type() {
        ArgType::Boolean => value.as_u64().map(|v| PropValue::Bool(v != 0)),
        ArgType::Byte | ArgType::UInt16 | ArgType::UInt32 => {
            value.as_u64().and_then(|v| u32::try_from(v).ok()).map(PropValue::U32)
        }
        ArgType::String | ArgType::ObjectPath => {
            value.as_str().map(|s| PropValue::Str(s.to_string()))
        }
        ArgType::Array => value.as_iter().map(|items| {
            PropValue::List(items.filter_map(|item| item.as_str().map(str::to_string)).collect())
        }),
        ArgType::Variant => value
            .as_iter()
            .and_then(|mut inner| inner.next().and_then(convert)),
        _ => None,
    }
}

/// Keeps the property types the object model understands and drops the rest.
pub(crate) fn properties(map: &PropMap) -> Properties {
    map.iter()
        .filter_map(|(key, value)| convert(&*value.0).map(|value| (key.clone(), value)))
        .collect()
}

pub(crate) fn prop_u64(map: &PropMap, key: &str) -> Option<u64> {
    map.get(key).and_then(|value| value.0.as_u64())
}

pub(crate) fn prop_string(map: &PropMap, key: &str) -> Option<String> {
    map.get(key).and_then(|value| value.0.as_str()).map(str::to_string)
}
