//! Serde helpers for command payloads.
//!
//! When the `tracing` feature is enabled, this module also logs warnings for any
//! unknown fields encountered while decoding a `result` payload, which helps
//! spot server versions that report more than this client models.

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Decode a command payload, warning about unknown fields.
///
/// Unknown fields trigger warnings but never fail the decode. A failure is
/// logged with the JSON path that could not be decoded.
///
/// # Example
///
/// ```ignore
/// let entities: Vec<Entity> = deserialize_with_warnings(payload)?;
/// // Logs: WARN unknown field in command result field="[0].brand_new"
/// ```
#[cfg(feature = "tracing")]
pub(crate) fn deserialize_with_warnings<T: DeserializeOwned>(value: Value) -> crate::Result<T> {
    use std::any::type_name;

    tracing::trace!(
        type_name = %type_name::<T>(),
        json = %value,
        "decoding command result"
    );

    // Kept so unknown paths can be resolved to values afterwards
    let original = value.clone();

    let mut unknown_paths: Vec<String> = Vec::new();

    let result: T = serde_ignored::deserialize(value, |path| {
        unknown_paths.push(path.to_string());
    })
    .inspect_err(|_| {
        let json_str = original.to_string();
        let jd = &mut serde_json::Deserializer::from_str(&json_str);
        let path_result: Result<T, _> = serde_path_to_error::deserialize(jd);
        if let Err(path_err) = path_result {
            let path = path_err.path().to_string();
            let value_display = format_value(lookup_value(&original, &path));

            tracing::error!(
                type_name = %type_name::<T>(),
                path = %path,
                value = %value_display,
                error = %path_err.inner(),
                "command result did not decode"
            );
        }
    })?;

    if !unknown_paths.is_empty() {
        let type_name = type_name::<T>();
        for path in unknown_paths {
            let value_display = format_value(lookup_value(&original, &path));

            tracing::warn!(
                type_name = %type_name,
                field = %path,
                value = %value_display,
                "unknown field in command result"
            );
        }
    }

    Ok(result)
}

/// Pass-through decoding when tracing is disabled.
#[cfg(not(feature = "tracing"))]
pub(crate) fn deserialize_with_warnings<T: DeserializeOwned>(value: Value) -> crate::Result<T> {
    Ok(serde_json::from_value(value)?)
}

/// Look up a value in a JSON structure by path.
///
/// Handles paths from both `serde_ignored` and `serde_path_to_error`:
/// - `?` for Option wrappers (skipped)
/// - Numeric indices for arrays: `items.0` or `items[0]`
/// - Field names for objects: `foo.bar` or `foo.bar[0].baz`
#[cfg(feature = "tracing")]
fn lookup_value<'value>(value: &'value Value, path: &str) -> Option<&'value Value> {
    let mut current = value;

    for segment in parse_path_segments(path) {
        if segment.is_empty() || segment == "?" {
            continue;
        }

        match current {
            Value::Object(map) => {
                current = map.get(&segment)?;
            }
            Value::Array(arr) => {
                let index: usize = segment.parse().ok()?;
                current = arr.get(index)?;
            }
            _ => return None,
        }
    }

    Some(current)
}

/// Split `"[15].attributes.friendly_name"` into `["15", "attributes", "friendly_name"]`.
#[cfg(feature = "tracing")]
fn parse_path_segments(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();

    let mut chars = path.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '.' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    current.push(inner);
                }
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
            }
            ']' => {}
            _ => current.push(ch),
        }
    }

    if !current.is_empty() {
        segments.push(current);
    }

    segments
}

#[cfg(feature = "tracing")]
fn format_value(value: Option<&Value>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "<unable to retrieve>".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::deserialize_with_warnings;
    use crate::error::Kind;
    use crate::types::Entity;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Panel {
        component_name: String,
        #[serde(default)]
        icon: Option<String>,
    }

    #[test]
    fn unknown_fields_do_not_fail() {
        let panel: Panel = deserialize_with_warnings(json!({
            "component_name": "map",
            "icon": "mdi:account-location",
            "url_path": "map"
        }))
        .unwrap();

        assert_eq!(panel.component_name, "map");
        assert_eq!(panel.icon.as_deref(), Some("mdi:account-location"));
    }

    #[test]
    fn missing_required_field_is_internal_error() {
        let err = deserialize_with_warnings::<Panel>(json!({"icon": "mdi:map"})).unwrap_err();
        assert_eq!(err.kind(), Kind::Internal);
    }

    #[test]
    fn decodes_state_list() {
        let states: Vec<Entity> = deserialize_with_warnings(json!([
            {"entity_id": "light.a", "state": "on", "attributes": {}},
            {"entity_id": "sun.sun", "state": "above_horizon"}
        ]))
        .unwrap();

        assert_eq!(states.len(), 2);
        assert_eq!(states[1].domain(), "sun");
    }

    #[cfg(feature = "tracing")]
    mod path_lookup {
        use serde_json::json;

        use super::super::{format_value, lookup_value, parse_path_segments};

        #[test]
        fn segments_mix_dots_and_brackets() {
            assert_eq!(
                parse_path_segments("[15].attributes.friendly_name"),
                ["15", "attributes", "friendly_name"]
            );
            assert_eq!(parse_path_segments("a[0][1].b"), ["a", "0", "1", "b"]);
            assert!(parse_path_segments("").is_empty(), "empty path has no segments");
        }

        #[test]
        fn lookup_walks_objects_and_arrays() {
            let value = json!([{"entity_id": "light.a", "attributes": {"order": 2}}]);

            assert_eq!(
                lookup_value(&value, "[0].attributes.order"),
                Some(&json!(2))
            );
            assert_eq!(lookup_value(&value, "0.entity_id"), Some(&json!("light.a")));
            assert_eq!(lookup_value(&value, "?.0.entity_id"), Some(&json!("light.a")));
            assert_eq!(lookup_value(&value, "[3]"), None);
            assert_eq!(lookup_value(&value, "[0].entity_id.deeper"), None);
        }

        #[test]
        fn format_missing_value() {
            assert_eq!(format_value(None), "<unable to retrieve>");
            assert_eq!(format_value(Some(&json!("on"))), "\"on\"");
        }
    }
}
