//! Response body deserialization.
//!
//! With the `tracing` feature enabled, fields present in a response but missing from the target
//! type are logged as warnings, which is usually the first sign of an API change.

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Deserializes a raw response body. An empty (or all-whitespace) body reads as `null`, so
/// endpoints answering `204 No Content` can target `()` or `Option<T>`.
pub fn from_body<T: DeserializeOwned>(body: &[u8]) -> crate::Result<T> {
    let value = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice::<Value>(body)?
    };

    deserialize_with_warnings(value)
}

/// Deserialize JSON with unknown field warnings.
///
/// Unknown fields trigger warnings but do not cause deserialization to fail. On failure the
/// offending path and the value found there are logged before the error is returned.
#[cfg(feature = "tracing")]
pub fn deserialize_with_warnings<T: DeserializeOwned>(value: Value) -> crate::Result<T> {
    use std::any::type_name;

    tracing::trace!(
        type_name = %type_name::<T>(),
        json = %value,
        "deserializing JSON"
    );

    // Kept for looking up unknown field values afterwards
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
                "deserialization failed"
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
                "unknown field in API response"
            );
        }
    }

    Ok(result)
}

/// Pass-through deserialization when tracing is disabled.
#[cfg(not(feature = "tracing"))]
pub fn deserialize_with_warnings<T: DeserializeOwned>(value: Value) -> crate::Result<T> {
    Ok(serde_json::from_value(value)?)
}

/// Look up a value by a `serde_ignored` or `serde_path_to_error` path.
///
/// `?` segments (Option wrappers) are skipped. Array indices may use either `items.0` or
/// `items[0]`. Returns `None` if the path is missing or runs through a scalar.
#[cfg(feature = "tracing")]
fn lookup_value<'value>(value: &'value Value, path: &str) -> Option<&'value Value> {
    let mut current = value;

    for segment in parse_path_segments(path) {
        if segment.is_empty() || segment == "?" {
            continue;
        }

        match current {
            Value::Object(map) => current = map.get(&segment)?,
            Value::Array(items) => current = items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        }
    }

    Some(current)
}

/// `"orders[3].fills.0"` -> `["orders", "3", "fills", "0"]`
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
    value.map_or_else(|| "<unable to retrieve>".to_owned(), Value::to_string)
}
