//! Documents and dotted field paths.

use serde_json::{Map, Value};

/// A stored record: a JSON object.
pub type Document = Map<String, Value>;

/// Resolves a dotted path such as `address.zip`.
#[must_use]
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Mutable variant of [`get_path`].
pub fn get_path_mut<'a>(doc: &'a mut Document, path: &str) -> Option<&'a mut Value> {
    let mut segments = path.split('.');
    let mut current = doc.get_mut(segments.next()?)?;
    for segment in segments {
        current = current.as_object_mut()?.get_mut(segment)?;
    }
    Some(current)
}

/// Sets a dotted path, creating intermediate objects.
///
/// Returns `false` without modifying anything when an intermediate segment
/// holds a non-object value.
pub fn set_path(doc: &mut Document, path: &str, value: Value) -> bool {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };

    let mut current = doc;
    for segment in parents {
        let slot = current.entry((*segment).to_string()).or_insert_with(|| Value::Object(Map::new()));
        match slot {
            Value::Object(map) => current = map,
            _ => return false,
        }
    }
    current.insert((*last).to_string(), value);
    true
}
