/// Structured command and reply documents
///
/// The wire codec is a collaborator; everything above it sees replies as
/// ordered field maps that can be queried by name.
use serde_json::{Map, Value};

pub type Document = Map<String, Value>;

/// Convert a JSON value into a document. Non-object values yield an empty one.
pub fn document(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

/// Build a single-field command such as `{ "ismaster": 1 }`
pub fn command(name: &str) -> Document {
    let mut doc = Document::new();
    doc.insert(name.to_string(), Value::from(1));
    doc
}

/// Name of a command is its first field
pub fn command_name(command: &Document) -> Option<&str> {
    command.keys().next().map(String::as_str)
}

/// Lenient boolean read: JSON booleans, or numbers where non-zero is true.
pub fn get_bool(doc: &Document, key: &str) -> Option<bool> {
    match doc.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        _ => None,
    }
}

pub fn flag(doc: &Document, key: &str) -> bool {
    get_bool(doc, key).unwrap_or(false)
}

pub fn get_i64(doc: &Document, key: &str) -> Option<i64> {
    match doc.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|v| v as i64)),
        _ => None,
    }
}

pub fn get_str<'a>(doc: &'a Document, key: &str) -> Option<&'a str> {
    doc.get(key)?.as_str()
}

/// String array field; non-string entries are skipped
pub fn get_str_array<'a>(doc: &'a Document, key: &str) -> Vec<&'a str> {
    doc.get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

/// Command replies carry `ok: 1` on success. A missing field counts as success.
pub fn is_ok(reply: &Document) -> bool {
    get_bool(reply, "ok").unwrap_or(true)
}
