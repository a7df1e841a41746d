//! Tolerant extraction of JSON from model output.
//!
//! Models wrap JSON in prose or fenced code blocks despite instructions.
//! This layer is the explicit "tolerant extractor": direct parse first, then
//! a fenced block, then the widest bracket range. Strict serde stays the
//! default everywhere else.

use serde_json::Value;

/// Best-effort extraction of a JSON object. Returns `None` when nothing
/// object-shaped can be recovered.
pub fn extract_json_object(raw: &str) -> Option<Value> {
    extract(raw, '{', '}').filter(Value::is_object)
}

/// Best-effort extraction of a JSON array of objects. Non-object elements
/// are dropped; anything unrecoverable yields an empty vec via `None`.
pub fn extract_json_array(raw: &str) -> Option<Vec<Value>> {
    let value = extract(raw, '[', ']')?;
    let items = value.as_array()?;
    Some(items.iter().filter(|item| item.is_object()).cloned().collect())
}

fn extract(raw: &str, open: char, close: char) -> Option<Value> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Some(value);
    }

    // Inside a fenced block: start from the first opener after the fence.
    if let Some(fence) = text.find("```") {
        if let Some(start) = text[fence..].find(open).map(|i| i + fence) {
            if let Some(end) = text.rfind(close) {
                if end > start {
                    if let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) {
                        return Some(value);
                    }
                }
            }
        }
    }

    // Widest bracket range over the whole text.
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::{extract_json_array, extract_json_object};

    #[test]
    fn direct_object_parses() {
        let value = extract_json_object(r#"{"type":"NONE","outcome":"SUCCESS"}"#).unwrap();
        assert_eq!(value["type"], "NONE");
    }

    #[test]
    fn object_inside_fenced_block_is_recovered() {
        let raw = "Here you go:\n```json\n{\"conclusion\": \"approved\", \"summary\": \"ok\"}\n```\nthanks";
        let value = extract_json_object(raw).unwrap();
        assert_eq!(value["conclusion"], "approved");
    }

    #[test]
    fn object_embedded_in_prose_is_recovered() {
        let raw = "Sure! {\"lesson\": \"check timezones\"} hope that helps";
        let value = extract_json_object(raw).unwrap();
        assert_eq!(value["lesson"], "check timezones");
    }

    #[test]
    fn array_with_trailing_prose_is_recovered() {
        let raw = "proposals below\n[{\"problem\": \"a\"}, {\"problem\": \"b\"}]\ndone";
        let items = extract_json_array(raw).unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn array_drops_non_object_elements() {
        let items = extract_json_array(r#"[{"ok":1}, "stray", 42]"#).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn garbage_yields_none() {
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_array("").is_none());
        assert!(extract_json_object("} backwards {").is_none());
    }

    #[test]
    fn non_object_top_level_is_rejected_for_objects() {
        assert!(extract_json_object("[1,2,3]").is_none());
    }
}
