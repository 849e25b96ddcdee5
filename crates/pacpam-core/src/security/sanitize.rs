//! String and value sanitizing for display-bound text

use serde_json::Value;

/// Characters dropped by [`sanitize_string`] besides ASCII control characters
const MARKUP: [char; 5] = ['<', '>', '"', '\'', '`'];

fn is_stripped(c: char) -> bool {
    c.is_ascii_control() || MARKUP.contains(&c)
}

/// Strip control characters and HTML metacharacters, then truncate to `max_len` chars
pub fn sanitize_string(input: &str, max_len: usize) -> String {
    input
        .chars()
        .filter(|c| !is_stripped(*c))
        .take(max_len)
        .collect()
}

/// Sanitize every string inside a JSON value; object keys are left untouched
pub fn sanitize_value(value: Value, max_len: usize) -> Value {
    match value {
        Value::String(raw) => Value::String(sanitize_string(&raw, max_len)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| sanitize_value(item, max_len))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, item)| (key, sanitize_value(item, max_len)))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_string() {
        assert_eq!(sanitize_string("<b>bob</b>", 100), "bbob/b");
        assert_eq!(sanitize_string("a\u{0}b\nc\u{7f}d", 100), "abcd");
        assert_eq!(sanitize_string("it's \"ok\" `x`", 100), "its ok x");
        assert_eq!(sanitize_string("héllo wörld", 5), "héllo");
    }

    #[test]
    fn test_sanitize_value_recurses() {
        let dirty = json!({ "name": "<eve>", "tags": ["a\tb", 3], "nested": { "x": "\"q\"" }, "n": null });
        assert_eq!(
            sanitize_value(dirty, 10),
            json!({ "name": "eve", "tags": ["ab", 3], "nested": { "x": "q" }, "n": null })
        );
    }
}
