//! Redaction of secrets before they reach the transaction log

use serde_json::Value as JsonValue;

const REDACTED: &str = "[REDACTED]";

const SENSITIVE_KEYS: &[&str] = &[
    "token",
    "password",
    "passwd",
    "secret",
    "signature",
    "apikey",
    "api_key",
    "authorization",
    "credential",
    "private_key",
    "privatekey",
];

pub fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|s| key.contains(s))
}

/// Copy of `value` with sensitive fields replaced
pub fn sanitize_value(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if is_sensitive_key(k) {
                        JsonValue::String(REDACTED.to_string())
                    } else {
                        sanitize_value(v)
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(sanitize_value).collect()),
        JsonValue::String(s) => JsonValue::String(sanitize_text(s)),
        other => other.clone(),
    }
}

/// Mask bearer tokens in free text
pub fn sanitize_text(text: &str) -> String {
    let mut out = Vec::new();
    let mut mask_next = false;
    for word in text.split(' ') {
        if mask_next && !word.is_empty() {
            out.push(REDACTED);
            mask_next = false;
            continue;
        }
        mask_next = word.eq_ignore_ascii_case("bearer");
        out.push(word);
    }
    out.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_keys_are_redacted() {
        let value = json!({
            "user": {"name": "Ada", "password": "hunter2"},
            "items": [{"accessToken": "x"}],
        });
        assert_eq!(
            sanitize_value(&value),
            json!({
                "user": {"name": "Ada", "password": "[REDACTED]"},
                "items": [{"accessToken": "[REDACTED]"}],
            })
        );
    }

    #[test]
    fn test_bearer_tokens_are_masked() {
        assert_eq!(
            sanitize_text("401 with Bearer abc.def"),
            "401 with Bearer [REDACTED]"
        );
        assert_eq!(sanitize_text("plain message"), "plain message");
    }
}
