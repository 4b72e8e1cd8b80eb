//! Key-based redaction of structured log payloads.
//!
//! Any object key containing one of [`SENSITIVE_KEYS`] (case-insensitive)
//! has its value replaced with [`REDACTED`], at any depth.

use serde_json::{Map, Value};

pub const REDACTED: &str = "[REDACTED]";

/// Lowercase fragments that mark a key as sensitive.
pub const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "secret",
    "token",
    "apikey",
    "api_key",
    "authorization",
    "cookie",
    "creditcard",
    "credit_card",
    "ssn",
    "privatekey",
    "private_key",
];

pub fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|fragment| key.contains(fragment))
}

/// Return a copy of `value` with sensitive fields masked.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, inner)| {
                    let masked = if is_sensitive_key(key) {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact(inner)
                    };
                    (key.clone(), masked)
                })
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}
