//! Fuzz testing for log redaction.
//!
//! Builds arbitrary nested JSON and checks that no value stored under a
//! sensitive key survives [`redact`], at any depth.
//!
//! ```bash
//! cargo +nightly fuzz run fuzz_redact -- -max_total_time=60
//! ```

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use request_pipeline::redact::{REDACTED, is_sensitive_key, redact};
use serde_json::{Map, Value};

const MAX_DEPTH: usize = 8;

#[derive(Debug, Arbitrary)]
enum Node {
    Null,
    Bool(bool),
    Number(i64),
    Text(String),
    List(Vec<Node>),
    Object(Vec<(String, Node)>),
}

impl Node {
    fn into_value(self, depth: usize) -> Value {
        if depth > MAX_DEPTH {
            return Value::Null;
        }
        match self {
            Node::Null => Value::Null,
            Node::Bool(b) => Value::Bool(b),
            Node::Number(n) => Value::from(n),
            Node::Text(s) => Value::String(s),
            Node::List(items) => {
                Value::Array(items.into_iter().map(|n| n.into_value(depth + 1)).collect())
            }
            Node::Object(fields) => Value::Object(
                fields
                    .into_iter()
                    .map(|(k, n)| (k, n.into_value(depth + 1)))
                    .collect::<Map<_, _>>(),
            ),
        }
    }
}

fn assert_redacted(value: &Value) {
    match value {
        Value::Object(map) => {
            for (key, inner) in map {
                if is_sensitive_key(key) {
                    assert_eq!(inner, &Value::String(REDACTED.to_string()));
                } else {
                    assert_redacted(inner);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(assert_redacted),
        _ => {}
    }
}

fuzz_target!(|node: Node| {
    let value = node.into_value(0);
    assert_redacted(&redact(&value));
});
