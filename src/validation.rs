//! Structural validation of request bodies and query strings.
//!
//! A [`Schema`] turns raw input into a validated JSON value or the complete
//! list of violations. [`TypedSchema`] implements it for any type that
//! derives `Deserialize`, `Serialize` and `validator::Validate`:
//!
//! ```rust,ignore
//! #[derive(Deserialize, Serialize, Validate)]
//! struct Signup {
//!     #[validate(length(min = 3))]
//!     name: String,
//!     #[validate(email)]
//!     email: String,
//! }
//!
//! let options = MiddlewareOptions::public().with_body_schema(schema::<Signup>());
//! ```
//!
//! Every failed constraint is reported, not only the first; nested structs
//! and lists flatten to dotted paths such as `items[2].name`.

use std::borrow::Cow;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use axum::extract::Query;
use axum::http::Uri;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

use crate::error::{FieldViolation, sanitize_serde_error};

/// Validates a request body or query string.
pub trait Schema: Send + Sync {
    /// Validate a parsed JSON body.
    fn check_body(&self, body: Value) -> Result<Value, Vec<FieldViolation>>;

    /// Validate the query string of `uri`.
    fn check_query(&self, uri: &Uri) -> Result<Value, Vec<FieldViolation>>;
}

/// Schema backed by a `Deserialize + Validate` type.
pub struct TypedSchema<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for TypedSchema<T> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for TypedSchema<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TypedSchema<{}>", std::any::type_name::<T>())
    }
}

/// Shorthand for `Arc::new(TypedSchema::<T>::default())`.
pub fn schema<T>() -> Arc<dyn Schema>
where
    T: DeserializeOwned + Serialize + Validate + 'static,
{
    Arc::new(TypedSchema::<T>::default())
}

impl<T> TypedSchema<T>
where
    T: Serialize + Validate,
{
    fn finish(value: T) -> Result<Value, Vec<FieldViolation>> {
        value.validate().map_err(|errors| flatten_errors(&errors))?;
        serde_json::to_value(&value)
            .map_err(|_| vec![FieldViolation::new("", "could not be normalized")])
    }
}

impl<T> Schema for TypedSchema<T>
where
    T: DeserializeOwned + Serialize + Validate,
{
    fn check_body(&self, body: Value) -> Result<Value, Vec<FieldViolation>> {
        let parsed: T = serde_json::from_value(body).map_err(|e| vec![sanitize_serde_error(&e)])?;
        Self::finish(parsed)
    }

    fn check_query(&self, uri: &Uri) -> Result<Value, Vec<FieldViolation>> {
        let Query(parsed) = Query::<T>::try_from_uri(uri)
            .map_err(|rejection| vec![FieldViolation::new("query", rejection.body_text())])?;
        Self::finish(parsed)
    }
}

/// Flatten `validator` output into sorted `{path, message}` pairs.
pub fn flatten_errors(errors: &ValidationErrors) -> Vec<FieldViolation> {
    let mut out = Vec::new();
    collect("", errors, &mut out);
    out.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.message.cmp(&b.message)));
    out
}

fn collect(prefix: &str, errors: &ValidationErrors, out: &mut Vec<FieldViolation>) {
    for (field, kind) in errors.errors() {
        let path = join_path(prefix, field);
        match kind {
            ValidationErrorsKind::Field(field_errors) => {
                out.extend(field_errors.iter().map(|e| {
                    let message = describe(&e.code, e.message.as_ref(), &e.params);
                    FieldViolation::new(path.clone(), message)
                }));
            }
            ValidationErrorsKind::Struct(nested) => collect(&path, nested, out),
            ValidationErrorsKind::List(items) => {
                for (index, nested) in items {
                    collect(&format!("{path}[{index}]"), nested, out);
                }
            }
        }
    }
}

fn join_path(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{prefix}.{field}")
    }
}

/// Human-readable message for a validator error without a custom message.
fn describe(
    code: &str,
    message: Option<&Cow<'static, str>>,
    params: &HashMap<Cow<'static, str>, Value>,
) -> String {
    if let Some(message) = message {
        return message.to_string();
    }
    match code {
        "email" => "must be a valid email address".to_string(),
        "url" => "must be a valid URL".to_string(),
        "required" => "is required".to_string(),
        "length" => match (params.get("min"), params.get("max")) {
            (Some(min), Some(max)) => format!("length must be between {min} and {max}"),
            (Some(min), None) => format!("length must be at least {min}"),
            (None, Some(max)) => format!("length must be at most {max}"),
            (None, None) => "has an invalid length".to_string(),
        },
        "range" => match (params.get("min"), params.get("max")) {
            (Some(min), Some(max)) => format!("must be between {min} and {max}"),
            (Some(min), None) => format!("must be at least {min}"),
            (None, Some(max)) => format!("must be at most {max}"),
            (None, None) => "is out of range".to_string(),
        },
        other => format!("failed '{other}' validation"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, Serialize, Validate)]
    struct Signup {
        #[validate(length(min = 3))]
        name: String,
        #[validate(email)]
        email: String,
    }

    #[derive(Debug, Deserialize, Serialize, Validate)]
    struct Item {
        #[validate(length(min = 1, message = "must not be empty"))]
        name: String,
    }

    #[derive(Debug, Deserialize, Serialize, Validate)]
    struct Order {
        #[validate(nested)]
        items: Vec<Item>,
        #[validate(range(min = 1, max = 10))]
        quantity: u32,
    }

    #[derive(Debug, Deserialize, Serialize, Validate)]
    struct Paging {
        #[validate(range(min = 1, max = 100))]
        limit: u32,
    }

    #[test]
    fn test_valid_body_passes_through() {
        let value = schema::<Signup>()
            .check_body(json!({"name": "Alice", "email": "alice@example.com"}))
            .unwrap();
        assert_eq!(value["name"], "Alice");
    }

    #[test]
    fn test_collects_every_violation() {
        let violations = schema::<Signup>()
            .check_body(json!({"name": "AB", "email": "bad"}))
            .unwrap_err();
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].path, "email");
        assert_eq!(violations[0].message, "must be a valid email address");
        assert_eq!(violations[1].path, "name");
        assert_eq!(violations[1].message, "length must be at least 3");
    }

    #[test]
    fn test_nested_paths() {
        let violations = schema::<Order>()
            .check_body(json!({"items": [{"name": "ok"}, {"name": ""}], "quantity": 0}))
            .unwrap_err();
        let paths: Vec<_> = violations.iter().map(|v| v.path.as_str()).collect();
        assert_eq!(paths, vec!["items[1].name", "quantity"]);
        assert_eq!(violations[0].message, "must not be empty");
    }

    #[test]
    fn test_missing_field_reported() {
        let violations = schema::<Signup>()
            .check_body(json!({"name": "Alice"}))
            .unwrap_err();
        assert_eq!(violations, vec![FieldViolation::new("email", "is required")]);
    }

    #[test]
    fn test_query_validation() {
        let ok: Uri = "/items?limit=10".parse().unwrap();
        assert_eq!(schema::<Paging>().check_query(&ok).unwrap()["limit"], 10);

        let out_of_range: Uri = "/items?limit=500".parse().unwrap();
        let violations = schema::<Paging>().check_query(&out_of_range).unwrap_err();
        assert_eq!(violations[0].path, "limit");

        let malformed: Uri = "/items?limit=abc".parse().unwrap();
        let violations = schema::<Paging>().check_query(&malformed).unwrap_err();
        assert_eq!(violations[0].path, "query");
    }
}
