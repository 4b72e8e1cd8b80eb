//! Fuzz testing for `Authorization` header parsing.
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! cargo +nightly install cargo-fuzz
//! cargo +nightly fuzz run fuzz_bearer -- -max_total_time=60
//! ```
//!
//! Any header value must produce `Ok(Some(token))` with a non-empty,
//! whitespace-trimmed token, or a validation error. Never a panic.

#![no_main]

use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderValue};
use libfuzzer_sys::fuzz_target;
use request_pipeline::AppError;
use request_pipeline::middleware::parse_bearer;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = HeaderValue::from_bytes(data) else {
        return;
    };
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, value);

    match parse_bearer(&headers) {
        Ok(Some(token)) => {
            assert!(!token.is_empty());
            assert_eq!(token.trim(), token);
        }
        Ok(None) => unreachable!("header was present"),
        Err(AppError::Validation(_)) => {}
        Err(other) => panic!("unexpected error kind: {other:?}"),
    }
});
