//! Deterministic coalescing keys.
//!
//! A key is `provider:sha256(input):sha256(options)`. Input is canonicalized
//! first (trimmed, CRLF folded to LF) and only options that change the
//! output contribute to the options hash, so requests that differ in
//! irrelevant settings still share one execution.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Options that can contribute to a coalescing key.
pub trait KeyOptions {
    /// Output-affecting fields as `name -> canonical value`. Fields left out
    /// of the map do not influence the key.
    fn key_fields(&self) -> BTreeMap<&'static str, String>;
}

impl KeyOptions for () {
    fn key_fields(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::new()
    }
}

/// Generation settings for a metered text provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub category: Option<String>,
    pub user_id: Option<String>,
    pub stream: bool,
    pub client_timeout_ms: Option<u64>,
}

impl KeyOptions for GenerationOptions {
    fn key_fields(&self) -> BTreeMap<&'static str, String> {
        let mut fields = BTreeMap::new();
        if let Some(temperature) = self.temperature {
            fields.insert("temperature", format!("{temperature:.2}"));
        }
        if let Some(max_tokens) = self.max_tokens {
            fields.insert("max_tokens", max_tokens.to_string());
        }
        if let Some(category) = &self.category {
            fields.insert("category", category.trim().to_lowercase());
        }
        fields
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoalesceKey(String);

impl CoalesceKey {
    pub fn derive<O>(provider: &str, input: &str, options: &O) -> Self
    where
        O: KeyOptions + ?Sized,
    {
        let material: String = options
            .key_fields()
            .into_iter()
            .map(|(name, value)| length_prefixed(name, &value))
            .collect();

        Self(format!(
            "{provider}:{}:{}",
            sha256_hex(&canonicalize(input)),
            sha256_hex(&material)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CoalesceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CoalesceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub fn canonicalize(input: &str) -> String {
    input.replace("\r\n", "\n").trim().to_string()
}

/// `len:name` then `len:value`, so separators inside values cannot forge
/// another field.
fn length_prefixed(name: &str, value: &str) -> String {
    format!("{}:{name}{}:{value}", name.len(), value.len())
}

fn sha256_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}
