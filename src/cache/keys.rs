//! Cache key construction.
//!
//! Entry keys look like `{prefix}:{resource_type}:{identifier}[:{params_hash}]`.
//! Tag sets and per-key tag lists live under their own namespaces so they can
//! never collide with entry keys.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use super::tags::Tag;

/// Request parameters, ordered by name.
pub type Params = BTreeMap<String, String>;

const TAG_NAMESPACE: &str = "__tag";
const KEY_TAGS_NAMESPACE: &str = "__keytags";
const PARAMS_HASH_WIDTH: usize = 16;

#[derive(Debug, Clone)]
pub struct KeyCodec {
    prefix: String,
}

impl KeyCodec {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Build an entry key. Empty parameter maps produce no hash segment.
    pub fn generate_key(&self, resource_type: &str, identifier: &str, params: &Params) -> String {
        if params.is_empty() {
            format!("{}:{resource_type}:{identifier}", self.prefix)
        } else {
            format!(
                "{}:{resource_type}:{identifier}:{}",
                self.prefix,
                hash_params(params)
            )
        }
    }

    /// Key of the set holding every entry key carrying `tag`.
    pub fn generate_tag_key(&self, tag: &Tag) -> String {
        format!("{}:{TAG_NAMESPACE}:{tag}", self.prefix)
    }

    /// Key of the set holding every tag attached to `key`.
    pub fn key_tags_key(&self, key: &str) -> String {
        format!("{}:{KEY_TAGS_NAMESPACE}:{key}", self.prefix)
    }
}

/// Fixed-width digest of the parameters; insertion order never matters.
pub fn hash_params(params: &Params) -> String {
    let mut hasher = Sha256::new();
    for (name, value) in params {
        // Length-prefixed so `a=bc` and `ab=c` cannot collide.
        hasher.update((name.len() as u64).to_be_bytes());
        hasher.update(name.as_bytes());
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value.as_bytes());
    }
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(PARAMS_HASH_WIDTH);
    digest
}

/// Collect a query string into sorted parameters. Repeated names are joined with `,`.
pub fn parse_query(query: Option<&str>) -> Params {
    let mut params = Params::new();
    let Some(query) = query else {
        return params;
    };
    for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
        params
            .entry(name.into_owned())
            .and_modify(|existing: &mut String| {
                existing.push(',');
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    params
}
