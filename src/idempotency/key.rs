use http::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::fmt;

use crate::idempotency::principal::Principal;
use crate::idempotency::token::IdempotencyToken;

/// Namespace reserved for idempotency entries in the shared cache.
pub const DEFAULT_KEY_PREFIX: &str = "idempotency";

/// Key segment used when no principal is attached to the request.
pub const ANONYMOUS_SEGMENT: &str = "global";

const CLAIM_SUFFIX: &str = ":lock";

/// Layout of derived keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFormat {
    /// `{prefix}:{principal}:{METHOD}:{TOKEN}`
    #[default]
    Plain,
    /// `{prefix}:{sha256 of the plain components}`
    Hashed,
}

/// Configuration for key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDeriverConfig {
    pub key_prefix: String,
    pub format: KeyFormat,
}

impl Default for KeyDeriverConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            format: KeyFormat::Plain,
        }
    }
}

/// Flat cache key addressing one logical operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of the in-flight marker guarding this entry.
    pub fn claim_key(&self) -> CacheKey {
        CacheKey(format!("{}{}", self.0, CLAIM_SUFFIX))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Builds cache keys scoped by actor, method and token.
#[derive(Debug, Clone)]
pub struct KeyDeriver {
    config: KeyDeriverConfig,
}

impl KeyDeriver {
    pub fn new(config: KeyDeriverConfig) -> Self {
        Self { config }
    }

    pub fn with_default_config() -> Self {
        Self::new(KeyDeriverConfig::default())
    }

    pub fn prefix(&self) -> &str {
        &self.config.key_prefix
    }

    pub fn derive(
        &self,
        token: &IdempotencyToken,
        method: &Method,
        principal: &Principal,
    ) -> CacheKey {
        let principal_segment = principal_segment(principal);
        let method = normalize_method(method);
        let token = token.to_string();

        match self.config.format {
            KeyFormat::Plain => CacheKey(format!(
                "{}:{}:{}:{}",
                self.config.key_prefix, principal_segment, method, token
            )),
            KeyFormat::Hashed => {
                let mut hasher = Sha256::new();
                hasher.update(principal_segment.as_bytes());
                hasher.update(b"|");
                hasher.update(method.as_bytes());
                hasher.update(b"|");
                hasher.update(token.as_bytes());
                let hash_hex = hex::encode(hasher.finalize());

                CacheKey(format!("{}:{}", self.config.key_prefix, hash_hex))
            }
        }
    }
}

/// Canonical uppercase form of an HTTP method.
pub fn normalize_method(method: &Method) -> String {
    method.as_str().to_ascii_uppercase()
}

/// Encodes a principal as a key segment.
///
/// Actor ids are percent-escaped for `%`, `:` and `|`, and an actor literally
/// named `global` is written as `%67lobal` so it never aliases the anonymous
/// sentinel.
fn principal_segment(principal: &Principal) -> Cow<'_, str> {
    match principal {
        Principal::Anonymous => Cow::Borrowed(ANONYMOUS_SEGMENT),
        Principal::Actor(id) => {
            if id == ANONYMOUS_SEGMENT {
                return Cow::Owned("%67lobal".to_string());
            }
            if !id.contains(['%', ':', '|']) {
                return Cow::Borrowed(id);
            }
            let mut escaped = String::with_capacity(id.len() + 4);
            for c in id.chars() {
                match c {
                    '%' => escaped.push_str("%25"),
                    ':' => escaped.push_str("%3A"),
                    '|' => escaped.push_str("%7C"),
                    other => escaped.push(other),
                }
            }
            Cow::Owned(escaped)
        }
    }
}
