use chrono::{DateTime, Duration, Utc};
use http::HeaderValue;
use std::fmt;
use std::sync::Arc;
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::error::TokenRejection;

/// Length of a canonical ULID string.
pub const ULID_LENGTH: usize = 26;

/// A validated client idempotency token, held in canonical (uppercase) form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdempotencyToken(Ulid);

impl IdempotencyToken {
    pub fn ulid(&self) -> Ulid {
        self.0
    }

    /// Instant encoded in the first 48 bits of the token.
    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        let millis = i64::try_from(self.0.timestamp_ms()).ok()?;
        DateTime::<Utc>::from_timestamp_millis(millis)
    }
}

impl fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Controls the optional timestamp check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPolicy {
    /// Reject tokens minted further in the future than `max_clock_skew`.
    pub enforce_timestamp: bool,
    pub max_clock_skew: Duration,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            enforce_timestamp: false,
            max_clock_skew: Duration::seconds(300),
        }
    }
}

/// Checks presence and ULID syntax of the idempotency header.
#[derive(Clone)]
pub struct TokenValidator {
    policy: TokenPolicy,
    clock: Arc<dyn Clock>,
}

impl TokenValidator {
    pub fn new(policy: TokenPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { policy, clock }
    }

    pub fn with_default_policy() -> Self {
        Self::new(TokenPolicy::default(), Arc::new(SystemClock))
    }

    pub fn policy(&self) -> TokenPolicy {
        self.policy
    }

    /// Validates a raw header value as received on the wire.
    pub fn validate_header(
        &self,
        value: Option<&HeaderValue>,
    ) -> Result<IdempotencyToken, TokenRejection> {
        match value {
            None => Err(TokenRejection::Missing),
            Some(value) => {
                let text = value.to_str().map_err(|_| TokenRejection::NotUtf8)?;
                self.validate(Some(text))
            }
        }
    }

    pub fn validate(&self, value: Option<&str>) -> Result<IdempotencyToken, TokenRejection> {
        let raw = match value {
            Some(raw) if !raw.is_empty() => raw,
            _ => return Err(TokenRejection::Missing),
        };

        let length = raw.chars().count();
        if length != ULID_LENGTH {
            return Err(TokenRejection::InvalidLength(length));
        }

        if let Some(bad) = raw.chars().find(|c| !is_crockford_char(*c)) {
            return Err(TokenRejection::InvalidCharacter(bad));
        }

        // 26 base32 digits carry 130 bits; the leading digit may only use 3.
        if raw.as_bytes().first().is_some_and(|b| *b > b'7') {
            return Err(TokenRejection::TimestampOverflow);
        }

        let ulid = Ulid::from_string(&raw.to_ascii_uppercase()).map_err(|_| {
            TokenRejection::InvalidCharacter(raw.chars().next().unwrap_or_default())
        })?;
        let token = IdempotencyToken(ulid);

        if self.policy.enforce_timestamp {
            let latest = self.clock.now() + self.policy.max_clock_skew;
            match token.issued_at() {
                Some(issued) if issued <= latest => {}
                _ => return Err(TokenRejection::FutureTimestamp),
            }
        }

        Ok(token)
    }
}

impl fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenValidator")
            .field("policy", &self.policy)
            .finish()
    }
}

fn is_crockford_char(c: char) -> bool {
    match c.to_ascii_uppercase() {
        'I' | 'L' | 'O' | 'U' => false,
        upper => upper.is_ascii_digit() || upper.is_ascii_uppercase(),
    }
}
