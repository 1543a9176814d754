use axum::extract::Request;
use http::HeaderName;

/// The actor a request is attributed to.
///
/// Resolution happens outside this crate (an auth layer, a trusted gateway
/// header); the gate only consumes the result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Principal {
    #[default]
    Anonymous,
    Actor(String),
}

impl Principal {
    pub fn actor(id: impl Into<String>) -> Self {
        Principal::Actor(id.into())
    }

    /// Maps a missing or blank identifier to `Anonymous`.
    pub fn from_optional_id(id: Option<String>) -> Self {
        match id {
            Some(id) if !id.trim().is_empty() => Principal::Actor(id),
            _ => Principal::Anonymous,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Principal::Anonymous => None,
            Principal::Actor(id) => Some(id),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Principal::Anonymous)
    }
}

/// Supplies the principal for an inbound request.
pub trait PrincipalResolver: Send + Sync {
    fn resolve(&self, request: &Request) -> Principal;
}

/// Reads a `Principal` placed in the request extensions by an upstream
/// authentication layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionPrincipalResolver;

impl PrincipalResolver for ExtensionPrincipalResolver {
    fn resolve(&self, request: &Request) -> Principal {
        request
            .extensions()
            .get::<Principal>()
            .cloned()
            .unwrap_or_default()
    }
}

/// Reads the actor id from a header set by a trusted proxy.
#[derive(Debug, Clone)]
pub struct HeaderPrincipalResolver {
    header: HeaderName,
}

impl HeaderPrincipalResolver {
    pub fn new(header: HeaderName) -> Self {
        Self { header }
    }
}

impl PrincipalResolver for HeaderPrincipalResolver {
    fn resolve(&self, request: &Request) -> Principal {
        let id = request
            .headers()
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Principal::from_optional_id(id)
    }
}
