//! Authentication header injection for network transports

use std::collections::HashMap;

/// Supplies headers attached to every outbound HTTP request or websocket
/// upgrade. Called again on each (re)connect, so providers may rotate tokens.
pub trait AuthProvider: Send + Sync {
    /// Headers to attach
    fn auth_headers(&self) -> HashMap<String, String>;
}

/// A fixed set of headers
#[derive(Debug, Clone, Default)]
pub struct StaticHeaders {
    headers: HashMap<String, String>,
}

impl StaticHeaders {
    /// Create an empty header set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

impl AuthProvider for StaticHeaders {
    fn auth_headers(&self) -> HashMap<String, String> {
        self.headers.clone()
    }
}

/// `Authorization: Bearer <token>`
#[derive(Clone)]
pub struct BearerToken(String);

impl BearerToken {
    /// Wrap a token
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BearerToken(***)")
    }
}

impl AuthProvider for BearerToken {
    fn auth_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), format!("Bearer {}", self.0));
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_header() {
        let headers = BearerToken::new("s3cret").auth_headers();
        assert_eq!(headers.get("Authorization").map(String::as_str), Some("Bearer s3cret"));
        assert!(!format!("{:?}", BearerToken::new("s3cret")).contains("s3cret"));
    }

    #[test]
    fn test_static_headers() {
        let headers = StaticHeaders::new()
            .with_header("X-Api-Key", "abc")
            .with_header("X-Tenant", "t1")
            .auth_headers();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers["X-Tenant"], "t1");
    }
}
