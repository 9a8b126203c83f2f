//! Token validation.
//!
//! The fabric does not own an account database; whoever embeds the server
//! supplies the predicate deciding which tokens may connect. Validation may
//! suspend (a lookup against an external service is expected).

use async_trait::async_trait;

/// Decides whether a token may open a session.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Returns whether the token is acceptable.
    async fn validate(&self, token: &str) -> bool;
}

/// Accepts every token. The default; must be replaced in production.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl TokenValidator for AllowAll {
    async fn validate(&self, _token: &str) -> bool {
        true
    }
}

/// Rejects every token. Useful in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

#[async_trait]
impl TokenValidator for DenyAll {
    async fn validate(&self, _token: &str) -> bool {
        false
    }
}
