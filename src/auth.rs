use async_trait::async_trait;

use crate::errors::{MatchError, MatchResult};
use crate::Identity;

/// Maps a connection token to a participant identity. The default
/// resolver treats the token as the identity itself; a deployment with
/// real accounts swaps in a session-store-backed implementation.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> MatchResult<Identity>;
}

/// Guest-style resolver: any non-empty token is its own identity.
pub struct TokenResolver;

#[async_trait]
impl IdentityResolver for TokenResolver {
    async fn resolve(&self, token: &str) -> MatchResult<Identity> {
        let token = token.trim();
        if token.is_empty() {
            return Err(MatchError::Protocol("empty auth token".into()));
        }
        Ok(token.to_string())
    }
}
