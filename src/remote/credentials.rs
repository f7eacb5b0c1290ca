use async_trait::async_trait;

use crate::error::SyncResult;

/// Source of bearer tokens attached to stream connections. Implemented by
/// the auth and app-check integrations; both are treated as black boxes
/// here.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    /// The current token, or `None` when running unauthenticated.
    async fn get_token(&self) -> SyncResult<Option<String>>;

    /// Drops any cached token so the next `get_token` fetches a fresh one.
    /// Called after the backend rejects a token.
    fn invalidate_token(&self);
}

/// Provider for unauthenticated use and tests.
pub struct EmptyCredentialsProvider;

#[async_trait]
impl CredentialsProvider for EmptyCredentialsProvider {
    async fn get_token(&self) -> SyncResult<Option<String>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}
}
