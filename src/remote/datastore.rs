use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as Json;

use crate::error::SyncResult;

/// Tokens attached to every stream connection.
#[derive(Clone, Debug, Default)]
pub struct ConnectionTokens {
    pub auth: Option<String>,
    pub app_check: Option<String>,
}

/// A bidirectional message stream carrying proto-JSON payloads.
///
/// `recv` returning `None` means the peer closed the stream cleanly; an
/// `Err` item carries the terminal stream error. Either way the stream is
/// finished afterwards.
#[async_trait]
pub trait WireStream: Send + Sync {
    async fn send(&self, message: Json) -> SyncResult<()>;
    async fn recv(&self) -> Option<SyncResult<Json>>;
    fn close(&self);
}

/// Factory for the two long-lived backend streams. The network transport
/// behind this trait is pluggable; tests connect it to channel-backed
/// fakes.
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn open_watch_stream(&self, tokens: &ConnectionTokens)
        -> SyncResult<Arc<dyn WireStream>>;
    async fn open_write_stream(&self, tokens: &ConnectionTokens)
        -> SyncResult<Arc<dyn WireStream>>;
}
