//! Engine coordination: views over query results, the sync engine binding
//! queries to watch targets, listener fan-out, and the client facade.

pub mod client;
pub mod event_manager;
pub mod sync_engine;
pub mod target_id_generator;
pub mod view;

pub use client::{SyncClient, SyncClientConfig};
pub use event_manager::{EventManager, ListenerEvent, QueryListener};
pub use sync_engine::{SyncEngine, SyncEngineObserver, MAX_CONCURRENT_LIMBO_RESOLUTIONS};
pub use target_id_generator::TargetIdGenerator;
pub use view::{
    DocumentChangeType, DocumentViewChange, LimboChange, SyncState, View, ViewChange, ViewSnapshot,
};
