//! Local persistence: document, mutation, overlay, and target caches plus
//! the store that coordinates them.

pub mod local_documents_view;
pub mod local_store;
pub mod mutation_queue;
pub mod overlay_cache;
pub mod persistence;
pub mod query_engine;
pub mod remote_document_cache;
pub mod target_cache;

pub use local_documents_view::LocalDocumentsView;
pub use local_store::{LocalStore, LocalViewChanges, QueryResult};
pub use mutation_queue::MutationQueue;
pub use overlay_cache::{DocumentOverlayCache, Overlay};
pub use persistence::{MemoryPersistence, PersistenceState};
pub use query_engine::QueryEngine;
pub use remote_document_cache::RemoteDocumentCache;
pub use target_cache::TargetCache;
