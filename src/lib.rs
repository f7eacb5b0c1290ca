//! Client-side offline synchronization engine for Firestore-style document
//! databases.
//!
//! The crate is layered the way data flows:
//!
//! - [`model`]: documents, mutations, values, and the supporting key types.
//! - [`query`]: query shapes, filtering, and ordering.
//! - [`local`]: in-memory persistence (remote document cache, mutation
//!   queue, overlays, target cache) behind [`local::LocalStore`].
//! - [`remote`]: the listen and write streams, watch change aggregation,
//!   and the proto-JSON wire codec.
//! - [`core`]: views, the sync engine, listener fan-out, and the
//!   [`core::SyncClient`] facade.
//!
//! Writes apply to the local view immediately and are pushed to the backend
//! in the background; watch snapshots flow back in and are merged under a
//! version-monotonic rule, so listeners converge on the server state
//! without ever observing a torn snapshot.

pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod query;
pub mod remote;
pub mod util;

pub use error::{SyncError, SyncErrorCode, SyncResult};
