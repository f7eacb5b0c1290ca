//! Networking layer: the listen and write streams, watch change
//! aggregation, and the proto-JSON wire codec.

pub mod credentials;
pub mod datastore;
pub mod existence_filter;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod serializer;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use credentials::{CredentialsProvider, EmptyCredentialsProvider};
pub use datastore::{ConnectionTokens, Datastore, WireStream};
pub use existence_filter::{BloomFilter, ExistenceFilter};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::{RemoteStore, MAX_PENDING_WRITES};
pub use remote_syncer::{OnlineState, RemoteSyncer};
pub use watch_change::{WatchChange, WatchTargetChange, WatchTargetChangeState};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
