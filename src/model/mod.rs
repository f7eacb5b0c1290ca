pub mod database_id;
pub mod document;
pub mod document_key;
pub mod field_path;
pub mod mutation;
pub mod mutation_batch;
pub mod resource_path;
pub mod snapshot_version;
pub mod target;
pub mod timestamp;
pub mod value;

pub use database_id::DatabaseId;
pub use document::{DocumentState, DocumentType, MutableDocument};
pub use document_key::DocumentKey;
pub use field_path::{FieldMask, FieldPath};
pub use mutation::{
    FieldTransform, Mutation, MutationResult, Precondition, TransformOperation,
};
pub use mutation_batch::{MutationBatch, MutationBatchResult};
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use target::{Target, TargetData, TargetId, TargetPurpose};
pub use timestamp::Timestamp;
pub use value::{ObjectValue, Value};
