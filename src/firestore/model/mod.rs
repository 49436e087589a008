mod document;
mod document_key;
mod field_mask;
mod field_path;
mod geo_point;
mod mutation;
mod mutation_batch;
mod object_value;
mod resource_path;
mod snapshot_version;
mod timestamp;

pub use document::{DocumentState, DocumentType, MutableDocument};
pub use document_key::DocumentKey;
pub use field_mask::FieldMask;
pub use field_path::{FieldPath, IntoFieldPath};
pub use geo_point::GeoPoint;
pub use mutation::{
    FieldTransform, Mutation, MutationKind, MutationResult, Precondition, TransformOperation,
};
pub use mutation_batch::{MutationBatch, MutationBatchResult};
pub use object_value::ObjectValue;
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;

pub type BatchId = i32;
pub type TargetId = i32;
pub type ListenSequenceNumber = i64;

/// Batch id used before any batch was acknowledged.
pub const BATCHID_UNKNOWN: BatchId = -1;
