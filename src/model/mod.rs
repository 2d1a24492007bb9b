mod database_id;
mod document;
mod document_key;
mod field_index;
mod field_path;
mod geo_point;
mod mutation;
mod mutation_batch;
mod overlay;
mod resource_path;
mod snapshot_version;
mod timestamp;

pub use database_id::{DatabaseId, DEFAULT_DATABASE};
pub use document::{DocumentState, DocumentType, MutableDocument};
pub use document_key::DocumentKey;
pub use field_index::{FieldIndex, IndexKind, IndexSegment};
pub use field_path::{FieldPath, IntoFieldPath, DOCUMENT_KEY_FIELD};
pub use geo_point::GeoPoint;
pub use mutation::{
    calculate_overlay_mutation, FieldMask, FieldTransform, Mutation, MutationResult,
    Precondition, TransformOperation,
};
pub use mutation_batch::{MutationBatch, MutationBatchResult};
pub use overlay::{Overlay, OverlayedDocument};
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;

pub type TargetId = i32;
pub type BatchId = i32;
pub type ListenSequenceNumber = i64;

/// Batch id used before any batch has been assigned.
pub const BATCH_ID_UNKNOWN: BatchId = -1;
/// Sequence number of documents that were never part of a listen.
pub const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;
