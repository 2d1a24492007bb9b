//! Application-facing types: snapshots, read and write options, and the
//! write batch.

pub mod options;
pub mod snapshot;
pub mod user_data;
pub mod write_batch;

pub use crate::core::{ListenOptions, ListenSource};
pub use options::{GetSource, SetOptions};
pub use snapshot::{DocumentChange, DocumentSnapshot, QuerySnapshot, SnapshotMetadata};
pub use user_data::{parse_set_data, parse_update_data, ParsedSetData, ParsedUpdateData};
pub use write_batch::WriteBatch;
