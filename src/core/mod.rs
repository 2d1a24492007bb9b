pub mod client;
pub mod document_set;
pub mod event_manager;
pub mod query;
pub mod sync_engine;
pub mod target;
pub mod view;
pub mod view_snapshot;

pub use client::{SyncClient, Subscription};
pub use document_set::DocumentSet;
pub use event_manager::{EventManager, ListenOptions, ListenSource, QueryListener};
pub use query::{Bound, FieldFilter, FilterOperator, LimitType, OrderBy, OrderDirection, Query};
pub use sync_engine::SyncEngine;
pub use target::{Target, TargetIdGenerator};
pub use view::{LimboDocumentChange, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{ChangeType, DocumentChangeSet, DocumentViewChange, ViewSnapshot};

/// Whether the client believes it can reach the remote authority.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnlineState {
    /// Not yet known. Listeners are not told about it, so a brief connect
    /// does not flash `from_cache` snapshots.
    #[default]
    Unknown,
    Online,
    Offline,
}
