//! Local persistence: the document cache, the queue of pending writes and
//! the query machinery that reads them back.

pub mod document_overlay_cache;
pub mod file_backend;
pub mod index_manager;
pub(crate) mod local_documents_view;
pub mod local_store;
pub mod lru_garbage_collector;
pub mod mutation_queue;
pub mod persistence;
pub mod query_engine;
pub mod reference_set;
pub mod remote_document_cache;
pub mod target_cache;
pub mod target_data;

pub use document_overlay_cache::DocumentOverlayCache;
pub use file_backend::FileBackend;
pub use index_manager::{IndexManager, IndexType};
pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult, QueryResult};
pub use lru_garbage_collector::{LruGarbageCollector, LruResults};
pub use mutation_queue::MutationQueue;
pub use persistence::{
    LocalState, MemoryBackend, Persistence, PersistenceBackend, PersistenceTransaction,
    TransactionMode,
};
pub use query_engine::QueryEngine;
pub use reference_set::ReferenceSet;
pub use remote_document_cache::RemoteDocumentCache;
pub use target_cache::TargetCache;
pub use target_data::{TargetData, TargetPurpose};
