use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{aborted, failed_precondition, SyncError, SyncResult};
use crate::local::document_overlay_cache::DocumentOverlayCache;
use crate::local::file_backend::FileBackend;
use crate::local::index_manager::IndexManager;
use crate::local::mutation_queue::MutationQueue;
use crate::local::remote_document_cache::RemoteDocumentCache;
use crate::local::target_cache::TargetCache;
use crate::model::{DocumentKey, ListenSequenceNumber, MutableDocument, SnapshotVersion};
use crate::settings::{PersistenceSettings, SyncSettings};
use crate::util::lock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

/// Everything the local cache keeps. Serialized as one JSON document by the
/// file backend.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LocalState {
    pub(crate) remote_documents: RemoteDocumentCache,
    pub(crate) mutation_queue: MutationQueue,
    pub(crate) overlays: DocumentOverlayCache,
    pub(crate) targets: TargetCache,
    pub(crate) indexes: IndexManager,
    pub(crate) highest_listen_sequence_number: ListenSequenceNumber,
}

/// Durable storage for [`LocalState`].
pub trait PersistenceBackend: Send + Sync {
    fn load(&self) -> SyncResult<Option<LocalState>>;

    /// Called after every successful read-write transaction.
    fn persist(&self, state: &LocalState) -> SyncResult<()>;
}

/// Keeps nothing beyond the process lifetime.
#[derive(Debug, Default)]
pub struct MemoryBackend;

impl PersistenceBackend for MemoryBackend {
    fn load(&self) -> SyncResult<Option<LocalState>> {
        Ok(None)
    }

    fn persist(&self, _state: &LocalState) -> SyncResult<()> {
        Ok(())
    }
}

/// Transactional owner of the local cache.
///
/// Transactions run synchronously under one lock; callers on the serial
/// queue never contend for it. A read-write transaction that fails, or whose
/// commit fails, leaves the state exactly as it found it.
pub struct Persistence {
    state: Mutex<LocalState>,
    backend: Box<dyn PersistenceBackend>,
    quota_bytes: Option<usize>,
    injected_failures: Mutex<VecDeque<SyncError>>,
}

impl Persistence {
    pub fn new(backend: Box<dyn PersistenceBackend>, quota_bytes: Option<usize>) -> SyncResult<Self> {
        let state = backend.load()?.unwrap_or_default();
        Ok(Self {
            state: Mutex::new(state),
            backend,
            quota_bytes,
            injected_failures: Mutex::new(VecDeque::new()),
        })
    }

    pub fn memory() -> Self {
        Self {
            state: Mutex::new(LocalState::default()),
            backend: Box::new(MemoryBackend),
            quota_bytes: None,
            injected_failures: Mutex::new(VecDeque::new()),
        }
    }

    pub fn open(settings: &SyncSettings) -> SyncResult<Self> {
        let backend: Box<dyn PersistenceBackend> = match &settings.persistence {
            PersistenceSettings::Memory => Box::new(MemoryBackend),
            PersistenceSettings::File { path } => Box::new(FileBackend::new(path.clone())),
        };
        Self::new(backend, settings.persistence_quota_bytes)
    }

    /// Makes the next commit fail with `error`. Failures queue up.
    pub fn inject_commit_failure(&self, error: SyncError) {
        lock(&self.injected_failures).push_back(error);
    }

    pub fn run_transaction<T, F>(&self, action: &str, mode: TransactionMode, f: F) -> SyncResult<T>
    where
        F: FnOnce(&mut PersistenceTransaction<'_>) -> SyncResult<T>,
    {
        let mut state = lock(&self.state);
        let previous_sequence_number = state.highest_listen_sequence_number;
        let sequence_number = match mode {
            TransactionMode::ReadOnly => previous_sequence_number,
            TransactionMode::ReadWrite => previous_sequence_number + 1,
        };
        state.highest_listen_sequence_number = sequence_number;

        let (result, undo) = {
            let mut txn = PersistenceTransaction {
                state: &mut state,
                mode,
                sequence_number,
                undo: UndoLog::default(),
            };
            let result = f(&mut txn);
            (result, txn.undo)
        };

        let value = match result {
            Ok(value) => value,
            Err(err) => {
                undo.restore(&mut state);
                state.highest_listen_sequence_number = previous_sequence_number;
                log::debug!("transaction '{action}' failed: {err}");
                return Err(err);
            }
        };

        if mode == TransactionMode::ReadWrite && undo.touched() {
            if let Err(err) = self.commit(&state) {
                undo.restore(&mut state);
                state.highest_listen_sequence_number = previous_sequence_number;
                log::warn!("transaction '{action}' aborted on commit: {err}");
                return Err(aborted(format!(
                    "Transaction '{action}' could not be committed: {}",
                    err.message()
                )));
            }
        }
        Ok(value)
    }

    fn commit(&self, state: &LocalState) -> SyncResult<()> {
        if let Some(error) = lock(&self.injected_failures).pop_front() {
            return Err(error);
        }
        if let Some(quota) = self.quota_bytes {
            let used = state.remote_documents.byte_size();
            if used > quota {
                return Err(aborted(format!(
                    "Local cache quota exceeded ({used} > {quota} bytes)"
                )));
            }
        }
        self.backend.persist(state)
    }
}

#[derive(Default)]
struct UndoLog {
    remote_documents: Option<RemoteDocumentCache>,
    mutation_queue: Option<MutationQueue>,
    overlays: Option<DocumentOverlayCache>,
    targets: Option<TargetCache>,
    indexes: Option<IndexManager>,
}

impl UndoLog {
    fn touched(&self) -> bool {
        self.remote_documents.is_some()
            || self.mutation_queue.is_some()
            || self.overlays.is_some()
            || self.targets.is_some()
            || self.indexes.is_some()
    }

    fn restore(self, state: &mut LocalState) {
        if let Some(previous) = self.remote_documents {
            state.remote_documents = previous;
        }
        if let Some(previous) = self.mutation_queue {
            state.mutation_queue = previous;
        }
        if let Some(previous) = self.overlays {
            state.overlays = previous;
        }
        if let Some(previous) = self.targets {
            state.targets = previous;
        }
        if let Some(previous) = self.indexes {
            state.indexes = previous;
        }
    }
}

/// Access to the sub-stores inside one transaction. Mutable accessors fail
/// in read-only transactions and snapshot the store on first use.
pub struct PersistenceTransaction<'a> {
    state: &'a mut LocalState,
    mode: TransactionMode,
    sequence_number: ListenSequenceNumber,
    undo: UndoLog,
}

macro_rules! store_accessors {
    ($field:ident, $field_mut:ident, $ty:ty) => {
        pub fn $field(&self) -> &$ty {
            &self.state.$field
        }

        pub fn $field_mut(&mut self) -> SyncResult<&mut $ty> {
            self.ensure_writable()?;
            if self.undo.$field.is_none() {
                self.undo.$field = Some(self.state.$field.clone());
            }
            Ok(&mut self.state.$field)
        }
    };
}

impl PersistenceTransaction<'_> {
    store_accessors!(remote_documents, remote_documents_mut, RemoteDocumentCache);
    store_accessors!(mutation_queue, mutation_queue_mut, MutationQueue);
    store_accessors!(overlays, overlays_mut, DocumentOverlayCache);
    store_accessors!(targets, targets_mut, TargetCache);
    store_accessors!(indexes, indexes_mut, IndexManager);

    fn ensure_writable(&self) -> SyncResult<()> {
        if self.mode == TransactionMode::ReadOnly {
            return Err(failed_precondition(
                "Cannot modify the local cache in a read-only transaction",
            ));
        }
        Ok(())
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// Sequence number stamped on everything this transaction touches.
    pub fn current_sequence_number(&self) -> ListenSequenceNumber {
        self.sequence_number
    }

    /// Writes a document to the remote cache and keeps the collection-parent
    /// and field indexes in step.
    pub fn put_remote_document(
        &mut self,
        mut document: MutableDocument,
        read_time: SnapshotVersion,
    ) -> SyncResult<()> {
        document.set_read_time(read_time);
        let collection = document.key().collection_path();
        self.indexes_mut()?.add_to_collection_parent_index(&collection);
        self.indexes_mut()?.update_index_entries(&document);
        self.remote_documents_mut()?.add(document);
        Ok(())
    }

    pub fn remove_remote_document(&mut self, key: &DocumentKey) -> SyncResult<()> {
        self.indexes_mut()?.remove_document(key);
        self.remote_documents_mut()?.remove(key);
        Ok(())
    }
}
