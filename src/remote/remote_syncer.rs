use std::collections::BTreeSet;

use futures::FutureExt;

use crate::core::OnlineState;
use crate::error::{SyncError, SyncResult};
use crate::model::{BatchId, DocumentKey, MutationBatchResult, TargetId};
use crate::remote::remote_event::RemoteEvent;

pub type RemoteStoreFuture<'a, T> = futures::future::BoxFuture<'a, T>;

pub fn box_remote_store_future<'a, F, T>(future: F) -> RemoteStoreFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// Callbacks the remote store raises into the synchronization engine.
///
/// Every callback runs on the serial queue.
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies a consistent snapshot received on the listen stream.
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, SyncResult<()>>;

    /// The remote authority refused to serve a target.
    fn reject_listen(
        &self,
        target_id: TargetId,
        error: SyncError,
    ) -> RemoteStoreFuture<'_, SyncResult<()>>;

    fn apply_successful_write(
        &self,
        result: MutationBatchResult,
    ) -> RemoteStoreFuture<'_, SyncResult<()>>;

    /// The batch failed permanently and must be rolled back.
    fn reject_failed_write(
        &self,
        batch_id: BatchId,
        error: SyncError,
    ) -> RemoteStoreFuture<'_, SyncResult<()>>;

    /// Keys the local cache associates with the target. Limbo targets are
    /// answered from the engine's own bookkeeping.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    fn handle_credential_change(&self) -> RemoteStoreFuture<'_, SyncResult<()>> {
        box_remote_store_future(async { Ok(()) })
    }

    fn apply_online_state_change(&self, online_state: OnlineState) -> RemoteStoreFuture<'_, ()>;
}
