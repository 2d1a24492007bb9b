use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_channel::Receiver;

use crate::api::{DocumentSnapshot, GetSource, QuerySnapshot, SetOptions, WriteBatch};
use crate::core::{ListenOptions, OnlineState, Query, QueryListener, SyncEngine, View, ViewSnapshot};
use crate::error::{cancelled, internal_error, unavailable, SyncResult};
use crate::local::{LocalStore, LruResults, Persistence};
use crate::model::{DocumentKey, FieldIndex, Mutation, SnapshotVersion};
use crate::remote::datastore::StreamingDatastoreImpl;
use crate::remote::stream::MultiplexedConnection;
use crate::remote::{StreamingDatastore, TokenProviderArc};
use crate::settings::SyncSettings;
use crate::util::{lock, AsyncQueue, DelayedOperation, TimerId};
use crate::value::Value;

/// Entry point for applications: reads, writes and subscriptions against
/// the local cache, kept in sync with the remote authority.
///
/// Cloning is cheap; clones share one client.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    settings: SyncSettings,
    queue: AsyncQueue,
    sync_engine: SyncEngine,
    next_listener_id: AtomicU64,
    gc_timer: Mutex<Option<DelayedOperation<()>>>,
}

impl SyncClient {
    /// Opens the local cache described by `settings` and starts talking to
    /// the authority behind `datastore`.
    pub fn new(
        settings: SyncSettings,
        datastore: Arc<dyn StreamingDatastore>,
        token_provider: TokenProviderArc,
    ) -> SyncResult<Self> {
        let queue = AsyncQueue::with_retry(settings.retry_max_attempts, settings.retry_backoff.clone());
        let persistence = Arc::new(Persistence::open(&settings)?);
        let local_store = Arc::new(LocalStore::new(persistence, &settings));
        let sync_engine = SyncEngine::new(&settings, queue.clone(), local_store, datastore, token_provider);
        log::debug!("starting sync client for {}", settings.database_id.database_name());

        let engine = sync_engine.clone();
        queue.enqueue_and_forget(move || async move { engine.remote_store().start().await });

        let inner = Arc::new(ClientInner {
            settings,
            queue,
            sync_engine,
            next_listener_id: AtomicU64::new(1),
            gc_timer: Mutex::new(None),
        });
        if inner.settings.lru.is_enabled() {
            schedule_garbage_collection(&inner, inner.settings.lru.initial_delay);
        }
        Ok(Self { inner })
    }

    /// Connects over a multiplexed stream connection.
    pub fn connect(
        settings: SyncSettings,
        connection: Arc<MultiplexedConnection>,
        token_provider: TokenProviderArc,
    ) -> SyncResult<Self> {
        Self::new(settings, Arc::new(StreamingDatastoreImpl::new(connection)), token_provider)
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.sync_engine.online_state()
    }

    /// Starts listening to `query`. Snapshots arrive in order on the
    /// returned subscription; dropping it stops the listen.
    pub async fn subscribe(&self, query: Query, options: ListenOptions) -> SyncResult<Subscription> {
        let listener_id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = async_channel::unbounded();
        let listener = QueryListener::new(listener_id, query.clone(), options, sender);
        let engine = self.inner.sync_engine.clone();
        self.inner
            .queue
            .enqueue(move || async move { engine.listen(listener).await })
            .await?;
        Ok(Subscription {
            query,
            listener_id,
            receiver,
            client: Arc::downgrade(&self.inner),
        })
    }

    /// Reads `query` once.
    pub async fn get_once(&self, query: Query, source: GetSource) -> SyncResult<QuerySnapshot> {
        if source == GetSource::Cache {
            let engine = self.inner.sync_engine.clone();
            let snapshot = self
                .inner
                .queue
                .enqueue(move || async move { execute_cached_query(engine.local_store(), query) })
                .await?;
            return Ok(QuerySnapshot::from_view_snapshot(snapshot));
        }

        let options = ListenOptions::default().with_metadata_changes().wait_for_sync();
        let mut subscription = self.subscribe(query, options).await?;
        let snapshot = subscription
            .next()
            .await
            .unwrap_or_else(|| Err(cancelled("The listen ended before delivering a snapshot")))?;
        if snapshot.from_cache() && source == GetSource::Server {
            return Err(unavailable(
                "Failed to get documents from server. The client may be offline.",
            ));
        }
        Ok(snapshot)
    }

    /// Reads one document once.
    pub async fn get_document(&self, key: &DocumentKey, source: GetSource) -> SyncResult<DocumentSnapshot> {
        if source == GetSource::Cache {
            let engine = self.inner.sync_engine.clone();
            let lookup = key.clone();
            let document = self
                .inner
                .queue
                .enqueue(move || async move { engine.local_store().read_document(&lookup) })
                .await?;
            if document.is_found_document() {
                return Ok(DocumentSnapshot::from_document(&document, true));
            }
            if document.is_no_document() {
                return Ok(DocumentSnapshot::missing(key.clone(), true));
            }
            return Err(unavailable(
                "Failed to get document from cache. The document is not cached.",
            ));
        }

        let snapshot = self.get_once(Query::document(key), GetSource::Default).await?;
        let document = snapshot
            .get(key)
            .cloned()
            .unwrap_or_else(|| DocumentSnapshot::missing(key.clone(), snapshot.from_cache()));
        if !document.exists() && document.from_cache() {
            return Err(unavailable("Failed to get document because the client is offline."));
        }
        if document.exists() && document.from_cache() && source == GetSource::Server {
            return Err(unavailable(
                "Failed to get document from server. The client may be offline.",
            ));
        }
        Ok(document)
    }

    pub fn batch(&self) -> WriteBatch {
        WriteBatch::new(self.clone())
    }

    pub async fn set_document(
        &self,
        key: &DocumentKey,
        data: BTreeMap<String, Value>,
        options: SetOptions,
    ) -> SyncResult<SnapshotVersion> {
        let mut batch = self.batch();
        batch.set(key, data, options)?;
        batch.commit().await
    }

    pub async fn update_document(
        &self,
        key: &DocumentKey,
        data: BTreeMap<String, Value>,
    ) -> SyncResult<SnapshotVersion> {
        let mut batch = self.batch();
        batch.update(key, data)?;
        batch.commit().await
    }

    pub async fn delete_document(&self, key: &DocumentKey) -> SyncResult<SnapshotVersion> {
        let mut batch = self.batch();
        batch.delete(key)?;
        batch.commit().await
    }

    /// Applies `mutations` locally as one batch and waits for the authority
    /// to accept or reject it. Views see the write right away.
    pub async fn submit(&self, mutations: Vec<Mutation>) -> SyncResult<SnapshotVersion> {
        if mutations.is_empty() {
            return Ok(SnapshotVersion::min());
        }
        let engine = self.inner.sync_engine.clone();
        let callback = self
            .inner
            .queue
            .enqueue_retryable(move || {
                let engine = engine.clone();
                let mutations = mutations.clone();
                async move { engine.write(mutations).await }
            })
            .await?;
        callback
            .await
            .unwrap_or_else(|_| Err(cancelled("The write was dropped before it resolved")))
    }

    /// Resolves once every write submitted so far has been acknowledged or
    /// rejected. Stays pending while offline.
    pub async fn wait_for_pending_writes(&self) -> SyncResult<()> {
        let engine = self.inner.sync_engine.clone();
        let callback = self
            .inner
            .queue
            .enqueue(move || async move { engine.register_pending_writes_callback() })
            .await?;
        callback
            .await
            .unwrap_or_else(|_| Err(cancelled("The client has been shut down")))
    }

    pub async fn enable_network(&self) -> SyncResult<()> {
        let engine = self.inner.sync_engine.clone();
        self.inner
            .queue
            .enqueue(move || async move { engine.enable_network().await })
            .await
    }

    /// Goes offline. Listeners keep getting cache results and writes queue
    /// up locally.
    pub async fn disable_network(&self) -> SyncResult<()> {
        let engine = self.inner.sync_engine.clone();
        self.inner
            .queue
            .enqueue(move || async move { engine.disable_network().await })
            .await
    }

    /// Call after the token provider starts handing out tokens for a
    /// different principal.
    pub async fn handle_credential_change(&self) -> SyncResult<()> {
        let engine = self.inner.sync_engine.clone();
        self.inner
            .queue
            .enqueue(move || async move { engine.handle_credential_change().await })
            .await
    }

    /// Runs one garbage collection pass now, independent of the schedule.
    pub async fn collect_garbage(&self) -> SyncResult<LruResults> {
        let engine = self.inner.sync_engine.clone();
        self.inner
            .queue
            .enqueue(move || async move { engine.local_store().collect_garbage() })
            .await
    }

    /// Replaces the configured field indexes.
    pub async fn configure_indexes(&self, indexes: Vec<FieldIndex>) -> SyncResult<()> {
        let engine = self.inner.sync_engine.clone();
        self.inner
            .queue
            .enqueue(move || async move { engine.local_store().configure_field_indexes(indexes) })
            .await
    }

    pub async fn delete_all_indexes(&self) -> SyncResult<()> {
        let engine = self.inner.sync_engine.clone();
        self.inner
            .queue
            .enqueue(move || async move { engine.local_store().delete_all_field_indexes() })
            .await
    }

    pub async fn set_index_auto_creation_enabled(&self, enabled: bool) -> SyncResult<()> {
        let engine = self.inner.sync_engine.clone();
        self.inner
            .queue
            .enqueue(move || async move {
                engine.local_store().set_index_auto_creation_enabled(enabled);
                Ok(())
            })
            .await
    }

    /// Stops the client. Pending writes and listeners fail with `cancelled`;
    /// later calls never resolve.
    pub async fn shutdown(&self) -> SyncResult<()> {
        if let Some(timer) = lock(&self.inner.gc_timer).take() {
            timer.cancel();
        }
        let engine = self.inner.sync_engine.clone();
        self.inner
            .queue
            .enqueue_and_initiate_shutdown(move || async move { engine.shutdown().await })
            .await
    }

    #[cfg(test)]
    pub(crate) fn sync_engine(&self) -> &SyncEngine {
        &self.inner.sync_engine
    }
}

fn execute_cached_query(local_store: &LocalStore, query: Query) -> SyncResult<ViewSnapshot> {
    let result = local_store.execute_query(&query, true)?;
    let mut view = View::new(query, result.remote_keys);
    let doc_changes = view.compute_doc_changes(&result.documents, None);
    view.apply_changes(doc_changes, false, None, false)
        .snapshot
        .ok_or_else(|| internal_error("A new view must produce an initial snapshot"))
}

fn schedule_garbage_collection(inner: &Arc<ClientInner>, delay: Duration) {
    let weak: Weak<ClientInner> = Arc::downgrade(inner);
    let operation = inner
        .queue
        .enqueue_after_delay(TimerId::GarbageCollection, delay, move || async move {
            let Some(inner) = weak.upgrade() else {
                return Ok(());
            };
            match inner.sync_engine.local_store().collect_garbage() {
                Ok(results) if results.did_run => log::debug!(
                    "garbage collection removed {} targets and {} documents",
                    results.targets_removed,
                    results.documents_removed
                ),
                Ok(_) => {}
                Err(err) if err.is_transient_persistence_error() => {
                    log::debug!("garbage collection skipped: {err}")
                }
                Err(err) => log::warn!("garbage collection failed: {err}"),
            }
            schedule_garbage_collection(&inner, inner.settings.lru.regular_delay);
            Ok(())
        });
    *lock(&inner.gc_timer) = Some(operation);
}

/// Live results of a query. Dropping it stops the listen.
pub struct Subscription {
    query: Query,
    listener_id: u64,
    receiver: Receiver<SyncResult<ViewSnapshot>>,
    client: Weak<ClientInner>,
}

impl Subscription {
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Waits for the next snapshot. `None` once the listen has ended; an
    /// error is always the last item.
    pub async fn next(&mut self) -> Option<SyncResult<QuerySnapshot>> {
        let event = self.receiver.recv().await.ok()?;
        Some(event.map(QuerySnapshot::from_view_snapshot))
    }

    pub fn try_next(&mut self) -> Option<SyncResult<QuerySnapshot>> {
        let event = self.receiver.try_recv().ok()?;
        Some(event.map(QuerySnapshot::from_view_snapshot))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.receiver.close();
        let Some(inner) = self.client.upgrade() else {
            return;
        };
        let engine = inner.sync_engine.clone();
        let query = self.query.clone();
        let listener_id = self.listener_id;
        inner
            .queue
            .enqueue_and_forget(move || async move { engine.unlisten(&query, listener_id).await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ListenSource;
    use crate::error::{aborted, SyncErrorCode};
    use crate::model::DatabaseId;
    use crate::remote::datastore::NoopTokenProvider;
    use crate::remote::stream::InMemoryTransport;
    use crate::settings::LruSettings;

    struct Fixture {
        client: SyncClient,
        _peer: Arc<InMemoryTransport>,
    }

    async fn offline_client() -> Fixture {
        let (left, right) = InMemoryTransport::pair();
        let settings =
            SyncSettings::new(DatabaseId::for_project("demo")).with_lru(LruSettings::disabled());
        let client = SyncClient::connect(
            settings,
            Arc::new(MultiplexedConnection::client(left)),
            Arc::new(NoopTokenProvider),
        )
        .expect("client");
        client.disable_network().await.expect("disable network");
        Fixture { client, _peer: right }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).expect("key")
    }

    fn fields(value: i64) -> BTreeMap<String, Value> {
        BTreeMap::from([("n".to_string(), Value::from_integer(value))])
    }

    #[tokio::test]
    async fn offline_writes_are_visible_to_cache_reads() {
        let fixture = offline_client().await;
        let client = fixture.client.clone();
        let query = Query::collection("rooms").unwrap();
        let mut subscription = client
            .subscribe(query.clone(), ListenOptions::default().with_source(ListenSource::Cache))
            .await
            .unwrap();
        let initial = subscription.next().await.unwrap().unwrap();
        assert!(initial.is_empty());

        let writer = client.clone();
        let pending = tokio::spawn(async move {
            writer
                .set_document(&key("rooms/a"), fields(1), SetOptions::default())
                .await
        });

        let local = subscription.next().await.unwrap().unwrap();
        assert_eq!(local.len(), 1);
        assert!(local.has_pending_writes());

        let cached = client.get_once(query, GetSource::Cache).await.unwrap();
        assert!(cached.from_cache());
        assert_eq!(cached.len(), 1);

        let document = client.get_document(&key("rooms/a"), GetSource::Cache).await.unwrap();
        assert!(document.exists());
        assert!(document.has_pending_writes());
        assert!(!pending.is_finished());
        pending.abort();
    }

    #[tokio::test]
    async fn uncached_document_is_unavailable_from_cache() {
        let fixture = offline_client().await;
        let err = fixture
            .client
            .get_document(&key("rooms/missing"), GetSource::Cache)
            .await
            .unwrap_err();
        assert_eq!(err.code, SyncErrorCode::Unavailable);
    }

    #[tokio::test]
    async fn server_reads_fail_while_offline() {
        let fixture = offline_client().await;
        let query = Query::collection("rooms").unwrap();
        let err = fixture.client.get_once(query.clone(), GetSource::Server).await.unwrap_err();
        assert_eq!(err.code, SyncErrorCode::Unavailable);

        let snapshot = fixture.client.get_once(query, GetSource::Default).await.unwrap();
        assert!(snapshot.from_cache());
    }

    #[tokio::test]
    async fn aborted_commit_is_retried_for_writes() {
        let fixture = offline_client().await;
        let client = fixture.client.clone();
        client
            .sync_engine()
            .local_store()
            .persistence()
            .inject_commit_failure(aborted("quota exceeded"));

        let writer = client.clone();
        let pending = tokio::spawn(async move {
            writer
                .set_document(&key("rooms/a"), fields(1), SetOptions::default())
                .await
        });

        let document = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match client.get_document(&key("rooms/a"), GetSource::Cache).await {
                    Ok(document) => return document,
                    Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
                }
            }
        })
        .await
        .expect("write stored after retry");
        assert!(document.has_pending_writes());
        assert_eq!(client.sync_engine().local_store().pending_batch_count().unwrap(), 1);
        assert!(!pending.is_finished());
        pending.abort();
    }

    #[tokio::test]
    async fn empty_submit_resolves_immediately() {
        let fixture = offline_client().await;
        let version = fixture.client.submit(Vec::new()).await.unwrap();
        assert_eq!(version, SnapshotVersion::min());
        fixture.client.wait_for_pending_writes().await.unwrap();
    }

    #[tokio::test]
    async fn dropping_a_subscription_releases_the_view() {
        let fixture = offline_client().await;
        let query = Query::collection("rooms").unwrap();
        let subscription = fixture
            .client
            .subscribe(query, ListenOptions::default())
            .await
            .unwrap();
        assert_eq!(fixture.client.sync_engine().remote_store().listen_target_ids().len(), 1);
        drop(subscription);
        fixture.client.inner.queue.drain().await.unwrap();
        assert!(fixture.client.sync_engine().remote_store().listen_target_ids().is_empty());
    }

    #[tokio::test]
    async fn shutdown_fails_pending_writes() {
        let fixture = offline_client().await;
        let writer = fixture.client.clone();
        let pending = tokio::spawn(async move { writer.delete_document(&key("rooms/a")).await });
        fixture.client.inner.queue.drain().await.unwrap();
        while fixture.client.sync_engine().local_store().pending_batch_count().unwrap() == 0 {
            tokio::task::yield_now().await;
        }
        fixture.client.shutdown().await.unwrap();
        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.code, SyncErrorCode::Cancelled);
    }
}
