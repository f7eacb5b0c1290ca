use std::sync::Arc;

use futures::channel::oneshot;

use crate::core::event_manager::{EventManager, QueryListener};
use crate::core::sync_engine::{SyncEngine, SyncEngineObserver};
use crate::error::SyncResult;
use crate::local::{LocalStore, MemoryPersistence};
use crate::model::{DatabaseId, DocumentKey, MutableDocument, Mutation};
use crate::query::Query;
use crate::remote::credentials::CredentialsProvider;
use crate::remote::datastore::Datastore;
use crate::remote::remote_store::RemoteStore;
use crate::remote::remote_syncer::{OnlineState, RemoteSyncer};
use crate::util::async_queue::AsyncQueue;
use crate::util::backoff::BackoffConfig;

#[derive(Clone, Debug)]
pub struct SyncClientConfig {
    pub user: String,
    pub database_id: DatabaseId,
    pub backoff: BackoffConfig,
}

impl SyncClientConfig {
    pub fn new(user: impl Into<String>, database_id: DatabaseId) -> Self {
        Self {
            user: user.into(),
            database_id,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Top-level handle wiring the local store, sync engine, remote store, and
/// event manager together. All engine work is serialized through one
/// operation queue, so callers can use the client from any task.
pub struct SyncClient {
    queue: Arc<AsyncQueue>,
    event_manager: Arc<EventManager>,
    sync_engine: Arc<SyncEngine>,
    remote_store: Arc<RemoteStore>,
    local_store: Arc<LocalStore>,
}

impl SyncClient {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        auth_credentials: Arc<dyn CredentialsProvider>,
        app_check_credentials: Arc<dyn CredentialsProvider>,
        config: SyncClientConfig,
    ) -> Arc<Self> {
        let persistence = MemoryPersistence::new(config.user.clone());
        let local_store = Arc::new(LocalStore::new(persistence));
        let remote_store = RemoteStore::new(
            datastore,
            auth_credentials,
            app_check_credentials,
            Arc::clone(&local_store),
            config.database_id.clone(),
            config.backoff,
        );
        let sync_engine = SyncEngine::new(Arc::clone(&local_store), Arc::clone(&remote_store));
        remote_store
            .set_remote_syncer(Arc::downgrade(&sync_engine) as std::sync::Weak<dyn RemoteSyncer>);
        let event_manager = EventManager::new(Arc::clone(&sync_engine));
        sync_engine.set_observer(
            Arc::downgrade(&event_manager) as std::sync::Weak<dyn SyncEngineObserver>
        );

        Arc::new(Self {
            queue: AsyncQueue::new(),
            event_manager,
            sync_engine,
            remote_store,
            local_store,
        })
    }

    pub async fn enable_network(&self) -> SyncResult<()> {
        let remote_store = Arc::clone(&self.remote_store);
        self.queue
            .enqueue(async move { remote_store.enable_network().await })
            .await
    }

    pub async fn disable_network(&self) -> SyncResult<()> {
        let remote_store = Arc::clone(&self.remote_store);
        self.queue
            .enqueue(async move { remote_store.disable_network().await })
            .await
    }

    pub async fn listen(&self, query: Query) -> SyncResult<QueryListener> {
        let event_manager = Arc::clone(&self.event_manager);
        self.queue
            .enqueue(async move { event_manager.listen(query).await })
            .await?
    }

    pub async fn unlisten(&self, listener: QueryListener) -> SyncResult<()> {
        let event_manager = Arc::clone(&self.event_manager);
        self.queue
            .enqueue(async move { event_manager.unlisten(listener).await })
            .await?
    }

    /// Commits the mutations locally and returns once they are queued; the
    /// returned receiver resolves on backend acknowledgement.
    pub async fn write(
        &self,
        mutations: Vec<Mutation>,
    ) -> SyncResult<oneshot::Receiver<SyncResult<()>>> {
        let sync_engine = Arc::clone(&self.sync_engine);
        self.queue
            .enqueue(async move { sync_engine.write(mutations).await })
            .await?
    }

    /// Runs `query` once against local state, pending mutations applied,
    /// without registering a listener.
    pub async fn get_documents_matching_query(
        &self,
        query: Query,
    ) -> SyncResult<Vec<MutableDocument>> {
        let local_store = Arc::clone(&self.local_store);
        self.queue
            .enqueue(async move {
                let result = local_store.execute_query(&query, false).await?;
                let mut documents: Vec<MutableDocument> = result.documents.into_values().collect();
                documents.sort_by(|a, b| query.compare(a, b));
                Ok(documents)
            })
            .await?
    }

    /// Reads a document from local state, pending mutations applied.
    pub async fn get_document(&self, key: DocumentKey) -> SyncResult<MutableDocument> {
        let local_store = Arc::clone(&self.local_store);
        self.queue
            .enqueue(async move { local_store.read_document(&key).await })
            .await?
    }

    pub async fn handle_user_change(&self, user: String) -> SyncResult<()> {
        let sync_engine = Arc::clone(&self.sync_engine);
        self.queue
            .enqueue(async move { sync_engine.handle_user_change(&user).await })
            .await?
    }

    pub async fn online_state(&self) -> OnlineState {
        self.event_manager.online_state().await
    }

    /// Stops the streams and refuses further work. Operations already
    /// queued still run.
    pub async fn shutdown(&self) {
        let remote_store = Arc::clone(&self.remote_store);
        let _ = self
            .queue
            .enqueue(async move { remote_store.shutdown().await })
            .await;
        self.queue.enter_restricted_mode();
    }
}
