use std::collections::BTreeMap;
use std::sync::Arc;

use async_lock::Mutex;
use async_trait::async_trait;
use log::debug;

use crate::core::sync_engine::{SyncEngine, SyncEngineObserver};
use crate::core::view::ViewSnapshot;
use crate::error::{SyncError, SyncResult};
use crate::query::Query;
use crate::remote::remote_syncer::OnlineState;

/// What a registered listener receives over its channel.
#[derive(Clone, Debug)]
pub enum ListenerEvent {
    Snapshot(ViewSnapshot),
    /// The query was rejected; the registration is dead afterwards.
    Error(SyncError),
}

/// Handle for one registered query listener. Dropping it without calling
/// [`EventManager::unlisten`] leaks the registration until the query is
/// torn down.
pub struct QueryListener {
    id: u64,
    query: Query,
    receiver: async_channel::Receiver<ListenerEvent>,
}

impl QueryListener {
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Waits for the next event. `None` after the query was torn down.
    pub async fn next_event(&self) -> Option<ListenerEvent> {
        self.receiver.recv().await.ok()
    }

    pub fn try_next_event(&self) -> Option<ListenerEvent> {
        self.receiver.try_recv().ok()
    }
}

struct QueryListenersInfo {
    snapshot: Option<ViewSnapshot>,
    senders: BTreeMap<u64, async_channel::Sender<ListenerEvent>>,
}

struct EventManagerState {
    queries: BTreeMap<String, QueryListenersInfo>,
    next_listener_id: u64,
    online_state: OnlineState,
}

/// Fans view snapshots out to listeners, multiplexing any number of
/// listeners for the same query over one sync engine registration.
pub struct EventManager {
    sync_engine: Arc<SyncEngine>,
    state: Mutex<EventManagerState>,
}

impl EventManager {
    pub fn new(sync_engine: Arc<SyncEngine>) -> Arc<Self> {
        Arc::new(Self {
            sync_engine,
            state: Mutex::new(EventManagerState {
                queries: BTreeMap::new(),
                next_listener_id: 1,
                online_state: OnlineState::Unknown,
            }),
        })
    }

    pub async fn online_state(&self) -> OnlineState {
        self.state.lock().await.online_state
    }

    /// Registers a listener. The first listener for a query starts it; later
    /// ones immediately replay the latest snapshot.
    pub async fn listen(&self, query: Query) -> SyncResult<QueryListener> {
        let canonical_id = query.canonical_id();
        let (sender, receiver) = async_channel::unbounded();

        let (listener_id, first, replay) = {
            let mut state = self.state.lock().await;
            let listener_id = state.next_listener_id;
            state.next_listener_id += 1;
            match state.queries.get_mut(&canonical_id) {
                Some(info) => {
                    info.senders.insert(listener_id, sender);
                    (listener_id, false, info.snapshot.clone())
                }
                None => {
                    let mut senders = BTreeMap::new();
                    senders.insert(listener_id, sender);
                    state.queries.insert(
                        canonical_id.clone(),
                        QueryListenersInfo {
                            snapshot: None,
                            senders,
                        },
                    );
                    (listener_id, true, None)
                }
            }
        };

        if first {
            if let Err(err) = self.sync_engine.listen(query.clone()).await {
                let mut state = self.state.lock().await;
                state.queries.remove(&canonical_id);
                return Err(err);
            }
        } else if let Some(snapshot) = replay {
            let listener = QueryListener {
                id: listener_id,
                query,
                receiver,
            };
            self.send_to(&canonical_id, listener.id, ListenerEvent::Snapshot(snapshot))
                .await;
            return Ok(listener);
        }

        Ok(QueryListener {
            id: listener_id,
            query,
            receiver,
        })
    }

    /// Removes one registration; the last one for a query stops the query.
    pub async fn unlisten(&self, listener: QueryListener) -> SyncResult<()> {
        let canonical_id = listener.query.canonical_id();
        let stop_query = {
            let mut state = self.state.lock().await;
            let Some(info) = state.queries.get_mut(&canonical_id) else {
                return Ok(());
            };
            info.senders.remove(&listener.id);
            if info.senders.is_empty() {
                state.queries.remove(&canonical_id);
                true
            } else {
                false
            }
        };
        if stop_query {
            self.sync_engine.unlisten(&listener.query).await?;
        }
        Ok(())
    }

    async fn send_to(&self, canonical_id: &str, listener_id: u64, event: ListenerEvent) {
        let sender = {
            let state = self.state.lock().await;
            state
                .queries
                .get(canonical_id)
                .and_then(|info| info.senders.get(&listener_id).cloned())
        };
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }
}

#[async_trait]
impl SyncEngineObserver for EventManager {
    async fn on_view_snapshots(&self, snapshots: Vec<ViewSnapshot>) {
        for snapshot in snapshots {
            let canonical_id = snapshot.query.canonical_id();
            let senders: Vec<async_channel::Sender<ListenerEvent>> = {
                let mut state = self.state.lock().await;
                let Some(info) = state.queries.get_mut(&canonical_id) else {
                    continue;
                };
                info.snapshot = Some(snapshot.clone());
                info.senders.values().cloned().collect()
            };
            for sender in senders {
                let _ = sender.send(ListenerEvent::Snapshot(snapshot.clone())).await;
            }
        }
    }

    async fn on_query_error(&self, query: Query, error: SyncError) {
        let canonical_id = query.canonical_id();
        let senders = {
            let mut state = self.state.lock().await;
            state
                .queries
                .remove(&canonical_id)
                .map(|info| info.senders.into_values().collect::<Vec<_>>())
                .unwrap_or_default()
        };
        debug!("query {canonical_id} failed: {error}");
        for sender in senders {
            let _ = sender.send(ListenerEvent::Error(error.clone())).await;
        }
    }

    async fn on_online_state_change(&self, online_state: OnlineState) {
        self.state.lock().await.online_state = online_state;
    }
}
