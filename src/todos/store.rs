//! Local mirror of the signed-in user's todo list
//!
//! The mirror changes in two ways only: after the server accepted a REST call
//! made through this store, or when the push channel delivers an event.
//! Creating an item never inserts locally; the row appears once the server
//! pushes it back.

use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use todo_sync_auth::{ApiClient, Notice, SessionStore, TokenAccessor};
use todo_sync_realtime::{ConnectionState, HubClientOptions, HubConnection, Invocation};

use super::api::TodoApi;
use super::events::{apply_event, upsert, TodoEvent};
use super::types::{CreateTodoItem, TodoItem};
use crate::error::{Error, Result};

type Mirror = Arc<RwLock<Vec<TodoItem>>>;
type PushSlot = Arc<Mutex<Option<PushChannel>>>;

struct PushChannel {
    generation: u64,
    /// User the channel was opened for
    owner: String,
    connection: HubConnection,
    dispatcher: JoinHandle<()>,
}

struct Inner {
    api: TodoApi,
    session: SessionStore,
    tokens: TokenAccessor,
    hub_url: String,
    hub_options: HubClientOptions,
    items: Mirror,
    in_flight: AtomicUsize,
    push: PushSlot,
    generations: AtomicU64,
}

/// Todo collection store shared by every view of the list
#[derive(Clone)]
pub struct TodoStore {
    inner: Arc<Inner>,
}

impl TodoStore {
    /// The push channel authenticates with `api`'s token store, read again on
    /// every (re)connect.
    pub fn new(api: ApiClient, hub_url: &str, hub_options: HubClientOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                session: api.session().clone(),
                tokens: api.tokens().accessor(),
                api: TodoApi::new(api),
                hub_url: hub_url.to_string(),
                hub_options,
                items: Arc::new(RwLock::new(Vec::new())),
                in_flight: AtomicUsize::new(0),
                push: Arc::new(Mutex::new(None)),
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn api(&self) -> &TodoApi {
        &self.inner.api
    }

    /// Replace the mirror with the server's list
    pub async fn load_all(&self) -> Result<()> {
        let _loading = self.loading();
        match self.inner.api.get_all().await {
            Ok(items) => {
                debug!("Loaded {} todo items", items.len());
                *write(&self.inner.items) = items;
                Ok(())
            }
            Err(e) => {
                error!("Failed to load todo items: {}", e);
                Err(e.into())
            }
        }
    }

    /// Ask the server to create an item; the mirror is left untouched
    pub async fn create(&self, item: &CreateTodoItem) -> Result<()> {
        let _loading = self.loading();
        self.inner.api.create(item).await.map_err(|e| {
            error!("Failed to create todo item: {}", e);
            e.into()
        })
    }

    /// Replace the row with `item` once the server accepted it
    pub async fn update(&self, item: TodoItem) -> Result<()> {
        let _loading = self.loading();
        if let Err(e) = self.inner.api.update(&item).await {
            error!("Failed to update todo item {}: {}", item.id, e);
            return Err(e.into());
        }
        let mut items = write(&self.inner.items);
        if let Some(existing) = items.iter_mut().find(|t| t.id == item.id) {
            *existing = item;
        }
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        let _loading = self.loading();
        if let Err(e) = self.inner.api.delete(id).await {
            error!("Failed to delete todo item {}: {}", id, e);
            return Err(e.into());
        }
        write(&self.inner.items).retain(|t| t.id != id);
        Ok(())
    }

    /// Mark exactly `ids` completed, all with the same local timestamp
    pub async fn bulk_complete(&self, ids: &[i64]) -> Result<()> {
        let _loading = self.loading();
        if let Err(e) = self.inner.api.bulk_complete(ids).await {
            error!("Failed to complete todo items {:?}: {}", ids, e);
            return Err(e.into());
        }
        let now = Utc::now();
        for item in write(&self.inner.items)
            .iter_mut()
            .filter(|t| ids.contains(&t.id))
        {
            item.complete(now);
        }
        Ok(())
    }

    /// Fetch one row and merge it into the mirror
    pub async fn load_item(&self, id: i64) -> Result<TodoItem> {
        let _loading = self.loading();
        match self.inner.api.get(id).await {
            Ok(item) => {
                upsert(&mut write(&self.inner.items), item.clone());
                Ok(item)
            }
            Err(e) => {
                error!("Failed to load todo item {}: {}", id, e);
                Err(e.into())
            }
        }
    }

    /// Open the push channel for the current session.
    ///
    /// Does nothing when a channel for the same user already exists; a
    /// channel left over from another user is closed and replaced. A failed
    /// start leaves no channel behind so a later call tries again.
    ///
    /// When the session expires the channel closes itself and the mirror is
    /// cleared, as on logout.
    pub async fn connect_push(&self) -> Result<()> {
        let mut push = self.inner.push.lock().await;

        let session = match self.inner.session.get() {
            Some(session) if !session.token.is_empty() => session,
            _ => {
                error!("Cannot start push channel: user token missing");
                return Err(Error::MissingSession);
            }
        };

        match push.take() {
            Some(channel) if channel.owner == session.id => {
                debug!("Push channel already exists");
                *push = Some(channel);
                return Ok(());
            }
            Some(stale) => {
                info!("Replacing push channel opened for another user");
                stale.close().await;
            }
            None => {}
        }

        let connection = HubConnection::new(
            &self.inner.hub_url,
            self.inner.hub_options.clone(),
            self.inner.tokens.clone(),
        )?;
        // subscribe first so nothing sent right after the handshake is missed
        let invocations = connection.invocations();
        let notices = self.inner.api.client().notices();
        if let Err(e) = connection.start().await {
            error!("Push channel connection error: {}", e);
            return Err(e.into());
        }
        info!("Push channel connected");

        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let dispatcher = tokio::spawn(
            Dispatcher {
                generation,
                invocations,
                notices,
                items: self.inner.items.clone(),
                slot: self.inner.push.clone(),
                api: self.inner.api.clone(),
            }
            .run(),
        );
        *push = Some(PushChannel {
            generation,
            owner: session.id,
            connection,
            dispatcher,
        });
        Ok(())
    }

    /// Close the push channel; the next session builds a new one
    pub async fn disconnect_push(&self) {
        let channel = self.inner.push.lock().await.take();
        if let Some(channel) = channel {
            channel.close().await;
        }
    }

    /// `None` when no channel has been built
    pub async fn push_state(&self) -> Option<ConnectionState> {
        let connection = self
            .inner
            .push
            .lock()
            .await
            .as_ref()
            .map(|p| p.connection.clone());
        match connection {
            Some(connection) => Some(connection.state().await),
            None => None,
        }
    }

    /// Snapshot of the mirror, newest pushes first
    pub fn items(&self) -> Vec<TodoItem> {
        read(&self.inner.items).clone()
    }

    pub fn get(&self, id: i64) -> Option<TodoItem> {
        read(&self.inner.items).iter().find(|t| t.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        read(&self.inner.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True while any REST call made through this store is outstanding
    pub fn is_loading(&self) -> bool {
        self.inner.in_flight.load(Ordering::SeqCst) > 0
    }

    /// Drop every row, e.g. after logout
    pub fn clear(&self) {
        write(&self.inner.items).clear();
    }

    fn loading(&self) -> Loading<'_> {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        Loading(&self.inner.in_flight)
    }
}

impl std::fmt::Debug for TodoStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TodoStore")
            .field("hub_url", &self.inner.hub_url)
            .field("items", &self.len())
            .finish()
    }
}

/// Clears the loading flag when the operation finishes, cancelled or not
struct Loading<'a>(&'a AtomicUsize);

impl Drop for Loading<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PushChannel {
    async fn close(self) {
        self.connection.stop().await;
        self.dispatcher.abort();
        info!("Push channel closed");
    }
}

/// Routes hub invocations into the mirror for one push channel
struct Dispatcher {
    generation: u64,
    invocations: broadcast::Receiver<Invocation>,
    notices: broadcast::Receiver<Notice>,
    items: Mirror,
    slot: PushSlot,
    api: TodoApi,
}

impl Dispatcher {
    async fn run(mut self) {
        let mut notices_open = true;
        loop {
            tokio::select! {
                received = self.invocations.recv() => match received {
                    Ok(invocation) => {
                        if let Some(event) = TodoEvent::from_invocation(&invocation) {
                            debug!("Applying push event {:?}", event);
                            apply_event(&mut write(&self.items), event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Push dispatcher lagged, {} events skipped, reloading", skipped);
                        self.resync().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                notice = self.notices.recv(), if notices_open => match notice {
                    Ok(Notice::SessionExpired) => {
                        self.end_session().await;
                        break;
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => notices_open = false,
                },
            }
        }
    }

    /// Replace the mirror with the server's list after missed events
    async fn resync(&self) {
        match self.api.get_all().await {
            Ok(items) => {
                debug!("Resynced {} todo items", items.len());
                *write(&self.items) = items;
            }
            Err(e) => error!("Failed to reload todo items after lag: {}", e),
        }
    }

    async fn end_session(&self) {
        let channel = {
            let mut slot = self.slot.lock().await;
            let owned = slot
                .as_ref()
                .map_or(false, |c| c.generation == self.generation);
            if owned {
                write(&self.items).clear();
                slot.take()
            } else {
                None
            }
        };
        if let Some(channel) = channel {
            info!("Session expired, closing push channel");
            // the dispatcher is this task; only the connection needs stopping
            channel.connection.stop().await;
        }
    }
}

fn read(items: &Mirror) -> std::sync::RwLockReadGuard<'_, Vec<TodoItem>> {
    items.read().unwrap_or_else(|p| p.into_inner())
}

fn write(items: &Mirror) -> std::sync::RwLockWriteGuard<'_, Vec<TodoItem>> {
    items.write().unwrap_or_else(|p| p.into_inner())
}
