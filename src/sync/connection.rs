// src/sync/connection.rs
//
// Связи между пользователями. Одна строка на неупорядоченную пару; каждый
// переход - условный update, который меняет строку только из ожидаемого
// статуса и только от имени допустимой стороны.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use serde_json::json;

use crate::config::RealtimeConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::{Connection, ConnectionStatus, PendingRequest, Table, User};
use crate::remote::feed::{EventFilter, FeedSpec};
use crate::remote::retry::{ResubscribePolicy, RetryCounter};
use crate::remote::store::{insert_as, select_as, select_one_as, update_as, Filter, Query};
use crate::scheduler::{Clock, TaskHandle};
use crate::sync::realtime::supervise_feed;
use crate::sync::{Callback, Subscription, SyncContext};

const CONNECTED: [ConnectionStatus; 2] = [ConnectionStatus::Accepted, ConnectionStatus::Active];
const CLOSED: [ConnectionStatus; 2] = [ConnectionStatus::Rejected, ConnectionStatus::Inactive];

fn status_filter(statuses: &[ConnectionStatus]) -> Filter {
    Filter::is_in("status", statuses.iter().map(|s| s.as_str()))
}

/// Изменения, о которых узнаёт UI.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    IncomingRequest(PendingRequest),
    Connected(Connection),
    Removed(Connection),
}

#[derive(Default)]
struct LocalState {
    /// Установленные связи по id собеседника.
    active: HashMap<String, Connection>,
    /// Входящие запросы по id строки.
    incoming: HashMap<String, PendingRequest>,
    /// Исходящие запросы по id собеседника.
    outgoing: HashMap<String, Connection>,
}

impl LocalState {
    /// Переносит строку в нужное множество; возвращает событие для слушателей.
    fn apply(&mut self, me: &str, row: Connection, initiator: Option<User>) -> Option<ConnectionEvent> {
        let peer = row.peer_of(me)?.to_string();
        let id = row.id.clone().unwrap_or_default();

        let was_active = self.active.remove(&peer).is_some();
        let was_incoming = self.incoming.remove(&id).is_some();
        let was_outgoing = self.outgoing.remove(&peer).is_some();

        match row.status {
            ConnectionStatus::Pending if row.receiver_id == me => {
                let request = PendingRequest {
                    connection: row,
                    initiator,
                };
                self.incoming.insert(id, request.clone());
                (!was_incoming).then_some(ConnectionEvent::IncomingRequest(request))
            }
            ConnectionStatus::Pending => {
                self.outgoing.insert(peer, row);
                None
            }
            ConnectionStatus::Accepted | ConnectionStatus::Active => {
                self.active.insert(peer, row.clone());
                (!was_active).then_some(ConnectionEvent::Connected(row))
            }
            ConnectionStatus::Rejected | ConnectionStatus::Inactive => {
                (was_active || was_incoming || was_outgoing).then_some(ConnectionEvent::Removed(row))
            }
        }
    }
}

struct ConnectionInner {
    ctx: SyncContext,
    user_id: String,
    policy: ResubscribePolicy,
    retries: RetryCounter,
    state: Mutex<LocalState>,
    listeners: Mutex<HashMap<u64, Callback<ConnectionEvent>>>,
    feed: Mutex<Option<TaskHandle>>,
    next_id: AtomicU64,
}

impl ConnectionInner {
    fn state(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, event: ConnectionEvent) {
        let listeners: Vec<Callback<ConnectionEvent>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(event.clone());
        }
    }

    /// Профиль инициатора для входящего запроса; отсутствие не ошибка.
    async fn initiator_of(&self, row: &Connection) -> Option<User> {
        if row.status != ConnectionStatus::Pending || row.receiver_id != self.user_id {
            return None;
        }
        let query = Query::by_id(Table::Users, &row.initiator_id);
        match select_one_as::<User>(self.ctx.store.as_ref(), "connection_initiator", query).await {
            Ok(user) => user,
            Err(e) => {
                debug!("initiator {} not loaded: {}", row.initiator_id, e);
                None
            }
        }
    }

    async fn apply(&self, row: Connection) {
        let initiator = self.initiator_of(&row).await;
        let event = self.state().apply(&self.user_id, row, initiator);
        if let Some(event) = event {
            self.notify(event);
        }
    }

    /// Почему условный update не нашёл строку.
    async fn diagnose(&self, connection_id: &str, action: &str, actor_ok: impl Fn(&Connection) -> bool) -> SyncError {
        let query = Query::by_id(Table::Connections, connection_id);
        match select_one_as::<Connection>(self.ctx.store.as_ref(), "connection_diagnose", query).await {
            Ok(None) => SyncError::NotFound(format!("connection {connection_id}")),
            Ok(Some(row)) if !actor_ok(&row) => SyncError::NotAllowed(format!(
                "{} cannot {} connection {}",
                self.user_id, action, connection_id
            )),
            Ok(Some(row)) => SyncError::Conflict(format!(
                "connection {} is {}, cannot {}",
                connection_id,
                row.status.as_str(),
                action
            )),
            Err(e) => e,
        }
    }

    async fn transition(
        &self,
        connection_id: &str,
        action: &str,
        filter: Filter,
        to: ConnectionStatus,
        actor_ok: impl Fn(&Connection) -> bool,
    ) -> SyncResult<Connection> {
        let patch = json!({ "status": to.as_str(), "updated_at": self.ctx.clock.now() });
        let updated: Vec<Connection> = update_as(
            self.ctx.store.as_ref(),
            "connection_transition",
            Table::Connections,
            Filter::eq("id", connection_id).and(filter),
            patch,
        )
        .await?;
        let Some(row) = updated.into_iter().next() else {
            return Err(self.diagnose(connection_id, action, actor_ok).await);
        };
        info!("connection {} -> {} by {}", connection_id, to.as_str(), self.user_id);
        self.apply(row.clone()).await;
        Ok(row)
    }
}

/// Связи пользователя `user_id` и их изменения в реальном времени.
#[derive(Clone)]
pub struct ConnectionStateMachine {
    inner: Arc<ConnectionInner>,
}

impl ConnectionStateMachine {
    pub fn new(ctx: SyncContext, user_id: &str, realtime: &RealtimeConfig) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                ctx,
                user_id: user_id.to_string(),
                policy: ResubscribePolicy::from_config(realtime),
                retries: RetryCounter::new(),
                state: Mutex::new(LocalState::default()),
                listeners: Mutex::new(HashMap::new()),
                feed: Mutex::new(None),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    /// Запрос связи. Существующая строка пары переиспользуется: закрытая
    /// открывается заново, ожидающая или установленная возвращается как есть.
    pub async fn request_connection(&self, peer_id: &str) -> SyncResult<Connection> {
        let inner = &self.inner;
        let me = inner.user_id.as_str();
        if peer_id == me {
            return Err(SyncError::Invalid("cannot connect to yourself".into()));
        }
        let now = inner.ctx.clock.now();
        let existing: Option<Connection> = select_one_as(
            inner.ctx.store.as_ref(),
            "connection_lookup",
            Query::new(Table::Connections).filter(Filter::pair("initiator_id", "receiver_id", me, peer_id)),
        )
        .await?;

        let row = match existing {
            None => {
                let fresh = Connection {
                    id: None,
                    initiator_id: me.to_string(),
                    receiver_id: peer_id.to_string(),
                    status: ConnectionStatus::Pending,
                    created_at: now,
                    updated_at: now,
                };
                let inserted: Vec<Connection> =
                    insert_as(inner.ctx.store.as_ref(), "connection_request", Table::Connections, &[fresh]).await?;
                inserted
                    .into_iter()
                    .next()
                    .ok_or_else(|| SyncError::RemoteUnavailable("insert returned no row".into()))?
            }
            Some(row) if CLOSED.contains(&row.status) => {
                let id = row
                    .id
                    .clone()
                    .ok_or_else(|| SyncError::Invalid("stored connection without id".into()))?;
                let patch = json!({
                    "initiator_id": me,
                    "receiver_id": peer_id,
                    "status": ConnectionStatus::Pending.as_str(),
                    "updated_at": now,
                });
                let reopened: Vec<Connection> = update_as(
                    inner.ctx.store.as_ref(),
                    "connection_reopen",
                    Table::Connections,
                    Filter::eq("id", id.as_str()).and(status_filter(&CLOSED)),
                    patch,
                )
                .await?;
                reopened
                    .into_iter()
                    .next()
                    .ok_or_else(|| SyncError::Conflict(format!("connection {id} changed concurrently")))?
            }
            Some(row) => {
                debug!("connection {}<->{} already {}", me, peer_id, row.status.as_str());
                row
            }
        };
        inner.apply(row.clone()).await;
        Ok(row)
    }

    /// Принять входящий запрос: только получатель и только из `pending`.
    pub async fn accept_request(&self, connection_id: &str) -> SyncResult<Connection> {
        let me = self.inner.user_id.clone();
        let filter = Filter::eq("receiver_id", me.as_str())
            .and(Filter::eq("status", ConnectionStatus::Pending.as_str()));
        self.inner
            .transition(connection_id, "accept", filter, ConnectionStatus::Accepted, |row| {
                row.receiver_id == me
            })
            .await
    }

    pub async fn reject_request(&self, connection_id: &str) -> SyncResult<Connection> {
        let me = self.inner.user_id.clone();
        let filter = Filter::eq("receiver_id", me.as_str())
            .and(Filter::eq("status", ConnectionStatus::Pending.as_str()));
        self.inner
            .transition(connection_id, "reject", filter, ConnectionStatus::Rejected, |row| {
                row.receiver_id == me
            })
            .await
    }

    /// Завершить установленную связь: любая из сторон.
    pub async fn end_connection(&self, connection_id: &str) -> SyncResult<Connection> {
        let me = self.inner.user_id.clone();
        let filter = Filter::eq("initiator_id", me.as_str())
            .or(Filter::eq("receiver_id", me.as_str()))
            .and(status_filter(&CONNECTED));
        self.inner
            .transition(connection_id, "end", filter, ConnectionStatus::Inactive, |row| {
                row.involves(&me)
            })
            .await
    }

    /// Перечитывает связи и входящие запросы из хранилища.
    pub async fn refresh(&self) -> SyncResult<()> {
        let inner = &self.inner;
        let me = inner.user_id.as_str();
        let rows: Vec<Connection> = select_as(
            inner.ctx.store.as_ref(),
            "connections_refresh",
            Query::new(Table::Connections)
                .filter(Filter::eq("initiator_id", me).or(Filter::eq("receiver_id", me))),
        )
        .await?;

        let mut fresh = LocalState::default();
        for row in rows {
            let initiator = inner.initiator_of(&row).await;
            fresh.apply(me, row, initiator);
        }
        let incoming = fresh.incoming.len();
        let active = fresh.active.len();
        *inner.state() = fresh;
        debug!("{} has {} connections and {} incoming requests", me, active, incoming);
        Ok(())
    }

    /// Подписка на изменения строк, где пользователь инициатор или получатель.
    /// Повторный вызов ничего не делает.
    pub async fn start_realtime(&self) {
        let inner = &self.inner;
        if inner.feed.lock().unwrap_or_else(PoisonError::into_inner).is_some() {
            return;
        }
        let me = inner.user_id.as_str();
        let weak = Arc::downgrade(inner);
        let task = supervise_feed(
            inner.ctx.feed.clone(),
            FeedSpec::new(Table::Connections, EventFilter::All)
                .filter(Filter::eq("initiator_id", me).or(Filter::eq("receiver_id", me))),
            format!("connections:{me}"),
            inner.policy,
            inner.retries.clone(),
            move |event| {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return ControlFlow::Break(());
                    };
                    match event.new_as::<Connection>() {
                        Ok(Some(row)) => inner.apply(row).await,
                        Ok(None) => {}
                        Err(e) => warn!("malformed connection row: {}", e),
                    }
                    ControlFlow::Continue(())
                }
            },
        )
        .await;
        *inner.feed.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    pub fn stop_realtime(&self) {
        let task = self.inner.feed.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.cancel();
        }
    }

    pub fn subscribe(&self, listener: Callback<ConnectionEvent>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, listener);
        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
            }
        })
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.inner.state().active.values().cloned().collect()
    }

    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        let mut pending: Vec<PendingRequest> = self.inner.state().incoming.values().cloned().collect();
        pending.sort_by(|a, b| b.connection.created_at.cmp(&a.connection.created_at));
        pending
    }

    /// Известная локально строка с этим собеседником в любом открытом статусе.
    pub fn connection_with(&self, peer_id: &str) -> Option<Connection> {
        let state = self.inner.state();
        state
            .active
            .get(peer_id)
            .or_else(|| state.outgoing.get(peer_id))
            .cloned()
            .or_else(|| {
                state
                    .incoming
                    .values()
                    .find(|r| r.connection.initiator_id == peer_id)
                    .map(|r| r.connection.clone())
            })
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.inner.state().active.contains_key(peer_id)
    }

    /// Строка связи с собеседником по данным хранилища.
    pub async fn fetch_connection(&self, peer_id: &str) -> SyncResult<Option<Connection>> {
        let inner = &self.inner;
        select_one_as(
            inner.ctx.store.as_ref(),
            "connection_status",
            Query::new(Table::Connections)
                .filter(Filter::pair("initiator_id", "receiver_id", &inner.user_id, peer_id)),
        )
        .await
    }

    pub async fn fetch_connection_status(&self, peer_id: &str) -> SyncResult<Option<ConnectionStatus>> {
        Ok(self.fetch_connection(peer_id).await?.map(|r| r.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::cache_store::MemoryCache;
    use crate::models::UserRole;
    use crate::remote::memory::MemoryBackend;
    use crate::scheduler::TokioClock;
    use chrono::Utc;

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn machine(backend: &MemoryBackend, user: &str) -> ConnectionStateMachine {
        let ctx = SyncContext::from_memory(backend, Arc::new(MemoryCache::new()), Arc::new(TokioClock::new()));
        ConnectionStateMachine::new(ctx, user, &RealtimeConfig::default())
    }

    fn user(id: &str, role: UserRole) -> User {
        User {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            full_name: Some(id.to_uppercase()),
            avatar_url: None,
            role,
            created_at: Utc::now(),
        }
    }

    fn id_of(conn: &Connection) -> &str {
        conn.id.as_deref().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_is_unique_per_pair() {
        let backend = MemoryBackend::new();
        let a = machine(&backend, "a");
        let b = machine(&backend, "b");

        let first = a.request_connection("b").await.unwrap();
        let again = a.request_connection("b").await.unwrap();
        let reverse = b.request_connection("a").await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(first.id, reverse.id);
        assert_eq!(reverse.status, ConnectionStatus::Pending);
        assert_eq!(backend.row_count(Table::Connections), 1);
        assert!(a.request_connection("a").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_requires_receiver_and_pending() {
        let backend = MemoryBackend::new();
        let a = machine(&backend, "a");
        let b = machine(&backend, "b");
        let row = a.request_connection("b").await.unwrap();

        assert!(matches!(a.accept_request(id_of(&row)).await, Err(SyncError::NotAllowed(_))));
        let accepted = b.accept_request(id_of(&row)).await.unwrap();
        assert_eq!(accepted.status, ConnectionStatus::Accepted);
        assert!(b.is_connected("a"));
        assert!(matches!(b.accept_request(id_of(&row)).await, Err(SyncError::Conflict(_))));
        assert!(matches!(b.accept_request("missing").await, Err(SyncError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_row_cannot_be_accepted_but_can_be_rerequested() {
        let backend = MemoryBackend::new();
        let a = machine(&backend, "a");
        let b = machine(&backend, "b");
        let row = a.request_connection("b").await.unwrap();
        b.reject_request(id_of(&row)).await.unwrap();
        assert!(matches!(b.accept_request(id_of(&row)).await, Err(SyncError::Conflict(_))));

        let reopened = b.request_connection("a").await.unwrap();
        assert_eq!(reopened.id, row.id, "same row reopened");
        assert_eq!(reopened.status, ConnectionStatus::Pending);
        assert_eq!(reopened.initiator_id, "b");
        assert_eq!(backend.row_count(Table::Connections), 1);
        a.accept_request(id_of(&reopened)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_by_either_party_only() {
        let backend = MemoryBackend::new();
        let a = machine(&backend, "a");
        let b = machine(&backend, "b");
        let c = machine(&backend, "c");
        let row = a.request_connection("b").await.unwrap();
        b.accept_request(id_of(&row)).await.unwrap();

        assert!(matches!(c.end_connection(id_of(&row)).await, Err(SyncError::NotAllowed(_))));
        let ended = a.end_connection(id_of(&row)).await.unwrap();
        assert_eq!(ended.status, ConnectionStatus::Inactive);
        assert!(matches!(b.end_connection(id_of(&row)).await, Err(SyncError::Conflict(_))));
        assert_eq!(a.fetch_connection_status("b").await.unwrap(), Some(ConnectionStatus::Inactive));
    }

    #[tokio::test(start_paused = true)]
    async fn test_realtime_request_and_accept_reach_both_sides() {
        let backend = MemoryBackend::new();
        backend.seed(Table::Users, &user("a", UserRole::Passenger)).unwrap();
        backend.seed(Table::Users, &user("b", UserRole::Driver)).unwrap();
        let a = machine(&backend, "a");
        let b = machine(&backend, "b");
        a.start_realtime().await;
        b.start_realtime().await;
        b.start_realtime().await;
        assert_eq!(backend.feed_subscribers(Table::Connections), 2);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _sub = b.subscribe(Arc::new(move |e: ConnectionEvent| sink.lock().unwrap().push(e)));

        let row = a.request_connection("b").await.unwrap();
        settle().await;
        let pending = b.pending_requests();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].initiator.as_ref().map(|u| u.email.as_str()), Some("a@example.com"));
        assert!(matches!(events.lock().unwrap()[0], ConnectionEvent::IncomingRequest(_)));

        b.accept_request(id_of(&row)).await.unwrap();
        settle().await;
        assert!(a.is_connected("b"));
        assert!(b.is_connected("a"));
        assert!(b.pending_requests().is_empty());
        let connected = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, ConnectionEvent::Connected(_)))
            .count();
        assert_eq!(connected, 1, "local transition and feed echo give one event");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loads_state() {
        let backend = MemoryBackend::new();
        let a = machine(&backend, "a");
        let row = a.request_connection("b").await.unwrap();
        machine(&backend, "c").request_connection("a").await.unwrap();
        machine(&backend, "b").accept_request(id_of(&row)).await.unwrap();

        let fresh = machine(&backend, "a");
        fresh.refresh().await.unwrap();
        assert_eq!(fresh.connections().len(), 1);
        assert!(fresh.is_connected("b"));
        assert_eq!(fresh.pending_requests().len(), 1);
        assert!(fresh.connection_with("c").is_some());

        backend.set_online(false);
        assert!(fresh.refresh().await.is_err());
        assert!(fresh.is_connected("b"), "failed refresh keeps the last state");
    }
}
