// src/remote/memory.rs
//
// Бэкенд в памяти процесса: хранилище строк, лента изменений и каналы
// присутствия за одним мьютексом. Используется тестами и демо; умеет
// «уходить в офлайн» и рвать подписки, чтобы проверять деградацию.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::models::Table;
use crate::remote::feed::{ChangeEvent, ChangeFeed, ChangeKind, FeedMessage, FeedSpec, FeedSubscription};
use crate::remote::presence::{PresenceChannel, PresenceEvent, PresenceHandle, PresenceTransport};
use crate::remote::store::{compare_values, Direction, Filter, Query, RemoteStore};

struct FeedSubscriber {
    spec: FeedSpec,
    tx: UnboundedSender<FeedMessage>,
}

struct Member {
    id: u64,
    key: String,
    payload: Option<Value>,
    tx: UnboundedSender<PresenceEvent>,
}

#[derive(Default)]
struct BackendState {
    tables: HashMap<Table, Vec<Value>>,
    writes: HashMap<Table, usize>,
    feeds: Vec<FeedSubscriber>,
    channels: HashMap<String, Vec<Member>>,
    next_member: u64,
    join_delay: Option<Duration>,
}

impl BackendState {
    fn publish(&mut self, events: Vec<ChangeEvent>) {
        for event in events {
            self.feeds.retain(|sub| {
                if sub.tx.is_closed() {
                    return false;
                }
                if sub.spec.accepts(&event) {
                    sub.tx.send(FeedMessage::Change(event.clone())).is_ok()
                } else {
                    true
                }
            });
        }
    }

    fn presence_state(&self, channel: &str) -> HashMap<String, Value> {
        self.channels
            .get(channel)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|m| m.payload.clone().map(|p| (m.key.clone(), p)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

struct BackendInner {
    state: Mutex<BackendState>,
    online: AtomicBool,
}

impl BackendInner {
    fn state(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_online(&self, op: &str) -> SyncResult<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::RemoteUnavailable(format!("{op}: network is not available")))
        }
    }
}

/// Реализует RemoteStore, ChangeFeed и PresenceTransport. Клоны разделяют состояние.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<BackendInner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn as_object(row: Value, op: &str) -> SyncResult<Map<String, Value>> {
    match row {
        Value::Object(map) => Ok(map),
        other => Err(SyncError::Invalid(format!("{op}: expected JSON object, got {other}"))),
    }
}

fn assign_id(map: &mut Map<String, Value>) {
    let missing = map.get("id").map(Value::is_null).unwrap_or(true);
    if missing {
        map.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
    }
}

fn merge(target: &mut Value, patch: &Map<String, Value>) {
    if let Value::Object(existing) = target {
        for (k, v) in patch {
            existing.insert(k.clone(), v.clone());
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BackendInner {
                state: Mutex::new(BackendState::default()),
                online: AtomicBool::new(true),
            }),
        }
    }

    /// Переключает доступность сети для всех операций.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
        debug!("memory backend online = {}", online);
    }

    /// Задержка входа в канал присутствия, как у медленной сети.
    pub fn set_join_delay(&self, delay: Option<Duration>) {
        self.inner.state().join_delay = delay;
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    pub fn rows(&self, table: Table) -> Vec<Value> {
        self.inner.state().tables.get(&table).cloned().unwrap_or_default()
    }

    pub fn rows_as<T: DeserializeOwned>(&self, table: Table) -> Vec<T> {
        self.rows(table)
            .into_iter()
            .filter_map(|row| serde_json::from_value(row).ok())
            .collect()
    }

    pub fn row_count(&self, table: Table) -> usize {
        self.inner.state().tables.get(&table).map(Vec::len).unwrap_or(0)
    }

    /// Число успешных вызовов записи (insert/update/upsert) в таблицу.
    pub fn writes(&self, table: Table) -> usize {
        self.inner.state().writes.get(&table).copied().unwrap_or(0)
    }

    /// Кладёт строку напрямую, без событий и без учёта в `writes`.
    pub fn seed<T: Serialize>(&self, table: Table, value: &T) -> SyncResult<Value> {
        let mut map = as_object(serde_json::to_value(value)?, "seed")?;
        assign_id(&mut map);
        let row = Value::Object(map);
        self.inner
            .state()
            .tables
            .entry(table)
            .or_default()
            .push(row.clone());
        Ok(row)
    }

    /// Рвёт все подписки на ленту изменений с ошибкой транспорта.
    pub fn fail_feeds(&self, reason: &str) {
        let mut state = self.inner.state();
        for sub in state.feeds.drain(..) {
            let _ = sub.tx.send(FeedMessage::Error(reason.to_string()));
        }
    }

    /// Рвёт канал присутствия: участники получают ошибку и выбывают.
    pub fn fail_channel(&self, channel: &str, reason: &str) {
        let mut state = self.inner.state();
        if let Some(members) = state.channels.remove(channel) {
            for m in members {
                let _ = m.tx.send(PresenceEvent::Error(reason.to_string()));
            }
        }
    }

    /// Живые подписчики ленты на таблицу.
    pub fn feed_subscribers(&self, table: Table) -> usize {
        self.inner
            .state()
            .feeds
            .iter()
            .filter(|s| s.spec.table == table && !s.tx.is_closed())
            .count()
    }

    pub fn channel_members(&self, channel: &str) -> usize {
        self.inner
            .state()
            .channels
            .get(channel)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.state().channels.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl RemoteStore for MemoryBackend {
    async fn select(&self, query: Query) -> SyncResult<Vec<Value>> {
        self.inner.ensure_online("select")?;
        let state = self.inner.state();
        let mut rows: Vec<Value> = state
            .tables
            .get(&query.table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| query.filter.as_ref().map(|f| f.matches(r)).unwrap_or(true))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(state);

        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let ord = compare_values(a.get(&order.column), b.get(&order.column));
                match order.direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                }
            });
        }
        let page = rows
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(page)
    }

    async fn insert(&self, table: Table, rows: Vec<Value>) -> SyncResult<Vec<Value>> {
        self.inner.ensure_online("insert")?;
        let mut prepared = Vec::with_capacity(rows.len());
        for row in rows {
            let mut map = as_object(row, "insert")?;
            assign_id(&mut map);
            prepared.push(Value::Object(map));
        }

        let mut state = self.inner.state();
        state
            .tables
            .entry(table)
            .or_default()
            .extend(prepared.iter().cloned());
        *state.writes.entry(table).or_default() += 1;
        let events = prepared
            .iter()
            .map(|row| ChangeEvent {
                table,
                kind: ChangeKind::Insert,
                new: Some(row.clone()),
                old: None,
            })
            .collect();
        state.publish(events);
        Ok(prepared)
    }

    async fn update(&self, table: Table, filter: Filter, patch: Value) -> SyncResult<Vec<Value>> {
        self.inner.ensure_online("update")?;
        let patch = as_object(patch, "update")?;

        let mut state = self.inner.state();
        let mut events = Vec::new();
        let mut updated = Vec::new();
        if let Some(rows) = state.tables.get_mut(&table) {
            for row in rows.iter_mut().filter(|r| filter.matches(r)) {
                let old = row.clone();
                merge(row, &patch);
                updated.push(row.clone());
                events.push(ChangeEvent {
                    table,
                    kind: ChangeKind::Update,
                    new: Some(row.clone()),
                    old: Some(old),
                });
            }
        }
        *state.writes.entry(table).or_default() += 1;
        state.publish(events);
        Ok(updated)
    }

    async fn upsert(&self, table: Table, row: Value, conflict_key: &str) -> SyncResult<Value> {
        self.inner.ensure_online("upsert")?;
        let mut incoming = as_object(row, "upsert")?;
        let key = incoming
            .get(conflict_key)
            .cloned()
            .ok_or_else(|| SyncError::Invalid(format!("upsert: missing {conflict_key}")))?;

        let mut state = self.inner.state();
        let rows = state.tables.entry(table).or_default();
        let event = match rows.iter().position(|r| r.get(conflict_key) == Some(&key)) {
            Some(index) => {
                let existing = &mut rows[index];
                let old = existing.clone();
                incoming.remove("id");
                merge(existing, &incoming);
                ChangeEvent {
                    table,
                    kind: ChangeKind::Update,
                    new: Some(existing.clone()),
                    old: Some(old),
                }
            }
            None => {
                assign_id(&mut incoming);
                let row = Value::Object(incoming);
                rows.push(row.clone());
                ChangeEvent {
                    table,
                    kind: ChangeKind::Insert,
                    new: Some(row),
                    old: None,
                }
            }
        };
        *state.writes.entry(table).or_default() += 1;
        let stored = event.new.clone().unwrap_or(Value::Null);
        state.publish(vec![event]);
        Ok(stored)
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe(&self, spec: FeedSpec) -> SyncResult<FeedSubscription> {
        self.inner.ensure_online("subscribe")?;
        let (tx, rx) = unbounded_channel();
        self.inner.state().feeds.push(FeedSubscriber { spec, tx });
        Ok(FeedSubscription { events: rx })
    }
}

#[async_trait]
impl PresenceTransport for MemoryBackend {
    async fn join(&self, channel: &str, key: &str) -> SyncResult<PresenceHandle> {
        self.inner.ensure_online("join")?;
        let delay = self.inner.state().join_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let (tx, rx) = unbounded_channel();
        let mut state = self.inner.state();
        state.next_member += 1;
        let id = state.next_member;
        let _ = tx.send(PresenceEvent::Sync(state.presence_state(channel)));
        state
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(Member {
                id,
                key: key.to_string(),
                payload: None,
                tx,
            });
        drop(state);

        Ok(PresenceHandle {
            channel: Arc::new(MemoryChannel {
                backend: self.inner.clone(),
                name: channel.to_string(),
                key: key.to_string(),
                member_id: id,
            }),
            events: rx,
        })
    }
}

struct MemoryChannel {
    backend: Arc<BackendInner>,
    name: String,
    key: String,
    member_id: u64,
}

impl MemoryChannel {
    fn closed(&self) -> SyncError {
        SyncError::RemoteUnavailable(format!("channel {} is closed", self.name))
    }
}

#[async_trait]
impl PresenceChannel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn track(&self, payload: Value) -> SyncResult<()> {
        self.backend.ensure_online("track")?;
        let mut state = self.backend.state();
        let members = state.channels.get_mut(&self.name).ok_or_else(|| self.closed())?;
        let me = members
            .iter_mut()
            .find(|m| m.id == self.member_id)
            .ok_or_else(|| self.closed())?;
        me.payload = Some(payload.clone());
        for m in members.iter() {
            let _ = m.tx.send(PresenceEvent::Join {
                key: self.key.clone(),
                payload: payload.clone(),
            });
        }
        Ok(())
    }

    async fn send(&self, event: &str, payload: Value) -> SyncResult<()> {
        self.backend.ensure_online("broadcast")?;
        let state = self.backend.state();
        let members = state.channels.get(&self.name).ok_or_else(|| self.closed())?;
        if !members.iter().any(|m| m.id == self.member_id) {
            return Err(self.closed());
        }
        for m in members.iter().filter(|m| m.id != self.member_id) {
            let _ = m.tx.send(PresenceEvent::Broadcast {
                event: event.to_string(),
                payload: payload.clone(),
            });
        }
        Ok(())
    }

    async fn leave(&self) -> SyncResult<()> {
        let mut state = self.backend.state();
        let Some(members) = state.channels.get_mut(&self.name) else {
            return Ok(());
        };
        let before = members.len();
        members.retain(|m| m.id != self.member_id);
        if members.len() != before {
            for m in members.iter() {
                let _ = m.tx.send(PresenceEvent::Leave {
                    key: self.key.clone(),
                });
            }
        }
        if members.is_empty() {
            state.channels.remove(&self.name);
        }
        Ok(())
    }
}
