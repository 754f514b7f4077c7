// src/sync/chat.rs
//
// Чат с отложенной записью: сообщение сразу попадает в очередь, кэш диалога
// и (если канал открыт) broadcast собеседнику, а в хранилище уходит пачками.
// Каждое сообщение появляется в отображаемом диалоге ровно один раз, по
// какому бы пути оно ни пришло.

use std::collections::{BTreeMap, HashMap};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, error, info, warn};
use serde_json::json;
use uuid::Uuid;

use crate::config::{ChatConfig, RealtimeConfig};
use crate::db::cache_store::{get_json, set_json};
use crate::db::monitoring::DEDUP_DROPPED;
use crate::error::{SyncError, SyncResult};
use crate::models::{Message, Table};
use crate::remote::feed::{EventFilter, FeedSpec};
use crate::remote::presence::{PresenceChannel, PresenceEvent};
use crate::remote::retry::{ResubscribePolicy, RetryCounter};
use crate::remote::store::{insert_as, select_as, update_as, Direction, Filter, Query};
use crate::scheduler::{spawn_after, spawn_periodic, Clock, TaskHandle};
use crate::sync::dedup::{merge_unique, ChatEntry, ConversationView, Ingest};
use crate::sync::outbox::{Outbox, OutboxEntry};
use crate::sync::realtime::{supervise_feed, supervise_presence};
use crate::sync::{spawn_detached, Callback, Subscription, SyncContext};

const EVENT_NEW_MESSAGE: &str = "new_message";
const EVENT_TYPING: &str = "typing";

type PairKey = (String, String);

/// Ключ диалога не зависит от порядка участников.
pub fn pair_key(a: &str, b: &str) -> PairKey {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

pub fn history_cache_key(a: &str, b: &str) -> String {
    let (lo, hi) = pair_key(a, b);
    format!("chat_history_{lo}_{hi}")
}

pub fn chat_channel_name(a: &str, b: &str) -> String {
    let (lo, hi) = pair_key(a, b);
    format!("chat:{lo}:{hi}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Одна пачка не больше `batch_size`.
    Batch,
    /// Пачки подряд, пока очередь не опустеет.
    Drain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushReport {
    pub written: usize,
    pub remaining: usize,
}

/// Колбэки открытого диалога.
#[derive(Clone)]
pub struct ChatCallbacks {
    pub on_message: Callback<Message>,
    pub on_typing: Option<Callback<bool>>,
    pub on_online: Option<Callback<bool>>,
}

impl ChatCallbacks {
    pub fn new(on_message: Callback<Message>) -> Self {
        Self {
            on_message,
            on_typing: None,
            on_online: None,
        }
    }

    pub fn with_typing(mut self, on_typing: Callback<bool>) -> Self {
        self.on_typing = Some(on_typing);
        self
    }

    pub fn with_online(mut self, on_online: Callback<bool>) -> Self {
        self.on_online = Some(on_online);
        self
    }
}

struct ConversationState {
    view: ConversationView,
    listeners: HashMap<u64, Callback<Message>>,
}

struct ActiveChannel {
    me: String,
    channel: Arc<dyn PresenceChannel>,
}

struct ChatInner {
    ctx: SyncContext,
    config: ChatConfig,
    policy: ResubscribePolicy,
    retries: RetryCounter,
    outbox: tokio::sync::Mutex<Outbox>,
    flush_lock: tokio::sync::Mutex<()>,
    conversations: Mutex<HashMap<PairKey, ConversationState>>,
    /// Каналы диалога по подпискам: у каждой подписки своё членство.
    channels: Mutex<HashMap<PairKey, BTreeMap<u64, ActiveChannel>>>,
    typing_timers: Mutex<HashMap<PairKey, TaskHandle>>,
    timer: Mutex<Option<TaskHandle>>,
    initialized: AtomicBool,
    /// Записанное в хранилище ещё числится в сохранённой очереди.
    outbox_stale: AtomicBool,
    next_id: AtomicU64,
}

impl ChatInner {
    fn conversations(&self) -> MutexGuard<'_, HashMap<PairKey, ConversationState>> {
        self.conversations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<PairKey, BTreeMap<u64, ActiveChannel>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn typing_timers(&self) -> MutexGuard<'_, HashMap<PairKey, TaskHandle>> {
        self.typing_timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn channel_for(&self, pair: &PairKey) -> Option<Arc<dyn PresenceChannel>> {
        self.channels()
            .get(pair)
            .and_then(|by_subscription| by_subscription.values().next_back())
            .map(|active| active.channel.clone())
    }

    /// Пропускает сообщение через множество увиденных; новые уходят слушателям.
    fn ingest(&self, message: Message, notify: bool) -> Ingest {
        let pair = pair_key(&message.sender_id, &message.receiver_id);
        let prefix = self.config.dedup_prefix_chars;
        let (outcome, listeners) = {
            let mut conversations = self.conversations();
            let state = conversations.entry(pair).or_insert_with(|| ConversationState {
                view: ConversationView::new(prefix),
                listeners: HashMap::new(),
            });
            let outcome = state.view.ingest(message.clone());
            let listeners: Vec<Callback<Message>> = if notify && outcome == Ingest::Appended {
                state.listeners.values().cloned().collect()
            } else {
                Vec::new()
            };
            (outcome, listeners)
        };
        if notify && outcome == Ingest::Duplicate {
            DEDUP_DROPPED.inc();
        }
        for listener in listeners {
            listener(message.clone());
        }
        outcome
    }

    async fn cached_history(&self, pair: &PairKey) -> Vec<Message> {
        let key = history_cache_key(&pair.0, &pair.1);
        match get_json::<Vec<Message>>(self.ctx.cache.as_ref(), &key).await {
            Ok(found) => found.unwrap_or_default(),
            Err(e) => {
                warn!("chat cache {} unreadable: {}", key, e);
                Vec::new()
            }
        }
    }

    /// Сливает сообщения в кэш диалога: без повторов, новые сверху, с ограничением длины.
    async fn merge_into_cache(&self, pair: &PairKey, fresh: Vec<Message>) {
        let cached = self.cached_history(pair).await;
        let mut merged = merge_unique(fresh.into_iter().chain(cached), self.config.dedup_prefix_chars);
        merged.truncate(self.config.cache_history_limit);
        let key = history_cache_key(&pair.0, &pair.1);
        if let Err(e) = set_json(self.ctx.cache.as_ref(), &key, &merged).await {
            warn!("chat cache {} not updated: {}", key, e);
        }
    }

    /// Сохраняет очередь, повторяя один раз. Неудача помечает сохранённую копию
    /// устаревшей: иначе после перезапуска записанное ушло бы в хранилище повторно.
    async fn persist_outbox(&self, outbox: &Outbox) {
        let cache = self.ctx.cache.as_ref();
        let saved = match outbox.persist(cache).await {
            Ok(()) => true,
            Err(first) => {
                debug!("outbox persist retried after: {}", first);
                match outbox.persist(cache).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("outbox not persisted after flush: {}", e);
                        false
                    }
                }
            }
        };
        self.outbox_stale.store(!saved, Ordering::SeqCst);
    }

    async fn flush(&self, mode: FlushMode) -> SyncResult<FlushReport> {
        let _flushing = self.flush_lock.lock().await;
        if self.outbox_stale.load(Ordering::SeqCst) {
            let outbox = self.outbox.lock().await;
            self.persist_outbox(&outbox).await;
        }
        let mut written = 0;
        loop {
            let snapshot = self.outbox.lock().await.snapshot(self.config.batch_size);
            if snapshot.is_empty() {
                break;
            }
            let messages: Vec<Message> = snapshot.iter().map(|e| e.message.clone()).collect();
            let stored: Vec<Message> = match insert_as(
                self.ctx.store.as_ref(),
                "flush_messages",
                Table::Messages,
                &messages,
            )
            .await
            {
                Ok(stored) => stored,
                Err(e) => {
                    warn!("outbox flush of {} messages failed, kept queued: {}", messages.len(), e);
                    return Err(e);
                }
            };

            let keys: Vec<Uuid> = snapshot.iter().map(|e| e.key).collect();
            {
                let mut outbox = self.outbox.lock().await;
                outbox.remove_keys(&keys);
                self.persist_outbox(&outbox).await;
            }
            written += stored.len();
            debug!("flushed {} messages", stored.len());

            let mut by_pair: HashMap<PairKey, Vec<Message>> = HashMap::new();
            for message in stored {
                self.ingest(message.clone(), true);
                by_pair
                    .entry(pair_key(&message.sender_id, &message.receiver_id))
                    .or_default()
                    .push(message);
            }
            for (pair, fresh) in by_pair {
                self.merge_into_cache(&pair, fresh).await;
            }

            if mode == FlushMode::Batch {
                break;
            }
        }
        let remaining = self.outbox.lock().await.len();
        Ok(FlushReport { written, remaining })
    }

    async fn mark_read(&self, message: &Message) {
        let id = match ChatEntry::from(message.clone()) {
            ChatEntry::Local(_) => {
                debug!("mark-read skipped for a message without remote id");
                return;
            }
            ChatEntry::Durable { id, .. } => id,
        };
        let result: SyncResult<Vec<Message>> = update_as(
            self.ctx.store.as_ref(),
            "mark_message_read",
            Table::Messages,
            Filter::eq("id", id.as_str()),
            json!({ "read": true }),
        )
        .await;
        match result {
            Ok(rows) if rows.is_empty() => debug!("message {} not found for mark-read", id),
            Ok(_) => {}
            Err(e) => warn!("mark-read of {} failed: {}", id, e),
        }
    }

    /// Входящее по ленте или broadcast'у. Сообщения собеседника с id отмечаются прочитанными.
    async fn receive(&self, me: &str, message: Message) {
        let outcome = self.ingest(message.clone(), true);
        if outcome == Ingest::Duplicate {
            return;
        }
        let pair = pair_key(&message.sender_id, &message.receiver_id);
        self.merge_into_cache(&pair, vec![message.clone()]).await;
        if self.config.auto_mark_read
            && message.receiver_id == me
            && message.id.is_some()
            && !message.read
        {
            self.mark_read(&message).await;
        }
    }

    async fn on_presence_event(
        &self,
        me: &str,
        peer: &str,
        callbacks: &ChatCallbacks,
        event: PresenceEvent,
    ) {
        match event {
            PresenceEvent::Broadcast { event, payload } if event == EVENT_NEW_MESSAGE => {
                match serde_json::from_value::<Message>(payload) {
                    Ok(message) if message.is_between(me, peer) => self.receive(me, message).await,
                    Ok(_) => debug!("broadcast for another conversation ignored"),
                    Err(e) => warn!("malformed chat broadcast: {}", e),
                }
            }
            PresenceEvent::Broadcast { event, payload } if event == EVENT_TYPING => {
                let from_peer = payload.get("user_id").and_then(|v| v.as_str()) == Some(peer);
                let typing = payload.get("is_typing").and_then(|v| v.as_bool()).unwrap_or(false);
                if let (true, Some(on_typing)) = (from_peer, &callbacks.on_typing) {
                    on_typing(typing);
                }
            }
            PresenceEvent::Join { key, .. } if key == peer => {
                if let Some(on_online) = &callbacks.on_online {
                    on_online(true);
                }
            }
            PresenceEvent::Leave { key } if key == peer => {
                if let Some(on_online) = &callbacks.on_online {
                    on_online(false);
                }
            }
            PresenceEvent::Sync(state) => {
                if let Some(on_online) = &callbacks.on_online {
                    on_online(state.contains_key(peer));
                }
            }
            _ => {}
        }
    }

    /// Снимает подписку; возвращает её канал для `leave`. Последняя подписка
    /// пары забирает с собой таймер набора и, если очередь пары пуста, сам диалог.
    fn release_subscription(&self, pair: &PairKey, subscription_id: u64) -> Option<Arc<dyn PresenceChannel>> {
        {
            let mut conversations = self.conversations();
            let idle = match conversations.get_mut(pair) {
                Some(state) => {
                    state.listeners.remove(&subscription_id);
                    state.listeners.is_empty() && !self.has_queued(pair)
                }
                None => false,
            };
            if idle {
                conversations.remove(pair);
                debug!("conversation {}:{} evicted", pair.0, pair.1);
            }
        }

        let mut channels = self.channels();
        let released = channels
            .get_mut(pair)
            .and_then(|by_subscription| by_subscription.remove(&subscription_id));
        if channels.get(pair).is_some_and(BTreeMap::is_empty) {
            channels.remove(pair);
            self.typing_timers().remove(pair);
        }
        released.map(|active| active.channel)
    }

    /// Есть ли в очереди сообщения пары. Занятая очередь считается непустой.
    fn has_queued(&self, pair: &PairKey) -> bool {
        match self.outbox.try_lock() {
            Ok(outbox) => !outbox.for_pair(&pair.0, &pair.1, None).is_empty(),
            Err(_) => true,
        }
    }
}

/// Движок чата. Клонируется дёшево; клоны разделяют очередь и диалоги.
#[derive(Clone)]
pub struct ChatSyncEngine {
    inner: Arc<ChatInner>,
}

impl ChatSyncEngine {
    pub fn new(ctx: SyncContext, config: ChatConfig, realtime: &RealtimeConfig) -> Self {
        Self {
            inner: Arc::new(ChatInner {
                ctx,
                config,
                policy: ResubscribePolicy::from_config(realtime),
                retries: RetryCounter::new(),
                outbox: tokio::sync::Mutex::new(Outbox::new()),
                flush_lock: tokio::sync::Mutex::new(()),
                conversations: Mutex::new(HashMap::new()),
                channels: Mutex::new(HashMap::new()),
                typing_timers: Mutex::new(HashMap::new()),
                timer: Mutex::new(None),
                initialized: AtomicBool::new(false),
                outbox_stale: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.inner.config
    }

    /// Поднимает сохранённую очередь и запускает периодический сброс. Повторный вызов ничего не делает.
    pub async fn init(&self) {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return;
        }
        let restored = Outbox::load(self.inner.ctx.cache.as_ref()).await;
        let added = self.inner.outbox.lock().await.absorb(restored);
        if added > 0 {
            info!("chat outbox restored {} unsent messages", added);
        }

        let weak: Weak<ChatInner> = Arc::downgrade(&self.inner);
        let timer = spawn_periodic(self.inner.config.flush_interval(), move || {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return ControlFlow::Break(());
                };
                if let Err(e) = inner.flush(FlushMode::Batch).await {
                    debug!("periodic flush postponed: {}", e);
                }
                ControlFlow::Continue(())
            }
        });
        *self.inner.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(timer);
    }

    /// Останавливает таймер и досылает очередь.
    pub async fn dispose(&self) -> SyncResult<FlushReport> {
        let timer = self.inner.timer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(timer) = timer {
            timer.cancel();
        }
        self.inner.typing_timers().clear();
        self.inner.initialized.store(false, Ordering::SeqCst);
        self.inner.flush(FlushMode::Drain).await
    }

    /// Отправка. Ошибка только если сообщение не удалось сохранить в локальную очередь.
    pub async fn send_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
        trip_id: Option<&str>,
    ) -> SyncResult<Message> {
        if content.trim().is_empty() {
            return Err(SyncError::Invalid("message content is empty".into()));
        }
        if sender_id == receiver_id {
            return Err(SyncError::Invalid("sender and receiver are the same user".into()));
        }
        let inner = &self.inner;
        let message = Message::new_local(sender_id, receiver_id, content, trip_id, inner.ctx.clock.now());

        let queued = {
            let mut outbox = inner.outbox.lock().await;
            let entry = OutboxEntry::new(message.clone());
            let key = entry.key;
            outbox.push(entry);
            if let Err(e) = outbox.persist(inner.ctx.cache.as_ref()).await {
                outbox.remove_keys(&[key]);
                error!("message from {} not queued: {}", sender_id, e);
                return Err(e);
            }
            inner.outbox_stale.store(false, Ordering::SeqCst);
            outbox.len()
        };

        let pair = pair_key(sender_id, receiver_id);
        inner.merge_into_cache(&pair, vec![message.clone()]).await;
        inner.ingest(message.clone(), true);

        if let Some(channel) = inner.channel_for(&pair) {
            match serde_json::to_value(&message) {
                Ok(payload) => {
                    if let Err(e) = channel.send(EVENT_NEW_MESSAGE, payload).await {
                        debug!("instant delivery skipped: {}", e);
                    }
                }
                Err(e) => warn!("message broadcast not encoded: {}", e),
            }
        }

        if queued >= inner.config.batch_size {
            if let Err(e) = inner.flush(FlushMode::Batch).await {
                debug!("batch flush postponed: {}", e);
            }
        }
        Ok(message)
    }

    pub async fn flush(&self, mode: FlushMode) -> SyncResult<FlushReport> {
        self.inner.flush(mode).await
    }

    /// Принудительный сброс всей очереди (уход приложения в фон).
    pub async fn flush_now(&self) -> SyncResult<FlushReport> {
        self.inner.flush(FlushMode::Drain).await
    }

    /// Сколько сообщений ждут записи в хранилище.
    pub async fn queued(&self) -> usize {
        self.inner.outbox.lock().await.len()
    }

    pub async fn queued_messages(&self) -> Vec<Message> {
        self.inner.outbox.lock().await.messages()
    }

    /// История диалога, новые сверху.
    ///
    /// Перед чтением очередь досылается. Первая страница объединяет хранилище,
    /// кэш и ещё не записанные сообщения; при недоступном хранилище ответ
    /// собирается из кэша и очереди без ошибки.
    pub async fn get_conversation_history(
        &self,
        user_a: &str,
        user_b: &str,
        trip_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> SyncResult<Vec<Message>> {
        let inner = &self.inner;
        if let Err(e) = inner.flush(FlushMode::Drain).await {
            warn!("history read with unsent messages: {}", e);
        }
        let pair = pair_key(user_a, user_b);
        let prefix = inner.config.dedup_prefix_chars;
        let in_trip = |m: &Message| trip_id.is_none() || m.trip_id.as_deref() == trip_id;

        let cached = inner.cached_history(&pair).await;
        let queued = inner.outbox.lock().await.for_pair(user_a, user_b, trip_id);

        let mut filter = Filter::pair("sender_id", "receiver_id", user_a, user_b);
        if let Some(trip_id) = trip_id {
            filter = filter.and(Filter::eq("trip_id", trip_id));
        }
        let query = Query::new(Table::Messages)
            .filter(filter)
            .order_by("created_at", Direction::Desc)
            .range(offset, limit);

        let page = match select_as::<Message>(inner.ctx.store.as_ref(), "conversation_history", query).await {
            Ok(remote) if offset == 0 => {
                inner.merge_into_cache(&pair, remote.clone()).await;
                let cached_in_trip = cached.into_iter().filter(|m| in_trip(m));
                let mut page = merge_unique(remote.into_iter().chain(cached_in_trip).chain(queued), prefix);
                page.truncate(limit);
                page
            }
            Ok(remote) => {
                inner.merge_into_cache(&pair, remote.clone()).await;
                remote
            }
            Err(e) if e.is_transient() => {
                warn!("history of {}/{} served from cache: {}", pair.0, pair.1, e);
                let cached_in_trip = cached.into_iter().filter(|m| in_trip(m));
                merge_unique(cached_in_trip.chain(queued), prefix)
                    .into_iter()
                    .skip(offset)
                    .take(limit)
                    .collect()
            }
            Err(e) => return Err(e),
        };

        for message in &page {
            inner.ingest(message.clone(), false);
        }
        Ok(page)
    }

    /// Открытый диалог: лента изменений (только вставки этой пары) как гарантированный
    /// путь, канал присутствия для мгновенной доставки, набора текста и статуса онлайн.
    pub async fn subscribe_to_conversation(
        &self,
        me: &str,
        peer: &str,
        callbacks: ChatCallbacks,
    ) -> SyncResult<Subscription> {
        if me == peer {
            return Err(SyncError::Invalid("cannot open a conversation with yourself".into()));
        }
        let inner = &self.inner;
        let pair = pair_key(me, peer);
        let subscription_id = inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let prefix = inner.config.dedup_prefix_chars;
        inner
            .conversations()
            .entry(pair.clone())
            .or_insert_with(|| ConversationState {
                view: ConversationView::new(prefix),
                listeners: HashMap::new(),
            })
            .listeners
            .insert(subscription_id, callbacks.on_message.clone());

        if let Err(e) = inner.flush(FlushMode::Drain).await {
            warn!("conversation opened with unsent messages: {}", e);
        }

        let weak = Arc::downgrade(inner);
        let feed_me = me.to_string();
        let feed_task = supervise_feed(
            inner.ctx.feed.clone(),
            FeedSpec::new(Table::Messages, EventFilter::Insert)
                .filter(Filter::pair("sender_id", "receiver_id", me, peer)),
            format!("messages:{}:{}", pair.0, pair.1),
            inner.policy,
            inner.retries.clone(),
            move |event| {
                let weak = weak.clone();
                let me = feed_me.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return ControlFlow::Break(());
                    };
                    match event.new_as::<Message>() {
                        Ok(Some(message)) => inner.receive(&me, message).await,
                        Ok(None) => {}
                        Err(e) => warn!("malformed message row: {}", e),
                    }
                    ControlFlow::Continue(())
                }
            },
        )
        .await;

        let join_weak = Arc::downgrade(inner);
        let join_pair = pair.clone();
        let join_me = me.to_string();
        let event_weak = Arc::downgrade(inner);
        let event_me = me.to_string();
        let event_peer = peer.to_string();
        let callbacks = Arc::new(callbacks);
        let presence_task = supervise_presence(
            inner.ctx.presence.clone(),
            chat_channel_name(me, peer),
            me.to_string(),
            inner.policy,
            inner.retries.clone(),
            move |channel| {
                let weak = join_weak.clone();
                let pair = join_pair.clone();
                let me = join_me.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        let _ = channel.leave().await;
                        return;
                    };
                    inner.channels().entry(pair).or_default().insert(
                        subscription_id,
                        ActiveChannel {
                            me: me.clone(),
                            channel: channel.clone(),
                        },
                    );
                    let payload = json!({ "user_id": me, "online_at": inner.ctx.clock.now() });
                    if let Err(e) = channel.track(payload).await {
                        warn!("chat presence track failed: {}", e);
                    }
                }
            },
            move |event| {
                let weak = event_weak.clone();
                let me = event_me.clone();
                let peer = event_peer.clone();
                let callbacks = callbacks.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return ControlFlow::Break(());
                    };
                    inner.on_presence_event(&me, &peer, &callbacks, event).await;
                    ControlFlow::Continue(())
                }
            },
        )
        .await;

        debug!("conversation {}:{} opened by {}", pair.0, pair.1, me);
        let weak = Arc::downgrade(inner);
        Ok(Subscription::new(move || {
            drop(feed_task);
            drop(presence_task);
            if let Some(inner) = weak.upgrade() {
                if let Some(channel) = inner.release_subscription(&pair, subscription_id) {
                    spawn_detached(async move {
                        let _ = channel.leave().await;
                    });
                }
            }
        }))
    }

    /// Отметка о прочтении. Для сообщений без удалённого id ничего не делает,
    /// ошибка хранилища только пишется в лог.
    pub async fn mark_message_as_read(&self, message: &Message) {
        self.inner.mark_read(message).await;
    }

    /// Индикатор набора текста. Без нового нажатия сбрасывается сам через `typing_timeout`.
    pub async fn set_typing(&self, me: &str, peer: &str, is_typing: bool) -> SyncResult<()> {
        let inner = &self.inner;
        let pair = pair_key(me, peer);
        let Some(channel) = inner.channel_for(&pair) else {
            debug!("typing state dropped, conversation {}:{} is not open", pair.0, pair.1);
            return Ok(());
        };
        channel
            .send(EVENT_TYPING, json!({ "user_id": me, "is_typing": is_typing }))
            .await?;

        if is_typing {
            let me = me.to_string();
            let timer = spawn_after(inner.config.typing_timeout(), async move {
                let payload = json!({ "user_id": me, "is_typing": false });
                if let Err(e) = channel.send(EVENT_TYPING, payload).await {
                    debug!("typing reset not sent: {}", e);
                }
            });
            inner.typing_timers().insert(pair, timer);
        } else {
            inner.typing_timers().remove(&pair);
        }
        Ok(())
    }

    /// Непрочитанные входящие пользователя по данным хранилища.
    pub async fn unread_count(&self, user_id: &str) -> SyncResult<usize> {
        let query = Query::new(Table::Messages).filter(
            Filter::eq("receiver_id", user_id).and(Filter::eq("read", false)),
        );
        let rows: Vec<Message> = select_as(self.inner.ctx.store.as_ref(), "unread_count", query).await?;
        Ok(rows.len())
    }

    /// Отображаемый список диалога, новые сверху.
    pub fn rendered(&self, a: &str, b: &str) -> Vec<Message> {
        self.inner
            .conversations()
            .get(&pair_key(a, b))
            .map(|state| state.view.messages())
            .unwrap_or_default()
    }

    /// Кто открыл канал диалога на этом движке.
    pub fn channel_owner(&self, a: &str, b: &str) -> Option<String> {
        self.inner
            .channels()
            .get(&pair_key(a, b))
            .and_then(|by_subscription| by_subscription.values().next_back())
            .map(|active| active.me.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::cache_store::{MemoryCache, PersistentCache};
    use crate::remote::memory::MemoryBackend;
    use crate::remote::store::RemoteStore;
    use crate::scheduler::TokioClock;
    use std::time::Duration;

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn engine(backend: &MemoryBackend, cache: Arc<MemoryCache>) -> ChatSyncEngine {
        let ctx = SyncContext::from_memory(backend, cache, Arc::new(TokioClock::new()));
        ChatSyncEngine::new(ctx, ChatConfig::default(), &RealtimeConfig::default())
    }

    fn recorder<T: Send + 'static>() -> (Callback<T>, Arc<Mutex<Vec<T>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: Callback<T> = Arc::new(move |v| sink.lock().unwrap().push(v));
        (cb, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_rejects_empty_content() {
        let backend = MemoryBackend::new();
        let chat = engine(&backend, Arc::new(MemoryCache::new()));
        assert!(matches!(
            chat.send_message("a", "b", "   ", None).await,
            Err(SyncError::Invalid(_))
        ));
        assert_eq!(chat.queued().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_fails_when_queue_cannot_persist() {
        let backend = MemoryBackend::new();
        let cache = Arc::new(MemoryCache::new());
        let chat = engine(&backend, cache.clone());
        cache.set_failing(true);
        assert!(matches!(
            chat.send_message("a", "b", "hi", None).await,
            Err(SyncError::Cache(_))
        ));
        assert_eq!(chat.queued().await, 0);
        assert!(chat.rendered("a", "b").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_threshold_flushes() {
        let backend = MemoryBackend::new();
        let chat = engine(&backend, Arc::new(MemoryCache::new()));
        for i in 0..9 {
            chat.send_message("a", "b", &format!("m{i}"), None).await.unwrap();
        }
        assert_eq!(backend.row_count(Table::Messages), 0);
        chat.send_message("a", "b", "m9", None).await.unwrap();
        assert_eq!(backend.row_count(Table::Messages), 10);
        assert_eq!(backend.writes(Table::Messages), 1, "one bulk insert");
        assert_eq!(chat.queued().await, 0);
        assert!(chat.rendered("b", "a").iter().all(|m| m.id.is_some()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush_moves_one_batch() {
        let backend = MemoryBackend::new();
        let chat = engine(&backend, Arc::new(MemoryCache::new()));
        chat.init().await;
        backend.set_online(false);
        for i in 0..25 {
            chat.send_message("a", "b", &format!("m{i}"), None).await.unwrap();
        }
        backend.set_online(true);
        assert_eq!(chat.queued().await, 25);

        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(backend.row_count(Table::Messages), 10);
        assert_eq!(chat.queued().await, 15);
        let stored: Vec<String> = backend
            .rows_as::<Message>(Table::Messages)
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(stored.first().map(String::as_str), Some("m0"), "oldest entries go first");

        let report = chat.dispose().await.unwrap();
        assert_eq!(report, FlushReport { written: 15, remaining: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_history_includes_queued() {
        let backend = MemoryBackend::new();
        let chat = engine(&backend, Arc::new(MemoryCache::new()));
        backend.set_online(false);
        chat.send_message("alice", "bob", "hello", None).await.unwrap();

        let history = chat.get_conversation_history("bob", "alice", None, 20, 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hello");
        assert!(history[0].id.is_none());
        assert_eq!(backend.row_count(Table::Messages), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_merges_and_filters_trip() {
        let backend = MemoryBackend::new();
        let chat = engine(&backend, Arc::new(MemoryCache::new()));
        let now = chrono::Utc::now();
        backend
            .seed(Table::Messages, &Message::new_local("bob", "alice", "old", Some("t1"), now - chrono::Duration::minutes(5)))
            .unwrap();
        backend
            .seed(Table::Messages, &Message::new_local("bob", "alice", "other trip", Some("t2"), now - chrono::Duration::minutes(4)))
            .unwrap();
        chat.send_message("alice", "bob", "new", Some("t1")).await.unwrap();

        let all = chat.get_conversation_history("alice", "bob", None, 20, 0).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].content, "new");
        assert!(all[0].id.is_some(), "history read drains the queue first");

        let trip = chat.get_conversation_history("alice", "bob", Some("t1"), 20, 0).await.unwrap();
        let contents: Vec<&str> = trip.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["new", "old"]);

        backend.set_online(false);
        let page = chat.get_conversation_history("alice", "bob", None, 1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].content, "other trip", "offline page comes from the sorted-pair cache");
    }

    #[tokio::test(start_paused = true)]
    async fn test_realtime_delivery_is_exactly_once() {
        let backend = MemoryBackend::new();
        let alice = engine(&backend, Arc::new(MemoryCache::new()));
        let bob = engine(&backend, Arc::new(MemoryCache::new()));

        let (on_message, received) = recorder::<Message>();
        let (on_online, online) = recorder::<bool>();
        let _bob_sub = bob
            .subscribe_to_conversation("bob", "alice", ChatCallbacks::new(on_message).with_online(on_online))
            .await
            .unwrap();
        let (noop, _) = recorder::<Message>();
        let _alice_sub = alice
            .subscribe_to_conversation("alice", "bob", ChatCallbacks::new(noop))
            .await
            .unwrap();
        settle().await;
        assert_eq!(online.lock().unwrap().last(), Some(&true));

        let sent = alice.send_message("alice", "bob", "on my way", None).await.unwrap();
        settle().await;
        assert_eq!(received.lock().unwrap().len(), 1, "presence broadcast arrives first");

        alice.flush_now().await.unwrap();
        settle().await;
        assert_eq!(received.lock().unwrap().len(), 1, "durable copy only upgrades the entry");
        let rendered = bob.rendered("alice", "bob");
        assert_eq!(rendered.len(), 1);
        assert!(rendered[0].id.is_some());
        assert_eq!(rendered[0].created_at, sent.created_at);

        let rows = backend.rows_as::<Message>(Table::Messages);
        assert!(rows[0].read, "peer message with an id is marked read on receipt");
        assert_eq!(bob.unread_count("bob").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_read_skips_local_messages() {
        let backend = MemoryBackend::new();
        let chat = engine(&backend, Arc::new(MemoryCache::new()));
        let local = Message::new_local("a", "b", "x", None, chrono::Utc::now());
        chat.mark_message_as_read(&local).await;
        assert_eq!(backend.writes(Table::Messages), 0);

        let stored = backend.seed(Table::Messages, &local).unwrap();
        let durable: Message = serde_json::from_value(stored).unwrap();
        assert_eq!(chat.unread_count("b").await.unwrap(), 1);
        chat.mark_message_as_read(&durable).await;
        assert_eq!(chat.unread_count("b").await.unwrap(), 0);

        backend.set_online(false);
        chat.mark_message_as_read(&durable).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_indicator_auto_clears() {
        let backend = MemoryBackend::new();
        let alice = engine(&backend, Arc::new(MemoryCache::new()));
        let bob = engine(&backend, Arc::new(MemoryCache::new()));
        let (noop, _) = recorder::<Message>();
        let (on_typing, typing) = recorder::<bool>();
        let _b = bob
            .subscribe_to_conversation("bob", "alice", ChatCallbacks::new(noop.clone()).with_typing(on_typing))
            .await
            .unwrap();
        let _a = alice
            .subscribe_to_conversation("alice", "bob", ChatCallbacks::new(noop))
            .await
            .unwrap();

        alice.set_typing("alice", "bob", true).await.unwrap();
        settle().await;
        assert_eq!(*typing.lock().unwrap(), vec![true]);

        tokio::time::advance(Duration::from_millis(2000)).await;
        settle().await;
        assert_eq!(*typing.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_error_resubscribes_after_backoff() {
        let backend = MemoryBackend::new();
        let bob = engine(&backend, Arc::new(MemoryCache::new()));
        let (on_message, received) = recorder::<Message>();
        let _sub = bob
            .subscribe_to_conversation("bob", "alice", ChatCallbacks::new(on_message))
            .await
            .unwrap();
        backend.fail_feeds("socket closed");
        settle().await;
        assert_eq!(backend.feed_subscribers(Table::Messages), 0);

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(backend.feed_subscribers(Table::Messages), 1);

        let row = Message::new_local("alice", "bob", "after reconnect", None, chrono::Utc::now());
        backend
            .insert(Table::Messages, vec![serde_json::to_value(&row).unwrap()])
            .await
            .unwrap();
        settle().await;
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_restores_outbox_and_unsubscribe_leaves_channel() {
        let backend = MemoryBackend::new();
        let cache = Arc::new(MemoryCache::new());
        {
            let first = engine(&backend, cache.clone());
            backend.set_online(false);
            first.send_message("a", "b", "survives restart", None).await.unwrap();
        }
        backend.set_online(true);
        assert!(cache.get(crate::sync::outbox::OUTBOX_CACHE_KEY).await.unwrap().is_some());

        let second = engine(&backend, cache);
        second.init().await;
        second.init().await;
        assert_eq!(second.queued().await, 1);

        let (noop, _) = recorder::<Message>();
        let sub = second
            .subscribe_to_conversation("a", "b", ChatCallbacks::new(noop))
            .await
            .unwrap();
        assert_eq!(second.queued().await, 0, "opening a conversation drains the queue");
        assert_eq!(second.channel_owner("b", "a").as_deref(), Some("a"));
        assert_eq!(backend.channel_members(&chat_channel_name("a", "b")), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        settle().await;
        assert_eq!(backend.channel_members(&chat_channel_name("a", "b")), 0);
        assert!(second.channel_owner("a", "b").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_subscription_leaves_its_own_channel() {
        let backend = MemoryBackend::new();
        let chat = engine(&backend, Arc::new(MemoryCache::new()));
        let name = chat_channel_name("a", "b");
        let (first_cb, _) = recorder::<Message>();
        let (second_cb, _) = recorder::<Message>();

        let first = chat
            .subscribe_to_conversation("a", "b", ChatCallbacks::new(first_cb))
            .await
            .unwrap();
        let second = chat
            .subscribe_to_conversation("a", "b", ChatCallbacks::new(second_cb))
            .await
            .unwrap();
        assert_eq!(backend.channel_members(&name), 2);

        first.unsubscribe();
        settle().await;
        assert_eq!(backend.channel_members(&name), 1);
        assert_eq!(chat.channel_owner("a", "b").as_deref(), Some("a"));

        second.unsubscribe();
        settle().await;
        assert_eq!(backend.channel_members(&name), 0);
        assert!(chat.channel_owner("a", "b").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushed_messages_not_replayed_after_restart() {
        let backend = MemoryBackend::new();
        let cache = Arc::new(MemoryCache::new());
        let chat = engine(&backend, cache.clone());
        backend.set_online(false);
        chat.send_message("a", "b", "only once", None).await.unwrap();
        backend.set_online(true);

        cache.set_failing(true);
        let report = chat.flush_now().await.unwrap();
        assert_eq!(report.written, 1);
        cache.set_failing(false);
        // следующий сброс переписывает устаревшую очередь в кэше
        chat.flush_now().await.unwrap();

        let restarted = engine(&backend, cache);
        restarted.init().await;
        assert_eq!(restarted.queued().await, 0);
        restarted.flush_now().await.unwrap();
        assert_eq!(backend.row_count(Table::Messages), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_listener_evicts_idle_conversation() {
        let backend = MemoryBackend::new();
        let chat = engine(&backend, Arc::new(MemoryCache::new()));

        let (cb, _) = recorder::<Message>();
        let sub = chat
            .subscribe_to_conversation("a", "b", ChatCallbacks::new(cb))
            .await
            .unwrap();
        chat.send_message("a", "b", "delivered", None).await.unwrap();
        chat.flush_now().await.unwrap();
        assert_eq!(chat.rendered("a", "b").len(), 1);
        sub.unsubscribe();
        assert!(chat.rendered("a", "b").is_empty());

        let (cb, _) = recorder::<Message>();
        let sub = chat
            .subscribe_to_conversation("a", "c", ChatCallbacks::new(cb))
            .await
            .unwrap();
        backend.set_online(false);
        chat.send_message("a", "c", "still queued", None).await.unwrap();
        sub.unsubscribe();
        assert_eq!(chat.rendered("a", "c").len(), 1, "queued pair keeps its view");
    }
}
