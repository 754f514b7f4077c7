// src/sync/location.rs
//
// «Где сейчас пользователь X». Показания датчика, локальный кэш и удалённые
// обновления сводятся в одно значение на пользователя: порог перемещения
// гасит лишние эмиты в UI, интервал синхронизации гасит лишние записи в
// хранилище, канал присутствия даёт быстрый путь между клиентами.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::{LocationConfig, RealtimeConfig};
use crate::db::cache_store::{get_json, set_json};
use crate::device::{DeviceSample, LocationProvider, PermissionResponse, WatchOptions};
use crate::error::{SyncError, SyncResult};
use crate::geo::distance_m;
use crate::models::{Coordinates, Location, Table};
use crate::remote::feed::{EventFilter, FeedSpec};
use crate::remote::presence::{PresenceChannel, PresenceEvent};
use crate::remote::retry::{ResubscribePolicy, RetryCounter};
use crate::remote::store::{select_one_as, upsert_as, Direction, Filter, Query};
use crate::scheduler::{spawn_periodic, Clock, TaskHandle};
use crate::sync::realtime::{supervise_feed, supervise_presence};
use crate::sync::{spawn_detached, Callback, Subscription, SyncContext};

pub fn location_cache_key(user_id: &str) -> String {
    format!("location_cache_{user_id}")
}

pub fn sync_state_key(user_id: &str) -> String {
    format!("last_location_db_sync_{user_id}")
}

pub fn presence_channel_name(connection_key: &str) -> String {
    format!("location:connection:{connection_key}")
}

/// Учёт записей позиции в хранилище, хранится в кэше рядом с самой позицией.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncBookkeeping {
    pub last_write_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_synced: Option<Coordinates>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Written,
    /// Ни интервал, ни перемещение не требуют записи; обновлён только учёт.
    Skipped,
    /// Хранилище недоступно; повтор на следующем тике.
    Failed,
}

pub enum TrackingOutcome {
    Started(TrackingHandle),
    PermissionDenied(PermissionResponse),
}

impl std::fmt::Debug for TrackingOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackingOutcome::Started(_) => f.write_str("Started"),
            TrackingOutcome::PermissionDenied(p) => write!(f, "PermissionDenied({p:?})"),
        }
    }
}

fn presence_payload(location: &Location, online_at: DateTime<Utc>) -> Value {
    json!({
        "user_id": location.user_id,
        "location": location,
        "online_at": online_at,
    })
}

struct TrackingSession {
    user_id: String,
    trip_id: Option<String>,
    on_update: Callback<Location>,
    last_emitted: Mutex<Option<Location>>,
    latest_seen: Mutex<Option<DateTime<Utc>>>,
    device_emitted: AtomicBool,
}

impl TrackingSession {
    /// Показание старше уже обработанного отбрасывается.
    fn accept_timestamp(&self, at: DateTime<Utc>) -> bool {
        let mut latest = self.latest_seen.lock().unwrap_or_else(PoisonError::into_inner);
        match *latest {
            Some(seen) if at < seen => false,
            _ => {
                *latest = Some(at);
                true
            }
        }
    }

    /// Первое показание датчика после старта эмитится всегда, остальные - по порогу.
    fn should_emit(&self, location: &Location, threshold_m: f64) -> bool {
        if !self.device_emitted.load(Ordering::SeqCst) {
            return true;
        }
        let last = self.last_emitted.lock().unwrap_or_else(PoisonError::into_inner);
        match last.as_ref() {
            Some(prev) => distance_m(prev.coordinates(), location.coordinates()) > threshold_m,
            None => true,
        }
    }

    fn emit(&self, location: Location) {
        *self.last_emitted.lock().unwrap_or_else(PoisonError::into_inner) = Some(location.clone());
        (self.on_update)(location);
    }
}

/// Подписчик на позицию другого пользователя; держит последнюю принятую метку.
struct UserWatch {
    user_id: String,
    held: Mutex<Option<DateTime<Utc>>>,
    on_update: Callback<Location>,
}

#[derive(Default)]
struct SharedChannel {
    channel: Option<Arc<dyn PresenceChannel>>,
    watchers: HashMap<u64, Arc<UserWatch>>,
    shares: usize,
    task: Option<TaskHandle>,
    /// `true` после первой попытки входа; пока она идёт, остальные ждут.
    joined: Option<watch::Sender<bool>>,
}

impl SharedChannel {
    fn is_idle(&self) -> bool {
        self.watchers.is_empty() && self.shares == 0
    }
}

struct ShareState {
    user_id: String,
    key: String,
    last: Location,
}

struct LocationInner {
    ctx: SyncContext,
    provider: Arc<dyn LocationProvider>,
    config: LocationConfig,
    policy: ResubscribePolicy,
    retries: RetryCounter,
    instance_key: String,
    channels: Mutex<HashMap<String, SharedChannel>>,
    shares: Mutex<HashMap<u64, ShareState>>,
    next_id: AtomicU64,
}

impl LocationInner {
    fn channels(&self) -> MutexGuard<'_, HashMap<String, SharedChannel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shares(&self) -> MutexGuard<'_, HashMap<u64, ShareState>> {
        self.shares.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn cached_location(&self, user_id: &str) -> Option<Location> {
        match get_json::<Location>(self.ctx.cache.as_ref(), &location_cache_key(user_id)).await {
            Ok(found) => found,
            Err(e) => {
                warn!("location cache read for {} failed: {}", user_id, e);
                None
            }
        }
    }

    async fn cache_location(&self, location: &Location) {
        let key = location_cache_key(&location.user_id);
        if let Err(e) = set_json(self.ctx.cache.as_ref(), &key, location).await {
            warn!("location cache write for {} failed: {}", location.user_id, e);
        }
    }

    async fn bookkeeping(&self, user_id: &str) -> SyncBookkeeping {
        match get_json(self.ctx.cache.as_ref(), &sync_state_key(user_id)).await {
            Ok(found) => found.unwrap_or_default(),
            Err(e) => {
                warn!("location sync state for {} unreadable: {}", user_id, e);
                SyncBookkeeping::default()
            }
        }
    }

    async fn save_bookkeeping(&self, user_id: &str, book: &SyncBookkeeping) {
        if let Err(e) = set_json(self.ctx.cache.as_ref(), &sync_state_key(user_id), book).await {
            warn!("location sync state for {} not saved: {}", user_id, e);
        }
    }

    fn interval_elapsed(&self, book: &SyncBookkeeping, now: DateTime<Utc>) -> bool {
        let interval = chrono::Duration::seconds(self.config.sync_interval_secs as i64);
        book.last_write_at
            .map(|at| now - at >= interval)
            .unwrap_or(true)
    }

    /// Запись позиции в хранилище с учётом интервала и порога перемещения.
    async fn sync_location(&self, location: &Location, force: bool) -> SyncOutcome {
        let now = self.ctx.clock.now();
        let mut book = self.bookkeeping(&location.user_id).await;

        let moved = book
            .last_synced
            .map(|at| distance_m(at, location.coordinates()) > self.config.movement_threshold_m)
            .unwrap_or(true);
        let due = force || self.interval_elapsed(&book, now) || moved;
        book.last_checked_at = Some(now);

        if !due {
            self.save_bookkeeping(&location.user_id, &book).await;
            return SyncOutcome::Skipped;
        }

        let mut row = location.clone();
        row.id = None;
        let result: SyncResult<Location> = upsert_as(
            self.ctx.store.as_ref(),
            "upsert_location",
            Table::Locations,
            &row,
            "user_id",
        )
        .await;
        let outcome = match result {
            Ok(_) => {
                book.last_write_at = Some(now);
                book.last_synced = Some(location.coordinates());
                debug!("location of {} synced (forced: {})", location.user_id, force);
                SyncOutcome::Written
            }
            Err(e) => {
                warn!("location sync for {} failed, retry on next tick: {}", location.user_id, e);
                SyncOutcome::Failed
            }
        };
        self.save_bookkeeping(&location.user_id, &book).await;
        outcome
    }

    /// Запись, только если с прошлой записи прошёл интервал.
    async fn sync_if_due(&self, location: &Location) -> SyncOutcome {
        let book = self.bookkeeping(&location.user_id).await;
        if self.interval_elapsed(&book, self.ctx.clock.now()) {
            self.sync_location(location, true).await
        } else {
            SyncOutcome::Skipped
        }
    }

    async fn handle_sample(&self, session: &TrackingSession, sample: DeviceSample) {
        let location = sample.into_location(&session.user_id, session.trip_id.as_deref());
        if !session.accept_timestamp(location.timestamp) {
            debug!("out-of-order sample for {} dropped", session.user_id);
            return;
        }
        self.cache_location(&location).await;
        self.sync_location(&location, false).await;
        if session.should_emit(&location, self.config.movement_threshold_m) {
            session.device_emitted.store(true, Ordering::SeqCst);
            session.emit(location.clone());
            self.push_to_shares(&location).await;
        }
    }

    /// Последнее-по-времени побеждает; принятое значение кэшируется.
    async fn accept(&self, watch: &UserWatch, location: Location) -> bool {
        {
            let mut held = watch.held.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(at) = *held {
                if location.timestamp <= at {
                    return false;
                }
            }
            *held = Some(location.timestamp);
        }
        self.cache_location(&location).await;
        (watch.on_update)(location);
        true
    }

    async fn on_presence_event(&self, key: &str, event: PresenceEvent) {
        let payloads: Vec<Value> = match event {
            PresenceEvent::Sync(state) => state.into_values().collect(),
            PresenceEvent::Join { payload, .. } => vec![payload],
            _ => return,
        };
        for payload in payloads {
            let Some(raw) = payload.get("location").cloned() else {
                continue;
            };
            let location: Location = match serde_json::from_value(raw) {
                Ok(location) => location,
                Err(e) => {
                    debug!("presence payload on {} without a location: {}", key, e);
                    continue;
                }
            };
            let watchers: Vec<Arc<UserWatch>> = self
                .channels()
                .get(key)
                .map(|entry| {
                    entry
                        .watchers
                        .values()
                        .filter(|w| w.user_id == location.user_id)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            for watch in watchers {
                self.accept(&watch, location.clone()).await;
            }
        }
    }

    fn attach_channel(&self, key: &str, channel: Arc<dyn PresenceChannel>) -> bool {
        match self.channels().get_mut(key) {
            Some(entry) => {
                entry.channel = Some(channel);
                true
            }
            None => false,
        }
    }

    /// Повторная публикация позиций после переподключения канала.
    async fn retrack_shares(&self, key: &str, channel: &Arc<dyn PresenceChannel>) {
        let payloads: Vec<Value> = self
            .shares()
            .values()
            .filter(|s| s.key == key)
            .map(|s| presence_payload(&s.last, self.ctx.clock.now()))
            .collect();
        for payload in payloads {
            if let Err(e) = channel.track(payload).await {
                warn!("re-track on {} failed: {}", key, e);
            }
        }
    }

    /// Находит или открывает общий канал ключа; `register` выполняется под
    /// тем же замком, что и создание записи.
    async fn acquire_channel(self: &Arc<Self>, key: &str, register: impl FnOnce(&mut SharedChannel)) {
        let pending = {
            let mut channels = self.channels();
            let fresh = !channels.contains_key(key);
            let entry = channels.entry(key.to_string()).or_default();
            register(entry);
            if fresh {
                entry.joined = Some(watch::channel(false).0);
                None
            } else {
                Some(entry.joined.as_ref().map(watch::Sender::subscribe))
            }
        };
        if let Some(joined) = pending {
            if let Some(mut joined) = joined {
                // Err: канал уже освобождён, ждать нечего
                let _ = joined.wait_for(|done| *done).await;
            }
            return;
        }

        let join_weak = Arc::downgrade(self);
        let join_key = key.to_string();
        let event_weak = Arc::downgrade(self);
        let event_key = key.to_string();
        let task = supervise_presence(
            self.ctx.presence.clone(),
            presence_channel_name(key),
            self.instance_key.clone(),
            self.policy,
            self.retries.clone(),
            move |channel| {
                let weak = join_weak.clone();
                let key = join_key.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) if inner.attach_channel(&key, channel.clone()) => {
                            inner.retrack_shares(&key, &channel).await;
                        }
                        _ => {
                            let _ = channel.leave().await;
                        }
                    }
                }
            },
            move |event| {
                let weak = event_weak.clone();
                let key = event_key.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return ControlFlow::Break(());
                    };
                    inner.on_presence_event(&key, event).await;
                    ControlFlow::Continue(())
                }
            },
        )
        .await;

        if let Some(entry) = self.channels().get_mut(key) {
            entry.task = Some(task);
            if let Some(joined) = &entry.joined {
                joined.send_replace(true);
            }
        }
    }

    /// Убирает простаивающий канал; возвращает его для `leave`.
    fn detach_if_idle(&self, key: &str) -> Option<Arc<dyn PresenceChannel>> {
        let mut channels = self.channels();
        let idle = channels.get(key).map(SharedChannel::is_idle).unwrap_or(false);
        if !idle {
            return None;
        }
        let entry = channels.remove(key)?;
        drop(channels);
        if let Some(task) = &entry.task {
            task.cancel();
        }
        debug!("location presence {} released", key);
        entry.channel
    }

    fn release_watcher(&self, key: &str, watcher_id: u64) -> Option<Arc<dyn PresenceChannel>> {
        if let Some(entry) = self.channels().get_mut(key) {
            entry.watchers.remove(&watcher_id);
        }
        self.detach_if_idle(key)
    }

    fn release_share(&self, share_id: u64) -> Option<Arc<dyn PresenceChannel>> {
        let key = self.shares().remove(&share_id)?.key;
        if let Some(entry) = self.channels().get_mut(&key) {
            entry.shares = entry.shares.saturating_sub(1);
        }
        self.detach_if_idle(&key)
    }

    fn channel_for(&self, key: &str) -> Option<Arc<dyn PresenceChannel>> {
        self.channels().get(key).and_then(|entry| entry.channel.clone())
    }

    /// Эмитированная позиция уходит во все активные расшаривания пользователя.
    async fn push_to_shares(&self, location: &Location) {
        let keys: Vec<String> = {
            let mut shares = self.shares();
            shares
                .values_mut()
                .filter(|s| s.user_id == location.user_id)
                .map(|s| {
                    s.last = location.clone();
                    s.key.clone()
                })
                .collect()
        };
        for key in keys {
            if let Some(channel) = self.channel_for(&key) {
                let payload = presence_payload(location, self.ctx.clock.now());
                if let Err(e) = channel.track(payload).await {
                    warn!("presence share on {} failed: {}", key, e);
                }
            }
        }
    }
}

/// Движок позиций. Клонируется дёшево; клоны разделяют состояние.
#[derive(Clone)]
pub struct LocationSyncEngine {
    inner: Arc<LocationInner>,
}

impl LocationSyncEngine {
    pub fn new(
        ctx: SyncContext,
        provider: Arc<dyn LocationProvider>,
        config: LocationConfig,
        realtime: &RealtimeConfig,
    ) -> Self {
        Self {
            inner: Arc::new(LocationInner {
                ctx,
                provider,
                config,
                policy: ResubscribePolicy::from_config(realtime),
                retries: RetryCounter::new(),
                instance_key: Uuid::new_v4().to_string(),
                channels: Mutex::new(HashMap::new()),
                shares: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &LocationConfig {
        &self.inner.config
    }

    /// Отказ возвращается значением; вызывающий решает, как предложить исправление.
    pub async fn request_permission(&self) -> PermissionResponse {
        self.inner.provider.request_permission().await
    }

    pub async fn permission_status(&self) -> PermissionResponse {
        self.inner.provider.permission_status().await
    }

    pub async fn get_current_sample(&self) -> SyncResult<DeviceSample> {
        self.inner.provider.current_position().await
    }

    /// Старт непрерывного слежения за своей позицией.
    ///
    /// Сначала отдаёт кэшированную позицию, затем принудительно пишет текущую в
    /// хранилище. Дальше эмитит только при смещении больше порога от последнего
    /// эмита, кэширует каждое показание и пишет в хранилище не чаще интервала
    /// (или при смещении от последней записанной точки). Периодический таймер
    /// делает принудительную запись.
    pub async fn start_tracking(
        &self,
        user_id: &str,
        trip_id: Option<&str>,
        on_update: Callback<Location>,
    ) -> SyncResult<TrackingOutcome> {
        let inner = &self.inner;
        let mut permission = inner.provider.permission_status().await;
        if !permission.granted {
            permission = inner.provider.request_permission().await;
        }
        if !permission.granted {
            info!("location permission denied for {}", user_id);
            return Ok(TrackingOutcome::PermissionDenied(permission));
        }

        let session = Arc::new(TrackingSession {
            user_id: user_id.to_string(),
            trip_id: trip_id.map(str::to_string),
            on_update,
            last_emitted: Mutex::new(None),
            latest_seen: Mutex::new(None),
            device_emitted: AtomicBool::new(false),
        });

        if let Some(cached) = inner.cached_location(user_id).await {
            session.emit(cached);
        }

        match inner.provider.current_position().await {
            Ok(sample) => {
                let location = sample.into_location(user_id, trip_id);
                session.accept_timestamp(location.timestamp);
                inner.cache_location(&location).await;
                inner.sync_location(&location, true).await;
                session.device_emitted.store(true, Ordering::SeqCst);
                session.emit(location.clone());
                inner.push_to_shares(&location).await;
            }
            Err(e) => warn!("initial position for {} unavailable: {}", user_id, e),
        }

        let mut samples = match inner
            .provider
            .watch_position(WatchOptions::from_config(&inner.config))
            .await
        {
            Ok(rx) => rx,
            Err(SyncError::PermissionDenied { can_ask_again }) => {
                return Ok(TrackingOutcome::PermissionDenied(PermissionResponse::denied(
                    can_ask_again,
                )));
            }
            Err(e) => return Err(e),
        };

        let weak = Arc::downgrade(inner);
        let pump_session = session.clone();
        let pump = TaskHandle::new(tokio::spawn(async move {
            while let Some(sample) = samples.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.handle_sample(&pump_session, sample).await;
            }
        }));

        let weak = Arc::downgrade(inner);
        let timer_user = user_id.to_string();
        let timer = spawn_periodic(inner.config.sync_interval(), move || {
            let weak = weak.clone();
            let user_id = timer_user.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return ControlFlow::Break(());
                };
                if let Some(location) = inner.cached_location(&user_id).await {
                    inner.sync_location(&location, true).await;
                }
                ControlFlow::Continue(())
            }
        });

        info!("location tracking started for {}", user_id);
        Ok(TrackingOutcome::Started(TrackingHandle {
            inner: Arc::downgrade(inner),
            session,
            pump,
            timer,
            stopped: AtomicBool::new(false),
        }))
    }

    /// Принудительная запись кэшированной позиции (например, при уходе приложения в фон).
    pub async fn force_sync(&self, user_id: &str) -> SyncResult<SyncOutcome> {
        let location = self
            .inner
            .cached_location(user_id)
            .await
            .ok_or_else(|| SyncError::NotFound(format!("no cached location for {user_id}")))?;
        Ok(self.inner.sync_location(&location, true).await)
    }

    /// Сначала кэш, затем самая свежая строка хранилища (она же кэшируется).
    pub async fn get_last_known(&self, user_id: &str) -> SyncResult<Option<Location>> {
        if let Some(cached) = self.inner.cached_location(user_id).await {
            return Ok(Some(cached));
        }
        let query = Query::new(Table::Locations)
            .filter(Filter::eq("user_id", user_id))
            .order_by("timestamp", Direction::Desc);
        let found: Option<Location> =
            select_one_as(self.inner.ctx.store.as_ref(), "last_known_location", query).await?;
        if let Some(location) = &found {
            self.inner.cache_location(location).await;
        }
        Ok(found)
    }

    /// Слежение за позицией другого пользователя по ленте изменений и, если
    /// задан ключ связи или поездки, по общему каналу присутствия.
    pub async fn subscribe_to_user(
        &self,
        user_id: &str,
        presence_key: Option<&str>,
        on_update: Callback<Location>,
    ) -> SyncResult<Subscription> {
        let inner = &self.inner;
        let watch = Arc::new(UserWatch {
            user_id: user_id.to_string(),
            held: Mutex::new(None),
            on_update,
        });

        if let Some(cached) = inner.cached_location(user_id).await {
            inner.accept(&watch, cached).await;
        }

        let weak = Arc::downgrade(inner);
        let feed_watch = watch.clone();
        let feed_task = supervise_feed(
            inner.ctx.feed.clone(),
            FeedSpec::new(Table::Locations, EventFilter::All).filter(Filter::eq("user_id", user_id)),
            format!("locations:{user_id}"),
            inner.policy,
            inner.retries.clone(),
            move |event| {
                let weak = weak.clone();
                let watch = feed_watch.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return ControlFlow::Break(());
                    };
                    match event.new_as::<Location>() {
                        Ok(Some(location)) => {
                            inner.accept(&watch, location).await;
                        }
                        Ok(None) => {}
                        Err(e) => warn!("malformed location row: {}", e),
                    }
                    ControlFlow::Continue(())
                }
            },
        )
        .await;

        let presence = match presence_key {
            Some(key) => {
                let watcher_id = inner.next_id();
                let registered = watch.clone();
                inner
                    .acquire_channel(key, move |entry| {
                        entry.watchers.insert(watcher_id, registered);
                    })
                    .await;
                Some((key.to_string(), watcher_id))
            }
            None => None,
        };

        let weak: Weak<LocationInner> = Arc::downgrade(inner);
        Ok(Subscription::new(move || {
            drop(feed_task);
            if let (Some(inner), Some((key, watcher_id))) = (weak.upgrade(), presence) {
                if let Some(channel) = inner.release_watcher(&key, watcher_id) {
                    spawn_detached(async move {
                        let _ = channel.leave().await;
                    });
                }
            }
        }))
    }

    /// Публикация своей позиции в канал `location:connection:<key>`.
    pub async fn share_presence(
        &self,
        user_id: &str,
        connection_key: &str,
        initial: Location,
    ) -> SyncResult<PresenceShare> {
        let inner = &self.inner;
        inner
            .acquire_channel(connection_key, |entry| entry.shares += 1)
            .await;

        let share_id = inner.next_id();
        inner.shares().insert(
            share_id,
            ShareState {
                user_id: user_id.to_string(),
                key: connection_key.to_string(),
                last: initial.clone(),
            },
        );

        let tracked = match inner.channel_for(connection_key) {
            Some(channel) => channel
                .track(presence_payload(&initial, inner.ctx.clock.now()))
                .await,
            None => Err(SyncError::RemoteUnavailable(format!(
                "presence {connection_key} is not joined"
            ))),
        };
        if let Err(e) = tracked {
            if let Some(channel) = inner.release_share(share_id) {
                let _ = channel.leave().await;
            }
            return Err(e);
        }

        inner.cache_location(&initial).await;
        inner.sync_if_due(&initial).await;
        Ok(PresenceShare {
            inner: Arc::downgrade(inner),
            share_id,
            connection_key: connection_key.to_string(),
            released: AtomicBool::new(false),
        })
    }
}

/// Активная сессия слежения. `stop` и `release` идемпотентны.
pub struct TrackingHandle {
    inner: Weak<LocationInner>,
    session: Arc<TrackingSession>,
    pump: TaskHandle,
    timer: TaskHandle,
    stopped: AtomicBool,
}

impl TrackingHandle {
    /// Останавливает датчик и таймер, затем принудительно пишет последнюю позицию.
    pub async fn stop(&self) {
        if !self.release() {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            if let Some(location) = inner.cached_location(&self.session.user_id).await {
                inner.sync_location(&location, true).await;
            }
        }
        info!("location tracking stopped for {}", self.session.user_id);
    }

    /// Синхронная остановка без финальной записи. `true` при первом вызове.
    pub fn release(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.pump.cancel();
        self.timer.cancel();
        true
    }

    pub fn is_active(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    pub fn last_emitted(&self) -> Option<Location> {
        self.session
            .last_emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for TrackingHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Расшаривание позиции в канал присутствия.
pub struct PresenceShare {
    inner: Weak<LocationInner>,
    share_id: u64,
    connection_key: String,
    released: AtomicBool,
}

impl PresenceShare {
    pub fn connection_key(&self) -> &str {
        &self.connection_key
    }

    /// Новая позиция в канал; запись в хранилище, если подошёл интервал.
    pub async fn update_location(&self, location: Location) -> SyncResult<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(SyncError::Invalid("presence share already released".into()));
        }
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| SyncError::Invalid("location engine dropped".into()))?;
        if let Some(state) = inner.shares().get_mut(&self.share_id) {
            state.last = location.clone();
        }
        let channel = inner.channel_for(&self.connection_key).ok_or_else(|| {
            SyncError::RemoteUnavailable(format!("presence {} is not joined", self.connection_key))
        })?;
        channel
            .track(presence_payload(&location, inner.ctx.clock.now()))
            .await?;
        inner.cache_location(&location).await;
        inner.sync_if_due(&location).await;
        Ok(())
    }

    /// Снимает расшаривание; канал покидается, если он больше никому не нужен.
    pub async fn cleanup(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            if let Some(channel) = inner.release_share(self.share_id) {
                if let Err(e) = channel.leave().await {
                    warn!("leaving {} failed: {}", self.connection_key, e);
                }
            }
        }
    }
}

impl Drop for PresenceShare {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            if let Some(channel) = inner.release_share(self.share_id) {
                spawn_detached(async move {
                    let _ = channel.leave().await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::cache_store::{MemoryCache, PersistentCache};
    use crate::device::SimulatedLocationProvider;
    use crate::geo::offset_north;
    use crate::remote::memory::MemoryBackend;
    use crate::remote::presence::PresenceTransport;
    use crate::remote::store::RemoteStore;
    use crate::scheduler::{Clock, TokioClock};
    use std::time::Duration;

    const BASE: Coordinates = Coordinates {
        latitude: 55.75,
        longitude: 37.61,
    };

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    struct Fixture {
        backend: MemoryBackend,
        cache: Arc<MemoryCache>,
        clock: Arc<TokioClock>,
        provider: Arc<SimulatedLocationProvider>,
        engine: LocationSyncEngine,
    }

    fn fixture(provider: SimulatedLocationProvider) -> Fixture {
        let backend = MemoryBackend::new();
        let cache = Arc::new(MemoryCache::new());
        let clock = Arc::new(TokioClock::new());
        let provider = Arc::new(provider);
        let ctx = SyncContext::from_memory(&backend, cache.clone(), clock.clone());
        let engine = LocationSyncEngine::new(
            ctx,
            provider.clone(),
            LocationConfig::default(),
            &RealtimeConfig::default(),
        );
        Fixture {
            backend,
            cache,
            clock,
            provider,
            engine,
        }
    }

    fn recorder() -> (Callback<Location>, Arc<Mutex<Vec<Location>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: Callback<Location> = Arc::new(move |loc| sink.lock().unwrap().push(loc));
        (cb, seen)
    }

    fn location_at(user: &str, at: Coordinates, ts: DateTime<Utc>) -> Location {
        DeviceSample::at(at, ts).into_location(user, None)
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_is_a_value() {
        let f = fixture(SimulatedLocationProvider::denied(true));
        let (cb, seen) = recorder();
        let outcome = f.engine.start_tracking("u1", None, cb).await.unwrap();
        match outcome {
            TrackingOutcome::PermissionDenied(p) => {
                assert!(!p.granted);
                assert!(p.can_ask_again);
            }
            other => panic!("expected denial, got {other:?}"),
        }
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(f.backend.writes(Table::Locations), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_emits_cache_then_forces_sync() {
        let f = fixture(SimulatedLocationProvider::new(None));
        let now = f.clock.now();
        let cached = location_at("u1", offset_north(BASE, 500.0), now - chrono::Duration::minutes(5));
        set_json(f.cache.as_ref(), &location_cache_key("u1"), &cached).await.unwrap();
        f.provider.push(DeviceSample::at(BASE, now));

        let (cb, seen) = recorder();
        let outcome = f.engine.start_tracking("u1", Some("trip-1"), cb).await.unwrap();
        let TrackingOutcome::Started(handle) = outcome else {
            panic!("tracking must start");
        };

        let emitted = seen.lock().unwrap().clone();
        assert_eq!(emitted.len(), 2, "cached value, then the current fix");
        assert_eq!(emitted[0], cached);
        assert_eq!(emitted[1].trip_id.as_deref(), Some("trip-1"));
        assert_eq!(f.backend.writes(Table::Locations), 1, "initial sync is forced");
        assert_eq!(f.provider.watcher_count(), 1);

        handle.stop().await;
        handle.stop().await;
        settle().await;
        assert!(!handle.is_active());
        assert_eq!(f.provider.watcher_count(), 0);
        assert_eq!(f.backend.writes(Table::Locations), 2, "stop forces one final sync");
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_and_out_of_order() {
        let f = fixture(SimulatedLocationProvider::new(Some(DeviceSample::at(BASE, Utc::now()))));
        let (cb, seen) = recorder();
        let TrackingOutcome::Started(handle) = f.engine.start_tracking("u1", None, cb).await.unwrap() else {
            panic!("tracking must start");
        };
        let t0 = f.clock.now();

        f.provider.push(DeviceSample::at(offset_north(BASE, 5.0), t0 + chrono::Duration::seconds(1)));
        f.provider.push(DeviceSample::at(offset_north(BASE, 30.0), t0 + chrono::Duration::seconds(2)));
        // старое показание далеко в стороне: не эмитится
        f.provider.push(DeviceSample::at(offset_north(BASE, 500.0), t0 - chrono::Duration::seconds(10)));
        settle().await;

        let emitted = seen.lock().unwrap().clone();
        assert_eq!(emitted.len(), 2);
        assert!((distance_m(emitted[0].coordinates(), emitted[1].coordinates()) - 30.0).abs() < 0.5);

        let cached: Location = get_json(f.cache.as_ref(), &location_cache_key("u1"))
            .await
            .unwrap()
            .unwrap();
        assert!((distance_m(BASE, cached.coordinates()) - 30.0).abs() < 0.5, "stale sample must not overwrite cache");
        drop(handle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_moves_within_interval_write_once() {
        let f = fixture(SimulatedLocationProvider::new(Some(DeviceSample::at(BASE, Utc::now()))));
        let (cb, _seen) = recorder();
        let TrackingOutcome::Started(handle) = f.engine.start_tracking("u1", None, cb).await.unwrap() else {
            panic!("tracking must start");
        };
        assert_eq!(f.backend.writes(Table::Locations), 1);

        for i in 1..=30 {
            tokio::time::advance(Duration::from_secs(1)).await;
            let jitter = (i % 5) as f64;
            f.provider.push(DeviceSample::at(offset_north(BASE, jitter), f.clock.now()));
            settle().await;
        }

        assert_eq!(f.backend.writes(Table::Locations), 1);
        let cached: Location = get_json(f.cache.as_ref(), &location_cache_key("u1"))
            .await
            .unwrap()
            .unwrap();
        assert!(distance_m(BASE, cached.coordinates()) < 0.5, "every sample still lands in the cache");
        handle.release();
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_timer_forces_sync() {
        let f = fixture(SimulatedLocationProvider::new(Some(DeviceSample::at(BASE, Utc::now()))));
        let (cb, _seen) = recorder();
        let TrackingOutcome::Started(handle) = f.engine.start_tracking("u1", None, cb).await.unwrap() else {
            panic!("tracking must start");
        };
        assert_eq!(f.backend.writes(Table::Locations), 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(f.backend.writes(Table::Locations), 2);

        handle.release();
        tokio::time::advance(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(f.backend.writes(Table::Locations), 2, "released handle stops the timer");
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_failure_is_logged_not_surfaced() {
        let f = fixture(SimulatedLocationProvider::new(Some(DeviceSample::at(BASE, Utc::now()))));
        f.backend.set_online(false);
        let (cb, seen) = recorder();
        let outcome = f.engine.start_tracking("u1", None, cb).await.unwrap();
        assert!(matches!(outcome, TrackingOutcome::Started(_)));
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(f.cache.get(&location_cache_key("u1")).await.unwrap().is_some());
        let book: SyncBookkeeping = get_json(f.cache.as_ref(), &sync_state_key("u1"))
            .await
            .unwrap()
            .unwrap();
        assert!(book.last_write_at.is_none());
        assert!(book.last_checked_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_last_known_falls_back_to_remote_and_caches() {
        let f = fixture(SimulatedLocationProvider::new(None));
        let now = f.clock.now();
        f.backend
            .seed(Table::Locations, &location_at("u2", BASE, now - chrono::Duration::seconds(30)))
            .unwrap();

        let found = f.engine.get_last_known("u2").await.unwrap().unwrap();
        assert_eq!(found.user_id, "u2");
        assert!(f.cache.get(&location_cache_key("u2")).await.unwrap().is_some());

        f.backend.set_online(false);
        assert!(f.engine.get_last_known("u2").await.unwrap().is_some(), "served from cache");
        assert!(f.engine.get_last_known("u3").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_merges_feed_and_presence_last_write_wins() {
        let watcher = fixture(SimulatedLocationProvider::new(None));
        let now = watcher.clock.now();
        let (cb, seen) = recorder();
        let sub = watcher
            .engine
            .subscribe_to_user("driver", Some("conn-1"), cb)
            .await
            .unwrap();
        assert_eq!(watcher.backend.channel_members(&presence_channel_name("conn-1")), 1);

        // быстрый путь: чужой клиент публикует позицию в канал
        let peer = watcher.backend.join(&presence_channel_name("conn-1"), "peer").await.unwrap();
        let fresh = location_at("driver", offset_north(BASE, 100.0), now + chrono::Duration::seconds(10));
        peer.channel.track(presence_payload(&fresh, now)).await.unwrap();
        settle().await;

        // запоздавшая строка из ленты старше уже показанной
        let stale = location_at("driver", BASE, now + chrono::Duration::seconds(5));
        watcher
            .backend
            .upsert(Table::Locations, serde_json::to_value(&stale).unwrap(), "user_id")
            .await
            .unwrap();
        settle().await;

        let got = seen.lock().unwrap().clone();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].timestamp, fresh.timestamp);

        sub.unsubscribe();
        sub.unsubscribe();
        settle().await;
        assert_eq!(watcher.backend.channel_members(&presence_channel_name("conn-1")), 1, "only the peer is left");
        assert_eq!(watcher.backend.feed_subscribers(Table::Locations), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_channel_freed_after_last_listener() {
        let f = fixture(SimulatedLocationProvider::new(None));
        let (cb1, _) = recorder();
        let (cb2, _) = recorder();
        let name = presence_channel_name("trip-9");
        let a = f.engine.subscribe_to_user("x", Some("trip-9"), cb1).await.unwrap();
        let b = f.engine.subscribe_to_user("y", Some("trip-9"), cb2).await.unwrap();
        assert_eq!(f.backend.channel_members(&name), 1, "one join per engine and key");

        drop(a);
        settle().await;
        assert_eq!(f.backend.channel_members(&name), 1);
        drop(b);
        settle().await;
        assert_eq!(f.backend.channel_members(&name), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_share_waits_for_join_in_flight() {
        let f = fixture(SimulatedLocationProvider::new(None));
        f.backend.set_join_delay(Some(Duration::from_millis(300)));
        let (cb, seen) = recorder();
        let name = presence_channel_name("trip-7");

        let (sub, share) = tokio::join!(
            f.engine.subscribe_to_user("alice", Some("trip-7"), cb),
            f.engine.share_presence("alice", "trip-7", location_at("alice", BASE, Utc::now())),
        );
        let _sub = sub.unwrap();
        let share = share.unwrap();
        settle().await;
        assert_eq!(f.backend.channel_members(&name), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);

        share.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_share_presence_reaches_other_engine() {
        let backend = MemoryBackend::new();
        let make = |provider: SimulatedLocationProvider| {
            let ctx = SyncContext::from_memory(
                &backend,
                Arc::new(MemoryCache::new()),
                Arc::new(TokioClock::new()),
            );
            LocationSyncEngine::new(ctx, Arc::new(provider), LocationConfig::default(), &RealtimeConfig::default())
        };
        let sharer = make(SimulatedLocationProvider::new(None));
        let viewer = make(SimulatedLocationProvider::new(None));
        let now = Utc::now();

        let (cb, seen) = recorder();
        let _sub = viewer.subscribe_to_user("alice", Some("c1"), cb).await.unwrap();

        let share = sharer
            .share_presence("alice", "c1", location_at("alice", BASE, now))
            .await
            .unwrap();
        settle().await;
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(backend.writes(Table::Locations), 1, "first share writes immediately");

        share
            .update_location(location_at("alice", offset_north(BASE, 50.0), now + chrono::Duration::seconds(5)))
            .await
            .unwrap();
        settle().await;
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(backend.writes(Table::Locations), 1, "interval not elapsed yet");

        share.cleanup().await;
        share.cleanup().await;
        assert!(share.update_location(location_at("alice", BASE, now)).await.is_err());
    }
}
