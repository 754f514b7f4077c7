// src/client.rs
//
// Точка входа для приложения: движки, привязанные к вошедшему пользователю,
// и проверка видимости перед подписками на чужие позицию и чат.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::config::SyncConfig;
use crate::db::cache_store::SqliteCache;
use crate::device::LocationProvider;
use crate::error::{SyncError, SyncResult};
use crate::models::{Connection, Location, Message, Trip};
use crate::remote::feed::ChangeFeed;
use crate::remote::presence::PresenceTransport;
use crate::remote::store::RemoteStore;
use crate::scheduler::SystemClock;
use crate::sync::chat::{ChatCallbacks, ChatSyncEngine, FlushReport};
use crate::sync::connection::ConnectionStateMachine;
use crate::sync::location::{LocationSyncEngine, PresenceShare, TrackingOutcome};
use crate::sync::trip::TripLifecycle;
use crate::sync::{Callback, Subscription, SyncContext};

/// Почему двое пользователей видят друг друга.
#[derive(Debug, Clone, PartialEq)]
pub enum Visibility {
    Connected(Connection),
    /// Открытая поездка, где один пассажир, а другой водитель.
    Trip(Trip),
    Hidden,
}

impl Visibility {
    pub fn is_visible(&self) -> bool {
        !matches!(self, Visibility::Hidden)
    }

    /// Общий для обеих сторон ключ канала присутствия позиций.
    pub fn presence_key(&self) -> Option<String> {
        match self {
            Visibility::Connected(connection) => connection.id.clone(),
            Visibility::Trip(trip) => trip.id.clone(),
            Visibility::Hidden => None,
        }
    }
}

pub enum ChatOpening {
    Opened(Subscription),
    /// Ни связи, ни поездки: UI предлагает отправить запрос на связь.
    NeedsConnection,
}

impl std::fmt::Debug for ChatOpening {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatOpening::Opened(sub) => write!(f, "Opened({sub:?})"),
            ChatOpening::NeedsConnection => f.write_str("NeedsConnection"),
        }
    }
}

pub struct SyncClient {
    user_id: String,
    config: SyncConfig,
    location: LocationSyncEngine,
    chat: ChatSyncEngine,
    connections: ConnectionStateMachine,
    trips: TripLifecycle,
}

impl SyncClient {
    pub fn new(
        ctx: SyncContext,
        provider: Arc<dyn LocationProvider>,
        user_id: &str,
        config: SyncConfig,
    ) -> Self {
        let location = LocationSyncEngine::new(ctx.clone(), provider, config.location.clone(), &config.realtime);
        let chat = ChatSyncEngine::new(ctx.clone(), config.chat.clone(), &config.realtime);
        let connections = ConnectionStateMachine::new(ctx.clone(), user_id, &config.realtime);
        let trips = TripLifecycle::new(ctx, &config.realtime);
        Self {
            user_id: user_id.to_string(),
            config,
            location,
            chat,
            connections,
            trips,
        }
    }

    /// Клиент с локальным кэшем SQLite из `config.cache` и системными часами.
    pub async fn open(
        config: SyncConfig,
        store: Arc<dyn RemoteStore>,
        feed: Arc<dyn ChangeFeed>,
        presence: Arc<dyn PresenceTransport>,
        provider: Arc<dyn LocationProvider>,
        user_id: &str,
    ) -> SyncResult<Self> {
        config.validate()?;
        let cache = SqliteCache::open(&config.cache.database_path, config.cache.lru_capacity).await?;
        let ctx = SyncContext::new(store, feed, presence, Arc::new(cache), Arc::new(SystemClock));
        Ok(Self::new(ctx, provider, user_id, config))
    }

    /// Поднимает очередь чата, загружает связи и подписывается на их изменения.
    pub async fn start(&self) {
        self.chat.init().await;
        if let Err(e) = self.connections.refresh().await {
            warn!("connections of {} not loaded on start: {}", self.user_id, e);
        }
        self.connections.start_realtime().await;
        info!("sync client started for {}", self.user_id);
    }

    /// Досылает очередь чата и отписывается от связей.
    pub async fn shutdown(&self) -> SyncResult<FlushReport> {
        self.connections.stop_realtime();
        let report = self.chat.dispose().await?;
        info!("sync client for {} stopped, {} messages flushed", self.user_id, report.written);
        Ok(report)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn location(&self) -> &LocationSyncEngine {
        &self.location
    }

    pub fn chat(&self) -> &ChatSyncEngine {
        &self.chat
    }

    pub fn connections(&self) -> &ConnectionStateMachine {
        &self.connections
    }

    pub fn trips(&self) -> &TripLifecycle {
        &self.trips
    }

    /// Связь (локально или в хранилище) либо открытая общая поездка.
    pub async fn visibility(&self, other: &str) -> SyncResult<Visibility> {
        if let Some(connection) = self.connections.connection_with(other) {
            if connection.status.is_connected() {
                return Ok(Visibility::Connected(connection));
            }
        }
        match self.connections.fetch_connection(other).await {
            Ok(Some(connection)) if connection.status.is_connected() => {
                return Ok(Visibility::Connected(connection));
            }
            Ok(_) => {}
            Err(e) if e.is_transient() => debug!("remote connection check skipped: {}", e),
            Err(e) => return Err(e),
        }
        Ok(match self.trips.open_trip_between(&self.user_id, other).await? {
            Some(trip) => Visibility::Trip(trip),
            None => Visibility::Hidden,
        })
    }

    async fn require_visible(&self, other: &str) -> SyncResult<String> {
        let visibility = self.visibility(other).await?;
        visibility.presence_key().ok_or_else(|| {
            SyncError::NotAllowed(format!("{} cannot see {}", self.user_id, other))
        })
    }

    /// Позиция другого пользователя, если он виден.
    pub async fn subscribe_to_user_location(
        &self,
        other: &str,
        on_update: Callback<Location>,
    ) -> SyncResult<Subscription> {
        let key = self.require_visible(other).await?;
        self.location.subscribe_to_user(other, Some(&key), on_update).await
    }

    /// Публикует свою позицию в общий с `other` канал.
    pub async fn share_location_with(&self, other: &str, initial: Location) -> SyncResult<PresenceShare> {
        let key = self.require_visible(other).await?;
        self.location.share_presence(&self.user_id, &key, initial).await
    }

    pub async fn start_tracking(
        &self,
        trip_id: Option<&str>,
        on_update: Callback<Location>,
    ) -> SyncResult<TrackingOutcome> {
        self.location.start_tracking(&self.user_id, trip_id, on_update).await
    }

    /// Открывает чат, если собеседник виден по связи или по указанной поездке.
    pub async fn open_chat(
        &self,
        peer: &str,
        trip_id: Option<&str>,
        callbacks: ChatCallbacks,
    ) -> SyncResult<ChatOpening> {
        let by_trip = match trip_id {
            Some(trip_id) => self.trips.get_trip(trip_id).await?.grants_visibility(&self.user_id, peer),
            None => false,
        };
        if !by_trip && !self.visibility(peer).await?.is_visible() {
            debug!("{} has no connection with {}", self.user_id, peer);
            return Ok(ChatOpening::NeedsConnection);
        }
        let subscription = self
            .chat
            .subscribe_to_conversation(&self.user_id, peer, callbacks)
            .await?;
        Ok(ChatOpening::Opened(subscription))
    }

    pub async fn send_message(&self, peer: &str, content: &str, trip_id: Option<&str>) -> SyncResult<Message> {
        self.chat.send_message(&self.user_id, peer, content, trip_id).await
    }

    pub async fn request_connection(&self, peer: &str) -> SyncResult<Connection> {
        self.connections.request_connection(peer).await
    }

    pub fn is_connected(&self, peer: &str) -> bool {
        self.connections.is_connected(peer)
    }
}
