// src/device.rs

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::config::LocationConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::{Coordinates, Location};

/// Ответ на запрос разрешения. Отказ - это значение, а не ошибка.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionResponse {
    pub granted: bool,
    pub can_ask_again: bool,
}

impl PermissionResponse {
    pub const GRANTED: PermissionResponse = PermissionResponse {
        granted: true,
        can_ask_again: true,
    };

    pub fn denied(can_ask_again: bool) -> Self {
        Self {
            granted: false,
            can_ask_again,
        }
    }
}

/// Показание датчика.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSample {
    pub latitude: f64,
    pub longitude: f64,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl DeviceSample {
    pub fn at(coords: Coordinates, timestamp: DateTime<Utc>) -> Self {
        Self {
            latitude: coords.latitude,
            longitude: coords.longitude,
            heading: None,
            speed: None,
            timestamp,
        }
    }

    pub fn into_location(self, user_id: &str, trip_id: Option<&str>) -> Location {
        Location {
            id: None,
            user_id: user_id.to_string(),
            latitude: self.latitude,
            longitude: self.longitude,
            heading: self.heading,
            speed: self.speed,
            trip_id: trip_id.map(str::to_string),
            timestamp: self.timestamp,
        }
    }
}

/// Параметры непрерывной подписки: минимальные расстояние и интервал между показаниями.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchOptions {
    pub distance_interval_m: f64,
    pub time_interval: Duration,
}

impl WatchOptions {
    pub fn from_config(config: &LocationConfig) -> Self {
        Self {
            distance_interval_m: config.device_distance_interval_m,
            time_interval: config.device_time_interval(),
        }
    }
}

/// Источник местоположения устройства.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn permission_status(&self) -> PermissionResponse;

    async fn request_permission(&self) -> PermissionResponse;

    /// Однократное чтение; ошибка устройства - `LocationUnavailable`.
    async fn current_position(&self) -> SyncResult<DeviceSample>;

    /// Непрерывная подписка; подписка снимается, когда получатель выброшен.
    async fn watch_position(&self, options: WatchOptions) -> SyncResult<UnboundedReceiver<DeviceSample>>;
}

struct SimulatedState {
    permission: PermissionResponse,
    grant_on_request: bool,
    current: Option<DeviceSample>,
    unavailable: bool,
    watchers: Vec<UnboundedSender<DeviceSample>>,
    last_options: Option<WatchOptions>,
}

/// Датчик, которым управляет код: тесты и демо «двигают» устройство через `push`.
pub struct SimulatedLocationProvider {
    state: Mutex<SimulatedState>,
}

impl SimulatedLocationProvider {
    pub fn new(initial: Option<DeviceSample>) -> Self {
        Self {
            state: Mutex::new(SimulatedState {
                permission: PermissionResponse::GRANTED,
                grant_on_request: true,
                current: initial,
                unavailable: false,
                watchers: Vec::new(),
                last_options: None,
            }),
        }
    }

    /// Разрешение не выдано; запрос его тоже не выдаст.
    pub fn denied(can_ask_again: bool) -> Self {
        let provider = Self::new(None);
        {
            let mut state = provider.state();
            state.permission = PermissionResponse::denied(can_ask_again);
            state.grant_on_request = false;
        }
        provider
    }

    /// Разрешение ещё не спрашивали; запрос выдаст его.
    pub fn undetermined(initial: Option<DeviceSample>) -> Self {
        let provider = Self::new(initial);
        provider.state().permission = PermissionResponse::denied(true);
        provider
    }

    fn state(&self) -> MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Новое показание: становится текущим и уходит всем подписчикам.
    pub fn push(&self, sample: DeviceSample) {
        let mut state = self.state();
        state.current = Some(sample.clone());
        state.watchers.retain(|tx| tx.send(sample.clone()).is_ok());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Сколько непрерывных подписок сейчас живо.
    pub fn watcher_count(&self) -> usize {
        let mut state = self.state();
        state.watchers.retain(|tx| !tx.is_closed());
        state.watchers.len()
    }

    pub fn last_watch_options(&self) -> Option<WatchOptions> {
        self.state().last_options
    }
}

#[async_trait]
impl LocationProvider for SimulatedLocationProvider {
    async fn permission_status(&self) -> PermissionResponse {
        self.state().permission
    }

    async fn request_permission(&self) -> PermissionResponse {
        let mut state = self.state();
        if state.grant_on_request {
            state.permission = PermissionResponse::GRANTED;
        }
        state.permission
    }

    async fn current_position(&self) -> SyncResult<DeviceSample> {
        let state = self.state();
        if state.unavailable {
            return Err(SyncError::LocationUnavailable("device reported an error".into()));
        }
        state
            .current
            .clone()
            .ok_or_else(|| SyncError::LocationUnavailable("no fix yet".into()))
    }

    async fn watch_position(&self, options: WatchOptions) -> SyncResult<UnboundedReceiver<DeviceSample>> {
        let mut state = self.state();
        if !state.permission.granted {
            return Err(SyncError::PermissionDenied {
                can_ask_again: state.permission.can_ask_again,
            });
        }
        let (tx, rx) = unbounded_channel();
        state.watchers.push(tx);
        state.last_options = Some(options);
        Ok(rx)
    }
}
