// src/config.rs

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Префикс переменных окружения, например `RIDE_SYNC_CHAT__BATCH_SIZE=20`.
pub const ENV_PREFIX: &str = "RIDE_SYNC_";

/// Полная конфигурация ядра синхронизации.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub cache: CacheConfig,
    pub location: LocationConfig,
    pub chat: ChatConfig,
    pub realtime: RealtimeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Путь к файлу SQLite; `:memory:` держит кэш только в памяти процесса.
    pub database_path: String,
    /// Ёмкость LRU поверх SQLite.
    pub lru_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            database_path: ":memory:".to_string(),
            lru_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Порог перемещения в метрах для эмита в UI и внеочередной записи в БД.
    pub movement_threshold_m: f64,
    /// Минимальный интервал между записями позиции в удалённое хранилище.
    pub sync_interval_secs: u64,
    /// Параметры подписки на датчик устройства.
    pub device_distance_interval_m: f64,
    pub device_time_interval_secs: u64,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            movement_threshold_m: 20.0,
            sync_interval_secs: 60,
            device_distance_interval_m: 10.0,
            device_time_interval_secs: 10,
        }
    }
}

impl LocationConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn device_time_interval(&self) -> Duration {
        Duration::from_secs(self.device_time_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Размер пачки для одной bulk-вставки из очереди.
    pub batch_size: usize,
    /// Период фонового сброса очереди.
    pub flush_interval_secs: u64,
    pub history_page_size: usize,
    /// Сколько символов контента входит в составной ключ дедупликации.
    pub dedup_prefix_chars: usize,
    pub typing_timeout_ms: u64,
    /// Сколько сообщений одного диалога держим в локальном кэше.
    pub cache_history_limit: usize,
    /// Отмечать входящие сообщения собеседника прочитанными при получении.
    pub auto_mark_read: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_interval_secs: 30,
            history_page_size: 20,
            dedup_prefix_chars: 32,
            typing_timeout_ms: 2000,
            cache_history_limit: 200,
            auto_mark_read: true,
        }
    }
}

impl ChatConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub resubscribe_backoff_secs: u64,
    /// Сколько переподписок подряд допускается до отказа от канала.
    pub max_resubscribe_attempts: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            resubscribe_backoff_secs: 5,
            max_resubscribe_attempts: 10,
        }
    }
}

impl RealtimeConfig {
    pub fn resubscribe_backoff(&self) -> Duration {
        Duration::from_secs(self.resubscribe_backoff_secs)
    }
}

impl SyncConfig {
    /// defaults <- TOML-файл (если указан) <- переменные окружения `RIDE_SYNC_*`.
    pub fn load(path: Option<&Path>) -> SyncResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(SyncConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config: SyncConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Разбор конфигурации из строки TOML поверх значений по умолчанию.
    pub fn from_toml_str(toml: &str) -> SyncResult<Self> {
        let config: SyncConfig = Figment::from(Serialized::defaults(SyncConfig::default()))
            .merge(Toml::string(toml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.cache.lru_capacity == 0 {
            return Err(SyncError::Config("cache.lru_capacity must be > 0".into()));
        }
        if !(self.location.movement_threshold_m > 0.0) {
            return Err(SyncError::Config(
                "location.movement_threshold_m must be positive".into(),
            ));
        }
        if self.location.sync_interval_secs == 0 {
            return Err(SyncError::Config(
                "location.sync_interval_secs must be > 0".into(),
            ));
        }
        if self.chat.batch_size == 0 {
            return Err(SyncError::Config("chat.batch_size must be > 0".into()));
        }
        if self.chat.flush_interval_secs == 0 {
            return Err(SyncError::Config(
                "chat.flush_interval_secs must be > 0".into(),
            ));
        }
        if self.chat.dedup_prefix_chars == 0 {
            return Err(SyncError::Config(
                "chat.dedup_prefix_chars must be > 0".into(),
            ));
        }
        Ok(())
    }
}
