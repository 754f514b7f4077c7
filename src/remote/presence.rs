// src/remote/presence.rs
//
// Эфемерный канал присутствия: участники публикуют (track) JSON-состояние,
// видимое всем на sync/join/leave, и рассылают broadcast остальным без
// сохранения и без гарантии доставки.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::SyncResult;

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// Полное состояние канала: ключ участника -> последнее опубликованное состояние.
    Sync(HashMap<String, Value>),
    Join { key: String, payload: Value },
    Leave { key: String },
    Broadcast { event: String, payload: Value },
    /// Ошибка транспорта; канал нужно переподключить.
    Error(String),
}

#[async_trait]
pub trait PresenceChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn track(&self, payload: Value) -> SyncResult<()>;

    /// Рассылка остальным участникам.
    async fn send(&self, event: &str, payload: Value) -> SyncResult<()>;

    /// Выход из канала; повторный вызов ничего не делает.
    async fn leave(&self) -> SyncResult<()>;
}

pub struct PresenceHandle {
    pub channel: Arc<dyn PresenceChannel>,
    pub events: UnboundedReceiver<PresenceEvent>,
}

#[async_trait]
pub trait PresenceTransport: Send + Sync {
    async fn join(&self, channel: &str, key: &str) -> SyncResult<PresenceHandle>;
}
