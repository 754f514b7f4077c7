// src/sync/outbox.rs
//
// Очередь исходящих сообщений (write-behind). Живёт в памяти и целиком
// сохраняется в локальный кэш после каждого изменения.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::cache_store::{get_json, set_json, PersistentCache};
use crate::error::SyncResult;
use crate::models::Message;

pub const OUTBOX_CACHE_KEY: &str = "chat_outbox";

/// Элемент очереди: локальный ключ v7 (упорядочен по времени) и само сообщение.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub key: Uuid,
    pub message: Message,
}

impl OutboxEntry {
    pub fn new(message: Message) -> Self {
        Self {
            key: Uuid::now_v7(),
            message,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Outbox {
    entries: Vec<OutboxEntry>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Поднимает очередь из кэша; битое или недоступное значение даёт пустую очередь.
    pub async fn load(cache: &dyn PersistentCache) -> Self {
        match get_json::<Vec<OutboxEntry>>(cache, OUTBOX_CACHE_KEY).await {
            Ok(Some(entries)) => {
                debug!("outbox restored with {} entries", entries.len());
                Self { entries }
            }
            Ok(None) => Self::default(),
            Err(e) => {
                warn!("outbox could not be restored: {}", e);
                Self::default()
            }
        }
    }

    pub async fn persist(&self, cache: &dyn PersistentCache) -> SyncResult<()> {
        set_json(cache, OUTBOX_CACHE_KEY, &self.entries).await
    }

    pub fn push(&mut self, entry: OutboxEntry) {
        self.entries.push(entry);
    }

    /// Добавляет элементы другой очереди, которых ещё нет в этой.
    pub fn absorb(&mut self, other: Outbox) -> usize {
        let before = self.entries.len();
        for entry in other.entries {
            if !self.entries.iter().any(|e| e.key == entry.key) {
                self.entries.push(entry);
            }
        }
        self.entries.len() - before
    }

    /// Первые `limit` элементов в порядке постановки.
    pub fn snapshot(&self, limit: usize) -> Vec<OutboxEntry> {
        self.entries.iter().take(limit).cloned().collect()
    }

    /// Удаляет ровно перечисленные ключи; добавленное после снимка остаётся.
    pub fn remove_keys(&mut self, keys: &[Uuid]) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !keys.contains(&e.key));
        before - self.entries.len()
    }

    /// Неотправленные сообщения диалога, при необходимости только одной поездки.
    pub fn for_pair(&self, a: &str, b: &str, trip_id: Option<&str>) -> Vec<Message> {
        self.entries
            .iter()
            .map(|e| &e.message)
            .filter(|m| m.is_between(a, b))
            .filter(|m| trip_id.is_none() || m.trip_id.as_deref() == trip_id)
            .cloned()
            .collect()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
