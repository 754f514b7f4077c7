// src/remote/feed.rs

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::SyncResult;
use crate::models::Table;
use crate::remote::store::{from_row, Filter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Набор событий подписки: `INSERT`, `UPDATE` или `*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    Insert,
    Update,
    All,
}

impl EventFilter {
    pub fn accepts(&self, kind: ChangeKind) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Insert => kind == ChangeKind::Insert,
            EventFilter::Update => kind == ChangeKind::Update,
        }
    }
}

/// Зафиксированное изменение строки.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub new: Option<Value>,
    pub old: Option<Value>,
}

impl ChangeEvent {
    /// Новая версия строки как сущность.
    pub fn new_as<T: DeserializeOwned>(&self) -> SyncResult<Option<T>> {
        self.new.clone().map(from_row).transpose()
    }

    pub fn old_as<T: DeserializeOwned>(&self) -> SyncResult<Option<T>> {
        self.old.clone().map(from_row).transpose()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Change(ChangeEvent),
    /// Ошибка транспорта; после неё подписка больше ничего не доставит.
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedSpec {
    pub table: Table,
    pub filter: Option<Filter>,
    pub events: EventFilter,
}

impl FeedSpec {
    pub fn new(table: Table, events: EventFilter) -> Self {
        Self {
            table,
            filter: None,
            events,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table || !self.events.accepts(event.kind) {
            return false;
        }
        let row = match event.kind {
            ChangeKind::Delete => event.old.as_ref(),
            _ => event.new.as_ref(),
        };
        match (&self.filter, row) {
            (None, _) => true,
            (Some(f), Some(row)) => f.matches(row),
            (Some(_), None) => false,
        }
    }
}

/// Живая подписка. Отписка - drop получателя.
#[derive(Debug)]
pub struct FeedSubscription {
    pub events: UnboundedReceiver<FeedMessage>,
}

/// Подписка на изменения строк после коммита, каждое изменение доставляется
/// подписчику ровно один раз.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, spec: FeedSpec) -> SyncResult<FeedSubscription>;
}
