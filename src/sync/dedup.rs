// src/sync/dedup.rs
//
// Одно и то же сообщение может прийти оптимистичной вставкой, broadcast'ом
// присутствия и лентой изменений, в любом порядке и не по разу. Идентичность -
// `id`, если он уже известен, иначе (sender_id, created_at, префикс текста).

use std::collections::HashSet;

use crate::models::Message;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SeenKey {
    Id(String),
    Composite {
        sender_id: String,
        created_at_ms: i64,
        prefix: String,
    },
}

pub fn composite_key(message: &Message, prefix_chars: usize) -> SeenKey {
    SeenKey::Composite {
        sender_id: message.sender_id.clone(),
        created_at_ms: message.created_at.timestamp_millis(),
        prefix: message.content.chars().take(prefix_chars).collect(),
    }
}

/// Все ключи сообщения: составной всегда, `Id` - когда есть удалённый id.
pub fn keys_for(message: &Message, prefix_chars: usize) -> Vec<SeenKey> {
    let mut keys = Vec::with_capacity(2);
    if let Some(id) = &message.id {
        keys.push(SeenKey::Id(id.clone()));
    }
    keys.push(composite_key(message, prefix_chars));
    keys
}

/// Локальное значение без id или строка, подтверждённая хранилищем.
/// Отметка о прочтении допустима только для `Durable`.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEntry {
    Local(Message),
    Durable { id: String, message: Message },
}

impl ChatEntry {
    pub fn message(&self) -> &Message {
        match self {
            ChatEntry::Local(message) => message,
            ChatEntry::Durable { message, .. } => message,
        }
    }

    pub fn durable_id(&self) -> Option<&str> {
        match self {
            ChatEntry::Local(_) => None,
            ChatEntry::Durable { id, .. } => Some(id),
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            ChatEntry::Local(message) => message,
            ChatEntry::Durable { message, .. } => message,
        }
    }
}

impl From<Message> for ChatEntry {
    fn from(message: Message) -> Self {
        match message.id.clone() {
            Some(id) => ChatEntry::Durable { id, message },
            None => ChatEntry::Local(message),
        }
    }
}

/// Множество увиденных ключей одного диалога.
#[derive(Debug, Clone)]
pub struct SeenSet {
    prefix_chars: usize,
    keys: HashSet<SeenKey>,
}

impl SeenSet {
    pub fn new(prefix_chars: usize) -> Self {
        Self {
            prefix_chars,
            keys: HashSet::new(),
        }
    }

    pub fn is_seen(&self, message: &Message) -> bool {
        keys_for(message, self.prefix_chars)
            .iter()
            .any(|k| self.keys.contains(k))
    }

    /// Запоминает все ключи сообщения; `true`, если сообщение новое.
    pub fn insert(&mut self, message: &Message) -> bool {
        let keys = keys_for(message, self.prefix_chars);
        let seen = keys.iter().any(|k| self.keys.contains(k));
        self.keys.extend(keys);
        !seen
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// Новое сообщение добавлено в список.
    Appended,
    /// Уже показанное локальное значение получило удалённый id.
    Upgraded,
    Duplicate,
}

/// Отображаемый список диалога, новые сверху.
#[derive(Debug, Clone)]
pub struct ConversationView {
    seen: SeenSet,
    entries: Vec<ChatEntry>,
}

impl ConversationView {
    pub fn new(prefix_chars: usize) -> Self {
        Self {
            seen: SeenSet::new(prefix_chars),
            entries: Vec::new(),
        }
    }

    pub fn ingest(&mut self, message: Message) -> Ingest {
        if self.seen.insert(&message) {
            let entry = ChatEntry::from(message);
            let at = entry.message().created_at;
            let pos = self
                .entries
                .iter()
                .position(|e| e.message().created_at < at)
                .unwrap_or(self.entries.len());
            self.entries.insert(pos, entry);
            return Ingest::Appended;
        }

        let Some(id) = message.id.clone() else {
            return Ingest::Duplicate;
        };
        let key = composite_key(&message, self.seen.prefix_chars);
        let prefix_chars = self.seen.prefix_chars;
        let local = self.entries.iter_mut().find(|e| {
            matches!(e, ChatEntry::Local(m) if composite_key(m, prefix_chars) == key)
        });
        match local {
            Some(entry) => {
                *entry = ChatEntry::Durable { id, message };
                Ingest::Upgraded
            }
            None => Ingest::Duplicate,
        }
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn messages(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Слияние списков без повторов; подтверждённая версия вытесняет локальную.
/// Результат отсортирован по `created_at`, новые первыми.
pub fn merge_unique(messages: impl IntoIterator<Item = Message>, prefix_chars: usize) -> Vec<Message> {
    let mut view = ConversationView::new(prefix_chars);
    for message in messages {
        view.ingest(message);
    }
    view.entries.into_iter().map(ChatEntry::into_message).collect()
}
