// src/remote/mod.rs
//
// Контракты внешних соавторов: долговечное хранилище, лента изменений,
// каналы присутствия. Бэкенд подменяется целиком: движки держат только
// `Arc<dyn ...>`.

pub mod feed;
pub mod memory;
pub mod presence;
pub mod retry;
pub mod store;

pub use feed::{ChangeEvent, ChangeFeed, ChangeKind, EventFilter, FeedMessage, FeedSpec, FeedSubscription};
pub use memory::MemoryBackend;
pub use presence::{PresenceChannel, PresenceEvent, PresenceHandle, PresenceTransport};
pub use retry::{ResubscribePolicy, RetryCounter};
pub use store::{Direction, Filter, Query, RemoteStore};
