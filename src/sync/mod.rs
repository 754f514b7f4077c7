// src/sync/mod.rs
//
// Движки синхронизации. Каждая подписка или сессия возвращает дескриптор,
// освобождение которого идемпотентно и допустимо в любой момент жизни.

pub mod chat;
pub mod connection;
pub mod dedup;
pub mod location;
pub mod outbox;
pub mod realtime;
pub mod trip;

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use log::debug;

use crate::db::cache_store::PersistentCache;
use crate::remote::feed::ChangeFeed;
use crate::remote::memory::MemoryBackend;
use crate::remote::presence::PresenceTransport;
use crate::remote::store::RemoteStore;
use crate::scheduler::Clock;

/// Колбэк доставки обновлений в UI.
pub type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Внешние соавторы, общие для всех движков.
#[derive(Clone)]
pub struct SyncContext {
    pub store: Arc<dyn RemoteStore>,
    pub feed: Arc<dyn ChangeFeed>,
    pub presence: Arc<dyn PresenceTransport>,
    pub cache: Arc<dyn PersistentCache>,
    pub clock: Arc<dyn Clock>,
}

impl SyncContext {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        feed: Arc<dyn ChangeFeed>,
        presence: Arc<dyn PresenceTransport>,
        cache: Arc<dyn PersistentCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            feed,
            presence,
            cache,
            clock,
        }
    }

    /// Все три удалённых контракта от одного бэкенда в памяти.
    pub fn from_memory(
        backend: &MemoryBackend,
        cache: Arc<dyn PersistentCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(
            Arc::new(backend.clone()),
            Arc::new(backend.clone()),
            Arc::new(backend.clone()),
            cache,
            clock,
        )
    }
}

type Cleanup = Box<dyn FnOnce() + Send>;

/// Отписка. `unsubscribe` можно звать сколько угодно раз; Drop тоже отписывает.
pub struct Subscription {
    cleanup: Mutex<Option<Cleanup>>,
}

impl Subscription {
    pub fn new(cleanup: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cleanup: Mutex::new(Some(Box::new(cleanup))),
        }
    }

    pub fn unsubscribe(&self) {
        let cleanup = self
            .cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(cleanup) = cleanup {
            cleanup();
        }
    }

    pub fn is_active(&self) -> bool {
        self.cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Запуск асинхронной очистки из синхронного кода (Drop, отписка).
pub(crate) fn spawn_detached<F>(fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(fut);
        }
        Err(_) => debug!("no tokio runtime, async cleanup skipped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_subscription_cleanup_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sub = Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(sub.is_active());
        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        drop(sub);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        {
            let _sub = Subscription::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
