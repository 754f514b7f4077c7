// src/lib.rs
//
// Ядро синхронизации клиента такси: позиции, чат, связи между
// пользователями и жизненный цикл поездки поверх удалённого хранилища
// с лентой изменений и каналами присутствия.

pub mod client;
pub mod config;
pub mod db;
pub mod device;
pub mod error;
pub mod geo;
pub mod models;
pub mod remote;
pub mod scheduler;
pub mod sync;

// ---------------------- Реэкспорт ----------------------

pub use client::{ChatOpening, SyncClient, Visibility};
pub use config::{CacheConfig, ChatConfig, LocationConfig, RealtimeConfig, SyncConfig};
pub use db::{MemoryCache, PersistentCache, SqliteCache};
pub use device::{DeviceSample, LocationProvider, PermissionResponse, SimulatedLocationProvider};
pub use error::{SyncError, SyncResult};
pub use models::{
    Connection, ConnectionStatus, Coordinates, Location, Message, PendingRequest, Place, Trip,
    TripStatus, User, UserRole,
};
pub use remote::{ChangeFeed, MemoryBackend, PresenceTransport, RemoteStore};
pub use scheduler::{Clock, SystemClock, TokioClock};
pub use sync::chat::{ChatCallbacks, ChatSyncEngine, FlushMode, FlushReport};
pub use sync::connection::{ConnectionEvent, ConnectionStateMachine};
pub use sync::location::{LocationSyncEngine, PresenceShare, SyncOutcome, TrackingHandle, TrackingOutcome};
pub use sync::trip::{estimate, TripEstimate, TripLifecycle};
pub use sync::{Callback, Subscription, SyncContext};

// ---------------------- Логирование ----------------------

/// Подключает env_logger (уровень из `RUST_LOG`). Повторный вызов ничего не делает.
pub fn init_logging() {
    if env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init()
        .is_ok()
    {
        log::debug!("logger initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::Utc;
    use models::Table;

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn client(backend: &MemoryBackend, user_id: &str) -> SyncClient {
        let _ = env_logger::builder().is_test(true).try_init();
        let ctx = SyncContext::from_memory(backend, Arc::new(MemoryCache::new()), Arc::new(TokioClock::new()));
        SyncClient::new(
            ctx,
            Arc::new(SimulatedLocationProvider::new(None)),
            user_id,
            SyncConfig::default(),
        )
    }

    fn seed_user(backend: &MemoryBackend, id: &str, role: UserRole) {
        let user = User {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            full_name: Some(id.to_uppercase()),
            avatar_url: None,
            role,
            created_at: Utc::now(),
        };
        backend.seed(Table::Users, &user).unwrap();
    }

    fn place(lat: f64, lon: f64) -> Place {
        Place {
            latitude: lat,
            longitude: lon,
            address: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_then_chat_delivers_once() {
        let backend = MemoryBackend::new();
        seed_user(&backend, "alice", UserRole::Passenger);
        seed_user(&backend, "bob", UserRole::Passenger);
        let alice = client(&backend, "alice");
        let bob = client(&backend, "bob");
        alice.start().await;
        bob.start().await;

        let requested = alice.request_connection("bob").await.unwrap();
        settle().await;
        let pending = bob.connections().pending_requests();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].initiator.as_ref().map(|u| u.id.as_str()), Some("alice"));
        bob.connections()
            .accept_request(requested.id.as_deref().unwrap())
            .await
            .unwrap();
        settle().await;

        let inbox = Arc::new(Mutex::new(Vec::new()));
        let sink = inbox.clone();
        let on_message: Callback<Message> = Arc::new(move |m: Message| sink.lock().unwrap().push(m.content));
        let opened = bob.open_chat("alice", None, ChatCallbacks::new(on_message)).await.unwrap();
        assert!(matches!(opened, ChatOpening::Opened(_)));
        let _alice_side = alice
            .open_chat("bob", None, ChatCallbacks::new(Arc::new(|_: Message| {})))
            .await
            .unwrap();

        alice.send_message("bob", "on my way", None).await.unwrap();
        settle().await;
        assert_eq!(*inbox.lock().unwrap(), vec!["on my way".to_string()]);

        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;
        assert_eq!(backend.row_count(Table::Messages), 1);
        assert_eq!(inbox.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_messages_survive_until_reconnect() {
        let backend = MemoryBackend::new();
        let alice = client(&backend, "alice");
        alice.start().await;

        backend.set_online(false);
        alice.send_message("bob", "hello", None).await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;
        assert_eq!(alice.chat().queued().await, 1);
        assert_eq!(backend.row_count(Table::Messages), 0);

        backend.set_online(true);
        let report = alice.shutdown().await.unwrap();
        assert_eq!(report, FlushReport { written: 1, remaining: 0 });
        let stored: Vec<Message> = backend.rows_as(Table::Messages);
        assert_eq!(stored[0].content, "hello");
        assert!(stored[0].id.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_drivers_race_for_one_trip() {
        let backend = MemoryBackend::new();
        seed_user(&backend, "pax", UserRole::Passenger);
        seed_user(&backend, "d1", UserRole::Driver);
        seed_user(&backend, "d2", UserRole::Driver);
        let pax = client(&backend, "pax");
        let d1 = client(&backend, "d1");
        let d2 = client(&backend, "d2");

        let trip = pax
            .trips()
            .create_trip_request("pax", place(55.75, 37.61), place(55.80, 37.70))
            .await
            .unwrap();
        let id = trip.id.clone().unwrap();

        let (first, second) = tokio::join!(
            d1.trips().accept_trip_request(&id, "d1"),
            d2.trips().accept_trip_request(&id, "d2"),
        );
        let winners = [&first, &second].iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        let loser = if first.is_ok() { second } else { first };
        assert!(matches!(loser, Err(SyncError::Conflict(_))));

        let stored = pax.trips().get_trip(&id).await.unwrap();
        assert_eq!(stored.status, TripStatus::Accepted);
        assert!(pax.trips().available_trips().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracking_emits_only_meaningful_moves() {
        let backend = MemoryBackend::new();
        let provider = Arc::new(SimulatedLocationProvider::new(None));
        let ctx = SyncContext::from_memory(&backend, Arc::new(MemoryCache::new()), Arc::new(TokioClock::new()));
        let driver = SyncClient::new(ctx, provider.clone(), "drv", SyncConfig::default());

        let emitted = Arc::new(Mutex::new(0usize));
        let counter = emitted.clone();
        let outcome = driver
            .start_tracking(None, Arc::new(move |_: Location| *counter.lock().unwrap() += 1))
            .await
            .unwrap();
        let TrackingOutcome::Started(handle) = outcome else {
            panic!("permission was granted");
        };

        let base = Coordinates::new(55.7500, 37.6100);
        provider.push(DeviceSample::at(base, Utc::now()));
        settle().await;
        // ~3 м: ниже порога
        provider.push(DeviceSample::at(Coordinates::new(55.75003, 37.6100), Utc::now()));
        settle().await;
        // ~110 м
        provider.push(DeviceSample::at(Coordinates::new(55.7510, 37.6100), Utc::now()));
        settle().await;
        assert_eq!(*emitted.lock().unwrap(), 2);

        handle.stop().await;
        settle().await;
        assert!(!handle.is_active());
        assert_eq!(provider.watcher_count(), 0);
    }
}
