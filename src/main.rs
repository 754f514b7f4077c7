// src/main.rs
//
// Демо: пассажир и водитель на одном бэкенде в памяти. Заявка, принятие,
// чат и позиция водителя у пассажира.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use log::info;

use ride_sync::db::monitoring::gather_metrics;
use ride_sync::models::Table;
use ride_sync::{
    estimate, init_logging, ChatCallbacks, Coordinates, DeviceSample, Location, MemoryBackend, MemoryCache,
    Message, Place, SimulatedLocationProvider, SyncClient, SyncConfig, SyncContext, SystemClock,
    TrackingOutcome, User, UserRole,
};

fn seed_user(backend: &MemoryBackend, id: &str, role: UserRole) -> Result<()> {
    let user = User {
        id: id.to_string(),
        email: format!("{id}@example.com"),
        full_name: None,
        avatar_url: None,
        role,
        created_at: Utc::now(),
    };
    backend.seed(Table::Users, &user)?;
    Ok(())
}

fn client(backend: &MemoryBackend, provider: Arc<SimulatedLocationProvider>, user_id: &str, config: &SyncConfig) -> SyncClient {
    let ctx = SyncContext::from_memory(backend, Arc::new(MemoryCache::new()), Arc::new(SystemClock));
    SyncClient::new(ctx, provider, user_id, config.clone())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = SyncConfig::load(config_path.as_deref()).context("config")?;

    let backend = MemoryBackend::new();
    seed_user(&backend, "passenger-1", UserRole::Passenger)?;
    seed_user(&backend, "driver-1", UserRole::Driver)?;

    let start = Coordinates::new(55.7558, 37.6173);
    let driver_gps = Arc::new(SimulatedLocationProvider::new(Some(DeviceSample::at(start, Utc::now()))));
    let passenger = client(&backend, Arc::new(SimulatedLocationProvider::new(None)), "passenger-1", &config);
    let driver = client(&backend, driver_gps.clone(), "driver-1", &config);
    passenger.start().await;
    driver.start().await;

    let pickup = Place {
        latitude: 55.7601,
        longitude: 37.6186,
        address: Some("Pickup".into()),
    };
    let destination = Place {
        latitude: 55.7340,
        longitude: 37.5880,
        address: Some("Destination".into()),
    };
    let trip = passenger
        .trips()
        .create_trip_request("passenger-1", pickup, destination)
        .await?;
    let trip_id = trip.id.clone().context("trip without id")?;
    let trip = driver.trips().accept_trip_request(&trip_id, "driver-1").await?;
    let eta = estimate(&trip, None);
    info!("trip {} accepted: {:.1} km, {}", trip_id, eta.distance_km, eta.eta_label);

    let _chat = passenger
        .open_chat(
            "driver-1",
            Some(&trip_id),
            ChatCallbacks::new(Arc::new(|m: Message| info!("passenger got: {}", m.content))),
        )
        .await?;
    let _watch = passenger
        .subscribe_to_user_location(
            "driver-1",
            Arc::new(|l: Location| info!("driver at {:.5},{:.5}", l.latitude, l.longitude)),
        )
        .await?;

    let TrackingOutcome::Started(tracking) = driver
        .start_tracking(Some(&trip_id), Arc::new(|_: Location| {}))
        .await?
    else {
        anyhow::bail!("location permission denied");
    };
    let share = driver
        .share_location_with("passenger-1", DeviceSample::at(start, Utc::now()).into_location("driver-1", Some(&trip_id)))
        .await?;

    driver.send_message("passenger-1", "On my way", Some(&trip_id)).await?;
    for step in 1..=5 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let at = Coordinates::new(start.latitude + 0.0005 * step as f64, start.longitude);
        driver_gps.push(DeviceSample::at(at, Utc::now()));
        share
            .update_location(DeviceSample::at(at, Utc::now()).into_location("driver-1", Some(&trip_id)))
            .await?;
    }

    tracking.stop().await;
    share.cleanup().await;
    driver.trips().complete_trip(&trip_id, "driver-1").await?;
    driver.shutdown().await?;
    passenger.shutdown().await?;

    info!(
        "stored: {} messages, {} locations",
        backend.row_count(Table::Messages),
        backend.row_count(Table::Locations)
    );
    println!("{}", gather_metrics());
    Ok(())
}
