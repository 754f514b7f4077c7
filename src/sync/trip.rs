// src/sync/trip.rs
//
// Жизненный цикл поездки: requested -> accepted -> in_progress -> completed,
// отмена из любого открытого статуса. Переходы выполняются условным update по
// текущему статусу, поэтому из двух одновременных попыток проходит одна.

use std::ops::ControlFlow;

use log::{info, warn};
use serde_json::json;

use crate::config::RealtimeConfig;
use crate::error::{SyncError, SyncResult};
use crate::geo::{distance_km, eta_minutes, format_eta};
use crate::models::{Place, Table, Trip, TripStatus, User, UserRole};
use crate::remote::feed::{EventFilter, FeedSpec};
use crate::remote::retry::{ResubscribePolicy, RetryCounter};
use crate::remote::store::{insert_as, select_as, select_one_as, update_as, Direction, Filter, Query};
use crate::scheduler::Clock;
use crate::sync::realtime::supervise_feed;
use crate::sync::{Callback, Subscription, SyncContext};

const DRIVER_BUSY: [TripStatus; 2] = [TripStatus::Accepted, TripStatus::InProgress];

fn status_filter(statuses: &[TripStatus]) -> Filter {
    Filter::is_in("status", statuses.iter().map(|s| s.as_str()))
}

fn party_filter(user_id: &str) -> Filter {
    Filter::eq("passenger_id", user_id).or(Filter::eq("driver_id", user_id))
}

/// Оценка поездки от точки посадки до назначения.
#[derive(Debug, Clone, PartialEq)]
pub struct TripEstimate {
    pub distance_km: f64,
    pub eta_minutes: f64,
    pub eta_label: String,
}

pub fn estimate(trip: &Trip, speed_kmh: Option<f64>) -> TripEstimate {
    let distance = distance_km(trip.pickup_location.coordinates(), trip.destination.coordinates());
    let eta = eta_minutes(distance, speed_kmh);
    TripEstimate {
        distance_km: distance,
        eta_minutes: eta,
        eta_label: format_eta(eta),
    }
}

pub struct TripLifecycle {
    ctx: SyncContext,
    policy: ResubscribePolicy,
    retries: RetryCounter,
}

impl TripLifecycle {
    pub fn new(ctx: SyncContext, realtime: &RealtimeConfig) -> Self {
        Self {
            ctx,
            policy: ResubscribePolicy::from_config(realtime),
            retries: RetryCounter::new(),
        }
    }

    async fn open_trip_as(&self, column: &str, user_id: &str, statuses: &[TripStatus]) -> SyncResult<Option<Trip>> {
        let query = Query::new(Table::Trips)
            .filter(Filter::eq(column, user_id).and(status_filter(statuses)))
            .order_by("created_at", Direction::Desc);
        select_one_as(self.ctx.store.as_ref(), "open_trip", query).await
    }

    /// Новая заявка пассажира. У пассажира может быть только одна открытая поездка.
    pub async fn create_trip_request(
        &self,
        passenger_id: &str,
        pickup_location: Place,
        destination: Place,
    ) -> SyncResult<Trip> {
        if let Some(open) = self.open_trip_as("passenger_id", passenger_id, &TripStatus::OPEN).await? {
            return Err(SyncError::Conflict(format!(
                "passenger {} already has trip {} ({})",
                passenger_id,
                open.id.unwrap_or_default(),
                open.status.as_str()
            )));
        }
        let now = self.ctx.clock.now();
        let trip = Trip {
            id: None,
            passenger_id: passenger_id.to_string(),
            driver_id: None,
            pickup_location,
            destination,
            status: TripStatus::Requested,
            created_at: now,
            updated_at: now,
        };
        let created: Vec<Trip> = insert_as(self.ctx.store.as_ref(), "create_trip", Table::Trips, &[trip]).await?;
        let created = created
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::RemoteUnavailable("insert returned no row".into()))?;
        info!("trip {:?} requested by {}", created.id, passenger_id);
        Ok(created)
    }

    /// Заявки, ожидающие водителя; новые первыми.
    pub async fn available_trips(&self) -> SyncResult<Vec<Trip>> {
        let query = Query::new(Table::Trips)
            .filter(Filter::eq("status", TripStatus::Requested.as_str()))
            .order_by("created_at", Direction::Desc);
        select_as(self.ctx.store.as_ref(), "available_trips", query).await
    }

    pub async fn get_trip(&self, trip_id: &str) -> SyncResult<Trip> {
        select_one_as(self.ctx.store.as_ref(), "get_trip", Query::by_id(Table::Trips, trip_id))
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("trip {trip_id}")))
    }

    /// Почему условный переход не нашёл строку.
    async fn diagnose(&self, trip_id: &str, action: &str, actor_ok: impl Fn(&Trip) -> bool) -> SyncError {
        match self.get_trip(trip_id).await {
            Ok(trip) if !actor_ok(&trip) => {
                SyncError::NotAllowed(format!("cannot {action} trip {trip_id}"))
            }
            Ok(trip) => SyncError::Conflict(format!(
                "trip {} is {}, cannot {}",
                trip_id,
                trip.status.as_str(),
                action
            )),
            Err(e) => e,
        }
    }

    async fn transition(
        &self,
        trip_id: &str,
        action: &str,
        guard: Filter,
        patch: serde_json::Value,
        actor_ok: impl Fn(&Trip) -> bool,
    ) -> SyncResult<Trip> {
        let updated: Vec<Trip> = update_as(
            self.ctx.store.as_ref(),
            "trip_transition",
            Table::Trips,
            Filter::eq("id", trip_id).and(guard),
            patch,
        )
        .await?;
        match updated.into_iter().next() {
            Some(trip) => {
                info!("trip {} -> {}", trip_id, trip.status.as_str());
                Ok(trip)
            }
            None => Err(self.diagnose(trip_id, action, actor_ok).await),
        }
    }

    /// Водитель берёт заявку. Из двух одновременных попыток вторая получает `Conflict`.
    pub async fn accept_trip_request(&self, trip_id: &str, driver_id: &str) -> SyncResult<Trip> {
        let driver: User = select_one_as(self.ctx.store.as_ref(), "trip_driver", Query::by_id(Table::Users, driver_id))
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("user {driver_id}")))?;
        if driver.role != UserRole::Driver {
            return Err(SyncError::NotAllowed(format!("{driver_id} is not a driver")));
        }
        if let Some(busy) = self.open_trip_as("driver_id", driver_id, &DRIVER_BUSY).await? {
            return Err(SyncError::Conflict(format!(
                "driver {} is busy with trip {}",
                driver_id,
                busy.id.unwrap_or_default()
            )));
        }
        let patch = json!({
            "status": TripStatus::Accepted.as_str(),
            "driver_id": driver_id,
            "updated_at": self.ctx.clock.now(),
        });
        self.transition(
            trip_id,
            "accept",
            Filter::eq("status", TripStatus::Requested.as_str()),
            patch,
            |_| true,
        )
        .await
    }

    /// Начало поездки: только назначенный водитель.
    pub async fn start_trip(&self, trip_id: &str, driver_id: &str) -> SyncResult<Trip> {
        let patch = json!({
            "status": TripStatus::InProgress.as_str(),
            "updated_at": self.ctx.clock.now(),
        });
        self.transition(
            trip_id,
            "start",
            Filter::eq("driver_id", driver_id).and(status_filter(&DRIVER_BUSY)),
            patch,
            |trip| trip.driver_id.as_deref() == Some(driver_id),
        )
        .await
    }

    pub async fn complete_trip(&self, trip_id: &str, actor_id: &str) -> SyncResult<Trip> {
        self.finish(trip_id, actor_id, TripStatus::Completed, "complete").await
    }

    pub async fn cancel_trip(&self, trip_id: &str, actor_id: &str) -> SyncResult<Trip> {
        self.finish(trip_id, actor_id, TripStatus::Canceled, "cancel").await
    }

    /// Завершение или отмена открытой поездки пассажиром или водителем.
    async fn finish(&self, trip_id: &str, actor_id: &str, to: TripStatus, action: &str) -> SyncResult<Trip> {
        let patch = json!({ "status": to.as_str(), "updated_at": self.ctx.clock.now() });
        self.transition(
            trip_id,
            action,
            party_filter(actor_id).and(status_filter(&TripStatus::OPEN)),
            patch,
            |trip| trip.involves(actor_id),
        )
        .await
    }

    /// Открытая поездка пользователя. Поездка, где он пассажир, важнее поездки, где он водитель.
    pub async fn active_trip_for(&self, user_id: &str) -> SyncResult<Option<Trip>> {
        if let Some(trip) = self.open_trip_as("passenger_id", user_id, &TripStatus::OPEN).await? {
            return Ok(Some(trip));
        }
        self.open_trip_as("driver_id", user_id, &DRIVER_BUSY).await
    }

    /// Открытая поездка, связывающая двух пользователей как пассажира и водителя.
    pub async fn open_trip_between(&self, a: &str, b: &str) -> SyncResult<Option<Trip>> {
        let query = Query::new(Table::Trips)
            .filter(Filter::pair("passenger_id", "driver_id", a, b).and(status_filter(&TripStatus::OPEN)))
            .order_by("created_at", Direction::Desc);
        select_one_as(self.ctx.store.as_ref(), "open_trip_between", query).await
    }

    pub async fn trip_history(&self, user_id: &str, limit: usize, offset: usize) -> SyncResult<Vec<Trip>> {
        let query = Query::new(Table::Trips)
            .filter(party_filter(user_id))
            .order_by("created_at", Direction::Desc)
            .range(offset, limit);
        select_as(self.ctx.store.as_ref(), "trip_history", query).await
    }

    /// Обновления одной поездки.
    pub async fn subscribe_trip(&self, trip_id: &str, on_update: Callback<Trip>) -> SyncResult<Subscription> {
        let task = supervise_feed(
            self.ctx.feed.clone(),
            FeedSpec::new(Table::Trips, EventFilter::Update).filter(Filter::eq("id", trip_id)),
            format!("trip:{trip_id}"),
            self.policy,
            self.retries.clone(),
            move |event| {
                let on_update = on_update.clone();
                async move {
                    match event.new_as::<Trip>() {
                        Ok(Some(trip)) => {
                            let terminal = trip.status.is_terminal();
                            on_update(trip);
                            if terminal {
                                return ControlFlow::Break(());
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("malformed trip row: {}", e),
                    }
                    ControlFlow::Continue(())
                }
            },
        )
        .await;
        Ok(Subscription::new(move || drop(task)))
    }
}
