// src/models.rs
//
// Сущности удалённого хранилища. Формат на проводе: JSON с теми же именами полей,
// время в RFC 3339, отсутствующие удалённые id не сериализуются.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Коллекции удалённого хранилища.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Users,
    Locations,
    Connections,
    Messages,
    Trips,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Users => "users",
            Table::Locations => "locations",
            Table::Connections => "connections",
            Table::Messages => "messages",
            Table::Trips => "trips",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Driver,
    Passenger,
}

impl UserRole {
    /// Роль, которую пользователь ищет в списке доступных.
    pub fn counterpart(&self) -> UserRole {
        match self {
            UserRole::Driver => UserRole::Passenger,
            UserRole::Passenger => UserRole::Driver,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub role: UserRole,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

/// Один полный снимок позиции пользователя (не дельта).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub user_id: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trip_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Location {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Pending,
    Accepted,
    Rejected,
    Active,
    Inactive,
}

impl ConnectionStatus {
    /// `accepted` и `active` равнозначны для видимости.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Accepted | ConnectionStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Pending => "pending",
            ConnectionStatus::Accepted => "accepted",
            ConnectionStatus::Rejected => "rejected",
            ConnectionStatus::Active => "active",
            ConnectionStatus::Inactive => "inactive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub initiator_id: String,
    pub receiver_id: String,
    pub status: ConnectionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    pub fn involves(&self, user_id: &str) -> bool {
        self.initiator_id == user_id || self.receiver_id == user_id
    }

    /// Вторая сторона связи относительно `user_id`.
    pub fn peer_of(&self, user_id: &str) -> Option<&str> {
        if self.initiator_id == user_id {
            Some(&self.receiver_id)
        } else if self.receiver_id == user_id {
            Some(&self.initiator_id)
        } else {
            None
        }
    }

    /// Совпадает ли неупорядоченная пара участников.
    pub fn is_pair(&self, a: &str, b: &str) -> bool {
        (self.initiator_id == a && self.receiver_id == b)
            || (self.initiator_id == b && self.receiver_id == a)
    }
}

/// Входящий запрос вместе с профилем инициатора, если он нашёлся.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub connection: Connection,
    pub initiator: Option<User>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trip_id: Option<String>,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Новое локальное сообщение без удалённого id.
    ///
    /// Время обрезается до миллисекунд, чтобы ключ дедупликации совпадал после
    /// круга через хранилище, которое хранит миллисекундную точность.
    pub fn new_local(
        sender_id: &str,
        receiver_id: &str,
        content: &str,
        trip_id: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
            trip_id: trip_id.map(str::to_string),
            read: false,
            created_at: created_at.trunc_subsecs(3),
        }
    }

    /// Сообщение принадлежит диалогу `a` и `b` в любом направлении.
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    Requested,
    Accepted,
    InProgress,
    Completed,
    Canceled,
}

impl TripStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TripStatus::Completed | TripStatus::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TripStatus::Requested => "requested",
            TripStatus::Accepted => "accepted",
            TripStatus::InProgress => "in_progress",
            TripStatus::Completed => "completed",
            TripStatus::Canceled => "canceled",
        }
    }

    pub const OPEN: [TripStatus; 3] = [
        TripStatus::Requested,
        TripStatus::Accepted,
        TripStatus::InProgress,
    ];
}

/// Точка посадки или назначения.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Place {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub passenger_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<String>,
    pub pickup_location: Place,
    pub destination: Place,
    pub status: TripStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trip {
    pub fn involves(&self, user_id: &str) -> bool {
        self.passenger_id == user_id || self.driver_id.as_deref() == Some(user_id)
    }

    /// Открытая поездка даёт пассажиру и водителю взаимную видимость.
    pub fn grants_visibility(&self, a: &str, b: &str) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        match self.driver_id.as_deref() {
            Some(driver) => {
                (self.passenger_id == a && driver == b) || (self.passenger_id == b && driver == a)
            }
            None => false,
        }
    }
}
