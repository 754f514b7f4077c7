// src/geo.rs

use crate::models::Coordinates;

/// Радиус Земли в километрах.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Средняя городская скорость для оценки времени прибытия, км/ч.
pub const DEFAULT_SPEED_KMH: f64 = 30.0;

/// Расстояние по дуге большого круга (формула гаверсинусов), километры.
pub fn distance_km(from: Coordinates, to: Coordinates) -> f64 {
    let d_lat = (to.latitude - from.latitude).to_radians();
    let d_lon = (to.longitude - from.longitude).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + from.latitude.to_radians().cos()
            * to.latitude.to_radians().cos()
            * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// То же в метрах; в метрах задаются пороги перемещения.
pub fn distance_m(from: Coordinates, to: Coordinates) -> f64 {
    distance_km(from, to) * 1000.0
}

/// Время прибытия в минутах при скорости `speed_kmh` (по умолчанию 30 км/ч).
pub fn eta_minutes(distance_km: f64, speed_kmh: Option<f64>) -> f64 {
    let speed = speed_kmh
        .filter(|s| *s > 0.0)
        .unwrap_or(DEFAULT_SPEED_KMH);
    distance_km / (speed / 60.0)
}

fn plural(n: u64, unit: &str) -> String {
    if n == 1 {
        format!("{n} {unit}")
    } else {
        format!("{n} {unit}s")
    }
}

/// Человекочитаемое время прибытия: "Less than a minute", "5 minutes", "1 hour 5 minutes".
pub fn format_eta(eta_minutes: f64) -> String {
    if eta_minutes < 1.0 {
        return "Less than a minute".to_string();
    }
    let total = eta_minutes.round() as u64;
    if total < 60 {
        return plural(total, "minute");
    }
    let (hours, minutes) = (total / 60, total % 60);
    let mut out = plural(hours, "hour");
    if minutes > 0 {
        out.push(' ');
        out.push_str(&plural(minutes, "minute"));
    }
    out
}

/// Заглушка обратного геокодирования: координаты с точностью 6 знаков.
pub fn placeholder_address(at: Coordinates) -> String {
    format!("{:.6}, {:.6}", at.latitude, at.longitude)
}

/// Смещение точки на `meters` к северу; удобно для тестов порогов.
pub fn offset_north(at: Coordinates, meters: f64) -> Coordinates {
    let d_lat = (meters / 1000.0 / EARTH_RADIUS_KM).to_degrees();
    Coordinates::new(at.latitude + d_lat, at.longitude)
}
