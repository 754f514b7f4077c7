// src/db/monitoring.rs

use std::future::Future;
use std::time::Instant;

use log::{debug, error};
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder, HistogramVec,
    IntCounter, IntCounterVec, TextEncoder,
};

use crate::error::SyncResult;

/// Глобальные метрики для отслеживания операций с локальным кэшем
pub static DB_QUERY_COUNTER: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "kv_cache_query_total",
        "Total number of local cache queries executed",
        &["operation"]
    )
    .expect("Failed to create DB_QUERY_COUNTER")
});

pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "kv_cache_query_duration_seconds",
        "Duration of local cache queries in seconds",
        &["operation"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to create DB_QUERY_DURATION")
});

/// Обращения к удалённому хранилищу и каналам, с исходом ok/error.
pub static REMOTE_CALL_COUNTER: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "remote_call_total",
        "Total number of remote store calls",
        &["operation", "outcome"]
    )
    .expect("Failed to create REMOTE_CALL_COUNTER")
});

pub static REMOTE_CALL_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "remote_call_duration_seconds",
        "Duration of remote store calls in seconds",
        &["operation"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("Failed to create REMOTE_CALL_DURATION")
});

/// Строки, записанные в удалённое хранилище, по сущностям.
pub static ROWS_WRITTEN: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "remote_rows_written_total",
        "Rows written to the remote store",
        &["table"]
    )
    .expect("Failed to create ROWS_WRITTEN")
});

pub static DEDUP_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "chat_dedup_dropped_total",
        "Messages dropped because they were already seen"
    )
    .expect("Failed to create DEDUP_DROPPED")
});

pub static RESUBSCRIBES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "realtime_resubscribe_total",
        "Realtime subscription restarts after a transport error",
        &["channel"]
    )
    .expect("Failed to create RESUBSCRIBES")
});

/// Функция-обёртка для выполнения операции с локальным кэшем и сбора метрик.
pub async fn measure_db_operation<F, T>(operation: &str, f: F) -> SyncResult<T>
where
    F: Future<Output = SyncResult<T>>,
{
    let start = Instant::now();
    let result = f.await;
    let secs = start.elapsed().as_secs_f64();

    DB_QUERY_COUNTER.with_label_values(&[operation]).inc();
    DB_QUERY_DURATION.with_label_values(&[operation]).observe(secs);

    debug!("DB operation {} took {:.4} seconds", operation, secs);
    result
}

/// То же для удалённого хранилища; исход попадает в метку `outcome`.
pub async fn measure_remote<F, T>(operation: &str, f: F) -> SyncResult<T>
where
    F: Future<Output = SyncResult<T>>,
{
    let start = Instant::now();
    let result = f.await;
    let secs = start.elapsed().as_secs_f64();

    let outcome = if result.is_ok() { "ok" } else { "error" };
    REMOTE_CALL_COUNTER
        .with_label_values(&[operation, outcome])
        .inc();
    REMOTE_CALL_DURATION
        .with_label_values(&[operation])
        .observe(secs);

    debug!("remote {} ({}) took {:.4} seconds", operation, outcome, secs);
    result
}

pub fn record_rows_written(table: &str, rows: usize) {
    ROWS_WRITTEN.with_label_values(&[table]).inc_by(rows as u64);
}

/// Все зарегистрированные метрики в текстовом формате Prometheus.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("metrics encoding failed: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
