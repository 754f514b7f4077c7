// src/db/cache_store.rs

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_rusqlite::{params, Connection};

use crate::db::cache::CacheHandler;
use crate::db::migrations::setup_migrations;
use crate::db::monitoring::measure_db_operation;
use crate::error::{SyncError, SyncResult};

/// Локальное хранилище строк ключ-значение, переживающее перезапуск приложения.
/// Транзакций нет: каждый ключ пишется целиком.
#[async_trait]
pub trait PersistentCache: Send + Sync {
    async fn get(&self, key: &str) -> SyncResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> SyncResult<()>;
    async fn remove(&self, key: &str) -> SyncResult<()>;
}

/// Читает и разбирает JSON-значение.
pub async fn get_json<T: DeserializeOwned>(
    cache: &dyn PersistentCache,
    key: &str,
) -> SyncResult<Option<T>> {
    match cache.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn set_json<T: Serialize + ?Sized>(
    cache: &dyn PersistentCache,
    key: &str,
    value: &T,
) -> SyncResult<()> {
    let raw = serde_json::to_string(value)?;
    cache.set(key, &raw).await
}

/// SQLite через tokio-rusqlite (один фоновый поток-писатель) + LRU на чтение.
#[derive(Clone)]
pub struct SqliteCache {
    conn: Arc<Connection>,
    lru: CacheHandler,
}

impl SqliteCache {
    /// Открывает (или создаёт) базу по пути; `:memory:` открывает базу в памяти.
    pub async fn open(path: &str, lru_capacity: usize) -> SyncResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory().await?
        } else {
            Connection::open(path).await?
        };
        let version = setup_migrations(&conn).await?;
        debug!("kv_cache opened at {} (schema v{})", path, version);
        Ok(Self {
            conn: Arc::new(conn),
            lru: CacheHandler::new(lru_capacity),
        })
    }

    /// Удаляет записи, не обновлявшиеся с `cutoff`. Возвращает число удалённых строк.
    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> SyncResult<usize> {
        let cutoff = cutoff.timestamp_millis() as f64 / 1000.0;
        let removed = measure_db_operation("cache_prune", async {
            Ok(self
                .conn
                .call(move |conn| {
                    Ok(conn.execute("DELETE FROM kv_cache WHERE updated_at < ?1", params![cutoff])?)
                })
                .await?)
        })
        .await?;
        if removed > 0 {
            self.lru.clear();
        }
        Ok(removed)
    }
}

#[async_trait]
impl PersistentCache for SqliteCache {
    async fn get(&self, key: &str) -> SyncResult<Option<String>> {
        if let Some(hit) = self.lru.get_value(key) {
            return Ok(Some(hit));
        }
        let owned = key.to_string();
        let value = measure_db_operation("cache_get", async {
            Ok(self
                .conn
                .call(move |conn| {
                    let mut stmt = conn.prepare("SELECT value FROM kv_cache WHERE key = ?1")?;
                    let mut rows = stmt.query(params![owned])?;
                    if let Some(row) = rows.next()? {
                        Ok(Some(row.get::<_, String>(0)?))
                    } else {
                        Ok(None)
                    }
                })
                .await?)
        })
        .await?;
        if let Some(value) = &value {
            self.lru.put_value(key, value);
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        let (k, v) = (key.to_string(), value.to_string());
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        measure_db_operation("cache_set", async {
            Ok(self
                .conn
                .call(move |conn| {
                    conn.execute(
                        r#"INSERT INTO kv_cache (key, value, updated_at) VALUES (?1, ?2, ?3)
                           ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                         updated_at = excluded.updated_at"#,
                        params![k, v, now],
                    )?;
                    Ok(())
                })
                .await?)
        })
        .await?;
        self.lru.put_value(key, value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> SyncResult<()> {
        let owned = key.to_string();
        self.lru.invalidate(key);
        measure_db_operation("cache_remove", async {
            Ok(self
                .conn
                .call(move |conn| {
                    conn.execute("DELETE FROM kv_cache WHERE key = ?1", params![owned])?;
                    Ok(())
                })
                .await?)
        })
        .await
    }
}

/// Кэш в памяти процесса. `set_failing(true)` заставляет все операции
/// возвращать `SyncError::Cache`, так тесты моделируют отказ диска.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
    failing: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, op: &str, key: &str) -> SyncResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            warn!("memory cache {} failed for {}", op, key);
            return Err(SyncError::Cache(format!("{op} {key}: storage unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistentCache for MemoryCache {
    async fn get(&self, key: &str) -> SyncResult<Option<String>> {
        self.check("get", key)?;
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        self.check("set", key)?;
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> SyncResult<()> {
        self.check("remove", key)?;
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}
