// src/db/mod.rs
//
// Локальная персистентность:
// 1) kv_cache в SQLite (schema + migrations) с LRU поверх (cache)
// 2) трейт PersistentCache и его реализации (cache_store)
// 3) метрики prometheus (monitoring)

pub mod cache;
pub mod cache_store;
pub mod migrations;
pub mod monitoring;
pub mod schema;

pub use cache_store::{get_json, set_json, MemoryCache, PersistentCache, SqliteCache};
