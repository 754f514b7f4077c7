// src/db/schema.rs

pub const SCHEMA_V1: &str = r#"
BEGIN;

-- KvCache: локальная реплика (позиции, история чатов, очередь отправки)
CREATE TABLE
    IF NOT EXISTS kv_cache (
        key TEXT PRIMARY KEY NOT NULL,
        value TEXT NOT NULL,
        updated_at REAL NOT NULL
    );

------------------------------------------------------------------
-- Устанавливаем user_version = 1
PRAGMA user_version = 1;

COMMIT;
"#;

pub const SCHEMA_V2: &str = r#"
BEGIN;

-- Индекс для вычистки устаревших записей по времени
CREATE INDEX IF NOT EXISTS idx_kv_cache_updated_at ON kv_cache (updated_at);

PRAGMA user_version = 2;

COMMIT;
"#;

/// Версия схемы после всех миграций.
pub const LATEST_SCHEMA_VERSION: i32 = 2;
