// src/db/migrations.rs

use log::info;
use tokio_rusqlite::{Connection, Result};

use crate::db::schema::{LATEST_SCHEMA_VERSION, SCHEMA_V1, SCHEMA_V2};

pub async fn setup_migrations(conn: &Connection) -> Result<i32> {
    conn.call(|conn| {
        // Узнаём текущую версию схемы
        let ver: i32 = conn.query_row("PRAGMA user_version;", [], |r| r.get(0))?;

        // Если 0 -> выполняем SCHEMA_V1
        if ver < 1 {
            conn.execute_batch(SCHEMA_V1)?;
        }
        if ver < 2 {
            conn.execute_batch(SCHEMA_V2)?;
        }
        if ver < LATEST_SCHEMA_VERSION {
            info!("kv_cache schema migrated from v{} to v{}", ver, LATEST_SCHEMA_VERSION);
        }

        let ver: i32 = conn.query_row("PRAGMA user_version;", [], |r| r.get(0))?;
        Ok(ver)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().await.unwrap();
        assert_eq!(setup_migrations(&conn).await.unwrap(), LATEST_SCHEMA_VERSION);
        assert_eq!(setup_migrations(&conn).await.unwrap(), LATEST_SCHEMA_VERSION);

        let tables: i64 = conn
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'kv_cache'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(tables, 1);
    }
}
