//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS speed_results (
            id INTEGER PRIMARY KEY,
            subscription_id INTEGER,
            node_name TEXT NOT NULL,
            delay_ms INTEGER,
            download_kbps REAL,
            upload_kbps REAL,
            ip_address TEXT,
            proxy_json TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS ip_quality_results (
            id INTEGER PRIMARY KEY,
            subscription_id INTEGER,
            ip_address TEXT NOT NULL,
            fraud_score INTEGER,
            risk_level TEXT,
            is_proxy INTEGER,
            is_vpn INTEGER,
            is_tor INTEGER,
            country_code TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_speed_results_created ON speed_results(created_at);
        CREATE INDEX IF NOT EXISTS idx_speed_results_download ON speed_results(download_kbps);
        CREATE INDEX IF NOT EXISTS idx_ip_quality_created ON ip_quality_results(created_at);",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM speed_results", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM ip_quality_results", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error
    }
}
