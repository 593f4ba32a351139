//! SQLite storage layer -- schema, queries, migrations.
//!
//! The pool is shared read/write across jobs and the admin API; SQLite's WAL
//! mode plus the busy timeout serialize concurrent writers.

pub mod schema;

use crate::ipquality::QualityResult;
use crate::speedcheck::ProxyResult;
use anyhow::Result;
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::collections::HashMap;
use std::path::Path;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(dir) = Path::new(path).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Save one speed-test result row. Rows are a time series; nothing is
/// deduplicated.
pub fn save_speed_result(pool: &Pool, r: &ProxyResult) -> Result<()> {
    let conn = pool.get()?;
    let proxy_json = if r.proxy.is_null() {
        None
    } else {
        serde_json::to_string(&r.proxy).ok()
    };
    conn.execute(
        "INSERT INTO speed_results (subscription_id, node_name, delay_ms, download_kbps, upload_kbps, ip_address, proxy_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            Option::<i64>::None,
            r.name,
            r.delay_ms,
            r.download_kbps,
            r.upload_kbps,
            r.ip,
            proxy_json
        ],
    )?;
    Ok(())
}

/// Save one IP-quality result row, scoped to no subscription.
pub fn save_quality_result(pool: &Pool, r: &QualityResult) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO ip_quality_results (subscription_id, ip_address, fraud_score, risk_level, is_proxy, is_vpn, is_tor, country_code)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            r.subscription_id,
            r.ip,
            r.fraud_score,
            r.risk_level.as_str(),
            r.is_proxy,
            r.is_vpn,
            r.is_tor,
            r.country_code
        ],
    )?;
    Ok(())
}

/// TopN selection metric. Anything unrecognized falls back to download speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectBy {
    DownloadSpeed,
    Delay,
}

impl SelectBy {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "delay" => SelectBy::Delay,
            _ => SelectBy::DownloadSpeed,
        }
    }

    fn order_clause(self) -> &'static str {
        match self {
            SelectBy::DownloadSpeed => "download_kbps DESC",
            SelectBy::Delay => "delay_ms ASC",
        }
    }
}

/// The N best recent proxy configurations, as opaque JSON strings.
pub fn query_top_n_proxy_configs(
    pool: &Pool,
    select_by: SelectBy,
    n: u32,
    window_hours: u32,
) -> Result<Vec<String>> {
    let n = if n == 0 { 10 } else { n };
    let window_hours = if window_hours == 0 { 24 } else { window_hours };
    let conn = pool.get()?;
    // Sort column is whitelisted via SelectBy; only values are bound.
    let sql = format!(
        "SELECT proxy_json FROM speed_results
         WHERE proxy_json IS NOT NULL AND proxy_json != ''
           AND created_at >= datetime('now', ?1)
         ORDER BY {} LIMIT ?2",
        select_by.order_clause()
    );
    let mut stmt = conn.prepare(&sql)?;
    let window = format!("-{window_hours} hour");
    let rows = stmt.query_map(rusqlite::params![window, n], |row| {
        row.get::<_, String>(0)
    })?;
    let mut out = Vec::new();
    for r in rows {
        let js = r?;
        if !js.is_empty() {
            out.push(js);
        }
    }
    Ok(out)
}

#[derive(Debug, serde::Serialize)]
pub struct SpeedRow {
    pub id: i64,
    pub node_name: String,
    pub delay_ms: Option<i64>,
    pub download_kbps: Option<f64>,
    pub upload_kbps: Option<f64>,
    pub ip_address: Option<String>,
    pub created_at: String,
}

#[derive(Debug, serde::Serialize)]
pub struct QualityRow {
    pub id: i64,
    pub ip_address: String,
    pub fraud_score: Option<i64>,
    pub risk_level: Option<String>,
    pub is_proxy: Option<bool>,
    pub is_vpn: Option<bool>,
    pub is_tor: Option<bool>,
    pub country_code: Option<String>,
    pub created_at: String,
}

fn clamp_page(page: u32, page_size: u32) -> (u32, u32) {
    let page = page.max(1);
    let page_size = if page_size == 0 || page_size > 200 {
        20
    } else {
        page_size
    };
    (page, page_size)
}

/// Paged speed results, newest first, optionally filtered by node name.
pub fn query_speed_results(
    pool: &Pool,
    page: u32,
    page_size: u32,
    node_like: Option<&str>,
) -> Result<(Vec<SpeedRow>, i64)> {
    let (page, page_size) = clamp_page(page, page_size);
    let conn = pool.get()?;
    let pattern = node_like.map(|s| format!("%{s}%"));

    let total: i64 = match &pattern {
        Some(p) => conn.query_row(
            "SELECT COUNT(1) FROM speed_results WHERE node_name LIKE ?1",
            rusqlite::params![p],
            |row| row.get(0),
        )?,
        None => conn.query_row("SELECT COUNT(1) FROM speed_results", [], |row| row.get(0))?,
    };

    let offset = (page - 1) * page_size;
    let base = "SELECT id, node_name, delay_ms, download_kbps, upload_kbps, ip_address, created_at
                FROM speed_results";
    let map = |row: &rusqlite::Row<'_>| {
        Ok(SpeedRow {
            id: row.get(0)?,
            node_name: row.get(1)?,
            delay_ms: row.get(2)?,
            download_kbps: row.get(3)?,
            upload_kbps: row.get(4)?,
            ip_address: row.get(5)?,
            created_at: row.get(6)?,
        })
    };

    let mut out = Vec::new();
    match &pattern {
        Some(p) => {
            let mut stmt = conn.prepare(&format!(
                "{base} WHERE node_name LIKE ?1 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
            ))?;
            for r in stmt.query_map(rusqlite::params![p, page_size, offset], map)? {
                out.push(r?);
            }
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "{base} ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
            ))?;
            for r in stmt.query_map(rusqlite::params![page_size, offset], map)? {
                out.push(r?);
            }
        }
    }
    Ok((out, total))
}

/// Paged quality results, newest first, optionally filtered by risk level.
pub fn query_quality_results(
    pool: &Pool,
    page: u32,
    page_size: u32,
    risk: Option<&str>,
) -> Result<(Vec<QualityRow>, i64)> {
    let (page, page_size) = clamp_page(page, page_size);
    let conn = pool.get()?;

    let total: i64 = match risk {
        Some(r) => conn.query_row(
            "SELECT COUNT(1) FROM ip_quality_results WHERE risk_level = ?1",
            rusqlite::params![r],
            |row| row.get(0),
        )?,
        None => conn.query_row("SELECT COUNT(1) FROM ip_quality_results", [], |row| {
            row.get(0)
        })?,
    };

    let offset = (page - 1) * page_size;
    let base = "SELECT id, ip_address, fraud_score, risk_level, is_proxy, is_vpn, is_tor, country_code, created_at
                FROM ip_quality_results";
    let map = |row: &rusqlite::Row<'_>| {
        Ok(QualityRow {
            id: row.get(0)?,
            ip_address: row.get(1)?,
            fraud_score: row.get(2)?,
            risk_level: row.get(3)?,
            is_proxy: row.get(4)?,
            is_vpn: row.get(5)?,
            is_tor: row.get(6)?,
            country_code: row.get(7)?,
            created_at: row.get(8)?,
        })
    };

    let mut out = Vec::new();
    match risk {
        Some(r) => {
            let mut stmt = conn.prepare(&format!(
                "{base} WHERE risk_level = ?1 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
            ))?;
            for row in stmt.query_map(rusqlite::params![r, page_size, offset], map)? {
                out.push(row?);
            }
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "{base} ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
            ))?;
            for row in stmt.query_map(rusqlite::params![page_size, offset], map)? {
                out.push(row?);
            }
        }
    }
    Ok((out, total))
}

#[derive(Debug, serde::Serialize)]
pub struct Dashboard {
    pub speed_tests_7d: i64,
    pub ip_checks_30d: i64,
    pub avg_speed_7d: f64,
    pub risk_counts: HashMap<String, i64>,
}

/// Aggregate stats for the admin dashboard.
pub fn dashboard(pool: &Pool) -> Result<Dashboard> {
    let conn = pool.get()?;
    let speed_tests_7d: i64 = conn.query_row(
        "SELECT COUNT(1) FROM speed_results WHERE created_at >= datetime('now','-7 day')",
        [],
        |row| row.get(0),
    )?;
    let ip_checks_30d: i64 = conn.query_row(
        "SELECT COUNT(1) FROM ip_quality_results WHERE created_at >= datetime('now','-30 day')",
        [],
        |row| row.get(0),
    )?;
    let avg_speed_7d: f64 = conn.query_row(
        "SELECT COALESCE(AVG(download_kbps),0) FROM speed_results WHERE created_at >= datetime('now','-7 day')",
        [],
        |row| row.get(0),
    )?;

    let mut risk_counts = HashMap::new();
    let mut stmt = conn.prepare(
        "SELECT COALESCE(risk_level,'Unknown'), COUNT(1) FROM ip_quality_results
         WHERE created_at >= datetime('now','-30 day') GROUP BY risk_level",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for r in rows {
        let (level, count) = r?;
        risk_counts.insert(level, count);
    }

    Ok(Dashboard {
        speed_tests_7d,
        ip_checks_30d,
        avg_speed_7d,
        risk_counts,
    })
}
