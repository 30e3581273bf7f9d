//! Database schema migrations.
//!
//! Migrations run in order and are tracked in the `migrations` table so
//! `SessionStore::open` is idempotent across restarts.

use crate::DatabaseResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 1;

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    info!(current_version, target_version = CURRENT_VERSION, "running migrations");

    if current_version < 1 {
        migrate_v1_initial_schema(conn)?;
        record_migration(conn, 1, "initial_schema")?;
    }

    info!("migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "migration applied");
    Ok(())
}

/// V1: users, sales, sources, rates, source_rates, failures, config.
fn migrate_v1_initial_schema(conn: &Connection) -> DatabaseResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE users (
            user_id             TEXT PRIMARY KEY,
            mac                 TEXT NOT NULL,
            client_id           TEXT,
            ip                  TEXT,
            user_code           TEXT NOT NULL,
            credit_seconds      INTEGER NOT NULL DEFAULT 0,
            total_seconds_ever  INTEGER NOT NULL DEFAULT 0,
            rate_down_kbps      INTEGER NOT NULL DEFAULT 0,
            rate_up_kbps        INTEGER NOT NULL DEFAULT 0,
            paused              INTEGER NOT NULL DEFAULT 0,
            connected           INTEGER NOT NULL DEFAULT 0,
            last_traffic_at     TEXT NOT NULL,
            last_seen_at        TEXT NOT NULL,
            session_expiry_at   TEXT,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL
        );
        CREATE UNIQUE INDEX idx_users_mac ON users(mac);
        CREATE UNIQUE INDEX idx_users_user_code ON users(user_code);
        CREATE INDEX idx_users_client_id ON users(client_id);
        CREATE UNIQUE INDEX idx_users_ip_active ON users(ip)
            WHERE ip IS NOT NULL AND credit_seconds > 0;

        CREATE TABLE sales (
            id      INTEGER PRIMARY KEY AUTOINCREMENT,
            ts      TEXT NOT NULL,
            amount  INTEGER NOT NULL,
            mac     TEXT NOT NULL,
            source  TEXT NOT NULL,
            seconds INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX idx_sales_ts ON sales(ts);
        CREATE INDEX idx_sales_source ON sales(source);

        CREATE TABLE sources (
            id                  TEXT PRIMARY KEY,
            kind                TEXT NOT NULL,
            display_name        TEXT NOT NULL,
            pulse_value_pesos   INTEGER NOT NULL DEFAULT 1,
            rate_down_kbps      INTEGER,
            rate_up_kbps        INTEGER,
            last_active_at      TEXT NOT NULL,
            created_at          TEXT NOT NULL
        );

        CREATE TABLE rates (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            amount          INTEGER NOT NULL UNIQUE,
            minutes         INTEGER NOT NULL,
            rate_up_kbps    INTEGER NOT NULL,
            rate_down_kbps  INTEGER NOT NULL
        );

        CREATE TABLE source_rates (
            source_id   TEXT NOT NULL,
            rate_id     INTEGER NOT NULL,
            PRIMARY KEY (source_id, rate_id)
        );

        CREATE TABLE failures (
            mac             TEXT PRIMARY KEY,
            count           INTEGER NOT NULL DEFAULT 0,
            banned_until    TEXT
        );

        CREATE TABLE config (
            key     TEXT PRIMARY KEY,
            value   TEXT NOT NULL
        );
        ",
    )?;

    // The local hardware slot is always registered.
    conn.execute(
        "INSERT INTO sources (id, kind, display_name, pulse_value_pesos, last_active_at, created_at)
         VALUES ('hardware', 'local', 'Coin/bill slot', 1, datetime('now'), datetime('now'))",
        [],
    )?;

    Ok(())
}
