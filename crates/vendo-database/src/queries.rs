//! Standalone query functions operating on any `&Connection` — used both by
//! the dedicated writer connection and by pooled read-only connections.

use crate::{
    DatabaseError, DatabaseResult, FailureRecord, NewUser, RateRow, Sale, SourceKind, SourceRow,
    User,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

fn parse_dt(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_dt_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(parse_dt)
}

const USER_COLUMNS: &str = "user_id, mac, client_id, ip, user_code, credit_seconds, total_seconds_ever, \
     rate_down_kbps, rate_up_kbps, paused, connected, last_traffic_at, last_seen_at, \
     session_expiry_at, created_at, updated_at";

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        user_id: row.get(0)?,
        mac: row.get(1)?,
        client_id: row.get(2)?,
        ip: row.get(3)?,
        user_code: row.get(4)?,
        credit_seconds: row.get(5)?,
        total_seconds_ever: row.get(6)?,
        rate_down_kbps: row.get(7)?,
        rate_up_kbps: row.get(8)?,
        paused: row.get(9)?,
        connected: row.get(10)?,
        last_traffic_at: parse_dt(row.get(11)?),
        last_seen_at: parse_dt(row.get(12)?),
        session_expiry_at: parse_dt_opt(row.get(13)?),
        created_at: parse_dt(row.get(14)?),
        updated_at: parse_dt(row.get(15)?),
    })
}

/// Normalize a MAC address to its canonical lowercase form.
pub fn normalize_mac(mac: &str) -> String {
    mac.trim().to_ascii_lowercase()
}

// ==========================================
// Users
// ==========================================

/// Insert a brand-new user, failing if the MAC or user_code already exists.
pub fn insert_user(conn: &Connection, new_user: &NewUser) -> DatabaseResult<User> {
    let now = Utc::now().to_rfc3339();
    let mac = normalize_mac(&new_user.mac);
    conn.execute(
        "INSERT INTO users (user_id, mac, client_id, ip, user_code, credit_seconds,
            total_seconds_ever, rate_down_kbps, rate_up_kbps, paused, connected,
            last_traffic_at, last_seen_at, session_expiry_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?5, ?6, ?7, 0, 1, ?8, ?8, NULL, ?8, ?8)",
        params![
            new_user.user_id,
            mac,
            new_user.client_id,
            new_user.user_code,
            new_user.credit_seconds,
            new_user.rate_down_kbps,
            new_user.rate_up_kbps,
            now,
        ],
    )?;
    find_by_id(conn, &new_user.user_id)?
        .ok_or_else(|| DatabaseError::NotFound(new_user.user_id.clone()))
}

/// Find a user by opaque id.
pub fn find_by_id(conn: &Connection, user_id: &str) -> DatabaseResult<Option<User>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = ?1"))?;
    Ok(stmt.query_row(params![user_id], row_to_user).optional()?)
}

/// Find a user by persistent client cookie.
pub fn find_by_cookie(conn: &Connection, client_id: &str) -> DatabaseResult<Option<User>> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {USER_COLUMNS} FROM users WHERE client_id = ?1"))?;
    Ok(stmt.query_row(params![client_id], row_to_user).optional()?)
}

/// Find a user by MAC (case-insensitive).
pub fn find_by_mac(conn: &Connection, mac: &str) -> DatabaseResult<Option<User>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {USER_COLUMNS} FROM users WHERE mac = ?1"))?;
    Ok(stmt
        .query_row(params![normalize_mac(mac)], row_to_user)
        .optional()?)
}

/// Find a user by their public, printable redemption code.
pub fn find_by_code(conn: &Connection, user_code: &str) -> DatabaseResult<Option<User>> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {USER_COLUMNS} FROM users WHERE user_code = ?1"))?;
    Ok(stmt
        .query_row(params![user_code.to_ascii_uppercase()], row_to_user)
        .optional()?)
}

/// Find a user currently holding a given IP among active (credited) records.
pub fn find_by_ip(conn: &Connection, ip: &str) -> DatabaseResult<Option<User>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE ip = ?1 AND credit_seconds > 0"
    ))?;
    Ok(stmt.query_row(params![ip], row_to_user).optional()?)
}

/// Claim `new_mac` for `user_id`, deleting any stale (non-this) record
/// already sitting on that MAC, then rewriting this user's MAC.
pub fn claim_mac(conn: &Connection, user_id: &str, new_mac: &str) -> DatabaseResult<()> {
    let mac = normalize_mac(new_mac);
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "DELETE FROM users WHERE mac = ?1 AND user_id != ?2",
        params![mac, user_id],
    )?;
    let updated = conn.execute(
        "UPDATE users SET mac = ?1, updated_at = ?2 WHERE user_id = ?3",
        params![mac, now, user_id],
    )?;
    if updated == 0 {
        return Err(DatabaseError::NotFound(user_id.to_string()));
    }
    Ok(())
}

/// Bind a cookie to a user that currently has none.
pub fn bind_cookie(conn: &Connection, user_id: &str, client_id: &str) -> DatabaseResult<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE users SET client_id = ?1, updated_at = ?2 WHERE user_id = ?3",
        params![client_id, now, user_id],
    )?;
    Ok(())
}

/// Assign `ip` to `user_id`, first clearing it from any other record so the
/// unique-active-IP invariant holds.
pub fn assign_ip(conn: &Connection, user_id: &str, ip: &str) -> DatabaseResult<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE users SET ip = NULL, updated_at = ?1 WHERE ip = ?2 AND user_id != ?3",
        params![now, ip, user_id],
    )?;
    let updated = conn.execute(
        "UPDATE users SET ip = ?1, updated_at = ?2 WHERE user_id = ?3",
        params![ip, now, user_id],
    )?;
    if updated == 0 {
        return Err(DatabaseError::NotFound(user_id.to_string()));
    }
    Ok(())
}

/// Decrement a user's credit by `seconds`, clamping at zero. Returns the new
/// balance.
pub fn decrement(conn: &Connection, user_id: &str, seconds: i64) -> DatabaseResult<i64> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE users SET credit_seconds = MAX(credit_seconds - ?1, 0), updated_at = ?2
         WHERE user_id = ?3",
        params![seconds, now, user_id],
    )?;
    let balance: i64 = conn.query_row(
        "SELECT credit_seconds FROM users WHERE user_id = ?1",
        params![user_id],
        |row| row.get(0),
    )?;
    Ok(balance)
}

/// Add `seconds` of credit, bumping the lifetime total too. Used by
/// `CreditApplier` and the free-time grant path.
pub fn add_credit(conn: &Connection, user_id: &str, seconds: i64) -> DatabaseResult<i64> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE users SET credit_seconds = credit_seconds + ?1,
            total_seconds_ever = total_seconds_ever + ?1,
            paused = 0, connected = 1, last_traffic_at = ?2, updated_at = ?2
         WHERE user_id = ?3",
        params![seconds, now, user_id],
    )?;
    let balance: i64 = conn.query_row(
        "SELECT credit_seconds FROM users WHERE user_id = ?1",
        params![user_id],
        |row| row.get(0),
    )?;
    Ok(balance)
}

/// Raise `rate_up_kbps`/`rate_down_kbps` to at least the given values.
pub fn raise_rates(conn: &Connection, user_id: &str, up_kbps: i64, down_kbps: i64) -> DatabaseResult<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE users SET rate_up_kbps = MAX(rate_up_kbps, ?1),
            rate_down_kbps = MAX(rate_down_kbps, ?2), updated_at = ?3
         WHERE user_id = ?4",
        params![up_kbps, down_kbps, now, user_id],
    )?;
    Ok(())
}

/// Force both bandwidth caps to exact values (used for per-source overrides).
pub fn set_rates(conn: &Connection, user_id: &str, up_kbps: i64, down_kbps: i64) -> DatabaseResult<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE users SET rate_up_kbps = ?1, rate_down_kbps = ?2, updated_at = ?3 WHERE user_id = ?4",
        params![up_kbps, down_kbps, now, user_id],
    )?;
    Ok(())
}

/// Coalesce the stored client_id with `client_id` if the existing one is null.
pub fn coalesce_client_id(conn: &Connection, user_id: &str, client_id: &str) -> DatabaseResult<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE users SET client_id = COALESCE(client_id, ?1), updated_at = ?2 WHERE user_id = ?3",
        params![client_id, now, user_id],
    )?;
    Ok(())
}

/// Touch `last_traffic_at`/`last_seen_at` to now.
pub fn touch_traffic(conn: &Connection, user_id: &str) -> DatabaseResult<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE users SET last_traffic_at = ?1, last_seen_at = ?1 WHERE user_id = ?2",
        params![now, user_id],
    )?;
    Ok(())
}

/// Pause a user: `paused = true`, `connected = false`.
pub fn pause(conn: &Connection, user_id: &str) -> DatabaseResult<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE users SET paused = 1, connected = 0, updated_at = ?1 WHERE user_id = ?2",
        params![now, user_id],
    )?;
    Ok(())
}

/// Resume a previously paused user: `paused = false`, `connected = true`.
pub fn resume(conn: &Connection, user_id: &str) -> DatabaseResult<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE users SET paused = 0, connected = 1, updated_at = ?1 WHERE user_id = ?2",
        params![now, user_id],
    )?;
    Ok(())
}

/// Expire a user: credit to zero, `connected = false`.
pub fn expire(conn: &Connection, user_id: &str) -> DatabaseResult<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE users SET credit_seconds = 0, connected = 0, updated_at = ?1 WHERE user_id = ?2",
        params![now, user_id],
    )?;
    Ok(())
}

/// Snapshot every active (credited, unpaused) user.
pub fn iterate_active(conn: &Connection) -> DatabaseResult<Vec<User>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE credit_seconds > 0 AND paused = 0"
    ))?;
    let rows = stmt
        .query_map([], row_to_user)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// All users currently flagged `connected`, regardless of pause state —
/// used by `IdleMonitor`, which watches connected-but-not-yet-paused users.
pub fn iterate_connected(conn: &Connection) -> DatabaseResult<Vec<User>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE connected = 1 AND paused = 0"
    ))?;
    let rows = stmt
        .query_map([], row_to_user)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// All MACs currently owned by an active user.
pub fn active_macs(conn: &Connection) -> DatabaseResult<Vec<String>> {
    let mut stmt = conn.prepare_cached("SELECT mac FROM users WHERE credit_seconds > 0")?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ==========================================
// Sales
// ==========================================

/// Append a sale row. Always succeeds before the User mutation in the same
/// credit transaction, per the ledger-integrity invariant.
pub fn insert_sale(conn: &Connection, amount: i64, mac: &str, source: &str, seconds: i64) -> DatabaseResult<Sale> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO sales (ts, amount, mac, source, seconds) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![now, amount, normalize_mac(mac), source, seconds],
    )?;
    let id = conn.last_insert_rowid();
    Ok(Sale {
        id,
        ts: parse_dt(now),
        amount,
        mac: normalize_mac(mac),
        source: source.to_string(),
        seconds,
    })
}

/// Total pesos sold across all time, for invariant checks and reporting.
pub fn total_sales_amount(conn: &Connection) -> DatabaseResult<i64> {
    let total: i64 = conn.query_row("SELECT COALESCE(SUM(amount), 0) FROM sales", [], |row| {
        row.get(0)
    })?;
    Ok(total)
}

/// The most recent zero-amount (free-time) grant for `mac`, if any —
/// surfaced by `status()` as the `free_time` field.
pub fn last_free_time_grant(conn: &Connection, mac: &str) -> DatabaseResult<Option<Sale>> {
    Ok(conn
        .query_row(
            "SELECT id, ts, amount, mac, source, seconds FROM sales WHERE mac = ?1 AND amount = 0 ORDER BY ts DESC LIMIT 1",
            params![normalize_mac(mac)],
            |row| {
                Ok(Sale {
                    id: row.get(0)?,
                    ts: parse_dt(row.get(1)?),
                    amount: row.get(2)?,
                    mac: row.get(3)?,
                    source: row.get(4)?,
                    seconds: row.get(5)?,
                })
            },
        )
        .optional()?)
}

/// Per-source totals over `[since, now)`, summed in UTC (see SPEC_FULL §3).
pub fn sales_by_source_since(
    conn: &Connection,
    since: DateTime<Utc>,
) -> DatabaseResult<Vec<(String, i64)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT source, SUM(amount) FROM sales WHERE ts >= ?1 GROUP BY source ORDER BY source",
    )?;
    let rows = stmt
        .query_map(params![since.to_rfc3339()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ==========================================
// Sources
// ==========================================

fn row_to_source(row: &rusqlite::Row<'_>) -> rusqlite::Result<SourceRow> {
    Ok(SourceRow {
        id: row.get(0)?,
        kind: SourceKind::from_str(&row.get::<_, String>(1)?),
        display_name: row.get(2)?,
        pulse_value_pesos: row.get(3)?,
        rate_down_kbps: row.get(4)?,
        rate_up_kbps: row.get(5)?,
        last_active_at: parse_dt(row.get(6)?),
        created_at: parse_dt(row.get(7)?),
    })
}

const SOURCE_COLUMNS: &str =
    "id, kind, display_name, pulse_value_pesos, rate_down_kbps, rate_up_kbps, last_active_at, created_at";

/// Upsert a source keyed by its device identifier (local or `remote:<id>`).
pub fn upsert_source(
    conn: &Connection,
    id: &str,
    kind: SourceKind,
    display_name: &str,
    pulse_value_pesos: i64,
    rate_down_kbps: Option<i64>,
    rate_up_kbps: Option<i64>,
) -> DatabaseResult<SourceRow> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO sources (id, kind, display_name, pulse_value_pesos, rate_down_kbps, rate_up_kbps, last_active_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
         ON CONFLICT(id) DO UPDATE SET
            display_name = excluded.display_name,
            pulse_value_pesos = excluded.pulse_value_pesos,
            rate_down_kbps = excluded.rate_down_kbps,
            rate_up_kbps = excluded.rate_up_kbps,
            last_active_at = excluded.last_active_at",
        params![id, kind.as_str(), display_name, pulse_value_pesos, rate_down_kbps, rate_up_kbps, now],
    )?;
    get_source(conn, id)?.ok_or_else(|| DatabaseError::NotFound(id.to_string()))
}

/// Bump `last_active_at` for a source on authenticated heartbeat/pulse.
pub fn touch_source(conn: &Connection, id: &str) -> DatabaseResult<()> {
    let now = Utc::now().to_rfc3339();
    let updated = conn.execute(
        "UPDATE sources SET last_active_at = ?1 WHERE id = ?2",
        params![now, id],
    )?;
    if updated == 0 {
        return Err(DatabaseError::NotFound(id.to_string()));
    }
    Ok(())
}

/// Fetch a source by id.
pub fn get_source(conn: &Connection, id: &str) -> DatabaseResult<Option<SourceRow>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?1"))?;
    Ok(stmt.query_row(params![id], row_to_source).optional()?)
}

/// List every registered source (local + remote).
pub fn list_sources(conn: &Connection) -> DatabaseResult<Vec<SourceRow>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {SOURCE_COLUMNS} FROM sources ORDER BY id"))?;
    let rows = stmt
        .query_map([], row_to_source)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Rate ids explicitly visible to `source_id`. An empty result means "no
/// restriction": the full table applies.
pub fn visible_rate_ids(conn: &Connection, source_id: &str) -> DatabaseResult<Vec<i64>> {
    let mut stmt =
        conn.prepare_cached("SELECT rate_id FROM source_rates WHERE source_id = ?1 ORDER BY rate_id")?;
    let rows = stmt
        .query_map(params![source_id], |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Replace the visibility mask for `source_id` with exactly `rate_ids`.
pub fn set_visible_rate_ids(conn: &Connection, source_id: &str, rate_ids: &[i64]) -> DatabaseResult<()> {
    conn.execute("DELETE FROM source_rates WHERE source_id = ?1", params![source_id])?;
    for rate_id in rate_ids {
        conn.execute(
            "INSERT INTO source_rates (source_id, rate_id) VALUES (?1, ?2)",
            params![source_id, rate_id],
        )?;
    }
    Ok(())
}

// ==========================================
// Rates
// ==========================================

fn row_to_rate(row: &rusqlite::Row<'_>) -> rusqlite::Result<RateRow> {
    Ok(RateRow {
        id: row.get(0)?,
        amount: row.get(1)?,
        minutes: row.get(2)?,
        rate_up_kbps: row.get(3)?,
        rate_down_kbps: row.get(4)?,
    })
}

const RATE_COLUMNS: &str = "id, amount, minutes, rate_up_kbps, rate_down_kbps";

/// List the full price table, ordered by amount.
pub fn list_rates(conn: &Connection) -> DatabaseResult<Vec<RateRow>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {RATE_COLUMNS} FROM rates ORDER BY amount"))?;
    let rows = stmt
        .query_map([], row_to_rate)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Upsert a rate line keyed by `amount`.
pub fn upsert_rate(
    conn: &Connection,
    amount: i64,
    minutes: i64,
    rate_up_kbps: i64,
    rate_down_kbps: i64,
) -> DatabaseResult<RateRow> {
    conn.execute(
        "INSERT INTO rates (amount, minutes, rate_up_kbps, rate_down_kbps) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(amount) DO UPDATE SET
            minutes = excluded.minutes, rate_up_kbps = excluded.rate_up_kbps, rate_down_kbps = excluded.rate_down_kbps",
        params![amount, minutes, rate_up_kbps, rate_down_kbps],
    )?;
    let mut stmt = conn.prepare_cached(&format!("SELECT {RATE_COLUMNS} FROM rates WHERE amount = ?1"))?;
    Ok(stmt.query_row(params![amount], row_to_rate)?)
}

// ==========================================
// Failures
// ==========================================

fn row_to_failure(row: &rusqlite::Row<'_>) -> rusqlite::Result<FailureRecord> {
    Ok(FailureRecord {
        mac: row.get(0)?,
        count: row.get(1)?,
        banned_until: row.get::<_, Option<String>>(2)?.map(parse_dt),
    })
}

/// Fetch a MAC's failure record, if any.
pub fn get_failure(conn: &Connection, mac: &str) -> DatabaseResult<Option<FailureRecord>> {
    let mut stmt = conn.prepare_cached("SELECT mac, count, banned_until FROM failures WHERE mac = ?1")?;
    Ok(stmt
        .query_row(params![normalize_mac(mac)], row_to_failure)
        .optional()?)
}

/// Record a failed attempt, returning the updated record.
pub fn record_failure(conn: &Connection, mac: &str) -> DatabaseResult<FailureRecord> {
    let mac = normalize_mac(mac);
    conn.execute(
        "INSERT INTO failures (mac, count, banned_until) VALUES (?1, 1, NULL)
         ON CONFLICT(mac) DO UPDATE SET count = count + 1",
        params![mac],
    )?;
    get_failure(conn, &mac)?.ok_or_else(|| DatabaseError::NotFound(mac))
}

/// Stamp a ban on `mac` until `until`.
pub fn set_banned_until(conn: &Connection, mac: &str, until: DateTime<Utc>) -> DatabaseResult<()> {
    conn.execute(
        "UPDATE failures SET banned_until = ?1 WHERE mac = ?2",
        params![until.to_rfc3339(), normalize_mac(mac)],
    )?;
    Ok(())
}

/// Clear a MAC's failure counter and ban on any successful attempt.
pub fn clear_failure(conn: &Connection, mac: &str) -> DatabaseResult<()> {
    conn.execute("DELETE FROM failures WHERE mac = ?1", params![normalize_mac(mac)])?;
    Ok(())
}

// ==========================================
// Config
// ==========================================

/// Read a raw config value, if an operator override exists.
pub fn get_config(conn: &Connection, key: &str) -> DatabaseResult<Option<String>> {
    let mut stmt = conn.prepare_cached("SELECT value FROM config WHERE key = ?1")?;
    Ok(stmt
        .query_row(params![key], |row| row.get::<_, String>(0))
        .optional()?)
}

/// Write a runtime-tunable config override.
pub fn set_config(conn: &Connection, key: &str, value: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}
