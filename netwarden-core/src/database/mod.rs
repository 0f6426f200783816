mod schema;

use crate::error::{NetwardenError, Result};
use crate::store::{LogStore, RuleStore};
use crate::types::{ApplicationRule, ConnectionLogRecord, TransportState, TunnelState};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection as SqliteConnection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;

pub use schema::SCHEMA;

const RULE_COLUMNS: &str =
    "identifier, display_name, is_system, wifi_blocked, cellular_blocked, last_updated";
const LOG_COLUMNS: &str =
    "id, timestamp, identifier, display_name, destination, port, transport, blocked";

const KEY_RULES_REVISION: &str = "rules_revision";
const KEY_TUNNEL_STATE: &str = "tunnel_state";
const KEY_TRANSPORT: &str = "transport";
const KEY_TUNNEL_ENABLED: &str = "tunnel_enabled";
const KEY_TUNNEL_REQUESTS: &str = "tunnel_requests";

/// Database handle for Netwarden
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<SqliteConnection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = SqliteConnection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = SqliteConnection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ========== Settings ==========

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Last tunnel state published by the service
    pub fn tunnel_state(&self) -> Result<TunnelState> {
        Ok(self
            .get_setting(KEY_TUNNEL_STATE)?
            .and_then(|s| s.parse().ok())
            .unwrap_or_default())
    }

    pub fn set_tunnel_state(&self, state: TunnelState) -> Result<()> {
        self.set_setting(KEY_TUNNEL_STATE, &state.to_string())
    }

    /// Last transport published by the service
    pub fn transport(&self) -> Result<TransportState> {
        Ok(self
            .get_setting(KEY_TRANSPORT)?
            .and_then(|s| s.parse().ok())
            .unwrap_or_default())
    }

    pub fn set_transport(&self, transport: TransportState) -> Result<()> {
        self.set_setting(KEY_TRANSPORT, transport.as_str())
    }

    /// Whether the user wants the tunnel up; `None` until first set
    pub fn tunnel_enabled(&self) -> Result<Option<bool>> {
        Ok(self.get_setting(KEY_TUNNEL_ENABLED)?.and_then(|s| s.parse().ok()))
    }

    /// Also counts the request, so re-enabling an enabled tunnel is visible
    pub fn set_tunnel_enabled(&self, enabled: bool) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![KEY_TUNNEL_ENABLED, enabled.to_string()],
        )?;
        bump_counter(&tx, KEY_TUNNEL_REQUESTS)?;
        tx.commit()?;
        Ok(())
    }

    /// Number of on/off requests made so far
    pub fn tunnel_requests(&self) -> Result<i64> {
        self.counter(KEY_TUNNEL_REQUESTS)
    }

    fn counter(&self, key: &str) -> Result<i64> {
        Ok(self
            .get_setting(key)?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0))
    }
}

fn bump_revision(conn: &SqliteConnection) -> rusqlite::Result<()> {
    bump_counter(conn, KEY_RULES_REVISION)
}

fn bump_counter(conn: &SqliteConnection, key: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, '1')
         ON CONFLICT(key) DO UPDATE SET value = CAST(value AS INTEGER) + 1",
        params![key],
    )?;
    Ok(())
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<ApplicationRule> {
    Ok(ApplicationRule {
        identifier: row.get(0)?,
        display_name: row.get(1)?,
        is_system: row.get(2)?,
        wifi_blocked: row.get(3)?,
        cellular_blocked: row.get(4)?,
        last_updated: millis_to_datetime(row.get(5)?),
    })
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<ConnectionLogRecord> {
    let transport: String = row.get(6)?;
    Ok(ConnectionLogRecord {
        id: row.get(0)?,
        timestamp: millis_to_datetime(row.get(1)?),
        identifier: row.get(2)?,
        display_name: row.get(3)?,
        destination: row.get(4)?,
        port: row.get(5)?,
        transport: transport.parse().unwrap_or_default(),
        blocked: row.get(7)?,
    })
}

fn upsert_rule_row(conn: &SqliteConnection, rule: &ApplicationRule, now: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO app_rules (identifier, display_name, is_system, wifi_blocked, cellular_blocked, last_updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(identifier) DO UPDATE SET
             display_name = excluded.display_name,
             is_system = excluded.is_system,
             wifi_blocked = excluded.wifi_blocked,
             cellular_blocked = excluded.cellular_blocked,
             last_updated = excluded.last_updated",
        params![
            rule.identifier,
            rule.display_name,
            rule.is_system,
            rule.wifi_blocked,
            rule.cellular_blocked,
            now,
        ],
    )?;
    Ok(())
}

impl RuleStore for Database {
    fn all_rules(&self) -> Result<Vec<ApplicationRule>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM app_rules ORDER BY display_name COLLATE NOCASE ASC",
            RULE_COLUMNS
        ))?;
        let rules = stmt.query_map([], rule_from_row)?;
        rules.collect::<std::result::Result<Vec<_>, _>>().map_err(NetwardenError::from)
    }

    fn rule(&self, identifier: &str) -> Result<Option<ApplicationRule>> {
        let conn = self.conn.lock();
        let rule = conn
            .query_row(
                &format!("SELECT {} FROM app_rules WHERE identifier = ?1", RULE_COLUMNS),
                params![identifier],
                rule_from_row,
            )
            .optional()?;
        Ok(rule)
    }

    fn blocked_rules(&self) -> Result<Vec<ApplicationRule>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM app_rules WHERE wifi_blocked = 1 OR cellular_blocked = 1",
            RULE_COLUMNS
        ))?;
        let rules = stmt.query_map([], rule_from_row)?;
        rules.collect::<std::result::Result<Vec<_>, _>>().map_err(NetwardenError::from)
    }

    fn upsert_rule(&self, rule: &ApplicationRule) -> Result<()> {
        let conn = self.conn.lock();
        upsert_rule_row(&conn, rule, Utc::now().timestamp_millis())?;
        bump_revision(&conn)?;
        Ok(())
    }

    fn upsert_rules(&self, rules: &[ApplicationRule]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().timestamp_millis();
        for rule in rules {
            upsert_rule_row(&tx, rule, now)?;
        }
        bump_revision(&tx)?;
        tx.commit()?;
        Ok(())
    }

    fn set_all_wifi_blocked(&self, blocked: bool) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE app_rules SET wifi_blocked = ?1, last_updated = ?2",
            params![blocked, Utc::now().timestamp_millis()],
        )?;
        bump_revision(&conn)?;
        Ok(rows)
    }

    fn set_all_cellular_blocked(&self, blocked: bool) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE app_rules SET cellular_blocked = ?1, last_updated = ?2",
            params![blocked, Utc::now().timestamp_millis()],
        )?;
        bump_revision(&conn)?;
        Ok(rows)
    }

    fn update_rule(&self, identifier: &str, wifi_blocked: bool, cellular_blocked: bool) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE app_rules SET wifi_blocked = ?2, cellular_blocked = ?3, last_updated = ?4
             WHERE identifier = ?1",
            params![identifier, wifi_blocked, cellular_blocked, Utc::now().timestamp_millis()],
        )?;

        if rows == 0 {
            return Err(NetwardenError::AppNotFound(identifier.to_string()));
        }
        bump_revision(&conn)?;
        Ok(())
    }

    fn delete_rules(&self, identifiers: &[String]) -> Result<usize> {
        if identifiers.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut deleted = 0;
        for identifier in identifiers {
            deleted += tx.execute("DELETE FROM app_rules WHERE identifier = ?1", params![identifier])?;
        }
        bump_revision(&tx)?;
        tx.commit()?;
        Ok(deleted)
    }

    fn blocked_app_count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM app_rules WHERE wifi_blocked = 1 OR cellular_blocked = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn rules_revision(&self) -> Result<i64> {
        self.counter(KEY_RULES_REVISION)
    }
}

impl LogStore for Database {
    fn insert_logs(&self, records: &[ConnectionLogRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR REPLACE INTO connection_logs ({})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                LOG_COLUMNS
            ))?;
            for record in records {
                stmt.execute(params![
                    record.id,
                    record.timestamp.timestamp_millis(),
                    record.identifier,
                    record.display_name,
                    record.destination,
                    record.port,
                    record.transport.as_str(),
                    record.blocked,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn recent_logs(&self, limit: usize) -> Result<Vec<ConnectionLogRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM connection_logs ORDER BY timestamp DESC, id DESC LIMIT ?1",
            LOG_COLUMNS
        ))?;
        let logs = stmt.query_map([limit as i64], log_from_row)?;
        logs.collect::<std::result::Result<Vec<_>, _>>().map_err(NetwardenError::from)
    }

    fn logs_for_app(&self, identifier: &str) -> Result<Vec<ConnectionLogRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM connection_logs WHERE identifier = ?1 ORDER BY timestamp DESC, id DESC",
            LOG_COLUMNS
        ))?;
        let logs = stmt.query_map(params![identifier], log_from_row)?;
        logs.collect::<std::result::Result<Vec<_>, _>>().map_err(NetwardenError::from)
    }

    fn clear_logs(&self) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM connection_logs", [])?)
    }

    fn delete_logs_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "DELETE FROM connection_logs WHERE timestamp < ?1",
            params![cutoff.timestamp_millis()],
        )?)
    }

    fn blocked_connection_count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM connection_logs WHERE blocked = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn blocked_connection_count_since(&self, since: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM connection_logs WHERE blocked = 1 AND timestamp > ?1",
            params![since.timestamp_millis()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(identifier: &str, wifi: bool, cellular: bool) -> ApplicationRule {
        let mut rule = ApplicationRule::new(identifier, identifier.to_uppercase(), false);
        rule.wifi_blocked = wifi;
        rule.cellular_blocked = cellular;
        rule
    }

    #[test]
    fn test_upsert_and_get_rule() {
        let db = Database::in_memory().unwrap();

        db.upsert_rule(&rule("com.app.a", true, false)).unwrap();

        let stored = db.rule("com.app.a").unwrap().unwrap();
        assert_eq!(stored.display_name, "COM.APP.A");
        assert!(stored.wifi_blocked);
        assert!(!stored.cellular_blocked);
        assert!(db.rule("com.app.missing").unwrap().is_none());
    }

    #[test]
    fn test_upsert_replaces_existing_row() {
        let db = Database::in_memory().unwrap();

        db.upsert_rule(&rule("com.app.a", true, false)).unwrap();
        let mut updated = rule("com.app.a", false, true);
        updated.display_name = "Renamed".to_string();
        db.upsert_rules(&[updated]).unwrap();

        let rules = db.all_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].display_name, "Renamed");
        assert!(rules[0].cellular_blocked);
    }

    #[test]
    fn test_blocked_rules_only_returns_flagged_apps() {
        let db = Database::in_memory().unwrap();
        db.upsert_rules(&[
            rule("com.app.a", true, false),
            rule("com.app.b", false, false),
            rule("com.app.c", false, true),
        ])
        .unwrap();

        let mut blocked: Vec<_> = db.blocked_rules().unwrap().into_iter().map(|r| r.identifier).collect();
        blocked.sort();
        assert_eq!(blocked, vec!["com.app.a", "com.app.c"]);
        assert_eq!(db.blocked_app_count().unwrap(), 2);
    }

    #[test]
    fn test_update_rule_and_missing_app() {
        let db = Database::in_memory().unwrap();
        db.upsert_rule(&rule("com.app.a", false, false)).unwrap();
        let before = db.rule("com.app.a").unwrap().unwrap().last_updated;

        db.update_rule("com.app.a", true, true).unwrap();
        let after = db.rule("com.app.a").unwrap().unwrap();
        assert!(after.wifi_blocked && after.cellular_blocked);
        assert!(after.last_updated >= before);

        let err = db.update_rule("com.app.missing", true, false).unwrap_err();
        assert!(matches!(err, NetwardenError::AppNotFound(_)));
    }

    #[test]
    fn test_bulk_block_flags() {
        let db = Database::in_memory().unwrap();
        db.upsert_rules(&[rule("com.app.a", false, false), rule("com.app.b", false, true)])
            .unwrap();

        assert_eq!(db.set_all_wifi_blocked(true).unwrap(), 2);
        assert!(db.all_rules().unwrap().iter().all(|r| r.wifi_blocked));

        db.set_all_cellular_blocked(false).unwrap();
        assert!(db.all_rules().unwrap().iter().all(|r| !r.cellular_blocked));
    }

    #[test]
    fn test_every_rule_write_bumps_revision() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.rules_revision().unwrap(), 0);

        db.upsert_rule(&rule("com.app.a", false, false)).unwrap();
        let first = db.rules_revision().unwrap();
        db.update_rule("com.app.a", true, false).unwrap();
        let second = db.rules_revision().unwrap();
        db.delete_rules(&["com.app.a".to_string()]).unwrap();
        let third = db.rules_revision().unwrap();

        assert!(first < second && second < third);
    }

    #[test]
    fn test_insert_and_read_recent_logs() {
        let db = Database::in_memory().unwrap();
        let mut older = ConnectionLogRecord::blocked("com.app.a", "App A", "10.0.0.1", 443, TransportState::Wifi);
        older.timestamp = Utc::now() - chrono::Duration::minutes(5);
        let newer = ConnectionLogRecord::blocked("com.app.b", "App B", "::1", 53, TransportState::Cellular);

        db.insert_logs(&[older, newer]).unwrap();

        let logs = db.recent_logs(10).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].identifier, "com.app.b");
        assert_eq!(logs[0].transport, TransportState::Cellular);
        assert!(logs[0].id.is_some());
        assert_eq!(db.recent_logs(1).unwrap().len(), 1);
        assert_eq!(db.logs_for_app("com.app.a").unwrap().len(), 1);
    }

    #[test]
    fn test_insert_with_id_replaces_row() {
        let db = Database::in_memory().unwrap();
        db.insert_logs(&[ConnectionLogRecord::blocked("com.app.a", "App A", "10.0.0.1", 80, TransportState::Wifi)])
            .unwrap();
        let mut existing = db.recent_logs(1).unwrap().remove(0);
        existing.port = 8080;

        db.insert_logs(&[existing.clone()]).unwrap();

        let logs = db.recent_logs(10).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].port, 8080);
        assert_eq!(logs[0].id, existing.id);
    }

    #[test]
    fn test_log_pruning_and_counts() {
        let db = Database::in_memory().unwrap();
        let mut stale = ConnectionLogRecord::blocked("com.app.a", "App A", "10.0.0.1", 80, TransportState::Wifi);
        stale.timestamp = Utc::now() - chrono::Duration::days(10);
        let fresh = ConnectionLogRecord::blocked("com.app.a", "App A", "10.0.0.1", 80, TransportState::Wifi);
        db.insert_logs(&[stale, fresh]).unwrap();

        assert_eq!(db.blocked_connection_count().unwrap(), 2);
        assert_eq!(
            db.blocked_connection_count_since(Utc::now() - chrono::Duration::days(1)).unwrap(),
            1
        );

        assert_eq!(db.prune_older_than_days(7).unwrap(), 1);
        assert_eq!(db.blocked_connection_count().unwrap(), 1);

        assert_eq!(db.clear_logs().unwrap(), 1);
        assert!(db.recent_logs(10).unwrap().is_empty());
    }

    #[test]
    fn test_runtime_state_settings() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.tunnel_state().unwrap(), TunnelState::Disconnected);
        assert_eq!(db.transport().unwrap(), TransportState::None);

        db.set_tunnel_state(TunnelState::Connected).unwrap();
        db.set_transport(TransportState::Wifi).unwrap();

        assert_eq!(db.tunnel_state().unwrap(), TunnelState::Connected);
        assert_eq!(db.transport().unwrap(), TransportState::Wifi);

        assert_eq!(db.tunnel_enabled().unwrap(), None);
        assert_eq!(db.tunnel_requests().unwrap(), 0);
        db.set_tunnel_enabled(false).unwrap();
        assert_eq!(db.tunnel_enabled().unwrap(), Some(false));

        db.set_tunnel_enabled(true).unwrap();
        db.set_tunnel_enabled(true).unwrap();
        assert_eq!(db.tunnel_enabled().unwrap(), Some(true));
        assert_eq!(db.tunnel_requests().unwrap(), 3);
    }
}
