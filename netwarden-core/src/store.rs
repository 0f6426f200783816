//! Interfaces to the collaborators the engine consumes but does not own.
//!
//! The SQLite [`Database`](crate::database::Database) implements both stores;
//! platform crates provide the registry and power policy.

use crate::error::Result;
use crate::types::{ApplicationRule, ConnectionLogRecord, InstalledApp};
use chrono::{DateTime, Utc};

/// Persistent per-application rules keyed by application identifier.
///
/// Every write refreshes the affected rows' last-updated timestamp.
pub trait RuleStore: Send + Sync {
    fn all_rules(&self) -> Result<Vec<ApplicationRule>>;

    fn rule(&self, identifier: &str) -> Result<Option<ApplicationRule>>;

    /// Rules with at least one block flag set
    fn blocked_rules(&self) -> Result<Vec<ApplicationRule>>;

    fn upsert_rule(&self, rule: &ApplicationRule) -> Result<()>;

    fn upsert_rules(&self, rules: &[ApplicationRule]) -> Result<()>;

    /// Returns the number of rows touched
    fn set_all_wifi_blocked(&self, blocked: bool) -> Result<usize>;

    /// Returns the number of rows touched
    fn set_all_cellular_blocked(&self, blocked: bool) -> Result<usize>;

    /// Fails with `AppNotFound` when no row has this identifier
    fn update_rule(&self, identifier: &str, wifi_blocked: bool, cellular_blocked: bool) -> Result<()>;

    fn delete_rules(&self, identifiers: &[String]) -> Result<usize>;

    fn blocked_app_count(&self) -> Result<usize>;

    /// Changes whenever any rule is written; used to detect edits made by
    /// another process
    fn rules_revision(&self) -> Result<i64>;
}

/// Persistent record of connection attempts
pub trait LogStore: Send + Sync {
    /// Records carrying an id replace the existing row with that id
    fn insert_logs(&self, records: &[ConnectionLogRecord]) -> Result<()>;

    /// Newest first
    fn recent_logs(&self, limit: usize) -> Result<Vec<ConnectionLogRecord>>;

    fn logs_for_app(&self, identifier: &str) -> Result<Vec<ConnectionLogRecord>>;

    fn clear_logs(&self) -> Result<usize>;

    fn delete_logs_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    fn blocked_connection_count(&self) -> Result<usize>;

    fn blocked_connection_count_since(&self, since: DateTime<Utc>) -> Result<usize>;

    /// Drop records older than `days` days
    fn prune_older_than_days(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        self.delete_logs_older_than(cutoff)
    }
}

/// Enumerates installed applications
pub trait AppRegistry: Send + Sync {
    fn installed_apps(&self) -> Result<Vec<InstalledApp>>;
}

/// Answers whether the host would kill the background service to save power
pub trait PowerPolicy: Send + Sync {
    fn would_kill_background_service(&self) -> bool;
}
