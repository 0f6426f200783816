/// Database schema for Netwarden
pub const SCHEMA: &str = r#"
-- Per-application rules
CREATE TABLE IF NOT EXISTS app_rules (
    identifier TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    is_system INTEGER NOT NULL DEFAULT 0,
    wifi_blocked INTEGER NOT NULL DEFAULT 0,
    cellular_blocked INTEGER NOT NULL DEFAULT 0,
    last_updated INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_app_rules_blocked ON app_rules(wifi_blocked, cellular_blocked);

-- Connection log
CREATE TABLE IF NOT EXISTS connection_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    identifier TEXT NOT NULL,
    display_name TEXT NOT NULL,
    destination TEXT NOT NULL,
    port INTEGER NOT NULL,
    transport TEXT NOT NULL CHECK (transport IN ('WIFI', 'CELLULAR', 'NONE')),
    blocked INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_connection_logs_timestamp ON connection_logs(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_connection_logs_identifier ON connection_logs(identifier);

-- Settings table for runtime state shared between processes
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
