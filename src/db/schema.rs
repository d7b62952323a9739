pub const SCHEMA_VERSION: &str = "1";

/// Drops everything the bootstrap creates. Children first so that the
/// RESTRICT foreign keys don't get in the way.
pub const DROP_SCHEMA_SQL: &str = r#"
DROP TABLE IF EXISTS xfers;
DROP TABLE IF EXISTS workflow_items;
DROP TABLE IF EXISTS routes;
DROP TABLE IF EXISTS priorities;
DROP TABLE IF EXISTS partners;
DROP TABLE IF EXISTS cots_patterns;
DROP TABLE IF EXISTS av_patterns;
DROP TABLE IF EXISTS scheduled_tasks;
DROP TABLE IF EXISTS control;
DROP TABLE IF EXISTS meta;
"#;

pub const CREATE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', '1');

-- Lower level = more urgent
CREATE TABLE IF NOT EXISTS priorities (
    priority_level INTEGER PRIMARY KEY,
    detail TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS routes (
    route_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    monitored_dir TEXT NOT NULL,
    filename_pattern TEXT NOT NULL,         -- Regex, full-match against the basename
    active BOOLEAN NOT NULL DEFAULT 1,
    priority INTEGER NOT NULL,
    FOREIGN KEY (priority) REFERENCES priorities(priority_level) ON DELETE RESTRICT
);

CREATE INDEX IF NOT EXISTS idx_routes_priority ON routes (priority);

-- Connector parameters for a remote system, consumed by transfer steps
CREATE TABLE IF NOT EXISTS partners (
    partner_id INTEGER PRIMARY KEY AUTOINCREMENT,
    service_name TEXT NOT NULL UNIQUE,
    service_description TEXT NOT NULL DEFAULT '',
    cots_product TEXT NOT NULL DEFAULT '',
    remote_host TEXT,
    remote_user TEXT,
    credentials_ref TEXT,
    pgp_key_handle TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    retry_wait_secs INTEGER NOT NULL DEFAULT 0,
    params TEXT NOT NULL DEFAULT '{}'        -- JSON object
);

-- Parameter templates for third-party transfer products
CREATE TABLE IF NOT EXISTS cots_patterns (
    cots_pattern_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    product TEXT NOT NULL,
    command_template TEXT NOT NULL,
    params TEXT NOT NULL DEFAULT ''
);

-- Parameter templates for antivirus scanners
CREATE TABLE IF NOT EXISTS av_patterns (
    av_pattern_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    command_template TEXT NOT NULL,
    params TEXT NOT NULL DEFAULT '',
    infected_exit_codes TEXT NOT NULL DEFAULT '1'   -- Comma separated
);

CREATE TABLE IF NOT EXISTS xfers (
    xfer_id INTEGER PRIMARY KEY AUTOINCREMENT,
    route_id INTEGER NOT NULL,
    cots_pattern_id INTEGER NOT NULL,
    partner_id INTEGER NOT NULL,
    command TEXT NOT NULL DEFAULT '',
    params TEXT NOT NULL DEFAULT '',
    delete_source BOOLEAN NOT NULL DEFAULT 0,
    FOREIGN KEY (route_id) REFERENCES routes(route_id) ON DELETE CASCADE,
    FOREIGN KEY (cots_pattern_id) REFERENCES cots_patterns(cots_pattern_id) ON DELETE RESTRICT,
    FOREIGN KEY (partner_id) REFERENCES partners(partner_id) ON DELETE RESTRICT
);

CREATE INDEX IF NOT EXISTS idx_xfers_route ON xfers (route_id);
CREATE INDEX IF NOT EXISTS idx_xfers_cots_pattern ON xfers (cots_pattern_id);
CREATE INDEX IF NOT EXISTS idx_xfers_partner ON xfers (partner_id);

CREATE TABLE IF NOT EXISTS workflow_items (
    workflow_item_id INTEGER PRIMARY KEY AUTOINCREMENT,
    route_id INTEGER NOT NULL,
    step_kind TEXT NOT NULL,
    function_call TEXT NOT NULL DEFAULT '',
    args TEXT NOT NULL DEFAULT '',           -- JSON object, parsed by the step
    running_order INTEGER NOT NULL,
    FOREIGN KEY (route_id) REFERENCES routes(route_id) ON DELETE CASCADE,
    UNIQUE (route_id, running_order)
);

CREATE INDEX IF NOT EXISTS idx_workflow_items_route ON workflow_items (route_id);

-- Cron-like fields are NULL for wildcard
CREATE TABLE IF NOT EXISTS scheduled_tasks (
    scheduled_task_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    function_kind TEXT NOT NULL,
    year TEXT DEFAULT NULL,
    month TEXT DEFAULT NULL,
    day TEXT DEFAULT NULL,
    week TEXT DEFAULT NULL,
    day_of_week TEXT DEFAULT NULL,
    hour TEXT DEFAULT NULL,
    minute TEXT DEFAULT NULL,
    second TEXT DEFAULT NULL,
    args TEXT NOT NULL DEFAULT '',
    active BOOLEAN NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS control (
    control_id INTEGER PRIMARY KEY CHECK (control_id = 1),
    status TEXT NOT NULL CHECK (status IN ('RUNNING', 'STOPPING', 'STOPPED')),
    num_threads INTEGER NOT NULL,
    pgp_keyring TEXT DEFAULT NULL,
    pgp_passphrase_ref TEXT DEFAULT NULL,
    updated_at INTEGER NOT NULL             -- Unix timestamp (UTC)
);
"#;

/// Number of seeded priority levels
pub const PRIORITY_LEVELS: i64 = 10;
pub const DEFAULT_NUM_THREADS: i64 = 4;
