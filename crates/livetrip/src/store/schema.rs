//! `SQLite` schema for the trip store.
//!
//! Table and column names mirror the document collections: `buses`,
//! `routes` and `live_trips`, keyed by their document ids.

/// Bus documents.
pub const CREATE_BUSES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS buses (
    bus_id TEXT PRIMARY KEY,
    model TEXT,
    route_id TEXT
)
";

/// Route documents.
pub const CREATE_ROUTES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS routes (
    route_id TEXT PRIMARY KEY,
    start_point TEXT NOT NULL,
    end_point TEXT NOT NULL
)
";

/// Live trip documents. Every column but the key is nullable so that a
/// merge-write can create a document with only some fields set.
pub const CREATE_LIVE_TRIPS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS live_trips (
    bus_id TEXT PRIMARY KEY,
    driver_id TEXT,
    route_id TEXT,
    latitude REAL,
    longitude REAL,
    last_updated TEXT,
    is_active INTEGER
)
";

/// Active trips are what riders query.
pub const CREATE_ACTIVE_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_live_trips_active ON live_trips(is_active)
";

/// Key-value pairs, currently only the schema version.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// All schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_BUSES_TABLE,
    CREATE_ROUTES_TABLE,
    CREATE_LIVE_TRIPS_TABLE,
    CREATE_ACTIVE_INDEX,
    CREATE_METADATA_TABLE,
];
