//! `SQLite`-backed trip store.
//!
//! Implements the document-collection contract on a local database: merge
//! writes become `INSERT … ON CONFLICT DO UPDATE` with `COALESCE`, and the
//! bus feed polls the `buses` table, emitting a snapshot whenever its digest
//! changes.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, trace, warn};

use super::migrations;
use super::{
    BusEntry, BusFeed, BusRecord, LiveTrip, LiveTripUpdate, Result, RouteRecord, StoreError,
    TripStore,
};
use crate::fix::GeoPoint;

/// Default period between bus feed polls.
const DEFAULT_FEED_INTERVAL: Duration = Duration::from_secs(1);

/// Trip store on a local `SQLite` database.
#[derive(Debug)]
pub struct SqliteTripStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
    feed_interval: Duration,
}

impl SqliteTripStore {
    /// Open or create a store at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening trip store at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| StoreError::Open {
            path: path.clone(),
            source,
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        migrations::initialize_schema(&conn)?;

        info!("Trip store opened at {}", path.display());
        Ok(Self::from_connection(path, conn))
    }

    /// Create an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let path = PathBuf::from(":memory:");
        let conn = Connection::open_in_memory().map_err(|source| StoreError::Open {
            path: path.clone(),
            source,
        })?;
        migrations::initialize_schema(&conn)?;
        Ok(Self::from_connection(path, conn))
    }

    fn from_connection(path: PathBuf, conn: Connection) -> Self {
        Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
            feed_interval: DEFAULT_FEED_INTERVAL,
        }
    }

    /// Poll the bus collection at this period when subscribed.
    #[must_use]
    pub fn with_feed_interval(mut self, period: Duration) -> Self {
        self.feed_interval = period;
        self
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create or replace a bus document.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn put_bus(&self, bus_id: &str, record: &BusRecord) -> Result<()> {
        with_conn(&self.conn, |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO buses (bus_id, model, route_id) VALUES (?1, ?2, ?3)",
                params![bus_id, record.model, record.route_id],
            )?;
            Ok(())
        })?;
        debug!(bus_id, "Stored bus");
        Ok(())
    }

    /// Create or replace a route document.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn put_route(&self, route: &RouteRecord) -> Result<()> {
        with_conn(&self.conn, |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO routes (route_id, start_point, end_point) VALUES (?1, ?2, ?3)",
                params![route.id, route.start_point, route.end_point],
            )?;
            Ok(())
        })?;
        debug!(route_id = %route.id, "Stored route");
        Ok(())
    }

    /// Read the whole bus collection, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn list_buses(&self) -> Result<Vec<BusEntry>> {
        with_conn(&self.conn, query_buses)
    }
}

#[async_trait::async_trait]
impl TripStore for SqliteTripStore {
    async fn get_bus(&self, bus_id: &str) -> Result<Option<BusRecord>> {
        with_conn(&self.conn, |conn| {
            let record = conn
                .query_row(
                    "SELECT model, route_id FROM buses WHERE bus_id = ?1",
                    [bus_id],
                    |row| {
                        Ok(BusRecord {
                            model: row.get(0)?,
                            route_id: row.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(record)
        })
    }

    async fn get_route(&self, route_id: &str) -> Result<Option<RouteRecord>> {
        with_conn(&self.conn, |conn| {
            let record = conn
                .query_row(
                    "SELECT route_id, start_point, end_point FROM routes WHERE route_id = ?1",
                    [route_id],
                    |row| {
                        Ok(RouteRecord {
                            id: row.get(0)?,
                            start_point: row.get(1)?,
                            end_point: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(record)
        })
    }

    async fn upsert_live_trip(&self, bus_id: &str, update: &LiveTripUpdate) -> Result<()> {
        if update.is_empty() {
            trace!(bus_id, "Empty live trip update, nothing to write");
            return Ok(());
        }

        let (latitude, longitude, stamped) = merge_columns(update);

        with_conn(&self.conn, |conn| {
            conn.execute(
                r"
                INSERT INTO live_trips
                    (bus_id, driver_id, route_id, latitude, longitude, last_updated, is_active)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(bus_id) DO UPDATE SET
                    driver_id = COALESCE(excluded.driver_id, live_trips.driver_id),
                    route_id = COALESCE(excluded.route_id, live_trips.route_id),
                    latitude = COALESCE(excluded.latitude, live_trips.latitude),
                    longitude = COALESCE(excluded.longitude, live_trips.longitude),
                    last_updated = COALESCE(excluded.last_updated, live_trips.last_updated),
                    is_active = COALESCE(excluded.is_active, live_trips.is_active)
                ",
                params![
                    bus_id,
                    update.driver_id,
                    update.route_id,
                    latitude,
                    longitude,
                    stamped,
                    update.is_active,
                ],
            )?;
            Ok(())
        })?;

        trace!(bus_id, "Live trip merged");
        Ok(())
    }

    async fn set_trip_inactive(&self, bus_id: &str) -> Result<()> {
        let affected = with_conn(&self.conn, |conn| {
            merge_existing(conn, bus_id, &LiveTripUpdate::inactive())
        })?;

        if affected == 0 {
            return Err(StoreError::NotFound {
                collection: "live_trips",
                id: bus_id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_live_trip(&self, bus_id: &str) -> Result<Option<LiveTrip>> {
        with_conn(&self.conn, |conn| {
            let trip = conn
                .query_row(
                    r"
                    SELECT bus_id, driver_id, route_id, latitude, longitude, last_updated, is_active
                    FROM live_trips WHERE bus_id = ?1
                    ",
                    [bus_id],
                    row_to_live_trip,
                )
                .optional()?;
            Ok(trip)
        })
    }

    async fn subscribe_buses(&self) -> Result<BusFeed> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let (tx, rx) = mpsc::channel(4);
        let conn = Arc::clone(&self.conn);
        let period = self.feed_interval;

        debug!(?period, "Starting bus collection feed");

        let task = runtime.spawn(async move {
            let mut ticker = interval(period);
            let mut last_digest: Option<blake3::Hash> = None;

            loop {
                ticker.tick().await;

                let snapshot = match with_conn(&conn, query_buses) {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!(error = %e, "Error reading bus collection");
                        continue;
                    }
                };

                let digest = snapshot_digest(&snapshot);
                if last_digest == Some(digest) {
                    trace!("Bus collection unchanged");
                    continue;
                }
                last_digest = Some(digest);

                debug!(buses = snapshot.len(), "Bus collection changed");
                if tx.send(snapshot).await.is_err() {
                    debug!("Bus feed closed, stopping");
                    break;
                }
            }
        });

        Ok(BusFeed::new(rx).with_task(task.abort_handle()))
    }
}

/// Run `f` with the connection locked.
fn with_conn<T>(
    conn: &Mutex<Connection>,
    f: impl FnOnce(&Connection) -> Result<T>,
) -> Result<T> {
    let guard = conn
        .lock()
        .map_err(|_| StoreError::Internal("connection mutex poisoned".to_string()))?;
    f(&guard)
}

/// Column values of `update` that need conversion: latitude, longitude and
/// the store-assigned timestamp.
fn merge_columns(update: &LiveTripUpdate) -> (Option<f64>, Option<f64>, Option<String>) {
    (
        update.last_location.map(|p| p.latitude),
        update.last_location.map(|p| p.longitude),
        update.server_timestamp.then(|| Utc::now().to_rfc3339()),
    )
}

/// Merge `update` into an existing live trip without creating one.
/// Returns the number of rows touched.
fn merge_existing(conn: &Connection, bus_id: &str, update: &LiveTripUpdate) -> Result<usize> {
    let (latitude, longitude, stamped) = merge_columns(update);
    let affected = conn.execute(
        r"
        UPDATE live_trips SET
            driver_id = COALESCE(?2, driver_id),
            route_id = COALESCE(?3, route_id),
            latitude = COALESCE(?4, latitude),
            longitude = COALESCE(?5, longitude),
            last_updated = COALESCE(?6, last_updated),
            is_active = COALESCE(?7, is_active)
        WHERE bus_id = ?1
        ",
        params![
            bus_id,
            update.driver_id,
            update.route_id,
            latitude,
            longitude,
            stamped,
            update.is_active,
        ],
    )?;
    Ok(affected)
}

fn query_buses(conn: &Connection) -> Result<Vec<BusEntry>> {
    let mut stmt = conn.prepare("SELECT bus_id, model, route_id FROM buses ORDER BY bus_id")?;
    let buses = stmt
        .query_map([], |row| {
            Ok(BusEntry {
                id: row.get(0)?,
                record: BusRecord {
                    model: row.get(1)?,
                    route_id: row.get(2)?,
                },
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(buses)
}

fn row_to_live_trip(row: &rusqlite::Row) -> rusqlite::Result<LiveTrip> {
    let latitude: Option<f64> = row.get(3)?;
    let longitude: Option<f64> = row.get(4)?;
    let last_updated: Option<String> = row.get(5)?;
    let is_active: Option<bool> = row.get(6)?;

    let last_location = match (latitude, longitude) {
        (Some(lat), Some(lon)) => Some(GeoPoint::new(lat, lon)),
        _ => None,
    };

    let last_updated = last_updated.and_then(|s| match DateTime::parse_from_rfc3339(&s) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(e) => {
            warn!(value = %s, error = %e, "Unparseable lastUpdated, ignoring");
            None
        }
    });

    Ok(LiveTrip {
        bus_id: row.get(0)?,
        driver_id: row.get(1)?,
        route_id: row.get(2)?,
        last_location,
        last_updated,
        is_active: is_active.unwrap_or(false),
    })
}

/// Digest of a bus snapshot, used to suppress unchanged snapshots.
fn snapshot_digest(snapshot: &[BusEntry]) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    for bus in snapshot {
        for field in [
            Some(bus.id.as_str()),
            bus.record.model.as_deref(),
            bus.record.route_id.as_deref(),
        ] {
            match field {
                Some(value) => {
                    hasher.update(&[1]);
                    hasher.update(&(value.len() as u64).to_le_bytes());
                    hasher.update(value.as_bytes());
                }
                None => {
                    hasher.update(&[0]);
                }
            }
        }
    }
    hasher.finalize()
}
