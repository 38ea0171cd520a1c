//! Trip store abstraction.
//!
//! The trip store is the remote document collection that holds bus, route and
//! live-trip records. Sessions only read bus and route records and write
//! live-trip records, always through merge semantics: a [`LiveTripUpdate`]
//! names exactly the fields it overwrites.

mod migrations;
mod schema;
mod sqlite;

pub use sqlite::SqliteTripStore;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::fix::GeoPoint;

/// Errors that can occur while talking to the trip store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to open or create the database.
    #[error("failed to open trip store at {path}: {source}")]
    Open {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A query failed.
    #[error("trip store query failed: {0}")]
    Query(#[from] rusqlite::Error),

    /// Failed to run schema migrations.
    #[error("trip store migration failed: {message}")]
    Migration {
        /// Description of what went wrong.
        message: String,
    },

    /// Failed to create the directory holding the database.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A record that must exist was missing.
    #[error("{collection}/{id} not found")]
    NotFound {
        /// Collection name.
        collection: &'static str,
        /// Document id.
        id: String,
    },

    /// The store did not answer in time.
    #[error("trip store timed out: {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
    },

    /// Internal error.
    #[error("internal trip store error: {0}")]
    Internal(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// A `buses/{busId}` document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusRecord {
    /// Vehicle model, for display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Route the bus runs, if assigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
}

/// A bus document together with its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusEntry {
    /// The bus id (document key).
    pub id: String,

    /// The document body.
    #[serde(flatten)]
    pub record: BusRecord,
}

/// A `routes/{routeId}` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRecord {
    /// The route id (document key).
    pub id: String,
    /// Where the route begins.
    pub start_point: String,
    /// Where the route ends.
    pub end_point: String,
}

/// A `live_trips/{busId}` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveTrip {
    /// The bus id (document key).
    pub bus_id: String,
    /// Driver currently broadcasting.
    pub driver_id: Option<String>,
    /// Route being driven.
    pub route_id: Option<String>,
    /// Latest reported position.
    pub last_location: Option<GeoPoint>,
    /// Store-assigned time of the latest write.
    pub last_updated: Option<DateTime<Utc>>,
    /// Whether the trip is broadcasting.
    pub is_active: bool,
}

/// A merge-write against a live-trip document.
///
/// Fields left as `None` are preserved by the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveTripUpdate {
    /// New driver id.
    pub driver_id: Option<String>,
    /// New route id.
    pub route_id: Option<String>,
    /// New position.
    pub last_location: Option<GeoPoint>,
    /// Ask the store to stamp `lastUpdated` with its own clock.
    pub server_timestamp: bool,
    /// New active flag.
    pub is_active: Option<bool>,
}

impl LiveTripUpdate {
    /// A position report from an active trip.
    #[must_use]
    pub fn broadcast(
        driver_id: impl Into<String>,
        route_id: impl Into<String>,
        location: GeoPoint,
    ) -> Self {
        Self {
            driver_id: Some(driver_id.into()),
            route_id: Some(route_id.into()),
            last_location: Some(location),
            server_timestamp: true,
            is_active: Some(true),
        }
    }

    /// Only clear the active flag.
    #[must_use]
    pub fn inactive() -> Self {
        Self {
            is_active: Some(false),
            ..Self::default()
        }
    }

    /// Check if the update would change nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.driver_id.is_none()
            && self.route_id.is_none()
            && self.last_location.is_none()
            && !self.server_timestamp
            && self.is_active.is_none()
    }
}

/// A document collection holding buses, routes and live trips.
#[async_trait::async_trait]
pub trait TripStore: Send + Sync {
    /// Read a bus document. `Ok(None)` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    async fn get_bus(&self, bus_id: &str) -> Result<Option<BusRecord>>;

    /// Read a route document. `Ok(None)` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    async fn get_route(&self, route_id: &str) -> Result<Option<RouteRecord>>;

    /// Merge `update` into the live-trip document of `bus_id`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    async fn upsert_live_trip(&self, bus_id: &str, update: &LiveTripUpdate) -> Result<()>;

    /// Clear the active flag of an existing live-trip document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if there is no such document, or
    /// another error if the write fails.
    async fn set_trip_inactive(&self, bus_id: &str) -> Result<()>;

    /// Read a live-trip document.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    async fn get_live_trip(&self, bus_id: &str) -> Result<Option<LiveTrip>>;

    /// Subscribe to the whole bus collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be established.
    async fn subscribe_buses(&self) -> Result<BusFeed>;
}

/// A continuous feed of bus collection snapshots.
///
/// Every item replaces the previous one entirely. Dropping the feed
/// unsubscribes.
#[derive(Debug)]
pub struct BusFeed {
    rx: mpsc::Receiver<Vec<BusEntry>>,
    task: Option<AbortHandle>,
}

impl BusFeed {
    /// Wrap the receiving end of a snapshot channel.
    #[must_use]
    pub fn new(rx: mpsc::Receiver<Vec<BusEntry>>) -> Self {
        Self { rx, task: None }
    }

    /// Tie the producing task to this feed; it is aborted on unsubscribe.
    #[must_use]
    pub fn with_task(mut self, task: AbortHandle) -> Self {
        self.task = Some(task);
        self
    }

    /// Wait for the next snapshot. `None` once the feed has ended.
    pub async fn next(&mut self) -> Option<Vec<BusEntry>> {
        self.rx.recv().await
    }

    /// Stop the feed. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        self.rx.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for BusFeed {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
