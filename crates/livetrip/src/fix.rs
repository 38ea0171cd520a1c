//! Core position types for livetrip.
//!
//! This module defines the fundamental data structures for representing
//! device location readings and the options that shape how they are requested.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters (IUGG).
const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// A geographic coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude, positive north.
    pub latitude: f64,
    /// Longitude, positive east.
    pub longitude: f64,
}

impl GeoPoint {
    /// Create a new point.
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check that both coordinates are finite and within range.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Great-circle distance to `other` in meters.
    #[must_use]
    pub fn distance_m(&self, other: &Self) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let d_lat = lat2 - lat1;
        let d_lon = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
    }
}

impl std::fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}, {:.6}", self.latitude, self.longitude)
    }
}

/// A single device location reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    /// Where the device was.
    pub position: GeoPoint,

    /// When the reading was taken.
    pub timestamp: DateTime<Utc>,

    /// Horizontal accuracy radius in meters, if the platform reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f64>,
}

impl Fix {
    /// Create a fix taken now.
    #[must_use]
    pub fn now(position: GeoPoint) -> Self {
        Self::at(position, Utc::now())
    }

    /// Create a fix taken at the given time.
    #[must_use]
    pub fn at(position: GeoPoint, timestamp: DateTime<Utc>) -> Self {
        Self {
            position,
            timestamp,
            accuracy_m: None,
        }
    }

    /// Attach an accuracy radius.
    #[must_use]
    pub fn with_accuracy(mut self, accuracy_m: f64) -> Self {
        self.accuracy_m = Some(accuracy_m);
        self
    }

    /// How old this fix is. Fixes stamped in the future have zero age.
    #[must_use]
    pub fn age(&self) -> Duration {
        (Utc::now() - self.timestamp).to_std().unwrap_or_default()
    }
}

/// Positioning accuracy preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accuracy {
    /// Use GPS, best precision.
    #[default]
    High,
    /// Prefer network/cell positioning to save power.
    PowerSaving,
}

impl std::fmt::Display for Accuracy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::PowerSaving => write!(f, "power_saving"),
        }
    }
}

/// Options for a one-shot fix request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixOptions {
    /// Upper bound on how long the request may take.
    pub timeout: Duration,
    /// Oldest cached fix that is still acceptable.
    pub maximum_age: Duration,
    /// Accuracy preference.
    pub accuracy: Accuracy,
}

impl Default for FixOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            maximum_age: Duration::from_secs(10),
            accuracy: Accuracy::High,
        }
    }
}

/// Options for a continuous location subscription.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchOptions {
    /// Minimum movement in meters between two reports.
    pub distance_filter_m: f64,
    /// Minimum time between two reports.
    pub interval: Duration,
    /// Accuracy preference.
    pub accuracy: Accuracy,
    /// Only report significant location changes (platform-defined).
    pub use_significant_changes: bool,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            distance_filter_m: 10.0,
            interval: Duration::from_secs(5),
            accuracy: Accuracy::High,
            use_significant_changes: false,
        }
    }
}
