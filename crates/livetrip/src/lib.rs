//! `livetrip` - Live bus trip broadcasting
//!
//! This library provides the driver-side session that turns a device's GPS
//! feed into live trip records: bus and route resolution, location permission
//! gating, the start/stop broadcast lifecycle, and the store, location and
//! identity seams it runs against.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod fix;
pub mod location;
pub mod logging;
pub mod navigator;
pub mod permission;
pub mod session;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use fix::{Fix, GeoPoint};
pub use location::{LocationSource, ReplayLocationSource, SubscriptionHandle};
pub use logging::init_logging;
pub use permission::{Capability, PermissionGate};
pub use session::{SessionConfig, SessionDeps, SessionRegistry, SessionStatus, TripSession};
pub use store::{SqliteTripStore, TripStore};
