//! Error types for livetrip.
//!
//! Each seam has its own error enum ([`LocationError`], [`StoreError`],
//! [`AuthError`]); [`Error`] wraps them and adds the session-level failures a
//! caller has to react to.

use thiserror::Error;

use crate::auth::AuthError;
use crate::location::LocationError;
use crate::session::SessionStatus;
use crate::store::StoreError;

/// The main error type for livetrip operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Session Errors ===
    /// Location permission was denied; the trip cannot start.
    #[error("location permission required")]
    PermissionRequired,

    /// The selected bus has no route assigned.
    #[error("bus {bus_id} has no route assigned")]
    RouteUnavailable {
        /// The selected bus.
        bus_id: String,
    },

    /// The bus record does not exist.
    #[error("bus {bus_id} not found")]
    BusNotFound {
        /// The requested bus.
        bus_id: String,
    },

    /// The route referenced by the bus does not exist.
    #[error("route {route_id} not found")]
    RouteNotFound {
        /// The referenced route.
        route_id: String,
    },

    /// Another session in this process already owns the bus.
    #[error("bus {bus_id} already has an active session")]
    BusInUse {
        /// The contested bus.
        bus_id: String,
    },

    /// The operation is not valid in the current session state.
    #[error("cannot {operation} while {status}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The state the session was in.
        status: SessionStatus,
    },

    // === Seam Errors ===
    /// The location source failed.
    #[error(transparent)]
    Location(#[from] LocationError),

    /// The trip store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Sign-in failed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized Result type for livetrip operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

/// Broad class of a failure, used to decide how it is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Location access refused. The user may grant it and retry.
    PermissionDenied,
    /// The bus has no usable route. Re-select a bus.
    RouteNotFound,
    /// The bus does not exist. Re-select a bus.
    BusNotFound,
    /// The one-shot fix did not arrive in time. Retry start.
    LocationTimeout,
    /// Positioning hiccup. Logged, never shown.
    TransientLocation,
    /// A store read or write failed.
    PersistenceWrite,
    /// Sign-in challenge failed. Resubmit phone number or code.
    AuthChallenge,
    /// The caller did something out of order or misconfigured.
    Usage,
    /// Bug or unrecoverable environment failure.
    Internal,
}

impl Error {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionRequired => ErrorKind::PermissionDenied,
            Self::RouteUnavailable { .. } | Self::RouteNotFound { .. } => ErrorKind::RouteNotFound,
            Self::BusNotFound { .. } => ErrorKind::BusNotFound,
            Self::BusInUse { .. }
            | Self::InvalidState { .. }
            | Self::ConfigLoad(_)
            | Self::ConfigValidation { .. } => ErrorKind::Usage,
            Self::Location(e) => match e {
                LocationError::PermissionDenied => ErrorKind::PermissionDenied,
                LocationError::Timeout(_) => ErrorKind::LocationTimeout,
                LocationError::Internal(_) => ErrorKind::Internal,
                LocationError::Unavailable(_)
                | LocationError::Stale { .. }
                | LocationError::InvalidPosition(_) => ErrorKind::TransientLocation,
            },
            Self::Store(e) => match e {
                StoreError::Internal(_) | StoreError::Migration { .. } => ErrorKind::Internal,
                _ => ErrorKind::PersistenceWrite,
            },
            Self::Auth(e) => match e {
                AuthError::Internal(_) => ErrorKind::Internal,
                _ => ErrorKind::AuthChallenge,
            },
            Self::Io(_) | Self::Json(_) => ErrorKind::Internal,
        }
    }

    /// Check if the user can recover from this error by retrying or re-selecting.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.kind() != ErrorKind::Internal
    }

    /// Check if this error is a permission issue.
    #[must_use]
    pub fn is_permission_error(&self) -> bool {
        self.kind() == ErrorKind::PermissionDenied
    }
}
