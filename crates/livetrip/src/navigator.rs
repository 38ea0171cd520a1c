//! Screen selection.
//!
//! The navigator decides which screen is active from two inputs: the
//! authentication state and the selected bus. Both travel as an immutable
//! [`Navigation`] value; every change produces a new value.

use serde::{Deserialize, Serialize};

use crate::auth::User;
use crate::store::BusEntry;

/// What the identity provider currently reports.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthState {
    /// The provider has not reported yet.
    #[default]
    Initializing,
    /// Nobody is signed in.
    SignedOut,
    /// An operator is signed in.
    SignedIn(User),
}

/// The screen to show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "screen", rename_all = "snake_case")]
pub enum ActiveScreen {
    /// Waiting for the first auth report.
    Loading,
    /// Phone-number sign-in.
    PhoneAuth,
    /// Bus list with search.
    BusSelection,
    /// Live broadcast for one bus.
    Tracking {
        /// The signed-in operator.
        driver_id: String,
        /// The selected bus.
        bus_id: String,
    },
}

/// Pick the screen for an auth state and bus selection.
#[must_use]
pub fn active_screen(auth: &AuthState, selected_bus: Option<&str>) -> ActiveScreen {
    match (auth, selected_bus) {
        (AuthState::Initializing, _) => ActiveScreen::Loading,
        (AuthState::SignedOut, _) => ActiveScreen::PhoneAuth,
        (AuthState::SignedIn(_), None) => ActiveScreen::BusSelection,
        (AuthState::SignedIn(user), Some(bus_id)) => ActiveScreen::Tracking {
            driver_id: user.uid.clone(),
            bus_id: bus_id.to_string(),
        },
    }
}

/// Navigation inputs as one immutable value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Navigation {
    auth: AuthState,
    selected_bus: Option<String>,
}

impl Navigation {
    /// Start before the provider has reported.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an auth report. Anything but a signed-in user clears the selection.
    #[must_use]
    pub fn with_auth(self, auth: AuthState) -> Self {
        let selected_bus = match auth {
            AuthState::SignedIn(_) => self.selected_bus,
            _ => None,
        };
        Self { auth, selected_bus }
    }

    /// Select a bus. Ignored unless someone is signed in.
    #[must_use]
    pub fn select_bus(self, bus_id: impl Into<String>) -> Self {
        if !matches!(self.auth, AuthState::SignedIn(_)) {
            return self;
        }
        Self {
            selected_bus: Some(bus_id.into()),
            ..self
        }
    }

    /// Leave the tracking screen for the bus list.
    #[must_use]
    pub fn clear_bus(self) -> Self {
        Self {
            selected_bus: None,
            ..self
        }
    }

    /// Sign out, clearing the selection.
    #[must_use]
    pub fn signed_out(self) -> Self {
        self.with_auth(AuthState::SignedOut)
    }

    /// The current auth state.
    #[must_use]
    pub fn auth(&self) -> &AuthState {
        &self.auth
    }

    /// The selected bus, if any.
    #[must_use]
    pub fn selected_bus(&self) -> Option<&str> {
        self.selected_bus.as_deref()
    }

    /// The screen to show.
    #[must_use]
    pub fn screen(&self) -> ActiveScreen {
        active_screen(&self.auth, self.selected_bus())
    }
}

/// Buses whose id contains `query`, ignoring case. An empty query keeps all.
#[must_use]
pub fn filter_buses<'a>(buses: &'a [BusEntry], query: &str) -> Vec<&'a BusEntry> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return buses.iter().collect();
    }
    buses
        .iter()
        .filter(|bus| bus.id.to_lowercase().contains(&needle))
        .collect()
}
