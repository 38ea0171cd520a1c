//! Phone-number sign-in.
//!
//! The identity provider is an external collaborator reached through
//! [`IdentityProvider`]. [`PhoneAuthFlow`] drives the two-step challenge
//! (send code, confirm code), validates input locally before anything goes
//! over the wire, and publishes the signed-in/signed-out state the navigator
//! observes.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::navigator::AuthState;

/// Errors that can occur during sign-in.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The phone number does not have the expected shape.
    #[error("please enter a valid {expected_digits}-digit phone number")]
    InvalidPhoneNumber {
        /// Digits a local number must have.
        expected_digits: usize,
    },

    /// The verification code does not have the expected shape.
    #[error("please enter the {expected_digits}-digit code")]
    InvalidCode {
        /// Digits a code must have.
        expected_digits: usize,
    },

    /// The provider refused to send a code or rejected the code.
    #[error("sign-in challenge failed: {0}")]
    ChallengeFailed(String),

    /// A code was submitted before one was requested.
    #[error("no verification in progress")]
    NoPendingVerification,

    /// The flow already has a signed-in user.
    #[error("already signed in")]
    AlreadySignedIn,

    /// Internal error.
    #[error("internal auth error: {0}")]
    Internal(String),
}

/// Result type for sign-in operations.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Shape of acceptable phone numbers and codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneRules {
    /// Prefix prepended to the local number, e.g. `+91`.
    pub country_code: String,
    /// Digits in a local phone number.
    pub phone_digits: usize,
    /// Digits in a verification code.
    pub code_digits: usize,
}

impl Default for PhoneRules {
    fn default() -> Self {
        Self {
            country_code: "+91".to_string(),
            phone_digits: 10,
            code_digits: 6,
        }
    }
}

/// Exactly `count` ASCII digits.
fn is_digits(input: &str, count: usize) -> bool {
    input.len() == count && input.bytes().all(|b| b.is_ascii_digit())
}

/// A validated phone number in E.164 form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Validate a locally-entered number and prefix the country code.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidPhoneNumber`] unless the trimmed input is
    /// exactly `rules.phone_digits` ASCII digits.
    pub fn parse(input: &str, rules: &PhoneRules) -> Result<Self> {
        let local = input.trim();
        if !is_digits(local, rules.phone_digits) {
            return Err(AuthError::InvalidPhoneNumber {
                expected_digits: rules.phone_digits,
            });
        }
        Ok(Self(format!("{}{local}", rules.country_code)))
    }

    /// The number as an E.164 string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated one-time code.
#[derive(Clone, PartialEq, Eq)]
pub struct OtpCode(String);

impl OtpCode {
    /// Validate a code.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCode`] unless the trimmed input is exactly
    /// `rules.code_digits` ASCII digits.
    pub fn parse(input: &str, rules: &PhoneRules) -> Result<Self> {
        let code = input.trim();
        if !is_digits(code, rules.code_digits) {
            return Err(AuthError::InvalidCode {
                expected_digits: rules.code_digits,
            });
        }
        Ok(Self(code.to_string()))
    }

    /// The code digits.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Codes are secrets; keep them out of logs.
impl std::fmt::Debug for OtpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OtpCode(******)")
    }
}

/// An authenticated operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Opaque identity, used as the driver id.
    pub uid: String,
    /// Number the user signed in with.
    pub phone_number: String,
}

/// A pending challenge returned by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    /// Provider-assigned challenge id.
    pub id: String,
    /// Number the code was sent to.
    pub phone: PhoneNumber,
}

/// A phone-number identity backend.
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Send a one-time code to `phone`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::ChallengeFailed`] if the code cannot be sent.
    async fn send_code(&self, phone: &PhoneNumber) -> Result<Verification>;

    /// Exchange a code for a signed-in user.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::ChallengeFailed`] if the code is rejected.
    async fn confirm(&self, verification: &Verification, code: &OtpCode) -> Result<User>;

    /// End the provider session.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot sign out.
    async fn sign_out(&self) -> Result<()>;
}

/// Where the sign-in flow is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowState {
    /// Waiting for a phone number.
    EnterPhone,
    /// A code was sent; waiting for it.
    AwaitingCode(Verification),
    /// Signed in.
    SignedIn(User),
}

/// The two-step phone sign-in.
#[derive(Debug)]
pub struct PhoneAuthFlow<P> {
    provider: P,
    rules: PhoneRules,
    state: FlowState,
    auth_tx: watch::Sender<AuthState>,
}

impl<P: IdentityProvider> PhoneAuthFlow<P> {
    /// Create a signed-out flow.
    #[must_use]
    pub fn new(provider: P, rules: PhoneRules) -> Self {
        let (auth_tx, _) = watch::channel(AuthState::SignedOut);
        Self {
            provider,
            rules,
            state: FlowState::EnterPhone,
            auth_tx,
        }
    }

    /// Current step.
    #[must_use]
    pub fn state(&self) -> &FlowState {
        &self.state
    }

    /// The signed-in user, if any.
    #[must_use]
    pub fn user(&self) -> Option<&User> {
        match &self.state {
            FlowState::SignedIn(user) => Some(user),
            _ => None,
        }
    }

    /// Observe signed-in/signed-out changes.
    #[must_use]
    pub fn auth_state(&self) -> watch::Receiver<AuthState> {
        self.auth_tx.subscribe()
    }

    /// Validate `input` and ask the provider for a code. Submitting again
    /// while a code is pending resends to the new number.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidPhoneNumber`] without contacting the
    /// provider, or the provider's error. The state is unchanged on error.
    pub async fn submit_phone(&mut self, input: &str) -> Result<&Verification> {
        if matches!(self.state, FlowState::SignedIn(_)) {
            return Err(AuthError::AlreadySignedIn);
        }
        let phone = PhoneNumber::parse(input, &self.rules)?;

        debug!(%phone, "Requesting verification code");
        let verification = self.provider.send_code(&phone).await.map_err(|e| {
            warn!(error = %e, "Failed to send verification code");
            e
        })?;

        self.state = FlowState::AwaitingCode(verification);
        match &self.state {
            FlowState::AwaitingCode(verification) => Ok(verification),
            _ => Err(AuthError::Internal("verification lost".to_string())),
        }
    }

    /// Validate `input` and confirm it with the provider.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::NoPendingVerification`] if no code was requested,
    /// [`AuthError::InvalidCode`] without contacting the provider, or the
    /// provider's error. A rejected code leaves the verification pending so
    /// the user can try again.
    pub async fn submit_code(&mut self, input: &str) -> Result<User> {
        let FlowState::AwaitingCode(verification) = &self.state else {
            return Err(AuthError::NoPendingVerification);
        };
        let code = OtpCode::parse(input, &self.rules)?;

        let user = self
            .provider
            .confirm(verification, &code)
            .await
            .map_err(|e| {
                warn!(error = %e, "Verification code rejected");
                e
            })?;

        info!(uid = %user.uid, "Signed in");
        self.state = FlowState::SignedIn(user.clone());
        self.auth_tx.send_replace(AuthState::SignedIn(user.clone()));
        Ok(user)
    }

    /// Abandon a pending verification and go back to number entry.
    pub fn reset(&mut self) {
        if matches!(self.state, FlowState::AwaitingCode(_)) {
            debug!("Verification abandoned");
            self.state = FlowState::EnterPhone;
        }
    }

    /// Sign out with the provider and return to number entry.
    ///
    /// # Errors
    ///
    /// Returns the provider's error; the local state is reset regardless.
    pub async fn sign_out(&mut self) -> Result<()> {
        let result = self.provider.sign_out().await;
        if let Err(e) = &result {
            warn!(error = %e, "Provider sign-out failed");
        }
        self.state = FlowState::EnterPhone;
        self.auth_tx.send_replace(AuthState::SignedOut);
        info!("Signed out");
        result
    }
}
