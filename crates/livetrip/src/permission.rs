//! Location permission handling.
//!
//! Some platforms grant location access implicitly; others require a
//! one-time interactive consent prompt. A [`PermissionGate`] hides that
//! difference behind a single capability check. A denial is not an error
//! here; callers decide what to do with it.

use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Whether the process may read the device location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Location access is authorized.
    Granted,
    /// Location access was refused.
    Denied,
}

impl Capability {
    /// Check if access is authorized.
    #[must_use]
    pub const fn is_granted(self) -> bool {
        matches!(self, Self::Granted)
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Granted => write!(f, "granted"),
            Self::Denied => write!(f, "denied"),
        }
    }
}

/// Resolves whether location may be read.
#[async_trait::async_trait]
pub trait PermissionGate: Send + Sync {
    /// Resolve the location capability, prompting at most once.
    async fn request(&self) -> Capability;
}

/// Gate for platforms where location access needs no consent.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImplicitPermission;

#[async_trait::async_trait]
impl PermissionGate for ImplicitPermission {
    async fn request(&self) -> Capability {
        Capability::Granted
    }
}

/// The platform's interactive consent dialog.
#[async_trait::async_trait]
pub trait ConsentPrompt: Send + Sync {
    /// Show the prompt and report the user's answer.
    async fn prompt(&self, rationale: &str) -> Capability;
}

/// A prompt with a predetermined answer.
#[derive(Debug, Clone, Copy)]
pub struct FixedPrompt(pub Capability);

#[async_trait::async_trait]
impl ConsentPrompt for FixedPrompt {
    async fn prompt(&self, _rationale: &str) -> Capability {
        self.0
    }
}

/// Gate that asks the user once and remembers the answer for the process.
#[derive(Debug)]
pub struct ConsentPermission<P> {
    prompt: P,
    answer: OnceCell<Capability>,
}

impl<P: ConsentPrompt> ConsentPermission<P> {
    /// Create a gate around `prompt`.
    #[must_use]
    pub fn new(prompt: P) -> Self {
        Self {
            prompt,
            answer: OnceCell::new(),
        }
    }

    /// The cached answer, if the prompt has already run.
    #[must_use]
    pub fn cached(&self) -> Option<Capability> {
        self.answer.get().copied()
    }
}

#[async_trait::async_trait]
impl<P: ConsentPrompt> PermissionGate for ConsentPermission<P> {
    async fn request(&self) -> Capability {
        *self
            .answer
            .get_or_init(|| async {
                let answer = self.prompt.prompt(permission_rationale()).await;
                match answer {
                    Capability::Granted => info!("Location permission granted"),
                    Capability::Denied => warn!("Location permission denied"),
                }
                answer
            })
            .await
    }
}

/// Text shown to the driver when asking for, or missing, location access.
#[must_use]
pub fn permission_rationale() -> &'static str {
    "This app needs access to your location for live tracking. \
     Location permission is required to start a trip."
}
