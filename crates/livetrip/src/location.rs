//! Device positioning abstraction.
//!
//! A [`LocationSource`] offers a one-shot fix and a continuous subscription.
//! Continuous reports flow through a [`FixSink`] handed to the source by the
//! caller; the source returns a [`SubscriptionHandle`] whose cancellation is
//! synchronous and idempotent. Every event carries the generation of the
//! subscription that produced it, so a consumer can discard callbacks that
//! race with a cancel.
//!
//! The event channel is a bounded ring: when the consumer falls behind, the
//! oldest queued events are evicted, never the newest position.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::fix::{Fix, FixOptions, GeoPoint, WatchOptions};

/// Errors reported by a location source.
#[derive(Debug, Clone, Error)]
pub enum LocationError {
    /// The platform refused location access.
    #[error("location permission denied")]
    PermissionDenied,

    /// No position could be determined (GPS off, no signal).
    #[error("position unavailable: {0}")]
    Unavailable(String),

    /// The request did not complete in time.
    #[error("location request timed out after {0:?}")]
    Timeout(Duration),

    /// The platform returned a cached fix that is too old.
    #[error("fix is {age:?} old, maximum accepted age is {maximum_age:?}")]
    Stale {
        /// Age of the returned fix.
        age: Duration,
        /// Oldest acceptable age.
        maximum_age: Duration,
    },

    /// The platform returned coordinates outside the valid range.
    #[error("invalid coordinates: {0}")]
    InvalidPosition(GeoPoint),

    /// Internal error.
    #[error("internal location error: {0}")]
    Internal(String),
}

impl LocationError {
    /// Numeric code in the style of the platform geolocation APIs.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::PermissionDenied => 1,
            Self::Unavailable(_) | Self::Stale { .. } | Self::InvalidPosition(_) => 2,
            Self::Timeout(_) => 3,
            Self::Internal(_) => -1,
        }
    }

    /// Whether a subscription keeps running after this error.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Timeout(_) | Self::Stale { .. }
        )
    }
}

/// Something a subscription reports.
#[derive(Debug, Clone)]
pub enum LocationEvent {
    /// A new position.
    Fix(Fix),
    /// A failure that does not end the subscription.
    Error(LocationError),
}

/// A location event tagged with the subscription generation that produced it.
#[derive(Debug, Clone)]
pub struct SinkEvent {
    /// Generation of the originating subscription.
    pub generation: u64,
    /// The event itself.
    pub event: LocationEvent,
}

/// Delivery end of a location subscription.
///
/// Cheap to clone; every clone shares the cancellation flag of the
/// subscription it was created for. Delivery never blocks the caller, so it
/// is safe to call from whatever context the platform uses for callbacks.
/// A full channel evicts its oldest event to make room.
#[derive(Debug, Clone)]
pub struct FixSink {
    generation: u64,
    cancelled: Arc<AtomicBool>,
    tx: broadcast::Sender<SinkEvent>,
}

impl FixSink {
    /// Create a sink for subscription `generation` that forwards into `tx`.
    #[must_use]
    pub fn new(generation: u64, tx: broadcast::Sender<SinkEvent>) -> Self {
        Self {
            generation,
            cancelled: Arc::new(AtomicBool::new(false)),
            tx,
        }
    }

    /// The generation this sink tags its events with.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the subscription was cancelled or its consumer is gone.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.tx.receiver_count() == 0
    }

    /// Deliver a fix. Returns `false` once the subscription is over.
    pub fn deliver_fix(&self, fix: Fix) -> bool {
        self.deliver(LocationEvent::Fix(fix))
    }

    /// Deliver a transient error. Returns `false` once the subscription is over.
    pub fn deliver_error(&self, error: LocationError) -> bool {
        self.deliver(LocationEvent::Error(error))
    }

    fn deliver(&self, event: LocationEvent) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            trace!(generation = self.generation, "Sink cancelled, discarding event");
            return false;
        }

        match self.tx.send(SinkEvent {
            generation: self.generation,
            event,
        }) {
            Ok(_) => true,
            Err(_) => {
                debug!(generation = self.generation, "Location consumer gone");
                false
            }
        }
    }

    /// Create the ownership token for this subscription.
    #[must_use]
    pub fn handle(&self) -> SubscriptionHandle {
        SubscriptionHandle {
            generation: self.generation,
            cancelled: Arc::clone(&self.cancelled),
            task: None,
        }
    }
}

/// Ownership token for an active continuous-location subscription.
///
/// Not cloneable: exactly one owner may cancel it. Dropping the handle
/// cancels the subscription.
#[derive(Debug)]
pub struct SubscriptionHandle {
    generation: u64,
    cancelled: Arc<AtomicBool>,
    task: Option<AbortHandle>,
}

impl SubscriptionHandle {
    /// Tie a background task to this handle; it is aborted on cancellation.
    #[must_use]
    pub fn with_task(mut self, task: AbortHandle) -> Self {
        self.task = Some(task);
        self
    }

    /// Generation of the subscription.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the subscription has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Cancel the subscription. Safe to call more than once.
    ///
    /// Once this returns, the sink refuses further deliveries.
    pub fn cancel(&mut self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            debug!(generation = self.generation, "Location subscription cancelled");
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// A device positioning service.
#[async_trait::async_trait]
pub trait LocationSource: Send + Sync {
    /// The name of this source (for logging/debugging).
    fn name(&self) -> &'static str;

    /// Request a single fix.
    ///
    /// # Errors
    ///
    /// Returns an error if no position can be determined.
    async fn current_fix(&self, options: &FixOptions) -> Result<Fix, LocationError>;

    /// Begin continuous reporting into `sink`.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be established.
    fn watch(
        &self,
        options: &WatchOptions,
        sink: FixSink,
    ) -> Result<SubscriptionHandle, LocationError>;

    /// Release a subscription. Idempotent.
    fn cancel(&self, handle: &mut SubscriptionHandle) {
        handle.cancel();
    }
}

/// Replays a recorded track as if it were a live GPS feed.
///
/// The one-shot fix is the first point of the track; the subscription emits
/// the remaining points one per interval, honouring the distance filter.
#[derive(Debug)]
pub struct ReplayLocationSource {
    track: Arc<[GeoPoint]>,
    pace: Option<Duration>,
    finished: Arc<Notify>,
}

impl ReplayLocationSource {
    /// Create a replay source over `track`.
    #[must_use]
    pub fn new(track: Vec<GeoPoint>) -> Self {
        Self {
            track: track.into(),
            pace: None,
            finished: Arc::new(Notify::new()),
        }
    }

    /// Parse a track from a JSON array of points.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        let track: Vec<GeoPoint> = serde_json::from_str(json)?;
        Ok(Self::new(track))
    }

    /// Load a track from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Emit points at this pace instead of the subscription interval.
    #[must_use]
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    /// Number of points in the track.
    #[must_use]
    pub fn len(&self) -> usize {
        self.track.len()
    }

    /// Check if the track has no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.track.is_empty()
    }

    /// Wait until a subscription has emitted the whole track.
    pub async fn wait_finished(&self) {
        self.finished.notified().await;
    }
}

#[async_trait::async_trait]
impl LocationSource for ReplayLocationSource {
    fn name(&self) -> &'static str {
        "replay"
    }

    async fn current_fix(&self, _options: &FixOptions) -> Result<Fix, LocationError> {
        self.track
            .first()
            .map(|point| Fix::now(*point))
            .ok_or_else(|| LocationError::Unavailable("replay track is empty".to_string()))
    }

    fn watch(
        &self,
        options: &WatchOptions,
        sink: FixSink,
    ) -> Result<SubscriptionHandle, LocationError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| LocationError::Internal(e.to_string()))?;

        let points = Arc::clone(&self.track);
        let finished = Arc::clone(&self.finished);
        let period = self.pace.unwrap_or(options.interval);
        let min_distance = options.distance_filter_m;
        let feed = sink.clone();

        debug!(
            points = points.len(),
            ?period,
            min_distance,
            "Starting track replay"
        );

        let task = runtime.spawn(async move {
            let mut last = points.first().copied();
            for point in points.iter().skip(1) {
                tokio::time::sleep(period).await;
                if feed.is_cancelled() {
                    debug!("Track replay cancelled");
                    return;
                }
                if let Some(prev) = last {
                    if prev.distance_m(point) < min_distance {
                        trace!(%point, "Below distance filter, skipping");
                        continue;
                    }
                }
                if !feed.deliver_fix(Fix::now(*point)) {
                    return;
                }
                last = Some(*point);
            }
            debug!("Track replay finished");
            finished.notify_one();
        });

        Ok(sink.handle().with_task(task.abort_handle()))
    }
}
