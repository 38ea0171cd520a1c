//! The live trip session.
//!
//! A [`TripSession`] owns the decision whether a bus is broadcasting. It
//! resolves the bus route, gates the start on location permission, takes an
//! immediate fix, then forwards every fix from a continuous subscription to
//! the trip store until stopped.
//!
//! ```text
//! Idle ──select──▶ AwaitingRoute ──resolved──▶ Ready ──start──▶ Broadcasting
//!                        │                       ▲                  │
//!                        ▼                       └──── Stopping ◀──stop
//!                 Error(route_not_found)
//! ```
//!
//! Fixes arrive on a channel fed by a [`FixSink`]. Each subscription gets a
//! fresh generation; events from an older generation are dropped, so nothing
//! delivered around a cancel can reach the store. When the session falls
//! behind, the channel evicts the oldest events so the newest position is
//! always the one written last.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::fix::{Fix, FixOptions, GeoPoint, WatchOptions};
use crate::location::{
    FixSink, LocationError, LocationEvent, LocationSource, SinkEvent, SubscriptionHandle,
};
use crate::permission::PermissionGate;
use crate::store::{LiveTripUpdate, RouteRecord, StoreError, TripStore};

/// Why a session ended up in [`SessionStatus::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionFault {
    /// The bus or its route does not exist.
    RouteNotFound,
    /// The store could not be read.
    LookupFailed,
}

impl std::fmt::Display for SessionFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RouteNotFound => write!(f, "route_not_found"),
            Self::LookupFailed => write!(f, "lookup_failed"),
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No bus selected.
    Idle,
    /// Looking up the bus and its route.
    AwaitingRoute,
    /// Route known, not broadcasting.
    Ready,
    /// Forwarding fixes to the store.
    Broadcasting,
    /// Tearing down the subscription.
    Stopping,
    /// Route resolution failed; select a bus again.
    Error(SessionFault),
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::AwaitingRoute => write!(f, "awaiting_route"),
            Self::Ready => write!(f, "ready"),
            Self::Broadcasting => write!(f, "broadcasting"),
            Self::Stopping => write!(f, "stopping"),
            Self::Error(fault) => write!(f, "error({fault})"),
        }
    }
}

/// Session tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    /// Options for the one-shot fix at start.
    pub fix_options: FixOptions,
    /// Options for the continuous subscription.
    pub watch_options: WatchOptions,
    /// Bound on every store read and write.
    pub write_timeout: Duration,
    /// Capacity of the fix channel.
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            fix_options: FixOptions::default(),
            watch_options: WatchOptions::default(),
            write_timeout: Duration::from_secs(10),
            event_buffer: 64,
        }
    }
}

/// Buses with a live session in this process.
///
/// Cheap to clone; clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    claimed: Arc<Mutex<HashSet<String>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `bus_id` for one session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BusInUse`] if another session holds it.
    pub fn claim(&self, bus_id: &str) -> Result<BusClaim> {
        let mut claimed = self.claimed.lock().unwrap_or_else(PoisonError::into_inner);
        if !claimed.insert(bus_id.to_string()) {
            return Err(Error::BusInUse {
                bus_id: bus_id.to_string(),
            });
        }
        Ok(BusClaim {
            registry: self.clone(),
            bus_id: bus_id.to_string(),
        })
    }

    /// Check if a session holds `bus_id`.
    #[must_use]
    pub fn is_claimed(&self, bus_id: &str) -> bool {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(bus_id)
    }
}

/// Exclusive claim on a bus. Released on drop.
#[derive(Debug)]
pub struct BusClaim {
    registry: SessionRegistry,
    bus_id: String,
}

impl Drop for BusClaim {
    fn drop(&mut self) {
        self.registry
            .claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.bus_id);
    }
}

/// Collaborators of a session.
#[derive(Clone)]
pub struct SessionDeps {
    /// Where trips are recorded.
    pub store: Arc<dyn TripStore>,
    /// Device positioning.
    pub location: Arc<dyn LocationSource>,
    /// Location permission.
    pub permission: Arc<dyn PermissionGate>,
    /// Per-process bus claims.
    pub registry: SessionRegistry,
}

impl std::fmt::Debug for SessionDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDeps")
            .field("location", &self.location.name())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// What processing one location event did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Applied {
    /// The fix was recorded and a store write issued.
    Forwarded(GeoPoint),
    /// A transient failure was logged.
    TransientError,
    /// The event belonged to a cancelled subscription or arrived outside a broadcast.
    Dropped,
}

/// Counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Fixes accepted while broadcasting, including the initial one.
    pub fixes_received: u64,
    /// Live trip writes issued.
    pub writes_issued: u64,
    /// Live trip writes that failed or timed out.
    pub writes_failed: u64,
    /// Events discarded as stale.
    pub events_dropped: u64,
}

#[derive(Debug, Default)]
struct WriteCounters {
    issued: AtomicU64,
    failed: AtomicU64,
}

/// Run a store call with a deadline.
async fn bounded<T>(
    limit: Duration,
    operation: &'static str,
    call: impl Future<Output = std::result::Result<T, StoreError>>,
) -> std::result::Result<T, StoreError> {
    match timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout { operation }),
    }
}

/// Broadcast session for one driver.
#[derive(Debug)]
pub struct TripSession {
    driver_id: String,
    deps: SessionDeps,
    config: SessionConfig,
    status: SessionStatus,
    bus_id: Option<String>,
    route: Option<RouteRecord>,
    claim: Option<BusClaim>,
    last_fix: Option<Fix>,
    subscription: Option<SubscriptionHandle>,
    generation: u64,
    events_tx: broadcast::Sender<SinkEvent>,
    events_rx: broadcast::Receiver<SinkEvent>,
    writes: JoinSet<()>,
    counters: Arc<WriteCounters>,
    fixes_received: u64,
    events_dropped: u64,
}

impl TripSession {
    /// Create an idle session for `driver_id`.
    #[must_use]
    pub fn new(driver_id: impl Into<String>, deps: SessionDeps, config: SessionConfig) -> Self {
        let (events_tx, events_rx) = broadcast::channel(config.event_buffer.max(1));
        Self {
            driver_id: driver_id.into(),
            deps,
            config,
            status: SessionStatus::Idle,
            bus_id: None,
            route: None,
            claim: None,
            last_fix: None,
            subscription: None,
            generation: 0,
            events_tx,
            events_rx,
            writes: JoinSet::new(),
            counters: Arc::new(WriteCounters::default()),
            fixes_received: 0,
            events_dropped: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Check if fixes are being forwarded.
    #[must_use]
    pub fn is_broadcasting(&self) -> bool {
        self.status == SessionStatus::Broadcasting
    }

    /// The operator this session writes as.
    #[must_use]
    pub fn driver_id(&self) -> &str {
        &self.driver_id
    }

    /// The selected bus.
    #[must_use]
    pub fn bus_id(&self) -> Option<&str> {
        self.bus_id.as_deref()
    }

    /// The resolved route id.
    #[must_use]
    pub fn route_id(&self) -> Option<&str> {
        self.route.as_ref().map(|route| route.id.as_str())
    }

    /// The resolved route.
    #[must_use]
    pub fn route(&self) -> Option<&RouteRecord> {
        self.route.as_ref()
    }

    /// The latest accepted fix, only while broadcasting.
    #[must_use]
    pub fn last_fix(&self) -> Option<&Fix> {
        self.last_fix.as_ref()
    }

    /// Generation of the current (or last) subscription.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Check if a subscription handle is held.
    #[must_use]
    pub fn has_subscription(&self) -> bool {
        self.subscription.is_some()
    }

    /// Session counters.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            fixes_received: self.fixes_received,
            writes_issued: self.counters.issued.load(Ordering::Relaxed),
            writes_failed: self.counters.failed.load(Ordering::Relaxed),
            events_dropped: self.events_dropped,
        }
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.status != status {
            debug!(from = %self.status, to = %status, bus_id = ?self.bus_id, "Session transition");
            self.status = status;
        }
    }

    fn invalid_state(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            operation,
            status: self.status,
        }
    }

    /// Select a bus and resolve its route.
    ///
    /// Returns the route, or `None` for a bus without one; either way the
    /// session is `Ready`. Only valid from `Idle` or `Error`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] from any other state
    /// - [`Error::BusInUse`] if another session owns the bus
    /// - [`Error::BusNotFound`] / [`Error::RouteNotFound`]; the session moves
    ///   to `Error(route_not_found)`
    /// - a store error; the session moves to `Error(lookup_failed)`
    pub async fn select(&mut self, bus_id: impl Into<String>) -> Result<Option<RouteRecord>> {
        if !matches!(self.status, SessionStatus::Idle | SessionStatus::Error(_)) {
            return Err(self.invalid_state("select"));
        }
        let bus_id = bus_id.into();

        self.claim = None;
        self.bus_id = None;
        self.route = None;
        let claim = self.deps.registry.claim(&bus_id)?;
        self.claim = Some(claim);
        self.bus_id = Some(bus_id.clone());
        self.set_status(SessionStatus::AwaitingRoute);

        match self.resolve_route(&bus_id).await {
            Ok(route) => {
                self.route.clone_from(&route);
                self.set_status(SessionStatus::Ready);
                match &route {
                    Some(route) => info!(
                        %bus_id,
                        route_id = %route.id,
                        from = %route.start_point,
                        to = %route.end_point,
                        "Bus ready"
                    ),
                    None => warn!(%bus_id, "Bus has no route assigned"),
                }
                Ok(route)
            }
            Err(e) => {
                let fault = match &e {
                    Error::BusNotFound { .. } | Error::RouteNotFound { .. } => {
                        SessionFault::RouteNotFound
                    }
                    _ => SessionFault::LookupFailed,
                };
                warn!(%bus_id, error = %e, "Route resolution failed");
                self.set_status(SessionStatus::Error(fault));
                Err(e)
            }
        }
    }

    async fn resolve_route(&self, bus_id: &str) -> Result<Option<RouteRecord>> {
        let limit = self.config.write_timeout;
        let bus = bounded(limit, "get_bus", self.deps.store.get_bus(bus_id))
            .await?
            .ok_or_else(|| Error::BusNotFound {
                bus_id: bus_id.to_string(),
            })?;

        let Some(route_id) = bus.route_id.filter(|id| !id.is_empty()) else {
            return Ok(None);
        };

        let route = bounded(limit, "get_route", self.deps.store.get_route(&route_id))
            .await?
            .ok_or(Error::RouteNotFound { route_id })?;
        Ok(Some(route))
    }

    /// Start broadcasting.
    ///
    /// Takes one fix right away and writes it with `isActive=true`, then
    /// subscribes to continuous updates. Returns the initial fix.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] unless `Ready`
    /// - [`Error::RouteUnavailable`] if the bus has no route; no permission
    ///   prompt is shown
    /// - [`Error::PermissionRequired`] if location access is denied
    /// - [`Error::Location`] if the initial fix fails, times out, is stale,
    ///   or the subscription cannot be established
    ///
    /// On every error the session stays `Ready` without a subscription.
    pub async fn start(&mut self) -> Result<Fix> {
        if self.status != SessionStatus::Ready {
            return Err(self.invalid_state("start"));
        }

        let (bus_id, route_id) = match (&self.bus_id, &self.route) {
            (Some(bus_id), Some(route)) => (bus_id.clone(), route.id.clone()),
            (Some(bus_id), None) => {
                return Err(Error::RouteUnavailable {
                    bus_id: bus_id.clone(),
                })
            }
            (None, _) => return Err(self.invalid_state("start")),
        };

        if !self.deps.permission.request().await.is_granted() {
            warn!(%bus_id, "Start refused, location permission required");
            return Err(Error::PermissionRequired);
        }

        let fix = self.initial_fix().await?;

        let update = LiveTripUpdate::broadcast(self.driver_id.clone(), route_id, fix.position);
        self.counters.issued.fetch_add(1, Ordering::Relaxed);
        let limit = self.config.write_timeout;
        if let Err(e) = bounded(
            limit,
            "upsert_live_trip",
            self.deps.store.upsert_live_trip(&bus_id, &update),
        )
        .await
        {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(%bus_id, error = %e, "Initial live trip write failed");
        }
        self.fixes_received += 1;
        self.last_fix = Some(fix);

        self.generation += 1;
        let sink = FixSink::new(self.generation, self.events_tx.clone());
        match self.deps.location.watch(&self.config.watch_options, sink) {
            Ok(handle) => {
                self.subscription = Some(handle);
                self.set_status(SessionStatus::Broadcasting);
                info!(
                    %bus_id,
                    driver_id = %self.driver_id,
                    generation = self.generation,
                    position = %fix.position,
                    "Trip started"
                );
                Ok(fix)
            }
            Err(e) => {
                warn!(%bus_id, error = %e, "Location subscription failed, rolling back start");
                self.generation += 1;
                self.last_fix = None;
                self.persist_inactive(&bus_id).await;
                Err(e.into())
            }
        }
    }

    async fn initial_fix(&self) -> Result<Fix> {
        let options = self.config.fix_options;
        let fix = match timeout(options.timeout, self.deps.location.current_fix(&options)).await
        {
            Ok(result) => result?,
            Err(_) => return Err(LocationError::Timeout(options.timeout).into()),
        };

        if !fix.position.is_valid() {
            return Err(LocationError::InvalidPosition(fix.position).into());
        }
        let age = fix.age();
        if age > options.maximum_age {
            return Err(LocationError::Stale {
                age,
                maximum_age: options.maximum_age,
            }
            .into());
        }
        Ok(fix)
    }

    /// Wait for the next location event and apply it.
    ///
    /// Returns `None` right away when not broadcasting. Cancel-safe.
    pub async fn process_next(&mut self) -> Option<Applied> {
        if self.status != SessionStatus::Broadcasting {
            self.process_pending();
            return None;
        }
        loop {
            match self.events_rx.recv().await {
                Ok(event) => return Some(self.apply(event)),
                Err(RecvError::Lagged(missed)) => self.note_evicted(missed),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Apply every location event already queued.
    pub fn process_pending(&mut self) -> Vec<Applied> {
        let mut applied = Vec::new();
        loop {
            match self.events_rx.try_recv() {
                Ok(event) => applied.push(self.apply(event)),
                Err(TryRecvError::Lagged(missed)) => self.note_evicted(missed),
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        applied
    }

    fn note_evicted(&mut self, missed: u64) {
        self.events_dropped += missed;
        warn!(missed, "Location events arrived faster than processed, oldest evicted");
    }

    /// Throw away every queued event without applying it.
    fn discard_pending(&mut self) {
        loop {
            match self.events_rx.try_recv() {
                Ok(_) => self.events_dropped += 1,
                Err(TryRecvError::Lagged(missed)) => self.events_dropped += missed,
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }

    fn apply(&mut self, event: SinkEvent) -> Applied {
        if self.status != SessionStatus::Broadcasting || event.generation != self.generation {
            self.events_dropped += 1;
            trace!(
                event_generation = event.generation,
                generation = self.generation,
                status = %self.status,
                "Dropping stale location event"
            );
            return Applied::Dropped;
        }

        match event.event {
            LocationEvent::Fix(fix) if fix.position.is_valid() => {
                self.fixes_received += 1;
                self.last_fix = Some(fix);
                self.spawn_write(fix.position);
                Applied::Forwarded(fix.position)
            }
            LocationEvent::Fix(fix) => {
                warn!(position = %fix.position, "Ignoring fix with invalid coordinates");
                Applied::TransientError
            }
            LocationEvent::Error(e) => {
                warn!(code = e.code(), error = %e, "Location error, subscription continues");
                Applied::TransientError
            }
        }
    }

    fn spawn_write(&mut self, position: GeoPoint) {
        let (Some(bus_id), Some(route)) = (self.bus_id.clone(), self.route.as_ref()) else {
            return;
        };
        let update = LiveTripUpdate::broadcast(self.driver_id.clone(), route.id.clone(), position);
        let store = Arc::clone(&self.deps.store);
        let counters = Arc::clone(&self.counters);
        let limit = self.config.write_timeout;

        counters.issued.fetch_add(1, Ordering::Relaxed);
        let Ok(runtime) = Handle::try_current() else {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(%bus_id, "No async runtime, live trip write skipped");
            return;
        };

        self.writes.spawn_on(
            async move {
                match bounded(limit, "upsert_live_trip", store.upsert_live_trip(&bus_id, &update))
                    .await
                {
                    Ok(()) => trace!(%bus_id, %position, "Live trip updated"),
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(%bus_id, error = %e, "Live trip write failed");
                    }
                }
            },
            &runtime,
        );

        while self.writes.try_join_next().is_some() {}
    }

    /// Wait until every issued write has finished.
    pub async fn flush_writes(&mut self) {
        while let Some(result) = self.writes.join_next().await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    warn!(error = %e, "Live trip write task failed");
                }
            }
        }
    }

    /// Cancel the subscription, discard queued events and in-flight writes.
    ///
    /// After this returns no event of the old subscription is applied.
    fn halt_broadcast(&mut self) {
        if let Some(mut handle) = self.subscription.take() {
            self.deps.location.cancel(&mut handle);
        }
        self.generation += 1;
        self.discard_pending();
        self.writes.abort_all();
        self.last_fix = None;
    }

    async fn persist_inactive(&self, bus_id: &str) {
        match bounded(
            self.config.write_timeout,
            "set_trip_inactive",
            self.deps.store.set_trip_inactive(bus_id),
        )
        .await
        {
            Ok(()) => debug!(%bus_id, "Trip marked inactive"),
            Err(e) => warn!(%bus_id, error = %e, "Failed to mark trip inactive"),
        }
    }

    /// Stop broadcasting and mark the trip inactive.
    ///
    /// Does nothing unless broadcasting or `Stopping`. If an earlier stop was
    /// dropped before it finished, calling this again completes it. Always
    /// ends in `Ready`, even if the inactive write fails.
    pub async fn stop(&mut self) {
        match self.status {
            SessionStatus::Broadcasting => {}
            SessionStatus::Stopping => {
                debug!(bus_id = ?self.bus_id, "Resuming interrupted stop");
            }
            _ => {
                debug!(status = %self.status, "Stop ignored, not broadcasting");
                return;
            }
        }
        self.set_status(SessionStatus::Stopping);
        self.halt_broadcast();
        // Let aborted writes settle so none lands after the inactive flag.
        self.flush_writes().await;

        if let Some(bus_id) = self.bus_id.clone() {
            self.persist_inactive(&bus_id).await;
        }
        self.set_status(SessionStatus::Ready);
        info!(bus_id = ?self.bus_id, stats = ?self.stats(), "Trip stopped");
    }

    /// Stop any broadcast, release the bus and return to `Idle`.
    pub async fn sign_out(&mut self) {
        self.stop().await;
        self.halt_broadcast();

        self.bus_id = None;
        self.route = None;
        self.claim = None;
        self.set_status(SessionStatus::Idle);
        debug!(driver_id = %self.driver_id, "Session signed out");
    }
}

impl Drop for TripSession {
    fn drop(&mut self) {
        let broadcasting = matches!(
            self.status,
            SessionStatus::Broadcasting | SessionStatus::Stopping
        );
        if !broadcasting && self.subscription.is_none() {
            return;
        }

        self.halt_broadcast();
        let Some(bus_id) = self.bus_id.take() else {
            return;
        };

        match Handle::try_current() {
            Ok(runtime) => {
                let store = Arc::clone(&self.deps.store);
                let limit = self.config.write_timeout;
                let mut writes = std::mem::take(&mut self.writes);
                runtime.spawn(async move {
                    while writes.join_next().await.is_some() {}
                    match bounded(limit, "set_trip_inactive", store.set_trip_inactive(&bus_id))
                        .await
                    {
                        Ok(()) => debug!(%bus_id, "Trip marked inactive on teardown"),
                        Err(e) => {
                            warn!(%bus_id, error = %e, "Failed to mark trip inactive on teardown");
                        }
                    }
                });
            }
            Err(_) => warn!(%bus_id, "Session dropped outside a runtime, trip left active"),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::permission::{Capability, ConsentPermission, ImplicitPermission};
    use crate::store::{BusRecord, SqliteTripStore};
    use crate::testing::{CountingPrompt, ManualLocationSource, RecordingStore};

    struct Harness {
        store: Arc<RecordingStore>,
        location: Arc<ManualLocationSource>,
        registry: SessionRegistry,
    }

    impl Harness {
        fn new() -> Self {
            let inner = SqliteTripStore::open_in_memory().unwrap();
            inner
                .put_bus(
                    "B12",
                    &BusRecord {
                        model: Some("Volvo 9400".to_string()),
                        route_id: Some("R5".to_string()),
                    },
                )
                .unwrap();
            inner
                .put_bus(
                    "B99",
                    &BusRecord {
                        model: Some("Tata".to_string()),
                        route_id: None,
                    },
                )
                .unwrap();
            inner
                .put_bus(
                    "B404",
                    &BusRecord {
                        model: None,
                        route_id: Some("R404".to_string()),
                    },
                )
                .unwrap();
            inner
                .put_route(&RouteRecord {
                    id: "R5".to_string(),
                    start_point: "Central".to_string(),
                    end_point: "Airport".to_string(),
                })
                .unwrap();

            Self {
                store: Arc::new(RecordingStore::new(inner)),
                location: Arc::new(ManualLocationSource::new(GeoPoint::new(12.97, 77.59))),
                registry: SessionRegistry::new(),
            }
        }

        fn deps(&self, permission: Arc<dyn PermissionGate>) -> SessionDeps {
            SessionDeps {
                store: Arc::clone(&self.store) as Arc<dyn TripStore>,
                location: Arc::clone(&self.location) as Arc<dyn LocationSource>,
                permission,
                registry: self.registry.clone(),
            }
        }

        fn session(&self) -> TripSession {
            self.session_with(Arc::new(ImplicitPermission), SessionConfig::default())
        }

        fn session_with(
            &self,
            permission: Arc<dyn PermissionGate>,
            config: SessionConfig,
        ) -> TripSession {
            TripSession::new("driver-1", self.deps(permission), config)
        }

        async fn broadcasting(&self) -> TripSession {
            let mut session = self.session();
            session.select("B12").await.unwrap();
            session.start().await.unwrap();
            session
        }
    }

    fn denied() -> Arc<dyn PermissionGate> {
        Arc::new(ConsentPermission::new(CountingPrompt::new(Capability::Denied)))
    }

    #[test]
    fn test_status_display() {
        assert_eq!(SessionStatus::Ready.to_string(), "ready");
        assert_eq!(
            SessionStatus::Error(SessionFault::RouteNotFound).to_string(),
            "error(route_not_found)"
        );
    }

    #[test]
    fn test_registry_claim_and_release() {
        let registry = SessionRegistry::new();
        let claim = registry.claim("B12").unwrap();
        assert!(registry.is_claimed("B12"));
        assert!(matches!(
            registry.claim("B12"),
            Err(Error::BusInUse { .. })
        ));

        drop(claim);
        assert!(!registry.is_claimed("B12"));
        assert!(registry.claim("B12").is_ok());
    }

    #[tokio::test]
    async fn test_new_session_is_idle() {
        let harness = Harness::new();
        let session = harness.session();
        assert_eq!(session.status(), SessionStatus::Idle);
        assert_eq!(session.driver_id(), "driver-1");
        assert!(session.bus_id().is_none());
        assert!(!session.has_subscription());
    }

    #[tokio::test]
    async fn test_select_resolves_route() {
        let harness = Harness::new();
        let mut session = harness.session();

        let route = session.select("B12").await.unwrap().unwrap();
        assert_eq!(route.start_point, "Central");
        assert_eq!(route.end_point, "Airport");
        assert_eq!(session.status(), SessionStatus::Ready);
        assert_eq!(session.route_id(), Some("R5"));
        assert_eq!(session.bus_id(), Some("B12"));
    }

    #[tokio::test]
    async fn test_routeless_bus_is_ready_but_cannot_start() {
        let harness = Harness::new();
        let mut session = harness.session();

        assert!(session.select("B99").await.unwrap().is_none());
        assert_eq!(session.status(), SessionStatus::Ready);
        assert!(session.route_id().is_none());

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, Error::RouteUnavailable { .. }));
        assert_eq!(session.status(), SessionStatus::Ready);
        assert_eq!(harness.location.watch_calls(), 0);
        assert_eq!(harness.store.upsert_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_bus_is_route_not_found() {
        let harness = Harness::new();
        let mut session = harness.session();

        let err = session.select("nope").await.unwrap_err();
        assert!(matches!(err, Error::BusNotFound { .. }));
        assert_eq!(
            session.status(),
            SessionStatus::Error(SessionFault::RouteNotFound)
        );
    }

    #[tokio::test]
    async fn test_missing_route_is_route_not_found() {
        let harness = Harness::new();
        let mut session = harness.session();

        let err = session.select("B404").await.unwrap_err();
        assert!(matches!(err, Error::RouteNotFound { .. }));
        assert_eq!(
            session.status(),
            SessionStatus::Error(SessionFault::RouteNotFound)
        );
    }

    #[tokio::test]
    async fn test_store_failure_is_lookup_failed() {
        let harness = Harness::new();
        harness.store.fail_reads(true);
        let mut session = harness.session();

        let err = session.select("B12").await.unwrap_err();
        assert!(matches!(err, Error::Store(_)));
        assert_eq!(
            session.status(),
            SessionStatus::Error(SessionFault::LookupFailed)
        );
    }

    #[tokio::test]
    async fn test_start_blocked_after_error_until_reselected() {
        let harness = Harness::new();
        let mut session = harness.session();
        session.select("B404").await.unwrap_err();

        for _ in 0..3 {
            let err = session.start().await.unwrap_err();
            assert!(matches!(err, Error::InvalidState { .. }));
        }
        assert_eq!(harness.location.watch_calls(), 0);

        session.select("B12").await.unwrap();
        assert!(session.start().await.is_ok());
        assert!(session.is_broadcasting());
    }

    #[tokio::test]
    async fn test_select_rejected_while_ready() {
        let harness = Harness::new();
        let mut session = harness.session();
        session.select("B12").await.unwrap();

        let err = session.select("B99").await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { operation: "select", .. }));
        assert_eq!(session.bus_id(), Some("B12"));
    }

    #[tokio::test]
    async fn test_two_sessions_cannot_share_a_bus() {
        let harness = Harness::new();
        let mut first = harness.session();
        let mut second = harness.session();

        first.select("B12").await.unwrap();
        let err = second.select("B12").await.unwrap_err();
        assert!(matches!(err, Error::BusInUse { .. }));
        assert_eq!(second.status(), SessionStatus::Idle);

        first.sign_out().await;
        assert!(second.select("B12").await.is_ok());
    }

    #[tokio::test]
    async fn test_start_with_denied_permission() {
        let harness = Harness::new();
        let mut session = harness.session_with(denied(), SessionConfig::default());
        session.select("B12").await.unwrap();

        for _ in 0..2 {
            let err = session.start().await.unwrap_err();
            assert!(matches!(err, Error::PermissionRequired));
            assert!(err.is_recoverable());
            assert_eq!(session.status(), SessionStatus::Ready);
            assert!(!session.has_subscription());
        }
        assert_eq!(harness.location.watch_calls(), 0);
        assert_eq!(harness.location.fix_calls(), 0);
        assert_eq!(harness.store.upsert_count(), 0);
    }

    #[tokio::test]
    async fn test_consent_prompt_runs_once_across_starts() {
        let harness = Harness::new();
        let prompt = CountingPrompt::new(Capability::Granted);
        let gate: Arc<dyn PermissionGate> = Arc::new(ConsentPermission::new(prompt.clone()));
        let mut session = harness.session_with(gate, SessionConfig::default());
        session.select("B12").await.unwrap();

        session.start().await.unwrap();
        session.stop().await;
        session.start().await.unwrap();
        session.stop().await;
        assert_eq!(prompt.count(), 1);
    }

    #[tokio::test]
    async fn test_start_before_select_is_invalid() {
        let harness = Harness::new();
        let mut session = harness.session();
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { operation: "start", .. }));
    }

    #[tokio::test]
    async fn test_start_writes_initial_fix() {
        let harness = Harness::new();
        let session = harness.broadcasting().await;

        assert_eq!(session.status(), SessionStatus::Broadcasting);
        assert!(session.has_subscription());
        assert_eq!(
            session.last_fix().map(|f| f.position),
            Some(GeoPoint::new(12.97, 77.59))
        );

        let upserts = harness.store.upserts();
        assert_eq!(upserts.len(), 1);
        let (bus_id, update) = &upserts[0];
        assert_eq!(bus_id, "B12");
        assert_eq!(update.is_active, Some(true));
        assert!(update.server_timestamp);

        let trip = harness.store.get_live_trip("B12").await.unwrap().unwrap();
        assert!(trip.is_active);
        assert_eq!(trip.driver_id.as_deref(), Some("driver-1"));
    }

    #[tokio::test]
    async fn test_three_fix_scenario() {
        let harness = Harness::new();
        let mut session = harness.broadcasting().await;

        assert!(harness.location.push_fix(GeoPoint::new(12.971, 77.591)));
        assert!(harness.location.push_fix(GeoPoint::new(12.972, 77.592)));
        let applied = session.process_pending();
        assert_eq!(
            applied,
            vec![
                Applied::Forwarded(GeoPoint::new(12.971, 77.591)),
                Applied::Forwarded(GeoPoint::new(12.972, 77.592)),
            ]
        );
        session.flush_writes().await;

        let upserts = harness.store.upserts();
        assert_eq!(upserts.len(), 3);
        let positions: Vec<GeoPoint> = upserts
            .iter()
            .map(|(_, update)| update.last_location.unwrap())
            .collect();
        assert_eq!(
            positions,
            vec![
                GeoPoint::new(12.97, 77.59),
                GeoPoint::new(12.971, 77.591),
                GeoPoint::new(12.972, 77.592),
            ]
        );
        for (bus_id, update) in &upserts {
            assert_eq!(bus_id, "B12");
            assert_eq!(update.driver_id.as_deref(), Some("driver-1"));
            assert_eq!(update.route_id.as_deref(), Some("R5"));
            assert_eq!(update.is_active, Some(true));
        }

        let trip = harness.store.get_live_trip("B12").await.unwrap().unwrap();
        assert_eq!(trip.last_location, Some(GeoPoint::new(12.972, 77.592)));
        assert_eq!(session.stats().fixes_received, 3);
        assert_eq!(session.stats().writes_issued, 3);
    }

    #[tokio::test]
    async fn test_triple_constant_across_restarts() {
        let harness = Harness::new();
        let mut session = harness.broadcasting().await;
        harness.location.push_fix(GeoPoint::new(12.971, 77.591));
        session.process_pending();
        session.flush_writes().await;
        session.stop().await;

        session.start().await.unwrap();
        harness.location.push_fix(GeoPoint::new(12.975, 77.595));
        session.process_pending();
        session.flush_writes().await;

        let upserts = harness.store.upserts();
        assert_eq!(upserts.len(), 4);
        assert!(upserts.iter().all(|(bus, update)| bus == "B12"
            && update.driver_id.as_deref() == Some("driver-1")
            && update.route_id.as_deref() == Some("R5")));
    }

    #[tokio::test]
    async fn test_process_next_waits_for_fix() {
        let harness = Harness::new();
        let mut session = harness.broadcasting().await;

        let location = Arc::clone(&harness.location);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            location.push_fix(GeoPoint::new(12.971, 77.591));
        });

        let applied = tokio::time::timeout(Duration::from_secs(2), session.process_next())
            .await
            .unwrap();
        assert_eq!(
            applied,
            Some(Applied::Forwarded(GeoPoint::new(12.971, 77.591)))
        );
    }

    #[tokio::test]
    async fn test_process_next_returns_none_when_not_broadcasting() {
        let harness = Harness::new();
        let mut session = harness.session();
        session.select("B12").await.unwrap();
        assert_eq!(session.process_next().await, None);
    }

    #[tokio::test]
    async fn test_stop_immediately_after_start() {
        let harness = Harness::new();
        let mut session = harness.broadcasting().await;
        let sink = harness.location.latest_sink().unwrap();

        session.stop().await;

        assert_eq!(session.status(), SessionStatus::Ready);
        assert!(!session.has_subscription());
        assert!(session.last_fix().is_none());
        assert!(sink.is_cancelled());
        assert_eq!(harness.store.inactive_calls(), vec!["B12".to_string()]);
        assert_eq!(harness.store.upsert_count(), 1);

        let trip = harness.store.get_live_trip("B12").await.unwrap().unwrap();
        assert!(!trip.is_active);
        assert_eq!(trip.route_id.as_deref(), Some("R5"));
    }

    #[tokio::test]
    async fn test_stop_when_not_broadcasting_is_noop() {
        let harness = Harness::new();
        let mut session = harness.session();

        session.stop().await;
        assert_eq!(session.status(), SessionStatus::Idle);

        session.select("B12").await.unwrap();
        session.stop().await;
        session.stop().await;
        assert_eq!(session.status(), SessionStatus::Ready);
        assert!(harness.store.inactive_calls().is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_stop_is_completed_by_next_stop() {
        let harness = Harness::new();
        let mut session = harness.broadcasting().await;
        harness
            .store
            .set_inactive_delay(Some(Duration::from_millis(300)));

        let interrupted = tokio::time::timeout(Duration::from_millis(50), session.stop()).await;
        assert!(interrupted.is_err());
        assert_eq!(session.status(), SessionStatus::Stopping);
        assert_eq!(harness.location.active_subscriptions(), 0);

        harness.store.set_inactive_delay(None);
        session.stop().await;
        assert_eq!(session.status(), SessionStatus::Ready);
        let trip = harness.store.get_live_trip("B12").await.unwrap().unwrap();
        assert!(!trip.is_active);

        session.start().await.unwrap();
        assert!(session.is_broadcasting());
    }

    #[tokio::test]
    async fn test_sign_out_after_interrupted_stop_marks_inactive() {
        let harness = Harness::new();
        let mut session = harness.broadcasting().await;
        harness
            .store
            .set_inactive_delay(Some(Duration::from_millis(300)));
        let _ = tokio::time::timeout(Duration::from_millis(50), session.stop()).await;
        harness.store.set_inactive_delay(None);

        session.sign_out().await;

        assert_eq!(session.status(), SessionStatus::Idle);
        assert_eq!(harness.store.inactive_calls(), vec!["B12".to_string()]);
        let trip = harness.store.get_live_trip("B12").await.unwrap().unwrap();
        assert!(!trip.is_active);
        assert!(!harness.registry.is_claimed("B12"));
    }

    #[tokio::test]
    async fn test_full_event_buffer_keeps_newest_fix() {
        let harness = Harness::new();
        let config = SessionConfig {
            event_buffer: 2,
            ..SessionConfig::default()
        };
        let mut session = harness.session_with(Arc::new(ImplicitPermission), config);
        session.select("B12").await.unwrap();
        session.start().await.unwrap();

        for point in [
            GeoPoint::new(12.971, 77.591),
            GeoPoint::new(12.972, 77.592),
            GeoPoint::new(12.973, 77.593),
        ] {
            assert!(harness.location.push_fix(point));
        }

        assert_eq!(
            session.process_pending(),
            vec![
                Applied::Forwarded(GeoPoint::new(12.972, 77.592)),
                Applied::Forwarded(GeoPoint::new(12.973, 77.593)),
            ]
        );
        session.flush_writes().await;

        let trip = harness.store.get_live_trip("B12").await.unwrap().unwrap();
        assert_eq!(trip.last_location, Some(GeoPoint::new(12.973, 77.593)));
        assert_eq!(session.stats().events_dropped, 1);
    }

    #[tokio::test]
    async fn test_stop_discards_queued_events() {
        let harness = Harness::new();
        let mut session = harness.broadcasting().await;
        harness.location.push_fix(GeoPoint::new(12.971, 77.591));
        harness.location.push_fix(GeoPoint::new(12.972, 77.592));

        session.stop().await;

        assert!(session.process_pending().is_empty());
        assert_eq!(session.stats().events_dropped, 2);
        assert_eq!(harness.store.upsert_count(), 1);
    }

    #[tokio::test]
    async fn test_routeless_bus_is_refused_before_permission_prompt() {
        let harness = Harness::new();
        let prompt = CountingPrompt::new(Capability::Granted);
        let gate: Arc<dyn PermissionGate> = Arc::new(ConsentPermission::new(prompt.clone()));
        let mut session = harness.session_with(gate, SessionConfig::default());
        session.select("B99").await.unwrap();

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, Error::RouteUnavailable { .. }));
        assert_eq!(prompt.count(), 0);
    }

    #[tokio::test]
    async fn test_stop_completes_when_inactive_write_fails() {
        let harness = Harness::new();
        let mut session = harness.broadcasting().await;
        harness.store.fail_writes(true);

        session.stop().await;
        assert_eq!(session.status(), SessionStatus::Ready);
        assert!(!session.has_subscription());
    }

    #[tokio::test]
    async fn test_at_most_one_subscription() {
        let harness = Harness::new();
        let mut session = harness.session();
        session.select("B12").await.unwrap();

        for round in 0..4 {
            session.start().await.unwrap();
            assert!(harness.location.active_subscriptions() <= 1);
            // A second start while broadcasting is refused.
            assert!(session.start().await.is_err());
            assert_eq!(harness.location.active_subscriptions(), 1, "round {round}");

            session.stop().await;
            assert_eq!(harness.location.active_subscriptions(), 0);
            session.stop().await;
            assert_eq!(harness.location.active_subscriptions(), 0);
        }
        assert_eq!(harness.location.watch_calls(), 4);
    }

    #[tokio::test]
    async fn test_in_flight_event_after_cancel_is_dropped() {
        let harness = Harness::new();
        let mut session = harness.broadcasting().await;
        let old_sink = harness.location.latest_sink().unwrap();

        // Delivered just before the cancel, still queued.
        assert!(old_sink.deliver_fix(Fix::now(GeoPoint::new(1.0, 1.0))));
        session.stop().await;
        // Refused outright once cancelled.
        assert!(!old_sink.deliver_fix(Fix::now(GeoPoint::new(2.0, 2.0))));

        session.start().await.unwrap();
        assert!(session.process_pending().is_empty());
        session.flush_writes().await;

        assert_eq!(harness.store.upsert_count(), 2);
        assert_eq!(session.stats().events_dropped, 1);
        assert!(session.generation() > old_sink.generation());
    }

    #[tokio::test]
    async fn test_transient_location_error_keeps_broadcasting() {
        let harness = Harness::new();
        let mut session = harness.broadcasting().await;

        harness
            .location
            .push_error(LocationError::Unavailable("tunnel".to_string()));
        harness.location.push_fix(GeoPoint::new(12.971, 77.591));

        assert_eq!(
            session.process_pending(),
            vec![
                Applied::TransientError,
                Applied::Forwarded(GeoPoint::new(12.971, 77.591))
            ]
        );
        assert!(session.is_broadcasting());
    }

    #[tokio::test]
    async fn test_invalid_continuous_fix_is_not_written() {
        let harness = Harness::new();
        let mut session = harness.broadcasting().await;

        harness.location.push_fix(GeoPoint::new(120.0, 77.0));
        assert_eq!(session.process_pending(), vec![Applied::TransientError]);
        session.flush_writes().await;
        assert_eq!(harness.store.upsert_count(), 1);
    }

    #[tokio::test]
    async fn test_write_failures_do_not_change_status() {
        let harness = Harness::new();
        let mut session = harness.broadcasting().await;
        harness.store.fail_writes(true);

        harness.location.push_fix(GeoPoint::new(12.971, 77.591));
        harness.location.push_fix(GeoPoint::new(12.972, 77.592));
        session.process_pending();
        session.flush_writes().await;

        assert!(session.is_broadcasting());
        let stats = session.stats();
        assert_eq!(stats.writes_issued, 3);
        assert_eq!(stats.writes_failed, 2);

        harness.store.fail_writes(false);
        harness.location.push_fix(GeoPoint::new(12.973, 77.593));
        session.process_pending();
        session.flush_writes().await;
        let trip = harness.store.get_live_trip("B12").await.unwrap().unwrap();
        assert_eq!(trip.last_location, Some(GeoPoint::new(12.973, 77.593)));
    }

    #[tokio::test]
    async fn test_initial_write_failure_still_starts() {
        let harness = Harness::new();
        harness.store.fail_writes(true);
        let session = harness.broadcasting().await;

        assert!(session.is_broadcasting());
        assert_eq!(session.stats().writes_failed, 1);
    }

    #[tokio::test]
    async fn test_initial_fix_failure_aborts_start() {
        let harness = Harness::new();
        harness.location.set_current(None);
        let mut session = harness.session();
        session.select("B12").await.unwrap();

        let err = session.start().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Location(LocationError::Unavailable(_))
        ));
        assert_eq!(session.status(), SessionStatus::Ready);
        assert_eq!(harness.location.watch_calls(), 0);
        assert_eq!(harness.store.upsert_count(), 0);
    }

    #[tokio::test]
    async fn test_initial_fix_timeout() {
        let harness = Harness::new();
        harness.location.set_delay(Some(Duration::from_secs(60)));
        let config = SessionConfig {
            fix_options: FixOptions {
                timeout: Duration::from_millis(50),
                ..FixOptions::default()
            },
            ..SessionConfig::default()
        };
        let mut session = harness.session_with(Arc::new(ImplicitPermission), config);
        session.select("B12").await.unwrap();

        let started = std::time::Instant::now();
        let err = session.start().await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(err, Error::Location(LocationError::Timeout(_))));
        assert_eq!(err.kind(), crate::error::ErrorKind::LocationTimeout);
        assert_eq!(session.status(), SessionStatus::Ready);
        assert!(!session.has_subscription());
    }

    #[tokio::test]
    async fn test_stale_initial_fix_is_rejected() {
        let harness = Harness::new();
        harness
            .location
            .set_fix_time(Some(Utc::now() - chrono::Duration::seconds(60)));
        let mut session = harness.session();
        session.select("B12").await.unwrap();

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, Error::Location(LocationError::Stale { .. })));
        assert_eq!(harness.location.watch_calls(), 0);
    }

    #[tokio::test]
    async fn test_watch_failure_rolls_back_start() {
        let harness = Harness::new();
        harness.location.fail_watch(true);
        let mut session = harness.session();
        session.select("B12").await.unwrap();

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, Error::Location(_)));
        assert_eq!(session.status(), SessionStatus::Ready);
        assert!(session.last_fix().is_none());

        let trip = harness.store.get_live_trip("B12").await.unwrap().unwrap();
        assert!(!trip.is_active);
    }

    #[tokio::test]
    async fn test_sign_out_while_broadcasting() {
        let harness = Harness::new();
        let mut session = harness.broadcasting().await;

        session.sign_out().await;

        assert_eq!(session.status(), SessionStatus::Idle);
        assert!(session.bus_id().is_none());
        assert!(session.route_id().is_none());
        assert_eq!(harness.location.active_subscriptions(), 0);
        assert_eq!(harness.store.inactive_calls().len(), 1);
        assert!(!harness.registry.is_claimed("B12"));
    }

    #[tokio::test]
    async fn test_sign_out_from_error() {
        let harness = Harness::new();
        let mut session = harness.session();
        session.select("B404").await.unwrap_err();

        session.sign_out().await;
        assert_eq!(session.status(), SessionStatus::Idle);
        assert!(harness.store.inactive_calls().is_empty());
        assert!(!harness.registry.is_claimed("B404"));
    }

    #[tokio::test]
    async fn test_drop_while_broadcasting_cancels_and_marks_inactive() {
        let harness = Harness::new();
        let session = harness.broadcasting().await;
        let sink = harness.location.latest_sink().unwrap();

        drop(session);
        assert!(sink.is_cancelled());
        assert!(!harness.registry.is_claimed("B12"));

        tokio::time::timeout(Duration::from_secs(2), async {
            while harness.store.inactive_calls().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let trip = harness.store.get_live_trip("B12").await.unwrap().unwrap();
        assert!(!trip.is_active);
    }

    #[tokio::test]
    async fn test_drop_when_ready_writes_nothing() {
        let harness = Harness::new();
        let mut session = harness.session();
        session.select("B12").await.unwrap();
        drop(session);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(harness.store.inactive_calls().is_empty());
    }

    #[tokio::test]
    async fn test_session_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.write_timeout, Duration::from_secs(10));
        assert_eq!(config.event_buffer, 64);
        assert_eq!(config.fix_options, FixOptions::default());
        assert_eq!(config.watch_options, WatchOptions::default());
    }
}
