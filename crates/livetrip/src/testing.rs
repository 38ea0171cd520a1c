//! Test doubles for the session seams.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::auth::{self, AuthError, IdentityProvider, OtpCode, PhoneNumber, User, Verification};
use crate::fix::{Fix, FixOptions, GeoPoint, WatchOptions};
use crate::location::{FixSink, LocationError, LocationSource, SubscriptionHandle};
use crate::permission::{Capability, ConsentPrompt};
use crate::store::{
    self, BusFeed, BusRecord, LiveTrip, LiveTripUpdate, RouteRecord, SqliteTripStore, StoreError,
    TripStore,
};

/// Consent prompt that counts how often it was shown.
#[derive(Debug, Clone)]
pub struct CountingPrompt {
    answer: Capability,
    shown: Arc<AtomicUsize>,
}

impl CountingPrompt {
    pub fn new(answer: Capability) -> Self {
        Self {
            answer,
            shown: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn count(&self) -> usize {
        self.shown.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ConsentPrompt for CountingPrompt {
    async fn prompt(&self, _rationale: &str) -> Capability {
        self.shown.fetch_add(1, Ordering::SeqCst);
        self.answer
    }
}

/// In-memory SQLite store that records writes and can be told to fail.
#[derive(Debug)]
pub struct RecordingStore {
    inner: SqliteTripStore,
    upserts: Mutex<Vec<(String, LiveTripUpdate)>>,
    inactive: Mutex<Vec<String>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    inactive_delay: Mutex<Option<Duration>>,
}

impl RecordingStore {
    pub fn new(inner: SqliteTripStore) -> Self {
        Self {
            inner,
            upserts: Mutex::new(Vec::new()),
            inactive: Mutex::new(Vec::new()),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            inactive_delay: Mutex::new(None),
        }
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Delay before a set-inactive call is recorded and applied.
    pub fn set_inactive_delay(&self, delay: Option<Duration>) {
        *self.inactive_delay.lock().unwrap() = delay;
    }

    /// Every upsert call, in call order, including failed ones.
    pub fn upserts(&self) -> Vec<(String, LiveTripUpdate)> {
        self.upserts.lock().unwrap().clone()
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts.lock().unwrap().len()
    }

    /// Every set-inactive call, including failed ones.
    pub fn inactive_calls(&self) -> Vec<String> {
        self.inactive.lock().unwrap().clone()
    }

    fn check(flag: &AtomicBool) -> store::Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Internal("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl TripStore for RecordingStore {
    async fn get_bus(&self, bus_id: &str) -> store::Result<Option<BusRecord>> {
        Self::check(&self.fail_reads)?;
        self.inner.get_bus(bus_id).await
    }

    async fn get_route(&self, route_id: &str) -> store::Result<Option<RouteRecord>> {
        Self::check(&self.fail_reads)?;
        self.inner.get_route(route_id).await
    }

    async fn upsert_live_trip(&self, bus_id: &str, update: &LiveTripUpdate) -> store::Result<()> {
        self.upserts
            .lock()
            .unwrap()
            .push((bus_id.to_string(), update.clone()));
        Self::check(&self.fail_writes)?;
        self.inner.upsert_live_trip(bus_id, update).await
    }

    async fn set_trip_inactive(&self, bus_id: &str) -> store::Result<()> {
        let delay = *self.inactive_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inactive.lock().unwrap().push(bus_id.to_string());
        Self::check(&self.fail_writes)?;
        self.inner.set_trip_inactive(bus_id).await
    }

    async fn get_live_trip(&self, bus_id: &str) -> store::Result<Option<LiveTrip>> {
        self.inner.get_live_trip(bus_id).await
    }

    async fn subscribe_buses(&self) -> store::Result<BusFeed> {
        Self::check(&self.fail_reads)?;
        self.inner.subscribe_buses().await
    }
}

#[derive(Debug)]
struct ManualState {
    current: Option<GeoPoint>,
    fix_time: Option<DateTime<Utc>>,
    delay: Option<Duration>,
    fail_watch: bool,
    sinks: Vec<FixSink>,
    fix_calls: usize,
}

/// Location source driven by the test: it hands out sinks and the test
/// pushes fixes into the latest one.
#[derive(Debug)]
pub struct ManualLocationSource {
    state: Mutex<ManualState>,
}

impl ManualLocationSource {
    pub fn new(current: GeoPoint) -> Self {
        Self {
            state: Mutex::new(ManualState {
                current: Some(current),
                fix_time: None,
                delay: None,
                fail_watch: false,
                sinks: Vec::new(),
                fix_calls: 0,
            }),
        }
    }

    /// Position the one-shot fix reports; `None` makes it unavailable.
    pub fn set_current(&self, current: Option<GeoPoint>) {
        self.state.lock().unwrap().current = current;
    }

    /// Timestamp of the one-shot fix; `None` means "now".
    pub fn set_fix_time(&self, time: Option<DateTime<Utc>>) {
        self.state.lock().unwrap().fix_time = time;
    }

    /// Delay before the one-shot fix answers.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().unwrap().delay = delay;
    }

    pub fn fail_watch(&self, fail: bool) {
        self.state.lock().unwrap().fail_watch = fail;
    }

    pub fn latest_sink(&self) -> Option<FixSink> {
        self.state.lock().unwrap().sinks.last().cloned()
    }

    pub fn push_fix(&self, point: GeoPoint) -> bool {
        self.latest_sink()
            .is_some_and(|sink| sink.deliver_fix(Fix::now(point)))
    }

    pub fn push_error(&self, error: LocationError) -> bool {
        self.latest_sink()
            .is_some_and(|sink| sink.deliver_error(error))
    }

    /// Subscriptions handed out and not yet cancelled.
    pub fn active_subscriptions(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .sinks
            .iter()
            .filter(|sink| !sink.is_cancelled())
            .count()
    }

    pub fn watch_calls(&self) -> usize {
        self.state.lock().unwrap().sinks.len()
    }

    pub fn fix_calls(&self) -> usize {
        self.state.lock().unwrap().fix_calls
    }
}

#[async_trait::async_trait]
impl LocationSource for ManualLocationSource {
    fn name(&self) -> &'static str {
        "manual"
    }

    async fn current_fix(&self, _options: &FixOptions) -> Result<Fix, LocationError> {
        let (current, fix_time, delay) = {
            let mut state = self.state.lock().unwrap();
            state.fix_calls += 1;
            (state.current, state.fix_time, state.delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let point =
            current.ok_or_else(|| LocationError::Unavailable("no satellites".to_string()))?;
        Ok(Fix::at(point, fix_time.unwrap_or_else(Utc::now)))
    }

    fn watch(
        &self,
        _options: &WatchOptions,
        sink: FixSink,
    ) -> Result<SubscriptionHandle, LocationError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_watch {
            return Err(LocationError::Unavailable(
                "location services disabled".to_string(),
            ));
        }
        let handle = sink.handle();
        state.sinks.push(sink);
        Ok(handle)
    }
}

/// Identity provider that accepts one fixed code.
#[derive(Debug, Clone)]
pub struct ScriptedIdentityProvider {
    code: String,
    fail_send: Arc<AtomicBool>,
    sent: Arc<AtomicUsize>,
    confirmations: Arc<AtomicUsize>,
}

impl ScriptedIdentityProvider {
    pub fn new(code: &str) -> Self {
        Self {
            code: code.to_string(),
            fail_send: Arc::new(AtomicBool::new(false)),
            sent: Arc::new(AtomicUsize::new(0)),
            confirmations: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn fail_send(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    pub fn codes_sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn confirmations(&self) -> usize {
        self.confirmations.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl IdentityProvider for ScriptedIdentityProvider {
    async fn send_code(&self, phone: &PhoneNumber) -> auth::Result<Verification> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(AuthError::ChallengeFailed("failed to send code".to_string()));
        }
        let n = self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(Verification {
            id: format!("verification-{n}"),
            phone: phone.clone(),
        })
    }

    async fn confirm(&self, verification: &Verification, code: &OtpCode) -> auth::Result<User> {
        self.confirmations.fetch_add(1, Ordering::SeqCst);
        if code.as_str() != self.code {
            return Err(AuthError::ChallengeFailed("invalid code".to_string()));
        }
        Ok(User {
            uid: format!("uid-{}", verification.id),
            phone_number: verification.phone.as_str().to_string(),
        })
    }

    async fn sign_out(&self) -> auth::Result<()> {
        Ok(())
    }
}
