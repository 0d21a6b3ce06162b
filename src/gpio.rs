//! GPIO event loop — turns button presses into capture calls.
//!
//! Each configured camera is wired to one input line with an internal
//! pull-up; a press shorts the line to ground, so the falling edge is the
//! trigger. The interrupt callback does exactly one thing: push a raw edge
//! onto an unbounded channel and return, so edges on other lines are never
//! missed. A dispatcher task then runs the two debounce stages and calls
//! `CaptureService::spawn`.
//!
//! The GPIO surface is abstracted behind [`EdgeSource`] so the daemon runs
//! unchanged on development hosts: `RpiEdges` (rppal, `rpi` feature) claims
//! real lines, `MockEdges` accepts injected presses.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::capture::CaptureService;
use crate::error::Result;
use crate::settings::Settings;

/// Software cooldown per source; edges inside it are discarded.
pub const TRIGGER_COOLDOWN: Duration = Duration::from_millis(1000);

/// Trigger-event ring buffer depth per source.
const RECENT_EVENTS_PER_SOURCE: usize = 8;

/// Trigger events older than this are evicted on read.
const RECENT_EVENT_TTL: Duration = Duration::from_secs(60);

// ──────────────── edge sources ────────────────────────────────────────────

/// A raw falling edge, exactly as delivered by the interrupt callback.
#[derive(Debug)]
pub struct RawEdge {
    pub source: String,
    pub pin: u8,
}

/// Hardware abstraction for the input lines. Implementations must deliver
/// `on_edge` from their own context without blocking the caller.
pub trait EdgeSource: Send {
    fn kind(&self) -> &'static str;

    /// Claim `pin` as a pull-up input and invoke `on_edge` on every falling
    /// edge until `release`.
    fn watch(&mut self, pin: u8, on_edge: Box<dyn FnMut() + Send>) -> Result<()>;

    /// Current electrical level (`true` = high = released), if claimed.
    fn level(&self, pin: u8) -> Option<bool>;

    fn release(&mut self);
}

#[cfg(feature = "rpi")]
pub use rpi::RpiEdges;

#[cfg(feature = "rpi")]
mod rpi {
    use super::*;
    use crate::error::StillpostError;
    use rppal::gpio::{Gpio, InputPin, Trigger};

    /// Real Raspberry Pi lines via rppal.
    pub struct RpiEdges {
        gpio: Gpio,
        pins: HashMap<u8, InputPin>,
    }

    impl RpiEdges {
        pub fn new() -> Result<Self> {
            let gpio = Gpio::new().map_err(|e| StillpostError::Gpio(e.to_string()))?;
            Ok(RpiEdges {
                gpio,
                pins: HashMap::new(),
            })
        }
    }

    impl EdgeSource for RpiEdges {
        fn kind(&self) -> &'static str {
            "rppal"
        }

        fn watch(&mut self, pin: u8, mut on_edge: Box<dyn FnMut() + Send>) -> Result<()> {
            let mut input = self
                .gpio
                .get(pin)
                .map_err(|e| StillpostError::Gpio(format!("pin {pin}: {e}")))?
                .into_input_pullup();
            // Clear any stale edge detection left by a previous claim
            // before arming ours.
            let _ = input.clear_async_interrupt();
            input
                .set_async_interrupt(Trigger::FallingEdge, move |_level| on_edge())
                .map_err(|e| StillpostError::Gpio(format!("pin {pin}: {e}")))?;
            self.pins.insert(pin, input);
            Ok(())
        }

        fn level(&self, pin: u8) -> Option<bool> {
            self.pins.get(&pin).map(|p| p.is_high())
        }

        fn release(&mut self) {
            for (_, mut input) in self.pins.drain() {
                let _ = input.clear_async_interrupt();
            }
        }
    }
}

type MockCallbacks = Arc<Mutex<HashMap<u8, Box<dyn FnMut() + Send>>>>;

/// No-hardware edge source for development hosts and tests. Edges are
/// injected through a [`MockHandle`].
#[derive(Default)]
pub struct MockEdges {
    callbacks: MockCallbacks,
    levels: Arc<Mutex<HashMap<u8, bool>>>,
}

impl MockEdges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle {
            callbacks: self.callbacks.clone(),
            levels: self.levels.clone(),
        }
    }
}

impl EdgeSource for MockEdges {
    fn kind(&self) -> &'static str {
        "mock"
    }

    fn watch(&mut self, pin: u8, on_edge: Box<dyn FnMut() + Send>) -> Result<()> {
        self.callbacks.lock().insert(pin, on_edge);
        self.levels.lock().insert(pin, true);
        Ok(())
    }

    fn level(&self, pin: u8) -> Option<bool> {
        self.levels.lock().get(&pin).copied()
    }

    fn release(&mut self) {
        self.callbacks.lock().clear();
        self.levels.lock().clear();
    }
}

#[derive(Clone)]
pub struct MockHandle {
    callbacks: MockCallbacks,
    levels: Arc<Mutex<HashMap<u8, bool>>>,
}

impl MockHandle {
    /// Simulate one press-and-release: drive the line low, fire the falling
    /// edge, release.
    pub fn press(&self, pin: u8) {
        self.levels.lock().insert(pin, false);
        if let Some(cb) = self.callbacks.lock().get_mut(&pin) {
            cb();
        }
        self.levels.lock().insert(pin, true);
    }
}

/// The edge source for this host: real lines when built with `rpi` and the
/// controller is present, mock otherwise.
pub fn default_edge_source() -> Box<dyn EdgeSource> {
    #[cfg(feature = "rpi")]
    {
        match RpiEdges::new() {
            Ok(edges) => return Box::new(edges),
            Err(e) => {
                warn!(error = %e, "GPIO controller unavailable, falling back to mock lines");
            }
        }
    }
    Box::new(MockEdges::new())
}

// ──────────────── debounce ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDecision {
    Accepted,
    /// Inside the contact-bounce window of the previous edge.
    Bounced,
    /// Past the bounce window but inside the per-source cooldown.
    CoolingDown,
}

/// Two debounce stages in series: a short bounce window absorbing contact
/// chatter, then a per-source cooldown discarding rapid re-fires.
#[derive(Debug)]
pub struct Debouncer {
    bounce: Duration,
    cooldown: Duration,
    last_edge: Option<Instant>,
    last_accepted: Option<Instant>,
}

impl Debouncer {
    pub fn new(bounce: Duration, cooldown: Duration) -> Self {
        Debouncer {
            bounce,
            cooldown,
            last_edge: None,
            last_accepted: None,
        }
    }

    /// Bounce window follows the hot `GPIO_BOUNCE_TIME` key.
    fn set_bounce(&mut self, bounce: Duration) {
        self.bounce = bounce;
    }

    pub fn observe(&mut self, now: Instant) -> EdgeDecision {
        if let Some(prev) = self.last_edge {
            if now.duration_since(prev) < self.bounce {
                self.last_edge = Some(now);
                return EdgeDecision::Bounced;
            }
        }
        self.last_edge = Some(now);

        if let Some(prev) = self.last_accepted {
            if now.duration_since(prev) < self.cooldown {
                return EdgeDecision::CoolingDown;
            }
        }
        self.last_accepted = Some(now);
        EdgeDecision::Accepted
    }
}

// ──────────────── trigger state ───────────────────────────────────────────

/// An accepted trigger, kept briefly for the dashboard's polling surface.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerEvent {
    pub seq: u64,
    pub source: String,
    pub pin: u8,
    /// Wall-clock seconds, for display.
    pub at: i64,
    #[serde(skip_serializing)]
    observed: Instant,
}

pub enum EdgeOutcome {
    Accepted(TriggerEvent),
    Bounced,
    CoolingDown,
    /// Passed debounce but the trigger is disarmed (camera disabled or
    /// triggering switched off). Not counted.
    Suppressed,
}

#[derive(Default)]
struct TriggerInner {
    seq: u64,
    counters: HashMap<String, u64>,
    recent: HashMap<String, VecDeque<TriggerEvent>>,
    debouncers: HashMap<String, Debouncer>,
}

/// Debounce state, trigger counters and the per-source event ring buffers,
/// all owned by one short-held lock.
#[derive(Default)]
pub struct TriggerState {
    inner: Mutex<TriggerInner>,
}

impl TriggerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run an edge through both debounce stages; when it is accepted and
    /// `armed`, count it and record a trigger event.
    pub fn observe(
        &self,
        source: &str,
        pin: u8,
        bounce: Duration,
        armed: bool,
        now: Instant,
    ) -> EdgeOutcome {
        let mut inner = self.inner.lock();
        let debouncer = inner
            .debouncers
            .entry(source.to_string())
            .or_insert_with(|| Debouncer::new(bounce, TRIGGER_COOLDOWN));
        debouncer.set_bounce(bounce);
        match debouncer.observe(now) {
            EdgeDecision::Bounced => return EdgeOutcome::Bounced,
            EdgeDecision::CoolingDown => return EdgeOutcome::CoolingDown,
            EdgeDecision::Accepted => {}
        }
        if !armed {
            return EdgeOutcome::Suppressed;
        }

        inner.seq += 1;
        let event = TriggerEvent {
            seq: inner.seq,
            source: source.to_string(),
            pin,
            at: Utc::now().timestamp(),
            observed: now,
        };
        *inner.counters.entry(source.to_string()).or_insert(0) += 1;
        let ring = inner.recent.entry(source.to_string()).or_default();
        ring.push_back(event.clone());
        while ring.len() > RECENT_EVENTS_PER_SOURCE {
            ring.pop_front();
        }
        EdgeOutcome::Accepted(event)
    }

    pub fn counters(&self) -> HashMap<String, u64> {
        self.inner.lock().counters.clone()
    }

    /// All buffered trigger events, oldest first. Aged-out events are
    /// evicted on the way.
    pub fn recent_events(&self) -> Vec<TriggerEvent> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        for ring in inner.recent.values_mut() {
            while ring
                .front()
                .is_some_and(|e| now.duration_since(e.observed) > RECENT_EVENT_TTL)
            {
                ring.pop_front();
            }
        }
        let mut events: Vec<TriggerEvent> = inner
            .recent
            .values()
            .flat_map(|ring| ring.iter().cloned())
            .collect();
        events.sort_by_key(|e| e.seq);
        events
    }
}

// ──────────────── service ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ClaimedLine {
    pub source: String,
    pub pin: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct PinStatus {
    pub source: String,
    pub pin: u8,
    /// Electrical level; `None` when the line is not claimed.
    pub level: Option<bool>,
    pub pressed: Option<bool>,
}

pub struct GpioService {
    settings: Arc<Settings>,
    capture: Arc<CaptureService>,
    pub triggers: Arc<TriggerState>,
    backend: Mutex<Box<dyn EdgeSource>>,
    claimed: Mutex<Vec<ClaimedLine>>,
    status_error: Mutex<Option<String>>,
}

impl GpioService {
    pub fn new(
        settings: Arc<Settings>,
        capture: Arc<CaptureService>,
        backend: Box<dyn EdgeSource>,
    ) -> Arc<Self> {
        Arc::new(GpioService {
            settings,
            capture,
            triggers: Arc::new(TriggerState::new()),
            backend: Mutex::new(backend),
            claimed: Mutex::new(Vec::new()),
            status_error: Mutex::new(None),
        })
    }

    /// Claim the configured lines and spawn the dispatcher. Returns `None`
    /// when GPIO is disabled or no line could be claimed; the rest of the
    /// daemon keeps running either way.
    pub fn start(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let snap = self.settings.current();
        if !snap.gpio.enabled {
            info!("GPIO disabled by configuration");
            return None;
        }

        let (tx, rx) = mpsc::unbounded_channel::<RawEdge>();
        let mut claimed = Vec::new();
        {
            let mut backend = self.backend.lock();
            for cam in &snap.cameras {
                let Some(pin) = cam.gpio_pin else { continue };
                let source = cam.source.clone();
                let tx = tx.clone();
                let edge_source = source.clone();
                let on_edge: Box<dyn FnMut() + Send> = Box::new(move || {
                    // Interrupt context: enqueue and return, nothing else.
                    let _ = tx.send(RawEdge {
                        source: edge_source.clone(),
                        pin,
                    });
                });
                match backend.watch(pin, on_edge) {
                    Ok(()) => {
                        info!(source = %source, pin, backend = backend.kind(), "Trigger line claimed");
                        claimed.push(ClaimedLine { source, pin });
                    }
                    Err(e) => {
                        warn!(source = %source, pin, error = %e, "Failed to claim trigger line");
                    }
                }
            }
        }

        if claimed.is_empty() {
            *self.status_error.lock() = Some("no GPIO lines could be claimed".to_string());
            warn!("GPIO trigger loop disabled: no lines claimed");
            return None;
        }
        *self.claimed.lock() = claimed;

        let service = self.clone();
        Some(tokio::spawn(async move { service.dispatch(rx).await }))
    }

    async fn dispatch(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<RawEdge>) {
        info!("GPIO dispatcher started");
        while let Some(edge) = rx.recv().await {
            self.handle_edge(edge);
        }
        info!("GPIO dispatcher stopped");
    }

    fn handle_edge(&self, edge: RawEdge) {
        let snap = self.settings.current();
        let bounce = Duration::from_millis(snap.gpio.bounce_ms);
        let armed = snap.gpio.trigger_enabled
            && snap
                .camera(&edge.source)
                .map(|cam| cam.enabled)
                .unwrap_or(false);

        match self
            .triggers
            .observe(&edge.source, edge.pin, bounce, armed, Instant::now())
        {
            EdgeOutcome::Accepted(event) => {
                info!(source = %event.source, seq = event.seq, pin = event.pin, "Trigger accepted");
                self.capture.spawn(&edge.source);
            }
            EdgeOutcome::Bounced => {
                debug!(source = %edge.source, "Edge discarded (contact bounce)");
            }
            EdgeOutcome::CoolingDown => {
                debug!(source = %edge.source, "Edge discarded (cooldown)");
            }
            EdgeOutcome::Suppressed => {
                debug!(source = %edge.source, "Edge ignored (trigger disarmed)");
            }
        }
    }

    pub fn claimed(&self) -> Vec<ClaimedLine> {
        self.claimed.lock().clone()
    }

    pub fn error(&self) -> Option<String> {
        self.status_error.lock().clone()
    }

    pub fn pin_levels(&self) -> Vec<PinStatus> {
        let backend = self.backend.lock();
        self.claimed
            .lock()
            .iter()
            .map(|line| {
                let level = backend.level(line.pin);
                PinStatus {
                    source: line.source.clone(),
                    pin: line.pin,
                    level,
                    pressed: level.map(|high| !high),
                }
            })
            .collect()
    }

    /// Cancel detection and release the lines.
    pub fn shutdown(&self) {
        self.backend.lock().release();
        self.claimed.lock().clear();
        info!("GPIO lines released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn debouncer() -> Debouncer {
        Debouncer::new(Duration::from_millis(300), Duration::from_millis(1000))
    }

    #[test]
    fn edge_train_within_bounce_yields_one_accept() {
        let mut deb = debouncer();
        let t0 = Instant::now();
        // Five edges inside 200 ms: contact bounce from one press.
        let mut accepted = 0;
        for i in 0..5u64 {
            if deb.observe(t0 + Duration::from_millis(i * 50)) == EdgeDecision::Accepted {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
    }

    #[test]
    fn cooldown_discards_rapid_refires() {
        let mut deb = debouncer();
        let t0 = Instant::now();
        assert_eq!(deb.observe(t0), EdgeDecision::Accepted);
        // Past the bounce window but inside the cooldown.
        assert_eq!(
            deb.observe(t0 + Duration::from_millis(500)),
            EdgeDecision::CoolingDown
        );
        // Past the cooldown: a genuine second press.
        assert_eq!(
            deb.observe(t0 + Duration::from_millis(1600)),
            EdgeDecision::Accepted
        );
    }

    #[test]
    fn accepted_edges_increment_counter_and_buffer_events() {
        let state = TriggerState::new();
        let bounce = Duration::from_millis(300);
        let t0 = Instant::now();

        assert!(matches!(
            state.observe("r1", 17, bounce, true, t0),
            EdgeOutcome::Accepted(_)
        ));
        assert!(matches!(
            state.observe("r1", 17, bounce, true, t0 + Duration::from_millis(100)),
            EdgeOutcome::Bounced
        ));

        let counters = state.counters();
        assert_eq!(counters.get("r1"), Some(&1));
        let events = state.recent_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, "r1");
        assert_eq!(events[0].seq, 1);
    }

    #[test]
    fn disarmed_edges_are_not_counted() {
        let state = TriggerState::new();
        let bounce = Duration::from_millis(300);

        assert!(matches!(
            state.observe("r2", 27, bounce, false, Instant::now()),
            EdgeOutcome::Suppressed
        ));
        assert!(state.counters().get("r2").is_none());
        assert!(state.recent_events().is_empty());
    }

    #[test]
    fn sources_debounce_independently() {
        let state = TriggerState::new();
        let bounce = Duration::from_millis(300);
        let t0 = Instant::now();

        assert!(matches!(
            state.observe("r1", 17, bounce, true, t0),
            EdgeOutcome::Accepted(_)
        ));
        // A press on another line at the same instant is unaffected.
        assert!(matches!(
            state.observe("r2", 27, bounce, true, t0),
            EdgeOutcome::Accepted(_)
        ));
        assert_eq!(state.counters().len(), 2);
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let state = TriggerState::new();
        let bounce = Duration::from_millis(1);
        let mut t = Instant::now();
        for _ in 0..20 {
            // Space the edges out past the cooldown so each is accepted.
            t += Duration::from_millis(1100);
            state.observe("r1", 17, bounce, true, t);
        }
        assert_eq!(state.counters().get("r1"), Some(&20));
        assert_eq!(state.recent_events().len(), RECENT_EVENTS_PER_SOURCE);
    }

    #[test]
    fn mock_edges_deliver_presses() {
        let mut edges = MockEdges::new();
        let handle = edges.handle();
        let hits = Arc::new(Mutex::new(0u32));
        let hits_cb = hits.clone();
        edges
            .watch(17, Box::new(move || *hits_cb.lock() += 1))
            .expect("watch");

        assert_eq!(edges.level(17), Some(true));
        handle.press(17);
        handle.press(17);
        assert_eq!(*hits.lock(), 2);
        assert_eq!(edges.level(17), Some(true));

        edges.release();
        assert_eq!(edges.level(17), None);
    }
}
