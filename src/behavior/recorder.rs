//! Behavioral recorder.
//!
//! Registers a single listener on the host's interaction surface and keeps
//! per-kind event logs in a sharded map, so appends for one kind never wait
//! on another. Logs are trimmed to the retention cap by a low-frequency
//! pruning task; snapshots are always capped copies.
//!
//! Idle time between two activity events comes from their timestamps. The
//! gap still open since the last activity is read from the session clock
//! when a snapshot is taken.

use super::{
    BehavioralBuffer, BehavioralSnapshot, Interaction, InteractionEvent, RawInteraction,
    SignalKind,
};
use crate::clock::{Clock, SystemClock};
use crate::config::BehavioralConfig;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Identifier of a listener registered on an [`InteractionSurface`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// The host's interaction surface.
///
/// `attach` must deliver every subsequent interaction to the sink until
/// `detach` is called with the returned id.
pub trait InteractionSurface: Send + Sync {
    fn attach(&self, sink: EventSink) -> ListenerId;
    fn detach(&self, id: ListenerId);
}

/// Minimum time step used for velocity, so same-millisecond events stay finite.
const MIN_STEP_MS: f64 = 1.0;

/// Per-kind derivation state plus the live event log.
#[derive(Debug)]
struct KindLog {
    events: BehavioralBuffer,
    last_timestamp: Option<u64>,
    last_position: Option<(f64, f64)>,
}

impl KindLog {
    fn new(hard_cap: usize) -> Self {
        Self {
            events: BehavioralBuffer::new(hard_cap),
            last_timestamp: None,
            last_position: None,
        }
    }

    fn derive(&mut self, raw: &RawInteraction) -> InteractionEvent {
        let delta_ms = self
            .last_timestamp
            .map(|prev| raw.timestamp_ms.saturating_sub(prev))
            .unwrap_or(0);
        let step = (delta_ms as f64).max(MIN_STEP_MS);
        let first = self.last_timestamp.is_none();
        self.last_timestamp = Some(raw.timestamp_ms);

        let (magnitude, angle) = match raw.interaction {
            Interaction::PointerMove { x, y } => {
                let previous = self.last_position.replace((x, y));
                match previous {
                    Some((px, py)) => {
                        let (dx, dy) = (x - px, y - py);
                        (dx.hypot(dy) / step, Some(dy.atan2(dx)))
                    }
                    None => (0.0, None),
                }
            }
            Interaction::Scroll { position } => {
                let previous = self.last_position.replace((0.0, position));
                match previous {
                    Some((_, prev)) => ((position - prev).abs() / step, None),
                    None => (0.0, None),
                }
            }
            Interaction::Click { .. } | Interaction::KeyPress | Interaction::Visibility { .. } => {
                (if first { 0.0 } else { delta_ms as f64 }, None)
            }
        };

        InteractionEvent {
            timestamp_ms: raw.timestamp_ms,
            delta_ms,
            magnitude,
            angle,
            trusted: raw.trusted,
        }
    }
}

/// Most recent activity event.
#[derive(Debug, Clone, Copy)]
struct LastActivity {
    timestamp_ms: u64,
    /// Clock reading when the event arrived
    seen_at_ms: u64,
}

/// State shared between the recorder and its event sinks.
struct RecorderShared {
    logs: DashMap<SignalKind, KindLog>,
    active: AtomicBool,
    retention_cap: usize,
    idle_quiescence_ms: u64,
    clock: Arc<dyn Clock>,
    last_activity: Mutex<Option<LastActivity>>,
    idle_ms: AtomicU64,
    recorded: AtomicU64,
}

impl RecorderShared {
    fn record(&self, raw: RawInteraction) {
        let kind = raw.kind();

        if kind.is_activity() {
            self.note_activity(raw.timestamp_ms);
        }

        // The live log tolerates twice the cap between prune ticks.
        let hard_cap = self.retention_cap.saturating_mul(2);
        let mut log = self
            .logs
            .entry(kind)
            .or_insert_with(|| KindLog::new(hard_cap));
        let event = log.derive(&raw);
        log.events.push(event);
        self.recorded.fetch_add(1, Ordering::Relaxed);
        trace!(kind = kind.as_str(), ts = raw.timestamp_ms, "Interaction recorded");
    }

    fn note_activity(&self, timestamp_ms: u64) {
        let mut last = lock(&self.last_activity);
        if let Some(prev) = *last {
            let gap = timestamp_ms.saturating_sub(prev.timestamp_ms);
            if gap > self.idle_quiescence_ms {
                self.idle_ms.fetch_add(gap, Ordering::Relaxed);
            }
        }
        *last = Some(LastActivity {
            timestamp_ms,
            seen_at_ms: self.clock.now_ms(),
        });
    }

    /// Closed idle gaps plus the open one, if it already passed quiescence.
    fn idle_now(&self) -> u64 {
        let closed = self.idle_ms.load(Ordering::Relaxed);
        let open = lock(&self.last_activity)
            .map(|last| self.clock.now_ms().saturating_sub(last.seen_at_ms))
            .filter(|gap| *gap > self.idle_quiescence_ms)
            .unwrap_or(0);
        closed.saturating_add(open)
    }

    fn prune(&self) -> usize {
        let mut removed = 0;
        for mut entry in self.logs.iter_mut() {
            let log = entry.value_mut();
            let excess = log.events.len().saturating_sub(self.retention_cap);
            if excess > 0 {
                let kept = log.events.newest(self.retention_cap);
                log.events.clear();
                for event in kept {
                    log.events.push(event);
                }
                removed += excess;
            }
        }
        removed
    }
}

/// Handle given to the host surface; forwards events while the recorder is active.
#[derive(Clone)]
pub struct EventSink {
    shared: Arc<RecorderShared>,
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("active", &self.shared.active.load(Ordering::Relaxed))
            .finish()
    }
}

impl EventSink {
    pub fn emit(&self, raw: RawInteraction) {
        if self.shared.active.load(Ordering::Acquire) {
            self.shared.record(raw);
        }
    }
}

/// Continuous interaction recorder.
pub struct BehavioralRecorder {
    shared: Arc<RecorderShared>,
    surface: Arc<dyn InteractionSurface>,
    listener: Mutex<Option<ListenerId>>,
    pruner: Mutex<Option<JoinHandle<()>>>,
    prune_interval: Duration,
}

impl BehavioralRecorder {
    /// Recorder reading open idle gaps from the system clock.
    pub fn new(surface: Arc<dyn InteractionSurface>, config: &BehavioralConfig) -> Self {
        Self::with_clock(surface, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        surface: Arc<dyn InteractionSurface>,
        config: &BehavioralConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let shared = Arc::new(RecorderShared {
            logs: DashMap::new(),
            active: AtomicBool::new(false),
            retention_cap: config.retention_cap.max(1),
            idle_quiescence_ms: config.idle_quiescence_ms,
            clock,
            last_activity: Mutex::new(None),
            idle_ms: AtomicU64::new(0),
            recorded: AtomicU64::new(0),
        });

        Self {
            shared,
            surface,
            listener: Mutex::new(None),
            pruner: Mutex::new(None),
            prune_interval: Duration::from_millis(config.prune_interval_ms.max(1)),
        }
    }

    /// Start listening. Calling while already active does nothing.
    pub fn start(&self) {
        let mut listener = lock(&self.listener);
        if listener.is_some() {
            return;
        }

        self.shared.active.store(true, Ordering::Release);
        let id = self.surface.attach(EventSink {
            shared: Arc::clone(&self.shared),
        });
        *listener = Some(id);

        // Without a runtime there is no pruning task; snapshots stay capped anyway.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let shared = Arc::clone(&self.shared);
            let period = self.prune_interval;
            let task = handle.spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let removed = shared.prune();
                    if removed > 0 {
                        debug!(removed, "Pruned behavioral buffers");
                    }
                }
            });
            *lock(&self.pruner) = Some(task);
        }

        debug!(listener = id.0, "Behavioral recorder started");
    }

    /// Stop listening and cancel the pruning task. Buffers are kept.
    pub fn stop(&self) {
        if let Some(id) = lock(&self.listener).take() {
            self.shared.active.store(false, Ordering::Release);
            self.surface.detach(id);
            debug!(listener = id.0, "Behavioral recorder stopped");
        }
        if let Some(task) = lock(&self.pruner).take() {
            task.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.listener).is_some()
    }

    /// Capped copy of every buffer.
    pub fn snapshot(&self) -> BehavioralSnapshot {
        let cap = self.shared.retention_cap;
        let events = self
            .shared
            .logs
            .iter()
            .map(|entry| (*entry.key(), entry.value().events.newest(cap)))
            .collect();

        BehavioralSnapshot {
            events,
            idle_ms: self.shared.idle_now(),
        }
    }

    /// Trim live buffers to the retention cap now. Returns events removed.
    pub fn prune(&self) -> usize {
        self.shared.prune()
    }

    /// Number of events recorded since construction or the last reset.
    pub fn recorded(&self) -> u64 {
        self.shared.recorded.load(Ordering::Relaxed)
    }

    /// Clear all buffers and idle tracking. Used at session reset.
    pub fn reset(&self) {
        self.shared.logs.clear();
        *lock(&self.shared.last_activity) = None;
        self.shared.idle_ms.store(0, Ordering::Relaxed);
        self.shared.recorded.store(0, Ordering::Relaxed);
    }
}

impl Drop for BehavioralRecorder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// In-process interaction surface that fans events out to attached sinks.
///
/// Hosts that receive events over a bridge push them through
/// [`LocalSurface::dispatch`].
#[derive(Debug, Default)]
pub struct LocalSurface {
    listeners: DashMap<u64, EventSink>,
    next_id: AtomicU64,
}

impl LocalSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatch(&self, raw: RawInteraction) {
        for listener in self.listeners.iter() {
            listener.value().emit(raw.clone());
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl InteractionSurface for LocalSurface {
    fn attach(&self, sink: EventSink) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.insert(id, sink);
        ListenerId(id)
    }

    fn detach(&self, id: ListenerId) {
        self.listeners.remove(&id.0);
    }
}
