//! Behavioral signal capture.
//!
//! Interaction events arrive from the host as [`RawInteraction`]s. The
//! recorder derives per-event magnitudes and appends them to bounded
//! per-kind buffers; the evaluator reads a [`BehavioralSnapshot`] copy.

pub mod recorder;

pub use recorder::{BehavioralRecorder, EventSink, InteractionSurface, ListenerId, LocalSurface};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Kinds of interaction signal, one buffer each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    PointerMove,
    Click,
    Scroll,
    KeyPress,
    Visibility,
}

impl SignalKind {
    pub const ALL: [SignalKind; 5] = [
        SignalKind::PointerMove,
        SignalKind::Click,
        SignalKind::Scroll,
        SignalKind::KeyPress,
        SignalKind::Visibility,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::PointerMove => "pointer_move",
            SignalKind::Click => "click",
            SignalKind::Scroll => "scroll",
            SignalKind::KeyPress => "key_press",
            SignalKind::Visibility => "visibility",
        }
    }

    /// Pointer and keyboard input count as user activity for idle tracking.
    pub fn is_activity(&self) -> bool {
        matches!(
            self,
            SignalKind::PointerMove | SignalKind::Click | SignalKind::KeyPress
        )
    }
}

/// Host interaction payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Interaction {
    PointerMove { x: f64, y: f64 },
    Click { x: f64, y: f64 },
    /// Absolute scroll offset after the tick
    Scroll { position: f64 },
    KeyPress,
    Visibility { hidden: bool },
}

impl Interaction {
    pub fn kind(&self) -> SignalKind {
        match self {
            Interaction::PointerMove { .. } => SignalKind::PointerMove,
            Interaction::Click { .. } => SignalKind::Click,
            Interaction::Scroll { .. } => SignalKind::Scroll,
            Interaction::KeyPress => SignalKind::KeyPress,
            Interaction::Visibility { .. } => SignalKind::Visibility,
        }
    }
}

/// An interaction event as delivered by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawInteraction {
    /// Host timestamp in milliseconds
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub interaction: Interaction,
    /// Whether the host vouches the event came from genuine input
    #[serde(default)]
    pub trusted: Option<bool>,
}

impl RawInteraction {
    pub fn new(timestamp_ms: u64, interaction: Interaction) -> Self {
        Self {
            timestamp_ms,
            interaction,
            trusted: Some(true),
        }
    }

    pub fn untrusted(mut self) -> Self {
        self.trusted = Some(false);
        self
    }

    pub fn kind(&self) -> SignalKind {
        self.interaction.kind()
    }
}

/// A recorded event with derived metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub timestamp_ms: u64,
    /// Time since the previous event of the same kind (0 for the first)
    pub delta_ms: u64,
    /// Velocity for pointer and scroll events, interval otherwise
    pub magnitude: f64,
    /// Heading in radians, pointer moves only
    pub angle: Option<f64>,
    pub trusted: Option<bool>,
}

/// Ordered, capped buffer of one signal kind. Oldest events are evicted first.
#[derive(Debug, Clone)]
pub struct BehavioralBuffer {
    events: VecDeque<InteractionEvent>,
    capacity: usize,
}

impl BehavioralBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, event: InteractionEvent) {
        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &InteractionEvent> {
        self.events.iter()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Copy out the newest `limit` events in order.
    pub fn newest(&self, limit: usize) -> Vec<InteractionEvent> {
        let skip = self.events.len().saturating_sub(limit);
        self.events.iter().skip(skip).cloned().collect()
    }
}

/// Stable copy of all buffers handed to the evaluator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BehavioralSnapshot {
    pub events: BTreeMap<SignalKind, Vec<InteractionEvent>>,
    /// Cumulative idle time observed between activity bursts
    pub idle_ms: u64,
}

impl BehavioralSnapshot {
    /// Events of one kind, oldest first.
    pub fn events(&self, kind: SignalKind) -> &[InteractionEvent] {
        self.events.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn count(&self, kind: SignalKind) -> usize {
        self.events(kind).len()
    }

    pub fn total(&self) -> usize {
        self.events.values().map(Vec::len).sum()
    }
}
