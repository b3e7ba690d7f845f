//! Best-effort event reporting.
//!
//! Sinks may fail; the [`Reporter`] discards every failure so reporting can
//! never influence a decision.

use crate::challenge::ChallengeOutcome;
use crate::config::ChallengeKind;
use crate::error::ReportError;
use crate::evaluator::RiskLevel;
use crate::machine::Phase;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Events emitted by the decision machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RiskEvent {
    SessionStarted {
        phase: Phase,
        block_count: u32,
    },
    ChallengeIssued {
        id: u64,
        kind: ChallengeKind,
    },
    ChallengeResolved {
        id: u64,
        outcome: ChallengeOutcome,
    },
    Assessed {
        score: u8,
        level: RiskLevel,
        reasons: Vec<String>,
    },
    Blocked {
        block_count: u32,
        duration_ms: u64,
        blocked_until: u64,
    },
    Unblocked,
    StreakReset {
        previous_count: u32,
    },
}

impl RiskEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RiskEvent::SessionStarted { .. } => "session_started",
            RiskEvent::ChallengeIssued { .. } => "challenge_issued",
            RiskEvent::ChallengeResolved { .. } => "challenge_resolved",
            RiskEvent::Assessed { .. } => "assessed",
            RiskEvent::Blocked { .. } => "blocked",
            RiskEvent::Unblocked => "unblocked",
            RiskEvent::StreakReset { .. } => "streak_reset",
        }
    }
}

/// Outbound reporting endpoint.
pub trait ReportSink: Send + Sync {
    fn report(&self, event: &RiskEvent) -> Result<(), ReportError>;
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ReportSink for NullSink {
    fn report(&self, _event: &RiskEvent) -> Result<(), ReportError> {
        Ok(())
    }
}

/// Writes events to the log as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn report(&self, event: &RiskEvent) -> Result<(), ReportError> {
        let payload = serde_json::to_string(event)?;
        info!(target: "session_guard::report", event = event.name(), %payload, "Risk event");
        Ok(())
    }
}

/// Forwards events to an async consumer, e.g. an uploader task.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<RiskEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RiskEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ReportSink for ChannelSink {
    fn report(&self, event: &RiskEvent) -> Result<(), ReportError> {
        self.tx
            .send(event.clone())
            .map_err(|_| ReportError::Unavailable)
    }
}

/// Fire-and-forget front for a sink.
#[derive(Clone)]
pub struct Reporter {
    sink: Arc<dyn ReportSink>,
}

impl Reporter {
    pub fn new(sink: Arc<dyn ReportSink>) -> Self {
        Self { sink }
    }

    pub fn emit(&self, event: RiskEvent) {
        if let Err(e) = self.sink.report(&event) {
            debug!(event = event.name(), error = %e, "Report dropped");
        }
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new(Arc::new(NullSink))
    }
}
