//! Offline scoring of recorded sessions.
//!
//! A recording holds the environment answers and the raw interaction stream
//! of one session. Replaying it drives the same recorder and evaluator the
//! live machine uses, without any timers.

use crate::behavior::{BehavioralRecorder, LocalSurface, RawInteraction};
use crate::config::GuardConfig;
use crate::evaluator::{RiskAssessment, RiskLevel, SignalEvaluator, WeightTable};
use crate::fingerprint::{FingerprintCollector, FingerprintSnapshot, StaticProbe};
use crate::report::RiskEvent;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// A recorded session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionRecording {
    pub environment: StaticProbe,
    pub events: Vec<RawInteraction>,
}

/// Replay output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayReport {
    pub score: u8,
    pub level: RiskLevel,
    /// Reasons shown to the user
    pub display_reasons: Vec<String>,
    pub assessment: RiskAssessment,
    pub fingerprint: FingerprintSnapshot,
    pub events_recorded: u64,
}

impl ReplayReport {
    /// The assessment as the machine would report it.
    pub fn event(&self) -> RiskEvent {
        RiskEvent::Assessed {
            score: self.score,
            level: self.level,
            reasons: self
                .assessment
                .reasons()
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Score a recording with the given weights.
pub async fn replay(
    recording: &SessionRecording,
    config: &GuardConfig,
    weights: &WeightTable,
) -> ReplayReport {
    let surface = Arc::new(LocalSurface::new());
    let recorder = BehavioralRecorder::new(surface.clone(), &config.behavioral);
    recorder.start();
    for event in &recording.events {
        surface.dispatch(event.clone());
    }
    recorder.stop();

    let fingerprint = FingerprintCollector::new(&config.fingerprint)
        .collect(&recording.environment)
        .await;
    let assessment = SignalEvaluator::new().evaluate(&fingerprint, &recorder.snapshot(), weights);
    debug!(
        events = recording.events.len(),
        score = assessment.score,
        "Recording replayed"
    );

    ReplayReport {
        score: assessment.score,
        level: RiskLevel::classify(assessment.score, &config.thresholds),
        display_reasons: assessment
            .display_reasons(config.display_reason_limit)
            .into_iter()
            .map(String::from)
            .collect(),
        events_recorded: recorder.recorded(),
        fingerprint,
        assessment,
    }
}
