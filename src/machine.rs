//! Session decision state machine.
//!
//! The machine is the only writer of durable session state. Transitions are
//! synchronous methods so they can be driven directly; [`DecisionMachine::run_until`]
//! strings them together with the challenge, collection and re-evaluation
//! timers. Nothing here returns an error: every branch ends in a defined
//! [`Phase`] and a durable-state write.

use crate::behavior::BehavioralRecorder;
use crate::challenge::{ChallengeBroker, ChallengeOutcome};
use crate::config::ThresholdConfig;
use crate::evaluator::{RiskAssessment, RiskLevel, SignalEvaluator};
use crate::fingerprint::{FingerprintCollector, FingerprintSnapshot};
use crate::lockout::BlockScheduler;
use crate::persistence::DurableState;
use crate::report::RiskEvent;
use crate::session::{HostSurfaces, SessionContext};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// What the host should currently show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// A challenge must be passed before the page is usable
    AwaitingChallenge,
    /// Verified and re-scored periodically
    Monitoring,
    /// Locked out until `blocked_until`
    Blocked,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::AwaitingChallenge => "awaiting_challenge",
            Phase::Monitoring => "monitoring",
            Phase::Blocked => "blocked",
        }
    }
}

/// Full machine state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub phase: Phase,
    pub verified: bool,
    pub last_score: u8,
    pub block_count: u32,
    pub blocked_until: Option<u64>,
}

impl SessionState {
    /// Derive the starting state from persisted fields. An elapsed lockout
    /// window is dropped.
    pub fn restore(durable: DurableState, now_ms: u64, thresholds: &ThresholdConfig) -> Self {
        let blocked_until = durable.blocked_until.filter(|until| *until > now_ms);
        let phase = if blocked_until.is_some() {
            Phase::Blocked
        } else if durable.verified && durable.last_score <= thresholds.safe {
            Phase::Monitoring
        } else {
            Phase::AwaitingChallenge
        };

        Self {
            phase,
            verified: durable.verified,
            last_score: durable.last_score,
            block_count: durable.block_count,
            blocked_until,
        }
    }

    pub fn durable(&self) -> DurableState {
        DurableState {
            verified: self.verified,
            last_score: self.last_score,
            block_count: self.block_count,
            blocked_until: self.blocked_until,
        }
    }
}

/// Drives one session.
pub struct DecisionMachine {
    ctx: Arc<SessionContext>,
    host: HostSurfaces,
    state: SessionState,
    scheduler: BlockScheduler,
    broker: ChallengeBroker,
    collector: FingerprintCollector,
    evaluator: SignalEvaluator,
    recorder: BehavioralRecorder,
    fingerprint: Option<FingerprintSnapshot>,
    last_assessment: Option<RiskAssessment>,
    /// Challenges issued since entering the current challenge phase
    attempts: u32,
    collected: bool,
    /// Start of the current run of safe assessments
    clean_since: Option<u64>,
    phase_tx: watch::Sender<Phase>,
}

impl DecisionMachine {
    /// Load durable state and derive the starting phase.
    pub fn new(ctx: Arc<SessionContext>, host: HostSurfaces) -> Self {
        let now = ctx.now_ms();
        let durable = ctx.store.load();
        let expired = durable.blocked_until.is_some_and(|until| until <= now);
        let state = SessionState::restore(durable, now, &ctx.config.thresholds);

        if expired {
            info!(block_count = state.block_count, "Lockout elapsed while away");
            ctx.store.save(&state.durable());
            ctx.reporter.emit(RiskEvent::Unblocked);
        }

        let config = &ctx.config;
        let scheduler = BlockScheduler::new(&config.lockout, Arc::clone(&ctx.clock));
        let broker = ChallengeBroker::new(config.challenge.clone());
        let collector = FingerprintCollector::new(&config.fingerprint);
        let recorder = BehavioralRecorder::with_clock(
            Arc::clone(&host.interactions),
            &config.behavioral,
            Arc::clone(&ctx.clock),
        );
        let (phase_tx, _) = watch::channel(state.phase);

        ctx.registry.init();
        ctx.reporter.emit(RiskEvent::SessionStarted {
            phase: state.phase,
            block_count: state.block_count,
        });
        info!(
            phase = state.phase.as_str(),
            verified = state.verified,
            last_score = state.last_score,
            block_count = state.block_count,
            "Session started"
        );

        Self {
            ctx,
            host,
            state,
            scheduler,
            broker,
            collector,
            evaluator: SignalEvaluator::new(),
            recorder,
            fingerprint: None,
            last_assessment: None,
            attempts: 0,
            collected: false,
            clean_since: None,
            phase_tx,
        }
    }

    /// Replace the challenge broker, e.g. with a seeded one.
    pub fn with_broker(mut self, broker: ChallengeBroker) -> Self {
        self.broker = broker;
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn recorder(&self) -> &BehavioralRecorder {
        &self.recorder
    }

    pub fn fingerprint(&self) -> Option<&FingerprintSnapshot> {
        self.fingerprint.as_ref()
    }

    pub fn last_assessment(&self) -> Option<&RiskAssessment> {
        self.last_assessment.as_ref()
    }

    /// Watch phase changes.
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.state.phase != phase {
            debug!(
                from = self.state.phase.as_str(),
                to = phase.as_str(),
                "Phase transition"
            );
        }
        self.state.phase = phase;
        self.phase_tx.send_replace(phase);
    }

    fn flush(&self) {
        self.ctx.store.save(&self.state.durable());
    }

    /// Apply a challenge outcome. Ignored outside the challenge phase.
    pub fn on_challenge_result(&mut self, outcome: ChallengeOutcome) -> Phase {
        if self.state.phase != Phase::AwaitingChallenge {
            debug!(
                outcome = outcome.as_str(),
                phase = self.state.phase.as_str(),
                "Ignoring challenge result"
            );
            return self.state.phase;
        }

        if outcome.is_pass() {
            self.state.verified = true;
            self.state.last_score = 0;
            self.attempts = 0;
            self.set_phase(Phase::Monitoring);
            self.flush();
            info!("Challenge passed, monitoring session");
        } else {
            info!(
                outcome = outcome.as_str(),
                attempts = self.attempts,
                "Challenge not passed"
            );
        }
        self.state.phase
    }

    /// Apply an assessment. Ignored outside monitoring.
    pub fn apply_assessment(&mut self, assessment: &RiskAssessment) -> Phase {
        if self.state.phase != Phase::Monitoring {
            debug!(
                score = assessment.score,
                phase = self.state.phase.as_str(),
                "Ignoring assessment"
            );
            return self.state.phase;
        }

        let now = self.ctx.now_ms();
        let level = RiskLevel::classify(assessment.score, &self.ctx.config.thresholds);
        let before = self.state.durable();
        self.state.last_score = assessment.score;

        debug!(
            score = assessment.score,
            level = level.as_str(),
            reasons = ?assessment.display_reasons(self.ctx.config.display_reason_limit),
            "Session assessed"
        );
        self.ctx.reporter.emit(RiskEvent::Assessed {
            score: assessment.score,
            level,
            reasons: assessment.reasons().into_iter().map(String::from).collect(),
        });

        match level {
            RiskLevel::Safe => self.track_clean_streak(now),
            RiskLevel::Suspicious | RiskLevel::High => {
                self.clean_since = None;
                self.state.verified = false;
            }
            RiskLevel::Block => self.block(now),
        }

        if self.state.durable() != before {
            self.flush();
        }
        self.last_assessment = Some(assessment.clone());
        self.state.phase
    }

    fn block(&mut self, now: u64) {
        self.clean_since = None;
        self.state.verified = false;
        self.state.block_count = self.state.block_count.saturating_add(1);

        let lockout = self.scheduler.compute_lockout(self.state.block_count, now);
        self.state.blocked_until = Some(lockout.blocked_until);
        self.set_phase(Phase::Blocked);

        warn!(
            score = self.state.last_score,
            block_count = self.state.block_count,
            duration_ms = lockout.duration_ms,
            blocked_until = lockout.blocked_until,
            "Session blocked"
        );
        self.ctx.reporter.emit(RiskEvent::Blocked {
            block_count: self.state.block_count,
            duration_ms: lockout.duration_ms,
            blocked_until: lockout.blocked_until,
        });
    }

    fn track_clean_streak(&mut self, now: u64) {
        let since = *self.clean_since.get_or_insert(now);
        let Some(reset_after) = self.ctx.config.lockout.streak_reset_ms else {
            return;
        };
        if self.state.block_count > 0 && now.saturating_sub(since) >= reset_after {
            let previous_count = self.state.block_count;
            self.state.block_count = 0;
            self.clean_since = Some(now);
            info!(previous_count, "Block streak forgotten after clean monitoring");
            self.ctx.reporter.emit(RiskEvent::StreakReset { previous_count });
        }
    }

    /// Leave the blocked phase if the lockout window has elapsed.
    pub fn check_block(&mut self) -> Phase {
        if self.state.phase != Phase::Blocked {
            return self.state.phase;
        }
        match self.state.blocked_until {
            Some(until) if !self.scheduler.is_expired(until) => {}
            _ => self.unblock(),
        }
        self.state.phase
    }

    fn unblock(&mut self) {
        self.state.blocked_until = None;
        self.attempts = 0;
        self.set_phase(Phase::AwaitingChallenge);
        self.flush();
        info!(block_count = self.state.block_count, "Lockout elapsed");
        self.ctx.reporter.emit(RiskEvent::Unblocked);
    }

    /// Score the session now. Collects the fingerprint first if needed and
    /// folds in the component registry's highest threat.
    pub async fn evaluate(&mut self) -> RiskAssessment {
        let fingerprint = match self.fingerprint.take() {
            Some(fingerprint) => fingerprint,
            None => self.collector.collect(self.host.probe.as_ref()).await,
        };
        let behavior = self.recorder.snapshot();
        let mut assessment = self
            .evaluator
            .evaluate(&fingerprint, &behavior, &self.ctx.weights);
        self.fingerprint = Some(fingerprint);

        let registry = &self.ctx.registry;
        if let Some(detector) = registry.bot_detector() {
            detector.record(assessment.score);
        }
        if let Some((kind, score)) = registry.threat(self.ctx.now_ms()) {
            assessment.raise_to(score, format!("Flagged by {}", kind.as_str()));
        }
        assessment
    }

    /// Evaluate and apply in one step.
    pub async fn reevaluate(&mut self) -> Phase {
        let assessment = self.evaluate().await;
        self.apply_assessment(&assessment)
    }

    /// Drive the session until `shutdown` completes.
    pub async fn run_until<F>(&mut self, shutdown: F) -> SessionState
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = self.step() => {}
            }
        }

        self.recorder.stop();
        self.ctx.registry.destroy();
        debug!(phase = self.state.phase.as_str(), "Session stopped");
        self.state.clone()
    }

    /// Drive the session for the lifetime of the page.
    pub async fn run(&mut self) -> SessionState {
        self.run_until(std::future::pending()).await
    }

    async fn step(&mut self) {
        match self.state.phase {
            Phase::Blocked => self.serve_block().await,
            Phase::AwaitingChallenge => self.serve_challenge().await,
            Phase::Monitoring => self.serve_monitoring().await,
        }
    }

    async fn serve_block(&mut self) {
        if let Some(until) = self.state.blocked_until {
            self.scheduler
                .countdown(until, |remaining_ms| trace!(remaining_ms, "Lockout countdown"))
                .await;
        }
        self.check_block();
    }

    async fn serve_challenge(&mut self) {
        if self.attempts > 0 {
            let delay = self.ctx.config.challenge.reissue_delay_ms;
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let spec = self.broker.issue(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        let id = spec.id;
        self.ctx.reporter.emit(RiskEvent::ChallengeIssued {
            id,
            kind: spec.task.kind(),
        });

        let outcome = self
            .broker
            .present_outcome(self.host.challenges.as_ref(), spec)
            .await;
        self.ctx
            .reporter
            .emit(RiskEvent::ChallengeResolved { id, outcome });
        self.on_challenge_result(outcome);
    }

    async fn serve_monitoring(&mut self) {
        let behavioral = &self.ctx.config.behavioral;
        if !self.collected {
            self.recorder.start();
            let window = tokio::time::sleep(Duration::from_millis(behavioral.collection_window_ms));
            if self.fingerprint.is_none() {
                let (fingerprint, ()) =
                    tokio::join!(self.collector.collect(self.host.probe.as_ref()), window);
                self.fingerprint = Some(fingerprint);
            } else {
                window.await;
            }
            self.collected = true;
        } else {
            let interval = behavioral.reevaluation_interval_ms;
            tokio::time::sleep(Duration::from_millis(interval)).await;
        }
        self.reevaluate().await;
    }
}
