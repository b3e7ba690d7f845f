//! Proof-of-humanity challenges.
//!
//! The broker issues a challenge, hands the host surface a
//! [`ChallengeHandle`] and waits for exactly one resolution: the user's
//! answer, an explicit cancel, or the wall-clock timeout, whichever comes
//! first. Later resolution attempts are no-ops.

use crate::config::{ChallengeConfig, ChallengeKind, Difficulty};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Arithmetic operator shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Add,
    Subtract,
    Multiply,
}

impl Operator {
    pub fn symbol(&self) -> char {
        match self {
            Operator::Add => '+',
            Operator::Subtract => '-',
            Operator::Multiply => '×',
        }
    }

    fn apply(&self, left: i64, right: i64) -> i64 {
        match self {
            Operator::Add => left + right,
            Operator::Subtract => left - right,
            Operator::Multiply => left * right,
        }
    }
}

/// What the user is asked to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChallengeTask {
    Arithmetic {
        left: i64,
        right: i64,
        operator: Operator,
    },
    SustainedHold {
        hold_ms: u64,
    },
}

impl ChallengeTask {
    pub fn kind(&self) -> ChallengeKind {
        match self {
            ChallengeTask::Arithmetic { .. } => ChallengeKind::Arithmetic,
            ChallengeTask::SustainedHold { .. } => ChallengeKind::SustainedHold,
        }
    }

    /// Human-readable prompt.
    pub fn prompt(&self) -> String {
        match self {
            ChallengeTask::Arithmetic {
                left,
                right,
                operator,
            } => format!("What is {} {} {}?", left, operator.symbol(), right),
            ChallengeTask::SustainedHold { hold_ms } => {
                format!("Press and hold for {:.1} seconds", *hold_ms as f64 / 1000.0)
            }
        }
    }

    /// The answer that passes an arithmetic task.
    pub fn expected_answer(&self) -> Option<i64> {
        match self {
            ChallengeTask::Arithmetic {
                left,
                right,
                operator,
            } => Some(operator.apply(*left, *right)),
            ChallengeTask::SustainedHold { .. } => None,
        }
    }
}

/// One challenge instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeSpec {
    pub id: u64,
    pub task: ChallengeTask,
    pub timeout_ms: u64,
}

/// How a challenge ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeOutcome {
    Passed,
    Failed,
    Cancelled,
    TimedOut,
}

impl ChallengeOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, ChallengeOutcome::Passed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeOutcome::Passed => "passed",
            ChallengeOutcome::Failed => "failed",
            ChallengeOutcome::Cancelled => "cancelled",
            ChallengeOutcome::TimedOut => "timed_out",
        }
    }
}

struct HandleInner {
    spec: ChallengeSpec,
    resolver: Mutex<Option<oneshot::Sender<ChallengeOutcome>>>,
    hold_started_at: Mutex<Option<u64>>,
}

/// The host's side of a presented challenge. Cheap to clone.
#[derive(Clone)]
pub struct ChallengeHandle {
    inner: Arc<HandleInner>,
}

impl ChallengeHandle {
    fn new(spec: ChallengeSpec, resolver: oneshot::Sender<ChallengeOutcome>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                spec,
                resolver: Mutex::new(Some(resolver)),
                hold_started_at: Mutex::new(None),
            }),
        }
    }

    pub fn spec(&self) -> &ChallengeSpec {
        &self.inner.spec
    }

    pub fn is_resolved(&self) -> bool {
        lock(&self.inner.resolver).is_none()
    }

    /// Resolve the challenge. Returns false if it was already resolved.
    fn resolve(&self, outcome: ChallengeOutcome) -> bool {
        let Some(sender) = lock(&self.inner.resolver).take() else {
            return false;
        };
        // The broker may have stopped waiting; resolution still counts once.
        let _ = sender.send(outcome);
        debug!(challenge = self.inner.spec.id, outcome = outcome.as_str(), "Challenge resolved");
        true
    }

    /// Submit an arithmetic answer. Exact match passes; anything else fails.
    ///
    /// Returns true if this call resolved the challenge.
    pub fn submit_answer(&self, answer: &str) -> bool {
        let Some(expected) = self.inner.spec.task.expected_answer() else {
            return false;
        };
        let outcome = match answer.trim().parse::<i64>() {
            Ok(value) if value == expected => ChallengeOutcome::Passed,
            _ => ChallengeOutcome::Failed,
        };
        self.resolve(outcome)
    }

    /// The user started holding the affordance.
    pub fn hold_start(&self, at_ms: u64) {
        if self.hold_ms().is_none() || self.is_resolved() {
            return;
        }
        let mut started = lock(&self.inner.hold_started_at);
        if started.is_none() {
            *started = Some(at_ms);
        }
    }

    /// Report hold progress at `at_ms`; passes once the required duration
    /// is reached. Returns progress in `[0, 1]`.
    pub fn hold_tick(&self, at_ms: u64) -> f64 {
        let Some(required) = self.hold_ms() else {
            return 0.0;
        };
        let Some(start) = *lock(&self.inner.hold_started_at) else {
            return 0.0;
        };
        let held = at_ms.saturating_sub(start);
        if held >= required {
            self.resolve(ChallengeOutcome::Passed);
            return 1.0;
        }
        held as f64 / required.max(1) as f64
    }

    /// The user let go. Completes the challenge if held long enough,
    /// otherwise progress resets to zero.
    pub fn hold_release(&self, at_ms: u64) -> bool {
        let Some(required) = self.hold_ms() else {
            return false;
        };
        let Some(start) = lock(&self.inner.hold_started_at).take() else {
            return false;
        };
        if at_ms.saturating_sub(start) >= required {
            self.resolve(ChallengeOutcome::Passed)
        } else {
            false
        }
    }

    /// The user dismissed the challenge.
    pub fn cancel(&self) -> bool {
        self.resolve(ChallengeOutcome::Cancelled)
    }

    fn hold_ms(&self) -> Option<u64> {
        match self.inner.spec.task {
            ChallengeTask::SustainedHold { hold_ms } => Some(hold_ms),
            ChallengeTask::Arithmetic { .. } => None,
        }
    }
}

/// The host UI that renders challenges.
///
/// `render` must return promptly; the host later resolves the challenge
/// through the handle.
pub trait ChallengeSurface: Send + Sync {
    fn render(&self, handle: ChallengeHandle);
}

/// Issues and presents challenges.
pub struct ChallengeBroker {
    config: ChallengeConfig,
    next_id: AtomicU64,
    rng: Mutex<StdRng>,
}

impl ChallengeBroker {
    pub fn new(config: ChallengeConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn with_seed(config: ChallengeConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: ChallengeConfig, rng: StdRng) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
            rng: Mutex::new(rng),
        }
    }

    pub fn config(&self) -> &ChallengeConfig {
        &self.config
    }

    /// Build a new challenge instance. Kinds rotate with the attempt number.
    pub fn issue(&self, attempt: u32) -> ChallengeSpec {
        let kinds = &self.config.kinds;
        let kind = if kinds.is_empty() {
            ChallengeKind::Arithmetic
        } else {
            kinds[attempt as usize % kinds.len()]
        };

        let task = match kind {
            ChallengeKind::Arithmetic => self.arithmetic(self.config.difficulty),
            ChallengeKind::SustainedHold => ChallengeTask::SustainedHold {
                hold_ms: self.config.hold_ms,
            },
        };

        ChallengeSpec {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            task,
            timeout_ms: self.config.timeout_ms,
        }
    }

    fn arithmetic(&self, difficulty: Difficulty) -> ChallengeTask {
        let mut rng = lock(&self.rng);
        let (left, right, operator) = match difficulty {
            Difficulty::Easy => (rng.gen_range(1..=9), rng.gen_range(1..=9), Operator::Add),
            Difficulty::Medium => {
                let operator = if rng.gen_bool(0.5) {
                    Operator::Add
                } else {
                    Operator::Subtract
                };
                let a = rng.gen_range(1..=20);
                let b = rng.gen_range(1..=20);
                // Keep subtraction results non-negative.
                (a.max(b), a.min(b), operator)
            }
            Difficulty::Hard => (
                rng.gen_range(2..=12),
                rng.gen_range(2..=12),
                Operator::Multiply,
            ),
        };
        ChallengeTask::Arithmetic {
            left,
            right,
            operator,
        }
    }

    /// Present a challenge and wait for its outcome.
    pub async fn present_outcome(
        &self,
        surface: &dyn ChallengeSurface,
        spec: ChallengeSpec,
    ) -> ChallengeOutcome {
        let (tx, mut rx) = oneshot::channel();
        let timeout = Duration::from_millis(spec.timeout_ms);
        let id = spec.id;
        let handle = ChallengeHandle::new(spec, tx);

        info!(challenge = id, kind = ?handle.spec().task.kind(), "Presenting challenge");
        surface.render(handle.clone());

        tokio::select! {
            outcome = &mut rx => outcome.unwrap_or(ChallengeOutcome::Cancelled),
            _ = tokio::time::sleep(timeout) => {
                if handle.resolve(ChallengeOutcome::TimedOut) {
                    ChallengeOutcome::TimedOut
                } else {
                    // Resolved in the same instant the timer fired.
                    rx.try_recv().unwrap_or(ChallengeOutcome::Cancelled)
                }
            }
        }
    }

    /// Present a challenge; true only for a verified human response.
    pub async fn present(&self, surface: &dyn ChallengeSurface, spec: ChallengeSpec) -> bool {
        self.present_outcome(surface, spec).await.is_pass()
    }
}

impl Default for ChallengeBroker {
    fn default() -> Self {
        Self::new(ChallengeConfig::default())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Surface that keeps the handle for the test to drive.
    #[derive(Default)]
    struct Recording {
        handles: Mutex<Vec<ChallengeHandle>>,
    }

    impl ChallengeSurface for Recording {
        fn render(&self, handle: ChallengeHandle) {
            self.handles.lock().unwrap().push(handle);
        }
    }

    /// Surface that answers arithmetic immediately.
    struct Solver {
        correct: bool,
    }

    impl ChallengeSurface for Solver {
        fn render(&self, handle: ChallengeHandle) {
            let answer = handle.spec().task.expected_answer().unwrap_or(0);
            let answer = if self.correct { answer } else { answer + 1 };
            handle.submit_answer(&answer.to_string());
        }
    }

    fn arithmetic_only() -> ChallengeConfig {
        ChallengeConfig {
            kinds: vec![ChallengeKind::Arithmetic],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_correct_answer_passes() {
        let broker = ChallengeBroker::with_seed(arithmetic_only(), 1);
        let spec = broker.issue(0);
        assert!(broker.present(&Solver { correct: true }, spec).await);
    }

    #[tokio::test]
    async fn test_wrong_answer_fails() {
        let broker = ChallengeBroker::with_seed(arithmetic_only(), 1);
        let spec = broker.issue(0);
        assert_eq!(
            broker.present_outcome(&Solver { correct: false }, spec).await,
            ChallengeOutcome::Failed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_once() {
        let broker = ChallengeBroker::with_seed(arithmetic_only(), 1);
        let surface = Recording::default();
        let spec = broker.issue(0);
        let answer = spec.task.expected_answer().unwrap();

        let started = tokio::time::Instant::now();
        let outcome = broker.present_outcome(&surface, spec).await;
        assert_eq!(outcome, ChallengeOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(30_000));

        let handle = surface.handles.lock().unwrap()[0].clone();
        assert!(handle.is_resolved());
        assert!(!handle.submit_answer(&answer.to_string()), "late answer is a no-op");
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_interruption_resets() {
        let config = ChallengeConfig {
            kinds: vec![ChallengeKind::SustainedHold],
            hold_ms: 3000,
            ..Default::default()
        };
        let broker = ChallengeBroker::with_seed(config, 1);
        let surface = Arc::new(Recording::default());
        let spec = broker.issue(0);

        let driver = {
            let surface = surface.clone();
            async move {
                tokio::task::yield_now().await;
                let handle = surface.handles.lock().unwrap()[0].clone();
                handle.hold_start(0);
                assert!((handle.hold_tick(2000) - 2.0 / 3.0).abs() < 1e-9);
                assert!(!handle.hold_release(2500));
                // Restarting counts from zero again.
                handle.hold_start(3000);
                assert!(handle.hold_tick(5500) < 1.0);
                assert_eq!(handle.hold_tick(6000), 1.0);
            }
        };

        let (outcome, _) = tokio::join!(broker.present_outcome(surface.as_ref(), spec), driver);
        assert_eq!(outcome, ChallengeOutcome::Passed);
    }

    #[tokio::test]
    async fn test_cancel() {
        struct Dismiss;
        impl ChallengeSurface for Dismiss {
            fn render(&self, handle: ChallengeHandle) {
                assert!(handle.cancel());
                assert!(!handle.cancel());
            }
        }
        let broker = ChallengeBroker::default();
        let spec = broker.issue(0);
        assert!(!broker.present(&Dismiss, spec).await);
    }

    #[test]
    fn test_kinds_rotate() {
        let broker = ChallengeBroker::with_seed(ChallengeConfig::default(), 3);
        assert_eq!(broker.issue(0).task.kind(), ChallengeKind::Arithmetic);
        assert_eq!(broker.issue(1).task.kind(), ChallengeKind::SustainedHold);
        assert_eq!(broker.issue(2).task.kind(), ChallengeKind::Arithmetic);
    }

    #[test]
    fn test_difficulty_tiers() {
        for (difficulty, operators) in [
            (Difficulty::Easy, vec![Operator::Add]),
            (Difficulty::Medium, vec![Operator::Add, Operator::Subtract]),
            (Difficulty::Hard, vec![Operator::Multiply]),
        ] {
            let config = ChallengeConfig {
                kinds: vec![ChallengeKind::Arithmetic],
                difficulty,
                ..Default::default()
            };
            let broker = ChallengeBroker::with_seed(config, 11);
            for attempt in 0..20 {
                match broker.issue(attempt).task {
                    ChallengeTask::Arithmetic {
                        left,
                        right,
                        operator,
                    } => {
                        assert!(operators.contains(&operator));
                        assert!(operator.apply(left, right) >= 0);
                    }
                    other => panic!("unexpected task {other:?}"),
                }
            }
        }
    }

    #[test]
    fn test_prompt_text() {
        let task = ChallengeTask::Arithmetic {
            left: 3,
            right: 4,
            operator: Operator::Add,
        };
        assert_eq!(task.prompt(), "What is 3 + 4?");
        assert_eq!(task.expected_answer(), Some(7));
    }
}
