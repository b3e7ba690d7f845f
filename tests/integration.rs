//! Integration tests for the Zentinel Session Guard.
//!
//! These tests drive the public API end to end: configuration loading,
//! behavioral recording, scoring, challenges, lockouts and the decision
//! machine over durable storage.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use zentinel_session_guard::behavior::{
    BehavioralRecorder, BehavioralSnapshot, Interaction, LocalSurface, RawInteraction, SignalKind,
};
use zentinel_session_guard::challenge::{
    ChallengeBroker, ChallengeHandle, ChallengeOutcome, ChallengeSurface,
};
use zentinel_session_guard::clock::{Clock, ManualClock};
use zentinel_session_guard::config::{
    BehavioralConfig, ChallengeConfig, ChallengeKind, LockoutConfig, ThresholdConfig,
};
use zentinel_session_guard::evaluator::{limits, Signal};
use zentinel_session_guard::fingerprint::{FingerprintCollector, FingerprintSnapshot, StaticProbe};
use zentinel_session_guard::lockout::BlockScheduler;
use zentinel_session_guard::persistence::{FileStore, KeyValueStore, MemoryStore};
use zentinel_session_guard::replay::{replay, SessionRecording};
use zentinel_session_guard::report::{ChannelSink, RiskEvent};
use zentinel_session_guard::{
    DecisionMachine, GuardConfig, HostSurfaces, Phase, RiskLevel, SessionContext,
    SignalEvaluator, WeightTable,
};

const NOW: u64 = 1_700_000_000_000;

// =============================================================================
// Fixtures
// =============================================================================

/// Curved pointer path with uneven speed.
fn human_pointer(start_ms: u64) -> Vec<RawInteraction> {
    (0..20u64)
        .map(|i| {
            let f = i as f64;
            RawInteraction::new(
                start_ms + i * 16,
                Interaction::PointerMove {
                    x: 10.0 * f + 6.0 * (f * 0.9).sin(),
                    y: 5.0 * f + 8.0 * (f * 1.3).cos(),
                },
            )
        })
        .collect()
}

/// Scripted input: straight lines, metronome clicks and keys, constant scroll.
fn robot_events() -> Vec<RawInteraction> {
    let mut events = Vec::new();
    for i in 0..20u64 {
        events.push(RawInteraction::new(
            i * 10,
            Interaction::PointerMove {
                x: i as f64 * 10.0,
                y: i as f64 * 5.0,
            },
        ));
    }
    for i in 0..6u64 {
        events.push(RawInteraction::new(
            1000 + i * 100,
            Interaction::Click { x: 50.0, y: 50.0 },
        ));
    }
    for i in 0..10u64 {
        events.push(RawInteraction::new(2000 + i * 20, Interaction::KeyPress));
    }
    for i in 0..8u64 {
        events.push(RawInteraction::new(
            3000 + i * 50,
            Interaction::Scroll {
                position: i as f64 * 100.0,
            },
        ));
    }
    events
}

fn record(events: &[RawInteraction], config: &BehavioralConfig) -> BehavioralSnapshot {
    let surface = Arc::new(LocalSurface::new());
    let recorder = BehavioralRecorder::new(surface.clone(), config);
    recorder.start();
    for event in events {
        surface.dispatch(event.clone());
    }
    recorder.snapshot()
}

fn anomalous_fingerprint() -> FingerprintSnapshot {
    FingerprintSnapshot {
        webdriver: true,
        automation_user_agent: true,
        gpu_anomaly: true,
        screen_mismatch: true,
        audio_context: false,
        font_count: 1,
        ..Default::default()
    }
}

fn bump(weights: &WeightTable, field: usize, by: f64) -> WeightTable {
    let mut w = weights.clone();
    match field {
        0 => w.webdriver += by,
        1 => w.automation_ua += by,
        2 => w.webgl_anomaly += by,
        3 => w.mouse_jitter += by,
        4 => w.click_interval += by,
        5 => w.scroll_linearity += by,
        6 => w.keyboard_speed += by,
        7 => w.focus_frequency += by,
        8 => w.screen_mismatch += by,
        9 => w.audio_context += by,
        10 => w.fonts += by,
        _ => w.touch_support += by,
    }
    w
}

/// Answers every challenge correctly as soon as it is shown.
struct Solver;

impl ChallengeSurface for Solver {
    fn render(&self, handle: ChallengeHandle) {
        match handle.spec().task.expected_answer() {
            Some(answer) => {
                handle.submit_answer(&answer.to_string());
            }
            None => {
                handle.hold_start(0);
                handle.hold_release(u64::MAX);
            }
        }
    }
}

/// Keeps challenges open for the test to resolve.
#[derive(Default)]
struct Pending {
    handles: Mutex<Vec<ChallengeHandle>>,
}

impl ChallengeSurface for Pending {
    fn render(&self, handle: ChallengeHandle) {
        self.handles.lock().unwrap().push(handle);
    }
}

fn context(
    config: GuardConfig,
    clock: Arc<ManualClock>,
    store: Arc<dyn KeyValueStore>,
) -> Arc<SessionContext> {
    Arc::new(
        SessionContext::builder(config)
            .clock(clock)
            .store(store)
            .weights(WeightTable::default())
            .build()
            .unwrap(),
    )
}

fn host(challenges: Arc<dyn ChallengeSurface>) -> HostSurfaces {
    HostSurfaces {
        probe: Arc::new(StaticProbe::desktop()),
        interactions: Arc::new(LocalSurface::new()),
        challenges,
    }
}

// =============================================================================
// Configuration Tests
// =============================================================================

#[test]
fn test_default_config_is_valid() {
    let config = GuardConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.thresholds.safe, 30);
    assert_eq!(config.thresholds.block, 65);
    assert_eq!(config.challenge.timeout_ms, 30_000);
    assert_eq!(config.display_reason_limit, 3);
}

#[test]
fn test_config_from_yaml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("guard.yaml");
    std::fs::write(
        &path,
        r#"
thresholds:
  safe: 20
  suspicious: 50
  block: 70
lockout:
  base_ms: 60000
challenge:
  kinds: [sustained_hold]
  difficulty: hard
weights:
  webdriver: 60
"#,
    )
    .unwrap();

    let config = GuardConfig::from_path(&path).unwrap();
    assert_eq!(config.thresholds.block, 70);
    assert_eq!(config.lockout.base_ms, 60_000);
    assert_eq!(config.challenge.kinds, vec![ChallengeKind::SustainedHold]);
    assert_eq!(config.weights.webdriver, 60.0);
    // Unspecified fields keep their defaults.
    assert_eq!(config.weights.automation_ua, 40.0);
    assert_eq!(config.behavioral.retention_cap, 200);
}

#[test]
fn test_config_from_json_file_rejects_bad_thresholds() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("guard.json");
    std::fs::write(&path, r#"{"thresholds": {"safe": 70, "suspicious": 50, "block": 60}}"#)
        .unwrap();
    assert!(GuardConfig::from_path(&path).is_err());
}

// =============================================================================
// Scoring Property Tests
// =============================================================================

#[test]
fn test_score_in_range_and_monotonic_in_weights() {
    let evaluator = SignalEvaluator::new();
    let behavioral = BehavioralConfig::default();
    let cases = [
        (anomalous_fingerprint(), record(&robot_events(), &behavioral)),
        (FingerprintSnapshot::default(), record(&robot_events(), &behavioral)),
        (FingerprintSnapshot::default(), BehavioralSnapshot::default()),
        (
            FingerprintSnapshot::default(),
            record(&human_pointer(0), &behavioral),
        ),
    ];

    for (fingerprint, behavior) in &cases {
        let base = WeightTable::default();
        let score = evaluator.evaluate(fingerprint, behavior, &base).score;
        assert!(score <= 100);

        for field in 0..12 {
            let heavier = bump(&base, field, 25.0);
            let bumped = evaluator.evaluate(fingerprint, behavior, &heavier).score;
            assert!(bumped <= 100);
            assert!(bumped >= score, "field {field}: {bumped} < {score}");
        }
    }
}

#[test]
fn test_robot_session_triggers_behavioral_signals() {
    let behavior = record(&robot_events(), &BehavioralConfig::default());
    let assessment = SignalEvaluator::new().evaluate(
        &FingerprintSnapshot::default(),
        &behavior,
        &WeightTable::default(),
    );

    for signal in [
        Signal::MouseJitter,
        Signal::ClickInterval,
        Signal::ClickReaction,
        Signal::KeyboardSpeed,
        Signal::KeyboardUniformity,
        Signal::ScrollLinearity,
    ] {
        assert!(assessment.triggered(signal), "{} not triggered", signal.as_str());
    }
    // Evaluation order is preserved in the reasons.
    let order: Vec<Signal> = assessment.contributions.iter().map(|c| c.signal).collect();
    let jitter = order.iter().position(|s| *s == Signal::MouseJitter).unwrap();
    let keys = order.iter().position(|s| *s == Signal::KeyboardSpeed).unwrap();
    assert!(jitter < keys);
}

#[test]
fn test_evaluation_is_deterministic() {
    let behavior = record(&robot_events(), &BehavioralConfig::default());
    let fingerprint = anomalous_fingerprint();
    let weights = WeightTable::default();
    let evaluator = SignalEvaluator::new();

    let first = evaluator.evaluate(&fingerprint, &behavior, &weights);
    for _ in 0..5 {
        let again = evaluator.evaluate(&fingerprint, &behavior, &weights);
        assert_eq!(again.score, first.score);
        assert_eq!(again.reasons(), first.reasons());
    }
}

#[test]
fn test_display_reasons_truncated() {
    let behavior = record(&robot_events(), &BehavioralConfig::default());
    let assessment = SignalEvaluator::new().evaluate(
        &anomalous_fingerprint(),
        &behavior,
        &WeightTable::default(),
    );
    assert!(assessment.reasons().len() > 3);
    assert_eq!(assessment.display_reasons(3), assessment.reasons()[..3].to_vec());
    assert_eq!(assessment.score, 100);
}

// =============================================================================
// Behavioral Recorder Tests
// =============================================================================

#[test]
fn test_recorder_start_is_idempotent() {
    let surface = Arc::new(LocalSurface::new());
    let recorder = BehavioralRecorder::new(surface.clone(), &BehavioralConfig::default());

    recorder.start();
    recorder.start();
    assert_eq!(surface.listener_count(), 1);

    for event in human_pointer(0).into_iter().take(3) {
        surface.dispatch(event);
    }
    assert_eq!(recorder.recorded(), 3);
    assert_eq!(recorder.snapshot().count(SignalKind::PointerMove), 3);

    recorder.stop();
    assert_eq!(surface.listener_count(), 0);
    surface.dispatch(RawInteraction::new(999, Interaction::KeyPress));
    assert_eq!(recorder.recorded(), 3);
}

#[test]
fn test_buffer_cap_keeps_newest() {
    let config = BehavioralConfig {
        retention_cap: 10,
        ..Default::default()
    };
    let clicks: Vec<RawInteraction> = (0..15u64)
        .map(|i| RawInteraction::new(i * 100, Interaction::Click { x: 1.0, y: 1.0 }))
        .collect();

    let snapshot = record(&clicks, &config);
    let kept = snapshot.events(SignalKind::Click);
    assert_eq!(kept.len(), 10);
    assert_eq!(kept.first().map(|e| e.timestamp_ms), Some(500));
    assert_eq!(kept.last().map(|e| e.timestamp_ms), Some(1400));
}

#[test]
fn test_idle_gaps_accumulate() {
    let events = vec![
        RawInteraction::new(0, Interaction::KeyPress),
        RawInteraction::new(1000, Interaction::KeyPress),
        RawInteraction::new(6000, Interaction::Click { x: 0.0, y: 0.0 }),
        // Scrolling does not count as activity.
        RawInteraction::new(20_000, Interaction::Scroll { position: 10.0 }),
        RawInteraction::new(30_000, Interaction::KeyPress),
    ];
    let snapshot = record(&events, &BehavioralConfig::default());
    assert_eq!(snapshot.idle_ms, 5000 + 24_000);
}

// =============================================================================
// Block Scheduler Tests
// =============================================================================

#[test]
fn test_backoff_strictly_doubles() {
    let config = LockoutConfig {
        max_ms: None,
        ..Default::default()
    };
    let scheduler = BlockScheduler::new(&config, Arc::new(ManualClock::new(NOW)));
    let d1 = scheduler.lockout_duration(1);
    assert_eq!(scheduler.lockout_duration(2), 2 * d1);
    assert_eq!(scheduler.lockout_duration(3), 4 * d1);

    let lockout = scheduler.compute_lockout(3, NOW);
    assert_eq!(lockout.blocked_until, NOW + 4 * d1);
}

// =============================================================================
// Scenario Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_no_pointer_session_keeps_monitoring() {
    let clock = Arc::new(ManualClock::new(NOW));
    let (sink, mut events) = ChannelSink::new();
    let ctx = Arc::new(
        SessionContext::builder(GuardConfig::default())
            .clock(clock)
            .sink(Arc::new(sink))
            .weights(WeightTable::default())
            .build()
            .unwrap(),
    );
    let mut machine = DecisionMachine::new(ctx, host(Arc::new(Solver)));

    let state = machine
        .run_until(tokio::time::sleep(Duration::from_secs(10)))
        .await;

    assert_eq!(limits::NO_POINTER_PENALTY, 40.0);
    assert_eq!(state.last_score, 40);
    assert_eq!(state.phase, Phase::Monitoring);
    assert!(!state.verified);

    let names: Vec<&str> = std::iter::from_fn(|| events.try_recv().ok())
        .map(|e| e.name())
        .collect();
    assert_eq!(
        names,
        vec!["session_started", "challenge_issued", "challenge_resolved", "assessed"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_no_pointer_session_blocks_under_strict_thresholds() {
    let clock = Arc::new(ManualClock::new(NOW));
    let store = Arc::new(MemoryStore::new());
    let config = GuardConfig {
        thresholds: ThresholdConfig {
            safe: 10,
            suspicious: 35,
            block: 35,
        },
        ..Default::default()
    };
    let mut machine = DecisionMachine::new(
        context(config, clock.clone(), store.clone()),
        host(Arc::new(Solver)),
    );

    let state = machine
        .run_until(tokio::time::sleep(Duration::from_secs(10)))
        .await;

    assert_eq!(state.phase, Phase::Blocked);
    assert_eq!(state.block_count, 1);
    assert_eq!(state.blocked_until, Some(NOW + 300_000));
    assert_eq!(
        store.get("session_guard.blocked_until"),
        Some((NOW + 300_000).to_string())
    );
}

#[tokio::test]
async fn test_webdriver_only_scores_its_weight() {
    let recording = SessionRecording {
        environment: StaticProbe {
            webdriver: Some(true),
            ..StaticProbe::desktop()
        },
        events: human_pointer(0),
    };
    let config = GuardConfig::default();
    let weights = WeightTable {
        webdriver: 47.6,
        ..Default::default()
    };

    let report = replay(&recording, &config, &weights).await;
    assert_eq!(report.score, 48);
    assert_eq!(report.assessment.reasons(), vec!["Automation flag present"]);
    assert_eq!(report.level, RiskLevel::Suspicious);
}

#[tokio::test(start_paused = true)]
async fn test_challenge_timeout_resolves_false_once() {
    let config = ChallengeConfig {
        kinds: vec![ChallengeKind::Arithmetic],
        timeout_ms: 30_000,
        ..Default::default()
    };
    let broker = ChallengeBroker::with_seed(config, 5);
    let surface = Pending::default();
    let spec = broker.issue(0);
    let answer = spec.task.expected_answer().unwrap();

    let started = tokio::time::Instant::now();
    assert!(!broker.present(&surface, spec).await);
    assert!(started.elapsed() >= Duration::from_millis(30_000));

    let handle = surface.handles.lock().unwrap()[0].clone();
    assert!(handle.is_resolved());
    assert!(!handle.submit_answer(&answer.to_string()));
    assert!(!handle.cancel());
}

#[test]
fn test_expired_block_on_reload_awaits_challenge() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let clock = Arc::new(ManualClock::new(NOW));

    {
        let store = Arc::new(FileStore::open(&path));
        let mut machine = DecisionMachine::new(
            context(GuardConfig::default(), clock.clone(), store),
            host(Arc::new(Pending::default())),
        );
        machine.on_challenge_result(ChallengeOutcome::Passed);
        let assessment = zentinel_session_guard::RiskAssessment {
            score: 95,
            contributions: vec![],
        };
        assert_eq!(machine.apply_assessment(&assessment), Phase::Blocked);
    }

    // Reload while still blocked.
    clock.advance(60_000);
    {
        let store = Arc::new(FileStore::open(&path));
        let machine = DecisionMachine::new(
            context(GuardConfig::default(), clock.clone(), store),
            host(Arc::new(Pending::default())),
        );
        assert_eq!(machine.phase(), Phase::Blocked);
    }

    // Reload after the window, with no countdown tick in between.
    clock.advance(300_000);
    let store = Arc::new(FileStore::open(&path));
    let machine = DecisionMachine::new(
        context(GuardConfig::default(), clock.clone(), store.clone()),
        host(Arc::new(Pending::default())),
    );
    assert_eq!(machine.phase(), Phase::AwaitingChallenge);
    assert_eq!(machine.state().block_count, 1);
    assert!(!machine.state().verified);
    assert_eq!(store.get("session_guard.blocked_until"), None);
}

#[tokio::test(start_paused = true)]
async fn test_live_countdown_lifts_block() {
    let clock = Arc::new(ManualClock::new(NOW));
    let store = Arc::new(MemoryStore::new());
    store.set("session_guard.blocked_until", &(NOW + 3_000).to_string()).unwrap();
    store.set("session_guard.block_count", "1").unwrap();

    let surface = Arc::new(Pending::default());
    let mut machine = DecisionMachine::new(
        context(GuardConfig::default(), clock.clone(), store.clone()),
        host(surface.clone()),
    );
    assert_eq!(machine.phase(), Phase::Blocked);
    let mut phases = machine.subscribe();

    let shutdown = {
        let clock = clock.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            // The host slept through the lockout window.
            clock.advance(10_000);
            tokio::time::sleep(Duration::from_millis(2_000)).await;
        }
    };
    let state = machine.run_until(shutdown).await;

    assert_eq!(state.phase, Phase::AwaitingChallenge);
    assert_eq!(state.blocked_until, None);
    assert_eq!(*phases.borrow_and_update(), Phase::AwaitingChallenge);
    assert_eq!(store.get("session_guard.blocked_until"), None);
    // The next challenge was already on screen.
    assert_eq!(surface.handles.lock().unwrap().len(), 1);
    assert!(clock.now_ms() > NOW + 3_000);
}

#[tokio::test(start_paused = true)]
async fn test_failed_challenge_is_reissued() {
    let clock = Arc::new(ManualClock::new(NOW));
    let store = Arc::new(MemoryStore::new());
    let surface = Arc::new(Pending::default());
    let mut machine = DecisionMachine::new(
        context(GuardConfig::default(), clock, store.clone()),
        host(surface.clone()),
    );

    let answers = {
        let surface = surface.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let first = surface.handles.lock().unwrap()[0].clone();
            assert!(first.submit_answer("-1"));
            // Re-issue waits for the configured delay.
            tokio::time::sleep(Duration::from_millis(500)).await;
            assert_eq!(surface.handles.lock().unwrap().len(), 1);
            tokio::time::sleep(Duration::from_millis(1_000)).await;
            let second = surface.handles.lock().unwrap()[1].clone();
            assert_eq!(second.spec().task.kind(), ChallengeKind::SustainedHold);
            second.hold_start(0);
            second.hold_tick(3_000);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    let state = machine.run_until(answers).await;

    assert_eq!(state.phase, Phase::Monitoring);
    assert!(state.verified);
    assert_eq!(state.block_count, 0);
    assert_eq!(store.get("session_guard.verified").as_deref(), Some("true"));
}

#[tokio::test]
async fn test_fingerprint_of_headless_browser() {
    let probe = StaticProbe {
        webdriver: Some(true),
        user_agent: Some("Mozilla/5.0 (X11; Linux x86_64) HeadlessChrome/120.0".to_string()),
        gpu_renderer: Some("Google SwiftShader".to_string()),
        ..StaticProbe::desktop()
    };
    let fingerprint = FingerprintCollector::default().collect(&probe).await;
    let behavior = record(&human_pointer(0), &BehavioralConfig::default());
    let assessment =
        SignalEvaluator::new().evaluate(&fingerprint, &behavior, &WeightTable::default());

    assert_eq!(assessment.score, 100);
    assert_eq!(
        assessment.reasons()[0],
        "Automation flag present",
        "markers are reported first"
    );
    assert!(assessment.triggered(Signal::WebglAnomaly));
}

#[tokio::test]
async fn test_action_burst_raises_score_through_rate_limiter() {
    let clock = Arc::new(ManualClock::new(NOW));
    let store = Arc::new(MemoryStore::new());
    let mut machine = DecisionMachine::new(
        context(GuardConfig::default(), clock.clone(), store.clone()),
        host(Arc::new(Solver)),
    );
    machine.on_challenge_result(ChallengeOutcome::Passed);

    let limiter = machine.context().registry.rate_limiter().unwrap();
    for i in 0..30 {
        assert!(limiter.record(NOW + i * 100));
    }
    clock.advance(3_000);
    let within = machine.evaluate().await;
    assert_eq!(within.score, 40, "a full window is not a breach");
    assert!(!within.triggered(Signal::ComponentThreat));

    let limiter = machine.context().registry.rate_limiter().unwrap();
    for _ in 0..30 {
        limiter.record(clock.now_ms());
    }
    let burst = machine.evaluate().await;
    assert_eq!(burst.score, 80);
    assert!(burst.triggered(Signal::ComponentThreat));
    assert!(burst.reasons().contains(&"Flagged by rate_limiter"));

    assert_eq!(machine.apply_assessment(&burst), Phase::Blocked);
    assert_eq!(machine.state().block_count, 1);
}

#[test]
fn test_risk_event_serialization() {
    let event = RiskEvent::Blocked {
        block_count: 2,
        duration_ms: 600_000,
        blocked_until: NOW,
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["event"], "blocked");
    assert_eq!(json["block_count"], 2);
}
