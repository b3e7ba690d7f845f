//! Risk score calculation and types.
//!
//! [`SignalEvaluator::evaluate`] is pure: the same fingerprint, behavioral
//! snapshot and weight table always produce the same score and the same
//! ordered reason list. Every triggered signal adds a non-negative term.

use crate::behavior::{BehavioralSnapshot, InteractionEvent, SignalKind};
use crate::config::ThresholdConfig;
use crate::fingerprint::FingerprintSnapshot;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Signals that can contribute to the risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Webdriver,
    AutomationUa,
    WebglAnomaly,
    MouseJitter,
    UntrustedPointer,
    NoPointerMovement,
    ClickInterval,
    ClickReaction,
    ScrollLinearity,
    KeyboardSpeed,
    KeyboardUniformity,
    FocusFrequency,
    ScreenMismatch,
    AudioContext,
    Fonts,
    TouchSupport,
    /// Raised by an auxiliary guard component, not by the evaluator
    ComponentThreat,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Webdriver => "webdriver",
            Signal::AutomationUa => "automation_ua",
            Signal::WebglAnomaly => "webgl_anomaly",
            Signal::MouseJitter => "mouse_jitter",
            Signal::UntrustedPointer => "untrusted_pointer",
            Signal::NoPointerMovement => "no_pointer_movement",
            Signal::ClickInterval => "click_interval",
            Signal::ClickReaction => "click_reaction",
            Signal::ScrollLinearity => "scroll_linearity",
            Signal::KeyboardSpeed => "keyboard_speed",
            Signal::KeyboardUniformity => "keyboard_uniformity",
            Signal::FocusFrequency => "focus_frequency",
            Signal::ScreenMismatch => "screen_mismatch",
            Signal::AudioContext => "audio_context",
            Signal::Fonts => "fonts",
            Signal::TouchSupport => "touch_support",
            Signal::ComponentThreat => "component_threat",
        }
    }
}

/// Weight of each weighted signal. All weights are positive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightTable {
    pub webdriver: f64,
    pub automation_ua: f64,
    pub webgl_anomaly: f64,
    pub mouse_jitter: f64,
    pub click_interval: f64,
    pub scroll_linearity: f64,
    pub keyboard_speed: f64,
    pub focus_frequency: f64,
    pub screen_mismatch: f64,
    pub audio_context: f64,
    pub fonts: f64,
    pub touch_support: f64,
}

impl Default for WeightTable {
    fn default() -> Self {
        Self {
            webdriver: 50.0,
            automation_ua: 40.0,
            webgl_anomaly: 20.0,
            mouse_jitter: 20.0,
            click_interval: 15.0,
            scroll_linearity: 10.0,
            keyboard_speed: 15.0,
            focus_frequency: 10.0,
            screen_mismatch: 15.0,
            audio_context: 10.0,
            fonts: 10.0,
            touch_support: 10.0,
        }
    }
}

impl WeightTable {
    /// Maximum relative jitter applied per weight.
    pub const JITTER: f64 = 0.2;

    fn values_mut(&mut self) -> [&mut f64; 12] {
        [
            &mut self.webdriver,
            &mut self.automation_ua,
            &mut self.webgl_anomaly,
            &mut self.mouse_jitter,
            &mut self.click_interval,
            &mut self.scroll_linearity,
            &mut self.keyboard_speed,
            &mut self.focus_frequency,
            &mut self.screen_mismatch,
            &mut self.audio_context,
            &mut self.fonts,
            &mut self.touch_support,
        ]
    }

    fn values(&self) -> [f64; 12] {
        [
            self.webdriver,
            self.automation_ua,
            self.webgl_anomaly,
            self.mouse_jitter,
            self.click_interval,
            self.scroll_linearity,
            self.keyboard_speed,
            self.focus_frequency,
            self.screen_mismatch,
            self.audio_context,
            self.fonts,
            self.touch_support,
        ]
    }

    pub fn all_positive(&self) -> bool {
        self.values().iter().all(|w| w.is_finite() && *w > 0.0)
    }

    /// Scale every weight independently by a factor in `[0.8, 1.2]`.
    ///
    /// Reproducible only with a seeded generator; tests that need exact
    /// scores pass a fixed table instead.
    pub fn jittered<R: Rng>(&self, rng: &mut R) -> Self {
        let mut table = self.clone();
        for weight in table.values_mut() {
            *weight *= rng.gen_range(1.0 - Self::JITTER..=1.0 + Self::JITTER);
        }
        table
    }
}

/// Fixed detection limits.
pub mod limits {
    pub const MIN_POINTER_SAMPLES: usize = 10;
    pub const JITTER_EPSILON: f64 = 0.01;
    pub const LOW_JITTER_THRESHOLD: f64 = 0.1;
    pub const UNTRUSTED_POINTER_FRACTION: f64 = 0.2;
    pub const UNTRUSTED_POINTER_PENALTY: f64 = 30.0;
    pub const NO_POINTER_PENALTY: f64 = 40.0;

    pub const MIN_CLICKS: usize = 3;
    pub const CLICK_STDDEV_THRESHOLD_MS: f64 = 50.0;
    pub const MIN_REACTION_MS: f64 = 150.0;

    pub const MIN_SCROLL_SAMPLES: usize = 5;
    pub const SCROLL_VARIANCE_THRESHOLD: f64 = 0.01;

    pub const MIN_KEYPRESSES: usize = 5;
    pub const SUPERHUMAN_KEY_INTERVAL_MS: f64 = 30.0;
    pub const KEY_UNIFORMITY_CV: f64 = 0.10;

    pub const FOCUS_CHANGE_THRESHOLD: usize = 10;
    pub const FONT_FLOOR: u32 = 5;
    pub const TOUCH_POINTER_FLOOR: usize = 3;
}

use limits::*;

/// One triggered signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub signal: Signal,
    pub points: f64,
    pub reason: String,
}

/// Result of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// Overall risk (0-100)
    pub score: u8,
    /// Triggered signals in evaluation order
    pub contributions: Vec<Contribution>,
}

impl RiskAssessment {
    /// A clean assessment with no triggered signals.
    pub fn clean() -> Self {
        Self {
            score: 0,
            contributions: vec![],
        }
    }

    /// Full ordered reason list, for audit.
    pub fn reasons(&self) -> Vec<&str> {
        self.contributions.iter().map(|c| c.reason.as_str()).collect()
    }

    /// The first `limit` reasons, for presentation.
    pub fn display_reasons(&self, limit: usize) -> Vec<&str> {
        self.contributions
            .iter()
            .take(limit)
            .map(|c| c.reason.as_str())
            .collect()
    }

    pub fn triggered(&self, signal: Signal) -> bool {
        self.contributions.iter().any(|c| c.signal == signal)
    }

    /// Raise the score to `floor`, recording the reason. Never lowers it.
    pub fn raise_to(&mut self, floor: u8, reason: impl Into<String>) {
        let floor = floor.min(100);
        if floor <= self.score {
            return;
        }
        self.contributions.push(Contribution {
            signal: Signal::ComponentThreat,
            points: f64::from(floor - self.score),
            reason: reason.into(),
        });
        self.score = floor;
    }
}

/// Risk band of a score under the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// `score <= safe`
    Safe,
    /// `safe < score <= suspicious`
    Suspicious,
    /// `suspicious < score <= block`; empty when the two thresholds coincide
    High,
    /// `score > block`
    Block,
}

impl RiskLevel {
    pub fn classify(score: u8, thresholds: &ThresholdConfig) -> Self {
        if score > thresholds.block {
            RiskLevel::Block
        } else if score > thresholds.suspicious {
            RiskLevel::High
        } else if score > thresholds.safe {
            RiskLevel::Suspicious
        } else {
            RiskLevel::Safe
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Suspicious => "suspicious",
            RiskLevel::High => "high",
            RiskLevel::Block => "block",
        }
    }
}

/// Accumulates contributions in trigger order.
struct Tally {
    total: f64,
    contributions: Vec<Contribution>,
}

impl Tally {
    fn new() -> Self {
        Self {
            total: 0.0,
            contributions: Vec::new(),
        }
    }

    fn add(&mut self, signal: Signal, points: f64, reason: impl Into<String>) {
        let points = points.max(0.0);
        self.total += points;
        self.contributions.push(Contribution {
            signal,
            points,
            reason: reason.into(),
        });
    }

    fn finish(self) -> RiskAssessment {
        let score = self.total.round().clamp(0.0, 100.0) as u8;
        RiskAssessment {
            score,
            contributions: self.contributions,
        }
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn variance(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    Some(values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64)
}

fn intervals(events: &[InteractionEvent]) -> Vec<f64> {
    events
        .windows(2)
        .map(|w| w[1].timestamp_ms.saturating_sub(w[0].timestamp_ms) as f64)
        .collect()
}

fn angle_change(a: f64, b: f64) -> f64 {
    let d = (b - a).abs() % (2.0 * PI);
    if d > PI {
        2.0 * PI - d
    } else {
        d
    }
}

/// Mean of `|Δangle| / (|Δvelocity| + ε)` over consecutive pointer samples.
pub fn pointer_jitter(moves: &[InteractionEvent]) -> Option<f64> {
    let samples: Vec<f64> = moves
        .windows(2)
        .filter_map(|w| {
            let (a, b) = (w[0].angle?, w[1].angle?);
            let dv = (w[1].magnitude - w[0].magnitude).abs();
            Some(angle_change(a, b) / (dv + JITTER_EPSILON))
        })
        .collect();
    mean(&samples)
}

/// Weighted anomaly scorer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalEvaluator;

impl SignalEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Score a session. Pure and deterministic.
    pub fn evaluate(
        &self,
        fingerprint: &FingerprintSnapshot,
        behavior: &BehavioralSnapshot,
        weights: &WeightTable,
    ) -> RiskAssessment {
        let mut tally = Tally::new();

        self.automation_markers(fingerprint, weights, &mut tally);
        self.pointer_naturalness(behavior, weights, &mut tally);
        self.click_regularity(behavior, weights, &mut tally);
        self.scroll_linearity(behavior, weights, &mut tally);
        self.keyboard_cadence(behavior, weights, &mut tally);
        self.focus_churn(behavior, weights, &mut tally);
        self.environment_coherence(fingerprint, behavior, weights, &mut tally);

        tally.finish()
    }

    fn automation_markers(&self, fp: &FingerprintSnapshot, w: &WeightTable, tally: &mut Tally) {
        if fp.webdriver {
            tally.add(Signal::Webdriver, w.webdriver, "Automation flag present");
        }
        if fp.automation_user_agent {
            tally.add(
                Signal::AutomationUa,
                w.automation_ua,
                "Automation tool in user agent",
            );
        }
        if fp.gpu_anomaly {
            let reason = match fp.gpu_renderer {
                Some(ref r) => format!("Software or virtual renderer ({r})"),
                None => "Graphics renderer unavailable".to_string(),
            };
            tally.add(Signal::WebglAnomaly, w.webgl_anomaly, reason);
        }
    }

    fn pointer_naturalness(&self, b: &BehavioralSnapshot, w: &WeightTable, tally: &mut Tally) {
        let moves = b.events(SignalKind::PointerMove);

        if moves.is_empty() {
            tally.add(
                Signal::NoPointerMovement,
                NO_POINTER_PENALTY,
                "No pointer movement recorded",
            );
            return;
        }

        if moves.len() >= MIN_POINTER_SAMPLES {
            if let Some(jitter) = pointer_jitter(moves) {
                if jitter < LOW_JITTER_THRESHOLD {
                    tally.add(
                        Signal::MouseJitter,
                        w.mouse_jitter,
                        format!("Pointer movement too smooth (jitter {jitter:.3})"),
                    );
                }
            }

            let untrusted = moves.iter().filter(|e| e.trusted == Some(false)).count();
            let fraction = untrusted as f64 / moves.len() as f64;
            if fraction > UNTRUSTED_POINTER_FRACTION {
                tally.add(
                    Signal::UntrustedPointer,
                    UNTRUSTED_POINTER_PENALTY,
                    format!("{:.0}% of pointer events synthetic", fraction * 100.0),
                );
            }
        }
    }

    fn click_regularity(&self, b: &BehavioralSnapshot, w: &WeightTable, tally: &mut Tally) {
        let clicks = b.events(SignalKind::Click);
        if clicks.len() < MIN_CLICKS {
            return;
        }
        let gaps = intervals(clicks);
        let (Some(m), Some(var)) = (mean(&gaps), variance(&gaps)) else {
            return;
        };

        let stddev = var.sqrt();
        if stddev < CLICK_STDDEV_THRESHOLD_MS {
            tally.add(
                Signal::ClickInterval,
                w.click_interval,
                format!("Click timing too regular (σ {stddev:.0}ms)"),
            );
        }
        if m < MIN_REACTION_MS {
            tally.add(
                Signal::ClickReaction,
                w.click_interval / 2.0,
                format!("Clicks faster than human reaction ({m:.0}ms)"),
            );
        }
    }

    fn scroll_linearity(&self, b: &BehavioralSnapshot, w: &WeightTable, tally: &mut Tally) {
        let scrolls = b.events(SignalKind::Scroll);
        if scrolls.len() < MIN_SCROLL_SAMPLES {
            return;
        }
        let velocities: Vec<f64> = scrolls.iter().skip(1).map(|e| e.magnitude).collect();
        let (Some(m), Some(var)) = (mean(&velocities), variance(&velocities)) else {
            return;
        };
        if m > 0.0 && var < SCROLL_VARIANCE_THRESHOLD {
            tally.add(
                Signal::ScrollLinearity,
                w.scroll_linearity,
                "Scroll velocity unnaturally constant",
            );
        }
    }

    fn keyboard_cadence(&self, b: &BehavioralSnapshot, w: &WeightTable, tally: &mut Tally) {
        let keys = b.events(SignalKind::KeyPress);
        if keys.len() < MIN_KEYPRESSES {
            return;
        }
        let gaps = intervals(keys);
        let (Some(m), Some(var)) = (mean(&gaps), variance(&gaps)) else {
            return;
        };

        if m < SUPERHUMAN_KEY_INTERVAL_MS {
            tally.add(
                Signal::KeyboardSpeed,
                w.keyboard_speed,
                format!("Typing faster than humanly possible ({m:.0}ms)"),
            );
        }
        let cv = if m > 0.0 { var.sqrt() / m } else { 0.0 };
        if cv < KEY_UNIFORMITY_CV {
            tally.add(
                Signal::KeyboardUniformity,
                w.keyboard_speed / 2.0,
                "Keystroke timing too uniform",
            );
        }
    }

    fn focus_churn(&self, b: &BehavioralSnapshot, w: &WeightTable, tally: &mut Tally) {
        let changes = b.count(SignalKind::Visibility);
        if changes > FOCUS_CHANGE_THRESHOLD {
            tally.add(
                Signal::FocusFrequency,
                w.focus_frequency,
                format!("Frequent focus changes ({changes})"),
            );
        }
    }

    fn environment_coherence(
        &self,
        fp: &FingerprintSnapshot,
        b: &BehavioralSnapshot,
        w: &WeightTable,
        tally: &mut Tally,
    ) {
        if fp.screen_mismatch {
            tally.add(
                Signal::ScreenMismatch,
                w.screen_mismatch,
                "Screen and viewport geometry inconsistent",
            );
        }
        if !fp.audio_context {
            tally.add(Signal::AudioContext, w.audio_context, "Audio context unavailable");
        }
        if fp.font_count < FONT_FLOOR {
            tally.add(
                Signal::Fonts,
                w.fonts,
                format!("Too few fonts detected ({})", fp.font_count),
            );
        }
        if fp.touch_support && b.count(SignalKind::PointerMove) < TOUCH_POINTER_FLOOR {
            tally.add(
                Signal::TouchSupport,
                w.touch_support,
                "Touch capable but no pointer activity",
            );
        }
    }
}
