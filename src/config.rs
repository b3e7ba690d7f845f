//! Configuration types for the session guard.

use crate::error::GuardError;
use crate::evaluator::WeightTable;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration for the session guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Score thresholds for decisions
    pub thresholds: ThresholdConfig,

    /// Signal weight overrides
    pub weights: WeightTable,

    /// Jitter weights once per session to reduce predictability
    pub randomize_weights: bool,

    /// Lockout backoff settings
    pub lockout: LockoutConfig,

    /// Challenge settings
    pub challenge: ChallengeConfig,

    /// Behavioral collection settings
    pub behavioral: BehavioralConfig,

    /// Fingerprint probe settings
    pub fingerprint: FingerprintConfig,

    /// Durable state settings
    pub persistence: PersistenceConfig,

    /// Auxiliary guard components
    pub components: ComponentConfig,

    /// Number of reasons shown to the end user (full list kept for audit)
    pub display_reason_limit: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            thresholds: ThresholdConfig::default(),
            weights: WeightTable::default(),
            randomize_weights: true,
            lockout: LockoutConfig::default(),
            challenge: ChallengeConfig::default(),
            behavioral: BehavioralConfig::default(),
            fingerprint: FingerprintConfig::default(),
            persistence: PersistenceConfig::default(),
            components: ComponentConfig::default(),
            display_reason_limit: 3,
        }
    }
}

impl GuardConfig {
    /// Load configuration from a JSON or YAML file, chosen by extension.
    pub fn from_path(path: &Path) -> Result<Self, GuardError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = if path
            .extension()
            .is_some_and(|e| e == "yaml" || e == "yml")
        {
            serde_yaml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), GuardError> {
        let t = &self.thresholds;
        if !(t.safe <= t.suspicious && t.suspicious <= t.block && t.block <= 100) {
            return Err(GuardError::InvalidConfig(format!(
                "thresholds must satisfy safe <= suspicious <= block <= 100 (got {}/{}/{})",
                t.safe, t.suspicious, t.block
            )));
        }
        if self.lockout.base_ms == 0 {
            return Err(GuardError::InvalidConfig("lockout.base_ms must be positive".into()));
        }
        if let Some(max) = self.lockout.max_ms {
            if max < self.lockout.base_ms {
                return Err(GuardError::InvalidConfig(
                    "lockout.max_ms must not be below lockout.base_ms".into(),
                ));
            }
        }
        if self.lockout.tick_ms == 0 {
            return Err(GuardError::InvalidConfig("lockout.tick_ms must be positive".into()));
        }
        if self.behavioral.retention_cap == 0 {
            return Err(GuardError::InvalidConfig(
                "behavioral.retention_cap must be positive".into(),
            ));
        }
        if self.behavioral.reevaluation_interval_ms == 0 || self.behavioral.prune_interval_ms == 0 {
            return Err(GuardError::InvalidConfig(
                "behavioral timer intervals must be positive".into(),
            ));
        }
        if self.challenge.kinds.is_empty() {
            return Err(GuardError::InvalidConfig(
                "challenge.kinds must name at least one kind".into(),
            ));
        }
        if !self.weights.all_positive() {
            return Err(GuardError::InvalidConfig("weights must be positive".into()));
        }
        Ok(())
    }
}

/// Score thresholds on the 0-100 scale.
///
/// `score <= safe` keeps the session verified; anything above `safe` clears
/// the verified flag for the next session while monitoring continues;
/// anything above `block` locks the session out. Scores between `suspicious`
/// and `block` are reported as high risk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub safe: u8,
    pub suspicious: u8,
    pub block: u8,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            safe: 30,
            suspicious: 65,
            block: 65,
        }
    }
}

/// Lockout backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockoutConfig {
    /// Duration of the first lockout in milliseconds
    pub base_ms: u64,

    /// Optional ceiling on a single lockout window
    pub max_ms: Option<u64>,

    /// Countdown refresh period in milliseconds
    pub tick_ms: u64,

    /// Forget the block streak after this much clean monitoring time
    pub streak_reset_ms: Option<u64>,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            base_ms: 5 * 60 * 1000,
            max_ms: Some(24 * 60 * 60 * 1000),
            tick_ms: 1000,
            streak_reset_ms: Some(60 * 60 * 1000),
        }
    }
}

/// Challenge kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    /// Solve a small arithmetic problem
    Arithmetic,
    /// Hold an affordance continuously for a fixed duration
    SustainedHold,
}

/// Arithmetic difficulty tier.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    #[default]
    Easy,
    Medium,
    Hard,
}

/// Challenge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengeConfig {
    /// Kinds to rotate through, one per attempt
    pub kinds: Vec<ChallengeKind>,

    /// Arithmetic difficulty tier
    pub difficulty: Difficulty,

    /// Required hold duration for sustained-hold challenges
    pub hold_ms: u64,

    /// Auto-fail when no interaction completes the challenge in time
    pub timeout_ms: u64,

    /// Pause before issuing a new challenge after a failure
    pub reissue_delay_ms: u64,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            kinds: vec![ChallengeKind::Arithmetic, ChallengeKind::SustainedHold],
            difficulty: Difficulty::Easy,
            hold_ms: 3000,
            timeout_ms: 30_000,
            reissue_delay_ms: 1000,
        }
    }
}

/// Behavioral collection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehavioralConfig {
    /// Time to collect interactions before the first evaluation
    pub collection_window_ms: u64,

    /// Interval between periodic re-evaluations
    pub reevaluation_interval_ms: u64,

    /// Maximum events retained per signal kind
    pub retention_cap: usize,

    /// Interval of the buffer pruning task
    pub prune_interval_ms: u64,

    /// Gap without pointer/keyboard activity counted as idle
    pub idle_quiescence_ms: u64,
}

impl Default for BehavioralConfig {
    fn default() -> Self {
        Self {
            collection_window_ms: 5000,
            reevaluation_interval_ms: 30_000,
            retention_cap: 200,
            prune_interval_ms: 5000,
            idle_quiescence_ms: 3000,
        }
    }
}

/// Fingerprint probe configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    /// Per-probe timeout in milliseconds
    pub probe_timeout_ms: u64,

    /// Allowed relative difference between screen and viewport size
    pub screen_tolerance: f64,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 1000,
            screen_tolerance: 0.05,
        }
    }
}

/// Durable state configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Prefix for every stored key
    pub key_prefix: String,

    /// Secret for the HMAC seal over stored values; unsealed when absent
    pub seal_secret: Option<String>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            key_prefix: "session_guard".to_string(),
            seal_secret: None,
        }
    }
}

/// Auxiliary component configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentConfig {
    /// Enable the page-action rate limiter
    pub rate_limiter: bool,

    /// Actions allowed inside one rate window
    pub rate_limit_actions: u32,

    /// Rate window in milliseconds
    pub rate_window_ms: u64,

    /// Enable honeypot trap tracking
    pub honeypot: bool,
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            rate_limiter: true,
            rate_limit_actions: 30,
            rate_window_ms: 10_000,
            honeypot: true,
        }
    }
}
