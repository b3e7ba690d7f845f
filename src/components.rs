//! Static registry of guard components.
//!
//! Every capability slot is always present. A slot that is switched off
//! holds [`Component::Disabled`], which contributes nothing.

use crate::config::ComponentConfig;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Capability slots, in registry order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    BotDetector,
    RateLimiter,
    Firewall,
    Honeypot,
    Captcha,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 5] = [
        ComponentKind::BotDetector,
        ComponentKind::RateLimiter,
        ComponentKind::Firewall,
        ComponentKind::Honeypot,
        ComponentKind::Captcha,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::BotDetector => "bot_detector",
            ComponentKind::RateLimiter => "rate_limiter",
            ComponentKind::Firewall => "firewall",
            ComponentKind::Honeypot => "honeypot",
            ComponentKind::Captcha => "captcha",
        }
    }
}

/// Common interface of all components.
pub trait GuardComponent: Send + Sync {
    fn kind(&self) -> ComponentKind;

    fn init(&self) {}

    /// Current threat contribution (0-100), if this component scores.
    fn threat_score(&self, _now_ms: u64) -> Option<u8> {
        None
    }

    fn destroy(&self) {}
}

/// Carries the latest evaluator score into the registry.
#[derive(Debug, Default)]
pub struct BotDetector {
    last_score: AtomicU8,
}

impl BotDetector {
    pub fn record(&self, score: u8) {
        self.last_score.store(score.min(100), Ordering::Relaxed);
    }
}

impl GuardComponent for BotDetector {
    fn kind(&self) -> ComponentKind {
        ComponentKind::BotDetector
    }

    fn init(&self) {
        self.last_score.store(0, Ordering::Relaxed);
    }

    fn threat_score(&self, _now_ms: u64) -> Option<u8> {
        Some(self.last_score.load(Ordering::Relaxed))
    }
}

/// Sliding-window counter of page actions (form submits, navigations).
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window_ms: u64,
    actions: Mutex<VecDeque<u64>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window_ms: u64) -> Self {
        Self {
            limit: limit.max(1),
            window_ms,
            actions: Mutex::new(VecDeque::new()),
        }
    }

    /// Record an action. Returns true while the rate is within the limit.
    pub fn record(&self, now_ms: u64) -> bool {
        let mut actions = lock(&self.actions);
        Self::expire(&mut actions, now_ms, self.window_ms);
        actions.push_back(now_ms);
        actions.len() as u32 <= self.limit
    }

    pub fn count(&self, now_ms: u64) -> u32 {
        let mut actions = lock(&self.actions);
        Self::expire(&mut actions, now_ms, self.window_ms);
        actions.len() as u32
    }

    fn expire(actions: &mut VecDeque<u64>, now_ms: u64, window_ms: u64) {
        while let Some(&ts) = actions.front() {
            if now_ms.saturating_sub(ts) >= window_ms {
                actions.pop_front();
            } else {
                break;
            }
        }
    }
}

impl GuardComponent for RateLimiter {
    fn kind(&self) -> ComponentKind {
        ComponentKind::RateLimiter
    }

    fn init(&self) {
        lock(&self.actions).clear();
    }

    fn threat_score(&self, now_ms: u64) -> Option<u8> {
        let count = self.count(now_ms);
        if count <= self.limit {
            return Some(0);
        }
        let ratio = count as f64 / self.limit as f64;
        Some((ratio * 40.0).min(100.0) as u8)
    }

    fn destroy(&self) {
        lock(&self.actions).clear();
    }
}

/// Trap elements invisible to people; any interaction is automation.
#[derive(Debug, Default)]
pub struct Honeypot {
    tripped: AtomicBool,
}

impl Honeypot {
    pub fn trip(&self, trap: &str) {
        if !self.tripped.swap(true, Ordering::Relaxed) {
            warn!(trap, "Honeypot tripped");
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Relaxed)
    }
}

impl GuardComponent for Honeypot {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Honeypot
    }

    fn init(&self) {
        self.tripped.store(false, Ordering::Relaxed);
    }

    fn threat_score(&self, _now_ms: u64) -> Option<u8> {
        Some(if self.is_tripped() { 100 } else { 0 })
    }
}

/// Empty implementation for a switched-off slot.
#[derive(Debug, Clone, Copy)]
pub struct Disabled(pub ComponentKind);

impl GuardComponent for Disabled {
    fn kind(&self) -> ComponentKind {
        self.0
    }
}

/// A registry slot.
#[derive(Debug)]
pub enum Component {
    BotDetector(BotDetector),
    RateLimiter(RateLimiter),
    Honeypot(Honeypot),
    Disabled(Disabled),
}

impl Component {
    pub fn as_component(&self) -> &dyn GuardComponent {
        match self {
            Component::BotDetector(c) => c,
            Component::RateLimiter(c) => c,
            Component::Honeypot(c) => c,
            Component::Disabled(c) => c,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Component::Disabled(_))
    }
}

/// Fixed set of components, one per [`ComponentKind`].
#[derive(Debug)]
pub struct ComponentRegistry {
    slots: Vec<Component>,
}

impl ComponentRegistry {
    pub fn new(config: &ComponentConfig) -> Self {
        let slots = ComponentKind::ALL
            .iter()
            .map(|kind| match kind {
                ComponentKind::BotDetector => Component::BotDetector(BotDetector::default()),
                ComponentKind::RateLimiter if config.rate_limiter => Component::RateLimiter(
                    RateLimiter::new(config.rate_limit_actions, config.rate_window_ms),
                ),
                ComponentKind::Honeypot if config.honeypot => {
                    Component::Honeypot(Honeypot::default())
                }
                // Network-layer filtering is out of scope and challenges are
                // served by the broker, so these slots never score.
                other => Component::Disabled(Disabled(*other)),
            })
            .collect();
        Self { slots }
    }

    pub fn get(&self, kind: ComponentKind) -> &Component {
        // Slots are built in `ComponentKind::ALL` order.
        &self.slots[kind as usize]
    }

    pub fn bot_detector(&self) -> Option<&BotDetector> {
        match self.get(ComponentKind::BotDetector) {
            Component::BotDetector(c) => Some(c),
            _ => None,
        }
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        match self.get(ComponentKind::RateLimiter) {
            Component::RateLimiter(c) => Some(c),
            _ => None,
        }
    }

    pub fn honeypot(&self) -> Option<&Honeypot> {
        match self.get(ComponentKind::Honeypot) {
            Component::Honeypot(c) => Some(c),
            _ => None,
        }
    }

    pub fn init(&self) {
        for slot in &self.slots {
            slot.as_component().init();
        }
        debug!(
            enabled = self.slots.iter().filter(|s| s.is_enabled()).count(),
            "Components initialized"
        );
    }

    pub fn destroy(&self) {
        for slot in &self.slots {
            slot.as_component().destroy();
        }
    }

    /// Highest threat contribution with the component that produced it.
    pub fn threat(&self, now_ms: u64) -> Option<(ComponentKind, u8)> {
        self.slots
            .iter()
            .filter_map(|slot| {
                let component = slot.as_component();
                component
                    .threat_score(now_ms)
                    .map(|score| (component.kind(), score))
            })
            .max_by_key(|(_, score)| *score)
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new(&ComponentConfig::default())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
