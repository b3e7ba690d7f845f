//! Per-session context.
//!
//! Everything the decision machine needs is built here once and passed in
//! explicitly: configuration, the session's weight table, the clock, durable
//! storage, the reporting sink and the component registry.

use crate::behavior::InteractionSurface;
use crate::challenge::ChallengeSurface;
use crate::clock::{Clock, SystemClock};
use crate::components::ComponentRegistry;
use crate::config::GuardConfig;
use crate::error::GuardError;
use crate::evaluator::WeightTable;
use crate::fingerprint::EnvironmentProbe;
use crate::persistence::{KeyValueStore, MemoryStore, SessionStore};
use crate::report::{NullSink, ReportSink, Reporter};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tracing::debug;

/// Shared, immutable session context.
pub struct SessionContext {
    pub config: GuardConfig,
    /// Fixed for the lifetime of the session
    pub weights: WeightTable,
    pub clock: Arc<dyn Clock>,
    pub store: SessionStore,
    pub reporter: Reporter,
    pub registry: ComponentRegistry,
}

impl SessionContext {
    pub fn builder(config: GuardConfig) -> SessionContextBuilder {
        SessionContextBuilder::new(config)
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }
}

/// Builder for [`SessionContext`].
pub struct SessionContextBuilder {
    config: GuardConfig,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn KeyValueStore>>,
    sink: Option<Arc<dyn ReportSink>>,
    weights: Option<WeightTable>,
    seed: Option<u64>,
}

impl SessionContextBuilder {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            clock: None,
            store: None,
            sink: None,
            weights: None,
            seed: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Use exactly this weight table, skipping any jitter.
    pub fn weights(mut self, weights: WeightTable) -> Self {
        self.weights = Some(weights);
        self
    }

    /// Seed the weight jitter for reproducible sessions.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<SessionContext, GuardError> {
        self.config.validate()?;

        let weights = match self.weights {
            Some(weights) => weights,
            None if self.config.randomize_weights => {
                let mut rng = match self.seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_entropy(),
                };
                self.config.weights.jittered(&mut rng)
            }
            None => self.config.weights.clone(),
        };
        debug!(?weights, "Session weights fixed");

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn KeyValueStore>);
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(NullSink) as Arc<dyn ReportSink>);

        Ok(SessionContext {
            store: SessionStore::new(store, &self.config.persistence),
            registry: ComponentRegistry::new(&self.config.components),
            reporter: Reporter::new(sink),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            weights,
            config: self.config,
        })
    }
}

/// Host-side collaborators the machine drives.
#[derive(Clone)]
pub struct HostSurfaces {
    pub probe: Arc<dyn EnvironmentProbe>,
    pub interactions: Arc<dyn InteractionSurface>,
    pub challenges: Arc<dyn ChallengeSurface>,
}
