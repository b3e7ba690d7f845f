//! Session Guard for Zentinel
//!
//! Client-resident risk scoring for a user session. Environment and
//! interaction signals are fused into a 0-100 risk score that drives a
//! challenge / monitor / block decision machine.
//!
//! # Features
//!
//! - Environment fingerprinting with per-probe timeouts and anomaly sentinels
//! - Bounded behavioral recording (pointer, clicks, scroll, keys, focus)
//! - Deterministic weighted scoring with an ordered reason list
//! - Arithmetic and sustained-hold challenges with exactly-once resolution
//! - Exponential lockout backoff on wall-clock deadlines
//! - Durable state over any key-value store, optionally HMAC-sealed
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use zentinel_session_guard::{DecisionMachine, GuardConfig, HostSurfaces, SessionContext};
//!
//! let ctx = SessionContext::builder(GuardConfig::default())
//!     .store(Arc::new(FileStore::open("state.json")))
//!     .build()?;
//! let mut machine = DecisionMachine::new(Arc::new(ctx), host);
//! machine.run().await;
//! ```

pub mod behavior;
pub mod challenge;
pub mod clock;
pub mod components;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod fingerprint;
pub mod lockout;
pub mod machine;
pub mod persistence;
pub mod replay;
pub mod report;
pub mod session;

pub use config::GuardConfig;
pub use error::GuardError;
pub use evaluator::{RiskAssessment, RiskLevel, SignalEvaluator, WeightTable};
pub use machine::{DecisionMachine, Phase, SessionState};
pub use session::{HostSurfaces, SessionContext};
