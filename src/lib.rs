//! # Adaptive Execution Control Plane
//!
//! A self-managing control plane for a serverless workflow mesh: it
//! observes module-level metrics, correlates cross-module impact, forecasts
//! near-term trends, enforces cost and error-budget policies, degrades
//! gracefully under sustained pressure, scales and redirects traffic, caches
//! aggressively with predictive prefetch, and streams all of it to external
//! observers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  aggregator → correlation → predictor                    │
//! │       │                          │                       │
//! │       ▼                          ▼                       │
//! │   governor  ──┐              ladder                      │
//! │               ▼                  │                       │
//! │            scaler  ◄──────────────┘                      │
//! │               │                                           │
//! │               ▼                                           │
//! │   cache  ──► dashboard  ◄──  bus (cross-cutting events)   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Every stateful component reads time through [`clock::Clock`] rather than
//! the wall clock directly, so tests can drive cooldowns, TTLs, and
//! hysteresis windows deterministically instead of sleeping.
//!
//! ## Example
//!
//! ```rust,no_run
//! use flowmesh_governor::{Controller, ControlPlaneConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ControlPlaneConfig::load(None)?;
//!     let controller = Controller::new(config);
//!     controller.start().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod aggregator;
pub mod bus;
pub mod cache;
pub mod clock;
pub mod config;
pub mod controller;
pub mod correlation;
pub mod dashboard;
pub mod error;
pub mod expr;
pub mod governor;
pub mod ladder;
pub mod predictor;
pub mod scaler;
pub mod types;

// Re-export main types
pub use clock::{Clock, SharedClock, VirtualClock, WallClock};
pub use config::ControlPlaneConfig;
pub use controller::Controller;
pub use error::{GovernorError, Result};
pub use types::{
    BurnRateMetrics, CorrelationAnalysis, DegradationLevel, EcosystemHealthIndex, ErrorBudget,
    ModuleHealth, ModuleMetrics,
};

/// Control-plane crate version (aligned with workspace)
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
