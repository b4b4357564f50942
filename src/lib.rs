//! Diversifier - Quality-diversity optimization over a niche archive.
//!
//! This crate wraps ordinary ask/tell optimizers (CMA-ES, differential
//! evolution, SNES) so that instead of converging to one optimum they fill
//! an archive of diverse good solutions, one elite per region of a
//! behavior descriptor space (CVT MAP-Elites style).
//!
//! # Architecture
//!
//! The crate is split into two main modules:
//!
//! - `schema`: Bounds, solver parameters and run configuration
//! - `compute`: Archive, solvers, the niche-relative transform, the
//!   parallel retry coordinator and the classical retry bridge
//!
//! # Example
//!
//! ```rust,no_run
//! use diversifier::{
//!     compute::{LogSink, minimize},
//!     schema::{Bounds, DiversifierConfig},
//! };
//!
//! // Fitness and a two-dimensional behavior descriptor
//! let fitness = |x: &[f64]| (x.iter().map(|v| v * v).sum::<f64>(), vec![x[0], x[1]]);
//!
//! let bounds = Bounds::uniform(4, -5.0, 5.0);
//! let desc_bounds = Bounds::uniform(2, -5.0, 5.0);
//! let config = DiversifierConfig {
//!     niche_num: 500,
//!     ..Default::default()
//! };
//!
//! let archive = minimize(&fitness, &bounds, &desc_bounds, &config, None, &LogSink).unwrap();
//! println!("{} niches occupied", archive.get_occupied());
//! ```

pub mod compute;
pub mod schema;

// Re-export commonly used types
pub use compute::{Archive, apply_advretry, minimize};
pub use schema::{Bounds, DiversifierConfig, OptParams, SolverKind};
