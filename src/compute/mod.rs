//! Compute module - Niche archive, solvers and the diversifying retry.

mod advretry;
mod archive;
mod attempt;
mod bridge;
mod cvt;
mod fitness;
mod parallel;
mod problems;
mod sink;
mod transform;

pub mod solver;

pub use advretry::*;
pub use archive::*;
pub use attempt::*;
pub use bridge::*;
pub use cvt::*;
pub use fitness::*;
pub use parallel::*;
pub use problems::*;
pub use sink::{InfoSink, LogSink, NoopSink};
pub use solver::{Solver, SolverStatus, WrappedSolver};
pub use transform::*;
