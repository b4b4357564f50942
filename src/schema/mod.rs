//! Schema module - Configuration types for diversifying optimization runs.

mod bounds;
mod config;
mod optimizer;

pub use bounds::*;
pub use config::*;
pub use optimizer::*;
