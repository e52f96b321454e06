pub mod client;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod reconcile;
pub mod sink;
pub mod stats;

pub use client::*;
pub use config::*;
pub use error::*;
pub use orchestrator::*;
pub use reconcile::*;
pub use sink::*;
pub use stats::*;
