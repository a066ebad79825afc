//! Binary similarity search against a reference corpus of catalogued
//! malware samples.
//!
//! The pipeline has four layers: `corpus` loads and snapshots the sample
//! registry, `engine` adapts the pairwise diff oracle, `search` ranks one
//! query deterministically, and `batch` fans many queries across a bounded
//! worker pool and reconciles a discovery-ordered report.

pub mod batch;
pub mod cli;
pub mod config;
pub mod corpus;
pub mod engine;
pub mod model;
pub mod report;
pub mod search;

pub use cli::{run, Cli};

/// Install the global tracing subscriber. Filter comes from `RUST_LOG`,
/// defaulting to warnings only so CLI output stays clean.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
