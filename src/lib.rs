pub mod attachments;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod optimizer;
pub mod orchestrator;
pub mod reconcile;
pub mod service;
pub mod storage;
pub mod sweep;

/// Install the fmt subscriber used by every binary (`RUST_LOG` controls the
/// filter).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();
}
