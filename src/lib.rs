//! Provara — extraction provenance & retrieval consistency engine.
//!
//! Three jobs, one subsystem:
//! - attach verifiable citations (page, bounding box, source text) to
//!   machine-extracted field values
//! - keep a derived, search-optimized projection consistent with the
//!   authoritative record store under human corrections
//! - route queries to direct execution or LLM refinement while guaranteeing
//!   aggregations cover the complete matching set, never a paged subset

pub mod aggregation;
pub mod backend;
pub mod cache;
pub mod citation;
pub mod config;
pub mod db;
pub mod engine;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod projection;
pub mod query;
pub mod sync;

pub use engine::{Engine, EngineAnswer, QueryExecution};

use tracing_subscriber::EnvFilter;

/// Initialize tracing from RUST_LOG, defaulting to info for this crate.
/// Call once from the host process.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("{} v{}", config::APP_NAME, config::APP_VERSION);
}
