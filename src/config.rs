use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Application-level constants
pub const APP_NAME: &str = "Provara";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default tracing filter when RUST_LOG is not set.
pub fn default_log_filter() -> String {
    format!("{}=info", env!("CARGO_PKG_NAME"))
}

/// Get the application data directory
/// ~/Provara/ on all platforms (user-visible)
pub fn app_data_dir() -> PathBuf {
    let home = dirs::home_dir().expect("Cannot determine home directory");
    home.join("Provara")
}

/// Get the default path of the authoritative record store.
pub fn store_db_path() -> PathBuf {
    app_data_dir().join("store.db")
}

/// Get the default path of the derived search projection.
pub fn projection_db_path() -> PathBuf {
    app_data_dir().join("projection.db")
}

/// Tunable thresholds and deadlines for the engine.
///
/// Every external-call boundary (backend query, LLM refinement, answer
/// generation) takes its timeout from here; callers may override per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fields extracted below this confidence need human verification.
    pub verification_threshold: f32,
    /// Queries classified at or above this confidence skip LLM refinement.
    pub direct_execute_threshold: f32,
    /// Character window captured before/after a citation match.
    pub context_window_chars: usize,
    /// Page size for listing searches. Aggregations ignore this.
    pub search_page_size: usize,
    /// Generated answers expire after this many seconds.
    pub cache_ttl_secs: u64,
    /// Hard deadline for a single LLM refinement call.
    pub llm_deadline_secs: u64,
    /// Deadline for a single answer-generation call.
    pub answer_deadline_secs: u64,
    /// Deadline for a single storage/search backend call.
    pub backend_deadline_secs: u64,
    /// Max attempts for transient provider failures.
    pub provider_retry_attempts: u32,
    /// Base backoff between provider retries, in milliseconds.
    pub provider_retry_base_ms: u64,
    /// How often the reconciliation job wakes up.
    pub reconcile_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            verification_threshold: 0.6,
            direct_execute_threshold: 0.7,
            context_window_chars: 200,
            search_page_size: 20,
            cache_ttl_secs: 24 * 60 * 60,
            llm_deadline_secs: 30,
            answer_deadline_secs: 60,
            backend_deadline_secs: 10,
            provider_retry_attempts: 3,
            provider_retry_base_ms: 250,
            reconcile_interval_secs: 15 * 60,
        }
    }
}
