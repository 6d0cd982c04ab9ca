// =============================================================================
// Central Application State — Aurora Fusion Service
// =============================================================================
//
// Everything the HTTP handlers share. The engine manages its own interior
// mutability (per-session locks, atomic counters); AppState adds the API
// token, a bounded error log and a version counter bumped on every session
// mutation so pollers can cheaply detect change.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for the error log.
//   - Arc around the engine so blocking tasks can own a handle.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::engine::{FusionEngine, StatsSnapshot};

/// A recorded error event for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// Machine-readable kind, e.g. `stale_session`.
    pub code: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

pub struct AppState {
    /// Incremented on every session mutation.
    pub state_version: AtomicU64,

    pub engine: Arc<FusionEngine>,

    /// Expected bearer token. `None` rejects every authenticated request.
    pub api_token: Option<String>,

    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    /// Used for uptime.
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(engine: FusionEngine, api_token: Option<String>) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            engine: Arc::new(engine),
            api_token: api_token.filter(|t| !t.is_empty()),
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    pub fn push_error(&self, message: String, code: Option<String>) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message,
            code,
            at: Utc::now().to_rfc3339(),
        });
        if errors.len() > MAX_RECENT_ERRORS {
            let excess = errors.len() - MAX_RECENT_ERRORS;
            errors.drain(..excess);
        }
    }

    pub fn build_status(&self) -> StatusSnapshot {
        StatusSnapshot {
            state_version: self.current_state_version(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            session_count: self.engine.session_count(),
            stats: self.engine.stats(),
            recent_errors: self.recent_errors.read().clone(),
            server_time: Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state_version: u64,
    pub uptime_secs: u64,
    pub session_count: usize,
    pub stats: StatsSnapshot,
    pub recent_errors: Vec<ErrorRecord>,
    pub server_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::small_config;
    use crate::model::FusionModel;

    fn state() -> AppState {
        let config = small_config();
        let model = FusionModel::new(&config);
        AppState::new(FusionEngine::with_model(config, model).unwrap(), Some(String::new()))
    }

    #[test]
    fn empty_token_counts_as_unset() {
        assert!(state().api_token.is_none());
    }

    #[test]
    fn error_log_is_bounded() {
        let s = state();
        for i in 0..(MAX_RECENT_ERRORS + 7) {
            s.push_error(format!("e{i}"), None);
        }
        let errors = s.recent_errors.read();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert_eq!(errors[0].message, "e7");
    }

    #[test]
    fn version_increments() {
        let s = state();
        let before = s.current_state_version();
        s.increment_version();
        assert_eq!(s.current_state_version(), before + 1);
        assert_eq!(s.build_status().session_count, 0);
    }
}
