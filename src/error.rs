// =============================================================================
// Engine Errors
// =============================================================================
//
// Every failure the inference core can raise. All of them are fatal for the
// call that raised them; none is retried or masked internally. Weight-quality
// breaches (ceiling, entropy floor) are not errors. The engine logs and
// counts them.
// =============================================================================

use serde::Serialize;

use crate::types::TrackId;

/// Pipeline stage that produced a non-finite intermediate value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", content = "track")]
pub enum Component {
    Encoder(TrackId),
    FreshnessDecay(TrackId),
    AttentionPool(TrackId),
    CrossTrackFusion,
    ModeReweighting,
    OutputHeads,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encoder(t) => write!(f, "resolution encoder [{t}]"),
            Self::FreshnessDecay(t) => write!(f, "freshness decay [{t}]"),
            Self::AttentionPool(t) => write!(f, "attention pool [{t}]"),
            Self::CrossTrackFusion => write!(f, "cross-track fusion"),
            Self::ModeReweighting => write!(f, "mode reweighting"),
            Self::OutputHeads => write!(f, "output heads"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("shape mismatch for {what}: expected {expected}, got {found}")]
    ShapeMismatch {
        what: String,
        expected: String,
        found: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("session {session:?} track {track} is not initialized; call initialize_session first")]
    Uninitialized { session: String, track: TrackId },

    #[error("session {session:?} went stale: {gap_secs}s since last update exceeds {threshold_secs}s; state was reset")]
    StaleSession {
        session: String,
        gap_secs: i64,
        threshold_secs: u64,
    },

    #[error("session {session:?} received an update {behind_secs}s older than its last update")]
    OutOfOrder { session: String, behind_secs: i64 },

    #[error("advance for session {session:?} carried no new bar on any track")]
    EmptyAdvance { session: String },

    #[error("non-finite value produced by {component}")]
    NonFinite { component: Component },
}

impl EngineError {
    pub(crate) fn shape(
        what: impl Into<String>,
        expected: impl std::fmt::Debug,
        found: impl std::fmt::Debug,
    ) -> Self {
        Self::ShapeMismatch {
            what: what.into(),
            expected: format!("{expected:?}"),
            found: format!("{found:?}"),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
