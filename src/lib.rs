// =============================================================================
// Aurora Fusion — multi-resolution fusion and incremental inference engine
// =============================================================================
//
// Five time resolutions (M1, M5, M15, H1, H4) are encoded independently,
// pooled by learned attention, fused across tracks with one explicit weight
// vector and projected into direction, magnitude and trend predictions.
// Sessions keep per-track recurrent state so each new bar costs one encoder
// step instead of a full-window recompute.
// =============================================================================

pub mod api;
pub mod app_state;
pub mod cache;
pub mod engine;
pub mod error;
pub mod model;
pub mod runtime_config;
pub mod types;

pub use engine::{FusionEngine, Prediction, RowPrediction, StatsSnapshot};
pub use error::{Component, EngineError, EngineResult};
pub use runtime_config::RuntimeConfig;
pub use types::{DirectionClass, SessionId, TrackId, TrackMap, TRACK_COUNT};
