// =============================================================================
// Fusion Engine — session lifecycle, predictions and counters
// =============================================================================
//
// The public face of the inference core. Owns the immutable configuration,
// the model parameters and the state cache, and turns pooled summaries into
// serializable predictions.
//
//   initialize_session  warm every track from its history, predict
//   advance             one new bar on one or more tracks, predict
//   reset_session       all tracks back to Uninitialized
//   predict             stateless pass over exactly-L windows
//
// Weight-quality breaches are logged at WARN and counted; they never fail a
// call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ndarray::{ArrayView2, ArrayView3, Axis};
use serde::Serialize;
use tracing::{info, warn};

use crate::cache::{SessionSnapshot, StateCache, TrackSlot};
use crate::error::{EngineError, EngineResult};
use crate::model::pooling::PoolOutput;
use crate::model::reweight::ReweightPlan;
use crate::model::{Decision, FusionModel};
use crate::runtime_config::RuntimeConfig;
use crate::types::{DirectionClass, SessionId, TrackId, TrackMap};

// =============================================================================
// Predictions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DirectionProbs {
    pub down: f64,
    pub neutral: f64,
    pub up: f64,
}

/// Prediction for one batch row.
#[derive(Debug, Clone, Serialize)]
pub struct RowPrediction {
    pub direction: DirectionClass,
    pub direction_probs: DirectionProbs,
    pub magnitude_pips: Vec<f64>,
    pub trend_strength: f64,
    /// Final per-track weights used for the fused vector.
    pub fusion_weights: TrackMap<f64>,
    /// Fusion-stage weights before mode reweighting.
    pub dynamic_weights: TrackMap<f64>,
    pub gate: f64,
    /// Steps back from the newest bar where each track's pool attends most.
    pub attention_focus: TrackMap<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub rows: Vec<RowPrediction>,
}

impl Prediction {
    fn from_decision(decision: &Decision, pooled: &TrackMap<PoolOutput>) -> Self {
        let rows = (0..decision.fusion_weights.nrows())
            .map(|b| {
                let probs = decision.heads.direction.row(b);
                let per_track = |w: &ndarray::Array2<f64>| TrackMap::from_fn(|t| w[[b, t.index()]]);
                RowPrediction {
                    direction: decision.heads.direction_class(b),
                    direction_probs: DirectionProbs {
                        down: probs[0],
                        neutral: probs[1],
                        up: probs[2],
                    },
                    magnitude_pips: decision.heads.magnitude.row(b).to_vec(),
                    trend_strength: decision.heads.trend[b],
                    fusion_weights: per_track(&decision.fusion_weights),
                    dynamic_weights: per_track(&decision.dynamic_weights),
                    gate: decision.gates[b],
                    attention_focus: pooled.as_ref().map(|_, p| {
                        let row = p.weights.row(b);
                        let peak = row
                            .iter()
                            .enumerate()
                            .fold((0, f64::NEG_INFINITY), |best, (i, &w)| if w > best.1 { (i, w) } else { best })
                            .0;
                        row.len() - 1 - peak
                    }),
                }
            })
            .collect();
        Self { rows }
    }
}

// =============================================================================
// Counters
// =============================================================================

/// Lock-free engine counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    initializations: AtomicU64,
    advances: AtomicU64,
    predictions: AtomicU64,
    resets: AtomicU64,
    stale_resets: AtomicU64,
    evictions: AtomicU64,
    ceiling_breaches: AtomicU64,
    entropy_breaches: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub initializations: u64,
    pub advances: u64,
    pub predictions: u64,
    pub resets: u64,
    pub stale_resets: u64,
    pub evictions: u64,
    pub ceiling_breaches: u64,
    pub entropy_breaches: u64,
}

impl EngineStats {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            initializations: get(&self.initializations),
            advances: get(&self.advances),
            predictions: get(&self.predictions),
            resets: get(&self.resets),
            stale_resets: get(&self.stale_resets),
            evictions: get(&self.evictions),
            ceiling_breaches: get(&self.ceiling_breaches),
            entropy_breaches: get(&self.entropy_breaches),
        }
    }
}

// =============================================================================
// FusionEngine
// =============================================================================

pub struct FusionEngine {
    config: Arc<RuntimeConfig>,
    model: Arc<FusionModel>,
    plan: ReweightPlan,
    cache: StateCache,
    stats: EngineStats,
}

impl FusionEngine {
    /// Validate `config` and build the model it describes (trained weights
    /// when `model.weights_path` is set).
    pub fn new(config: RuntimeConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let model = FusionModel::from_config(&config)?;
        Ok(Self::with_model(config, model)?)
    }

    /// Engine around already-built parameters.
    pub fn with_model(config: RuntimeConfig, model: FusionModel) -> EngineResult<Self> {
        config.validate()?;
        model.check_dimensions(&config)?;
        let plan = ReweightPlan::from_params(&config.reweighting)?;
        info!(
            mode = ?plan.mode,
            profile = %config.reweighting.active_profile,
            ceiling = plan.limits.ceiling,
            entropy_floor = plan.limits.entropy_floor,
            "fusion engine ready"
        );
        Ok(Self {
            cache: StateCache::new(config.staleness_threshold_secs),
            config: Arc::new(config),
            model: Arc::new(model),
            plan,
            stats: EngineStats::default(),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn model(&self) -> &FusionModel {
        &self.model
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn session_count(&self) -> usize {
        self.cache.session_count()
    }

    pub fn session_snapshot(&self, id: &str) -> Option<SessionSnapshot> {
        self.cache.snapshot(id)
    }

    pub fn track_slot(&self, id: &str, track: TrackId) -> Option<TrackSlot> {
        self.cache.track_slot(id, track)
    }

    /// Warm a session from per-track histories (`T >= L_track` steps each)
    /// and return the prediction for the newest step.
    pub fn initialize_session(
        &self,
        id: &str,
        histories: TrackMap<ArrayView3<f64>>,
        at: DateTime<Utc>,
    ) -> EngineResult<Prediction> {
        let pooled = self.cache.initialize(&self.model, id, histories, at)?;
        EngineStats::bump(&self.stats.initializations, 1);
        self.finish(Some(id), &pooled)
    }

    /// Feed one step of new bars; `None` marks a track with no new bar.
    pub fn advance(
        &self,
        id: &str,
        bars: TrackMap<Option<ArrayView2<f64>>>,
        at: DateTime<Utc>,
    ) -> EngineResult<Prediction> {
        match self.cache.advance(&self.model, id, bars, at) {
            Ok(pooled) => {
                EngineStats::bump(&self.stats.advances, 1);
                self.finish(Some(id), &pooled)
            }
            Err(err @ EngineError::StaleSession { .. }) => {
                EngineStats::bump(&self.stats.stale_resets, 1);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// `false` when the session is unknown.
    pub fn reset_session(&self, id: &str) -> bool {
        let known = self.cache.reset(id);
        if known {
            EngineStats::bump(&self.stats.resets, 1);
        }
        known
    }

    /// Stateless pass over exactly-`L_track` windows; no cache interaction.
    pub fn predict(&self, windows: TrackMap<ArrayView3<f64>>) -> EngineResult<Prediction> {
        let (decision, pooled) = self.model.forward(windows, &self.plan)?;
        EngineStats::bump(&self.stats.predictions, 1);
        self.record_breaches(None, &decision);
        Ok(Prediction::from_decision(&decision, &pooled))
    }

    /// Drop idle sessions; returns how many went.
    pub fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let evicted = self.cache.evict_idle(now).len();
        EngineStats::bump(&self.stats.evictions, evicted as u64);
        evicted
    }

    fn finish(&self, session: Option<&str>, pooled: &TrackMap<PoolOutput>) -> EngineResult<Prediction> {
        let decision = self.model.decide(pooled.as_ref(), &self.plan)?;
        self.record_breaches(session, &decision);
        Ok(Prediction::from_decision(&decision, pooled))
    }

    fn record_breaches(&self, session: Option<&str>, decision: &Decision) {
        let (ceiling, entropy) = (decision.ceiling_breaches, decision.entropy_breaches);
        if ceiling == 0 && entropy == 0 {
            return;
        }
        EngineStats::bump(&self.stats.ceiling_breaches, ceiling as u64);
        EngineStats::bump(&self.stats.entropy_breaches, entropy as u64);
        let max_dynamic = decision
            .dynamic_weights
            .axis_iter(Axis(0))
            .flat_map(|row| row.to_vec())
            .fold(0.0_f64, f64::max);
        warn!(
            session = session.unwrap_or("-"),
            ceiling_breaches = ceiling,
            entropy_breaches = entropy,
            max_dynamic_weight = max_dynamic,
            "fusion weights breached normalization limits before enforcement"
        );
    }
}

/// Convenience for callers holding owned arrays.
pub fn views<'a>(arrays: &'a TrackMap<ndarray::Array3<f64>>) -> TrackMap<ArrayView3<'a, f64>> {
    arrays.as_ref().map(|_, a| a.view())
}

/// Identifier for a new session when the caller supplies none.
pub fn new_session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string()
}
