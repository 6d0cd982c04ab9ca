// =============================================================================
// Fusion Model — the full parameter set and the stateless forward pass
// =============================================================================
//
// Data flows leaf-to-root:
//
//   per-track window → ResolutionEncoder → FreshnessDecay → AttentionPool
//                    → CrossTrackFusion → ModeReweighter → OutputHeads
//
// The model owns parameters only; recurrent state belongs to the cache. The
// split point is `summarize` (hidden window → pooled summary) and `decide`
// (five summaries → prediction), which is what lets the cache reuse a slow
// track's pooled summary while a faster track advances.

pub mod decay;
pub mod encoder;
pub mod fusion;
pub mod heads;
pub mod layers;
pub mod lstm;
pub mod pooling;
pub mod reweight;

use std::path::Path;

use anyhow::{bail, Context, Result};
use ndarray::{Array1, Array2, Array3, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Component, EngineError, EngineResult};
use crate::runtime_config::RuntimeConfig;
use crate::types::{TrackId, TrackMap, TRACK_COUNT};

use self::decay::FreshnessDecay;
use self::encoder::ResolutionEncoder;
use self::fusion::{weighted_sum, CrossTrackFusion};
use self::heads::{HeadOutput, OutputHeads};
use self::layers::ensure_finite;
use self::pooling::{AttentionPool, PoolOutput};
use self::reweight::{ModeReweighter, ReweightPlan};

/// Encoder, decay and pool for one track. Independently parameterized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackBranch {
    pub encoder: ResolutionEncoder,
    pub decay: FreshnessDecay,
    pub pool: AttentionPool,
}

/// Output of one full pass over five summaries.
#[derive(Debug, Clone)]
pub struct Decision {
    pub heads: HeadOutput,
    /// Dynamic weights from the fusion aggregate, `[B, 5]`.
    pub dynamic_weights: Array2<f64>,
    /// Final fusion weight vector actually used, `[B, 5]`.
    pub fusion_weights: Array2<f64>,
    /// Reweighting gate per batch row.
    pub gates: Array1<f64>,
    pub ceiling_breaches: usize,
    pub entropy_breaches: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionModel {
    feature_dim: usize,
    model_width: usize,
    /// Canonical track order.
    branches: Vec<TrackBranch>,
    fusion: CrossTrackFusion,
    reweighter: ModeReweighter,
    heads: OutputHeads,
}

impl FusionModel {
    /// Seeded initial parameters. `config` must already be validated.
    pub fn new(config: &RuntimeConfig) -> Self {
        let m = &config.model;
        let mut rng = StdRng::seed_from_u64(m.seed);
        let branches = config
            .tracks
            .iter()
            .map(|&spec| TrackBranch {
                encoder: ResolutionEncoder::new(
                    spec,
                    config.feature_dim,
                    m.model_width,
                    m.encoder_layers,
                    &mut rng,
                ),
                decay: FreshnessDecay::new(config.decay.mode, config.decay.initial_rate),
                pool: AttentionPool::new(m.model_width, m.pool_heads, &mut rng),
            })
            .collect();

        Self {
            feature_dim: config.feature_dim,
            model_width: m.model_width,
            branches,
            fusion: CrossTrackFusion::new(m.model_width, m.fusion_heads, m.ffn_multiplier, &mut rng),
            reweighter: ModeReweighter::new(m.model_width, &mut rng),
            heads: OutputHeads::new(m.model_width, m.magnitude_outputs, &mut rng),
        }
    }

    /// Trained weights from `model.weights_path` when set, seeded parameters
    /// otherwise.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        match &config.model.weights_path {
            Some(path) => {
                let model = Self::load(path)?;
                model
                    .check_dimensions(config)
                    .with_context(|| format!("weights at {path} do not match the configuration"))?;
                Ok(model)
            }
            None => {
                info!(seed = config.model.seed, "no weights_path configured, using seeded parameters");
                Ok(Self::new(config))
            }
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read model weights from {}", path.display()))?;
        let model: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse model weights from {}", path.display()))?;
        if model.branches.len() != TRACK_COUNT {
            bail!(
                "model weights at {} hold {} track branches, expected {TRACK_COUNT}",
                path.display(),
                model.branches.len()
            );
        }
        info!(path = %path.display(), model_width = model.model_width, "model weights loaded");
        Ok(model)
    }

    /// Atomic write: `.tmp` then rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string(self).context("failed to serialise model weights")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp weights to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp weights to {}", path.display()))?;
        info!(path = %path.display(), "model weights saved (atomic)");
        Ok(())
    }

    /// Verify that loaded parameters fit the configured shapes.
    pub fn check_dimensions(&self, config: &RuntimeConfig) -> EngineResult<()> {
        let m = &config.model;
        let mismatch = |what: &str, expected: usize, found: usize| {
            Err(EngineError::InvalidConfig(format!(
                "loaded model {what}={found} but configuration says {expected}"
            )))
        };
        if self.branches.len() != TRACK_COUNT {
            return mismatch("track branches", TRACK_COUNT, self.branches.len());
        }
        if self.feature_dim != config.feature_dim {
            return mismatch("feature_dim", config.feature_dim, self.feature_dim);
        }
        if self.model_width != m.model_width {
            return mismatch("model_width", m.model_width, self.model_width);
        }
        for (branch, spec) in self.branches.iter().zip(&config.tracks) {
            let enc = &branch.encoder;
            if enc.track() != spec.track {
                return Err(EngineError::InvalidConfig(format!(
                    "loaded model branch {} sits where {} is configured",
                    enc.track(),
                    spec.track
                )));
            }
            if enc.window_len() != spec.window_len {
                return mismatch(&format!("{} window_len", spec.track), spec.window_len, enc.window_len());
            }
            if enc.num_layers() != m.encoder_layers {
                return mismatch("encoder_layers", m.encoder_layers, enc.num_layers());
            }
            if branch.pool.heads() != m.pool_heads {
                return mismatch("pool_heads", m.pool_heads, branch.pool.heads());
            }
        }
        if self.fusion.heads() != m.fusion_heads {
            return mismatch("fusion_heads", m.fusion_heads, self.fusion.heads());
        }
        if self.heads.magnitude_outputs() != m.magnitude_outputs {
            return mismatch("magnitude_outputs", m.magnitude_outputs, self.heads.magnitude_outputs());
        }
        Ok(())
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn model_width(&self) -> usize {
        self.model_width
    }

    pub fn branch(&self, track: TrackId) -> &TrackBranch {
        &self.branches[track.index()]
    }

    pub fn encoder(&self, track: TrackId) -> &ResolutionEncoder {
        &self.branch(track).encoder
    }

    pub fn window_len(&self, track: TrackId) -> usize {
        self.encoder(track).window_len()
    }

    /// Decay then pool one track's hidden window `[B, L_track, D]`.
    pub fn summarize(&self, track: TrackId, hidden: ArrayView3<f64>) -> EngineResult<PoolOutput> {
        self.summarize_in_place(track, &mut hidden.to_owned())
    }

    /// Like [`summarize`](Self::summarize), decaying `window` in place. The
    /// state cache passes its per-track workspace here.
    pub fn summarize_in_place(&self, track: TrackId, window: &mut Array3<f64>) -> EngineResult<PoolOutput> {
        let branch = self.branch(track);
        let len = window.len_of(Axis(1));
        if len != branch.encoder.window_len() {
            return Err(EngineError::shape(
                format!("{track} pooling window length"),
                branch.encoder.window_len(),
                len,
            ));
        }
        branch.decay.apply(window);
        ensure_finite(Component::FreshnessDecay(track), &*window)?;
        branch.pool.forward(track, window.view())
    }

    /// Cross-track fusion, reweighting and heads over five pooled summaries.
    pub fn decide(&self, summaries: TrackMap<&PoolOutput>, plan: &ReweightPlan) -> EngineResult<Decision> {
        let batch = summaries[TrackId::M1].summary.nrows();
        let mut stacked = Array3::zeros((batch, TRACK_COUNT, self.model_width));
        for (track, pooled) in summaries.iter() {
            if pooled.summary.dim() != (batch, self.model_width) {
                return Err(EngineError::shape(
                    format!("{track} summary"),
                    (batch, self.model_width),
                    pooled.summary.dim(),
                ));
            }
            stacked.index_axis_mut(Axis(1), track.index()).assign(&pooled.summary);
        }

        let fused = self.fusion.forward(stacked.view())?;
        let fused_dynamic = weighted_sum(fused.refined.view(), fused.dynamic_weights.view());
        let reweighted = self
            .reweighter
            .reweight(plan, fused.dynamic_weights.view(), fused_dynamic.view())?;
        let decision_vector = weighted_sum(fused.refined.view(), reweighted.weights.view());
        ensure_finite(Component::CrossTrackFusion, &decision_vector)?;
        let heads = self.heads.forward(decision_vector.view())?;

        Ok(Decision {
            heads,
            dynamic_weights: fused.dynamic_weights,
            fusion_weights: reweighted.weights,
            gates: reweighted.gates,
            ceiling_breaches: reweighted.ceiling_breaches,
            entropy_breaches: reweighted.entropy_breaches,
        })
    }

    /// Full stateless pass over exactly-`L_track` windows.
    pub fn forward(
        &self,
        windows: TrackMap<ArrayView3<f64>>,
        plan: &ReweightPlan,
    ) -> EngineResult<(Decision, TrackMap<PoolOutput>)> {
        let pooled = TrackMap::try_from_fn(|track| {
            let (hidden, _) = self.encoder(track).encode(windows[track].view())?;
            self.summarize(track, hidden.view())
        })?;
        let decision = self.decide(pooled.as_ref(), plan)?;
        Ok((decision, pooled))
    }
}
