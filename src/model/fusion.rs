// =============================================================================
// Cross-Track Fusion — five track summaries into one decision vector
// =============================================================================
//
// The five summaries are treated as a five-token sequence:
//
//   attn    = MultiHeadSelfAttention(z)
//   z'      = LayerNorm(z + attn)
//   refined = LayerNorm(z' + FFN(z'))
//   dynamic = softmax(aggregate(refined))           [B, 5]
//
// Aggregation is an explicit per-track score, not an opaque mean, so the
// dynamic weight vector is available to the reweighting stage. The final
// weighted sum over refined tokens is taken exactly once, by `weighted_sum`,
// with whatever weight vector the reweighting stage settles on.

use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, Axis};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::layers::{ensure_finite, softmax, LayerNorm, Linear};
use crate::error::{Component, EngineError, EngineResult};
use crate::types::TRACK_COUNT;

#[derive(Debug, Clone)]
pub struct FusionOutput {
    /// Track tokens after attention and feed-forward refinement, `[B, 5, D]`.
    pub refined: Array3<f64>,
    /// Per-track contribution from the aggregate scorer, `[B, 5]`.
    pub dynamic_weights: Array2<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossTrackFusion {
    heads: usize,
    query: Linear,
    key: Linear,
    value: Linear,
    attn_out: Linear,
    norm_attn: LayerNorm,
    ffn_in: Linear,
    ffn_out: Linear,
    norm_ffn: LayerNorm,
    aggregate: Linear,
}

impl CrossTrackFusion {
    pub fn new(model_width: usize, heads: usize, ffn_multiplier: usize, rng: &mut StdRng) -> Self {
        let ffn_width = model_width * ffn_multiplier;
        Self {
            heads,
            query: Linear::new(model_width, model_width, rng),
            key: Linear::new(model_width, model_width, rng),
            value: Linear::new(model_width, model_width, rng),
            attn_out: Linear::new(model_width, model_width, rng),
            norm_attn: LayerNorm::new(model_width),
            ffn_in: Linear::new(model_width, ffn_width, rng),
            ffn_out: Linear::new(ffn_width, model_width, rng),
            norm_ffn: LayerNorm::new(model_width),
            aggregate: Linear::new(model_width, 1, rng),
        }
    }

    pub fn heads(&self) -> usize {
        self.heads
    }

    pub fn model_width(&self) -> usize {
        self.query.in_features()
    }

    pub fn forward(&self, summaries: ArrayView3<f64>) -> EngineResult<FusionOutput> {
        let (batch, tracks, width) = summaries.dim();
        if tracks != TRACK_COUNT || width != self.model_width() {
            return Err(EngineError::shape(
                "fusion input",
                [batch, TRACK_COUNT, self.model_width()],
                [batch, tracks, width],
            ));
        }
        ensure_finite(Component::CrossTrackFusion, &summaries)?;

        let mut refined = Array3::zeros((batch, TRACK_COUNT, width));
        let mut dynamic_weights = Array2::zeros((batch, TRACK_COUNT));

        for (b, tokens) in summaries.axis_iter(Axis(0)).enumerate() {
            let attended = self.self_attention(tokens);
            let mid = self.norm_attn.forward_rows((&tokens + &attended).view());

            let hidden = self.ffn_in.forward_rows(mid.view()).mapv(|v| v.max(0.0));
            let ff = self.ffn_out.forward_rows(hidden.view());
            let out = self.norm_ffn.forward_rows((&mid + &ff).view());

            let scores = self.aggregate.forward_rows(out.view()).column(0).to_owned();
            dynamic_weights.row_mut(b).assign(&softmax(scores.view()));
            refined.index_axis_mut(Axis(0), b).assign(&out);
        }

        ensure_finite(Component::CrossTrackFusion, &refined)?;
        ensure_finite(Component::CrossTrackFusion, &dynamic_weights)?;
        Ok(FusionOutput {
            refined,
            dynamic_weights,
        })
    }

    /// Scaled dot-product attention among the tokens of one batch row.
    fn self_attention(&self, tokens: ArrayView2<f64>) -> Array2<f64> {
        let width = tokens.ncols();
        let head_dim = width / self.heads;
        let scale = 1.0 / (head_dim as f64).sqrt();

        let q = self.query.forward_rows(tokens);
        let k = self.key.forward_rows(tokens);
        let v = self.value.forward_rows(tokens);

        let mut context = Array2::zeros((tokens.nrows(), width));
        for h in 0..self.heads {
            let (lo, hi) = (h * head_dim, (h + 1) * head_dim);
            let scores = q.slice(s![.., lo..hi]).dot(&k.slice(s![.., lo..hi]).t()) * scale;
            let mut attn = Array2::zeros(scores.raw_dim());
            for (src, mut dst) in scores.axis_iter(Axis(0)).zip(attn.axis_iter_mut(Axis(0))) {
                dst.assign(&softmax(src));
            }
            context
                .slice_mut(s![.., lo..hi])
                .assign(&attn.dot(&v.slice(s![.., lo..hi])));
        }
        self.attn_out.forward_rows(context.view())
    }
}

/// `fused[b] = Σ_k weights[b, k] · refined[b, k, :]`, the only place the
/// refined track tokens are combined.
pub fn weighted_sum(refined: ArrayView3<f64>, weights: ArrayView2<f64>) -> Array2<f64> {
    let (batch, _, width) = refined.dim();
    let mut fused = Array2::zeros((batch, width));
    for ((tokens, w), mut dst) in refined
        .axis_iter(Axis(0))
        .zip(weights.axis_iter(Axis(0)))
        .zip(fused.axis_iter_mut(Axis(0)))
    {
        dst.assign(&tokens.t().dot(&w));
    }
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;
    use rand::SeedableRng;

    fn fusion() -> CrossTrackFusion {
        CrossTrackFusion::new(8, 2, 2, &mut StdRng::seed_from_u64(17))
    }

    fn summaries(batch: usize) -> Array3<f64> {
        Array::from_shape_fn((batch, TRACK_COUNT, 8), |(b, k, d)| {
            ((b * 31 + k * 7 + d) as f64 * 0.37).sin()
        })
    }

    #[test]
    fn dynamic_weights_form_a_distribution() {
        let out = fusion().forward(summaries(3).view()).unwrap();
        assert_eq!(out.refined.dim(), (3, TRACK_COUNT, 8));
        assert_eq!(out.dynamic_weights.dim(), (3, TRACK_COUNT));
        for row in out.dynamic_weights.axis_iter(Axis(0)) {
            assert!((row.sum() - 1.0).abs() < 1e-6);
            assert!(row.iter().all(|&w| w >= 0.0));
        }
    }

    #[test]
    fn batch_rows_do_not_interact() {
        let f = fusion();
        let joint = f.forward(summaries(2).view()).unwrap();
        let second = summaries(2).slice(s![1..2, .., ..]).to_owned();
        let solo = f.forward(second.view()).unwrap();
        for (a, b) in joint
            .dynamic_weights
            .row(1)
            .iter()
            .zip(solo.dynamic_weights.row(0).iter())
        {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn wrong_track_count_is_rejected() {
        let err = fusion().forward(Array3::zeros((1, 4, 8)).view()).unwrap_err();
        assert!(matches!(err, EngineError::ShapeMismatch { .. }));
    }

    #[test]
    fn non_finite_summary_names_fusion() {
        let mut input = summaries(1);
        input[[0, 2, 5]] = f64::NAN;
        let err = fusion().forward(input.view()).unwrap_err();
        assert_eq!(
            err,
            EngineError::NonFinite {
                component: Component::CrossTrackFusion
            }
        );
    }

    #[test]
    fn weighted_sum_uses_each_row_weights() {
        let refined = Array::from_shape_fn((1, TRACK_COUNT, 2), |(_, k, d)| (k * 2 + d) as f64);
        let weights = ndarray::array![[0.0, 0.0, 1.0, 0.0, 0.0]];
        let fused = weighted_sum(refined.view(), weights.view());
        assert_eq!(fused, ndarray::array![[4.0, 5.0]]);
    }
}
