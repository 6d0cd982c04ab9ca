// =============================================================================
// Intra-Track Attention Pool
// =============================================================================
//
// Collapses a track's hidden sequence `[B, L, D]` into one summary `[B, D]`.
// Each head owns a learned query that attends over all L steps, so a pattern
// may occupy any contiguous or scattered sub-span of the window without a
// hand-picked sub-window length. Head contexts are concatenated and projected
// back to D.
//
// The diagnostic weight vector is the mean of the per-head distributions, so
// it is non-negative and sums to one exactly when every head's does.

use ndarray::{s, Array1, Array2, ArrayView3, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::layers::{ensure_finite, softmax, Linear};
use crate::error::{Component, EngineError, EngineResult};
use crate::types::TrackId;

/// Summary vector plus the attention distribution that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolOutput {
    /// `[B, D]`
    pub summary: Array2<f64>,
    /// `[B, L]`, diagnostics only.
    pub weights: Array2<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionPool {
    heads: usize,
    /// One learned query per head, `[heads, head_dim]`.
    queries: Array2<f64>,
    key: Linear,
    value: Linear,
    out: Linear,
}

impl AttentionPool {
    pub fn new(model_width: usize, heads: usize, rng: &mut StdRng) -> Self {
        let head_dim = model_width / heads;
        let bound = (1.0 / head_dim as f64).sqrt();
        Self {
            heads,
            queries: Array2::random_using((heads, head_dim), Uniform::new(-bound, bound), rng),
            key: Linear::new(model_width, model_width, rng),
            value: Linear::new(model_width, model_width, rng),
            out: Linear::new(model_width, model_width, rng),
        }
    }

    pub fn heads(&self) -> usize {
        self.heads
    }

    pub fn model_width(&self) -> usize {
        self.key.in_features()
    }

    fn head_dim(&self) -> usize {
        self.queries.ncols()
    }

    pub fn forward(&self, track: TrackId, hidden: ArrayView3<f64>) -> EngineResult<PoolOutput> {
        let component = Component::AttentionPool(track);
        let (batch, len, width) = hidden.dim();
        if width != self.model_width() || len == 0 {
            return Err(EngineError::ShapeMismatch {
                what: format!("{track} pool input"),
                expected: format!("[{batch}, >=1, {}]", self.model_width()),
                found: format!("[{batch}, {len}, {width}]"),
            });
        }
        ensure_finite(component, &hidden)?;

        let head_dim = self.head_dim();
        let scale = 1.0 / (head_dim as f64).sqrt();

        let mut summary = Array2::zeros((batch, width));
        let mut weights = Array2::zeros((batch, len));

        for (b, steps) in hidden.axis_iter(Axis(0)).enumerate() {
            let keys = self.key.forward_rows(steps);
            let values = self.value.forward_rows(steps);

            let mut context = Array1::zeros(width);
            let mut mean_alpha = Array1::<f64>::zeros(len);
            for h in 0..self.heads {
                let (lo, hi) = (h * head_dim, (h + 1) * head_dim);
                let scores = keys.slice(s![.., lo..hi]).dot(&self.queries.row(h)) * scale;
                let alpha = softmax(scores.view());
                context
                    .slice_mut(s![lo..hi])
                    .assign(&values.slice(s![.., lo..hi]).t().dot(&alpha));
                mean_alpha += &alpha;
            }
            mean_alpha /= self.heads as f64;

            summary.row_mut(b).assign(&self.out.forward(context.view()));
            weights.row_mut(b).assign(&mean_alpha);
        }

        ensure_finite(component, &summary)?;
        Ok(PoolOutput { summary, weights })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, Array3};
    use rand::SeedableRng;

    fn pool(width: usize, heads: usize) -> AttentionPool {
        AttentionPool::new(width, heads, &mut StdRng::seed_from_u64(21))
    }

    fn wavy(batch: usize, len: usize, width: usize) -> Array3<f64> {
        Array::from_shape_fn((batch, len, width), |(b, t, d)| {
            ((t * (d + 1)) as f64 * 0.13 + b as f64).cos() * 2.0
        })
    }

    #[test]
    fn weights_sum_to_one_and_are_non_negative() {
        let p = pool(8, 2);
        let out = p.forward(TrackId::M15, wavy(3, 50, 8).view()).unwrap();
        assert_eq!(out.summary.dim(), (3, 8));
        assert_eq!(out.weights.dim(), (3, 50));
        for row in out.weights.axis_iter(Axis(0)) {
            assert!((row.sum() - 1.0).abs() < 1e-6);
            assert!(row.iter().all(|&w| w >= 0.0));
        }
    }

    #[test]
    fn identical_steps_give_uniform_weights() {
        let p = pool(8, 4);
        let step = Array::from_shape_fn(8, |d| d as f64 - 3.5);
        let mut hidden = Array3::zeros((2, 40, 8));
        for mut s in hidden.axis_iter_mut(Axis(1)) {
            for mut row in s.axis_iter_mut(Axis(0)) {
                row.assign(&step);
            }
        }
        let out = p.forward(TrackId::H1, hidden.view()).unwrap();
        for w in out.weights.iter() {
            assert!(w.is_finite());
            assert!((w - 1.0 / 40.0).abs() < 1e-9, "weight {w}");
        }
    }

    #[test]
    fn all_zero_input_gives_uniform_weights() {
        let p = pool(8, 2);
        let out = p.forward(TrackId::M1, Array3::zeros((1, 7, 8)).view()).unwrap();
        for w in out.weights.iter() {
            assert!((w - 1.0 / 7.0).abs() < 1e-12);
        }
    }

    #[test]
    fn single_step_window_gets_full_weight() {
        let p = pool(8, 2);
        let out = p.forward(TrackId::H4, wavy(1, 1, 8).view()).unwrap();
        assert!((out.weights[[0, 0]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn width_mismatch_is_rejected() {
        let p = pool(8, 2);
        let err = p.forward(TrackId::M5, wavy(1, 5, 6).view()).unwrap_err();
        assert!(matches!(err, EngineError::ShapeMismatch { .. }));
    }

    #[test]
    fn non_finite_hidden_is_fatal() {
        let p = pool(8, 2);
        let mut hidden = wavy(1, 5, 8);
        hidden[[0, 3, 3]] = f64::INFINITY;
        let err = p.forward(TrackId::M5, hidden.view()).unwrap_err();
        assert_eq!(
            err,
            EngineError::NonFinite {
                component: Component::AttentionPool(TrackId::M5)
            }
        );
    }

    #[test]
    fn a_standout_step_draws_attention_on_some_head() {
        let p = pool(8, 1);
        let mut hidden = Array3::zeros((1, 30, 8));
        hidden.slice_mut(s![0, 17, ..]).fill(3.0);
        let out = p.forward(TrackId::M1, hidden.view()).unwrap();
        let w17 = out.weights[[0, 17]];
        let others = out.weights[[0, 0]];
        assert!((w17 - others).abs() > 1e-6, "standout step weighted like background");
    }
}
