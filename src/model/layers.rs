// =============================================================================
// Dense building blocks — linear projection, layer norm, softmax
// =============================================================================

use ndarray::{Array1, Array2, ArrayBase, ArrayView1, ArrayView2, Axis, Data, Dimension};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::error::{Component, EngineError, EngineResult};

/// Spread below which a score vector is treated as all-equal.
const DEGENERATE_SPREAD: f64 = 1e-12;

/// Affine projection `y = W x + b`, weight stored `[out, in]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Linear {
    weight: Array2<f64>,
    bias: Array1<f64>,
}

impl Linear {
    /// Xavier-uniform weights, zero bias.
    pub fn new(in_features: usize, out_features: usize, rng: &mut StdRng) -> Self {
        let bound = (6.0 / (in_features + out_features) as f64).sqrt();
        Self {
            weight: Array2::random_using(
                (out_features, in_features),
                Uniform::new(-bound, bound),
                rng,
            ),
            bias: Array1::zeros(out_features),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn forward(&self, x: ArrayView1<f64>) -> Array1<f64> {
        self.weight.dot(&x) + &self.bias
    }

    /// Row-wise projection of `[rows, in]` into `[rows, out]`.
    pub fn forward_rows(&self, x: ArrayView2<f64>) -> Array2<f64> {
        x.dot(&self.weight.t()) + &self.bias
    }
}

/// Layer normalization over the last axis with learned scale and shift.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerNorm {
    gamma: Array1<f64>,
    beta: Array1<f64>,
    eps: f64,
}

impl LayerNorm {
    pub fn new(features: usize) -> Self {
        Self {
            gamma: Array1::ones(features),
            beta: Array1::zeros(features),
            eps: 1e-5,
        }
    }

    pub fn features(&self) -> usize {
        self.gamma.len()
    }

    pub fn forward(&self, x: ArrayView1<f64>) -> Array1<f64> {
        let n = x.len() as f64;
        let mean = x.sum() / n;
        let var = x.fold(0.0, |acc, v| acc + (v - mean) * (v - mean)) / n;
        let inv_std = 1.0 / (var + self.eps).sqrt();
        x.mapv(|v| (v - mean) * inv_std) * &self.gamma + &self.beta
    }

    pub fn forward_rows(&self, x: ArrayView2<f64>) -> Array2<f64> {
        let mut out = Array2::zeros(x.raw_dim());
        for (row, mut dst) in x.axis_iter(Axis(0)).zip(out.axis_iter_mut(Axis(0))) {
            dst.assign(&self.forward(row));
        }
        out
    }
}

#[inline]
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Inverse of [`sigmoid`] for `p` in (0, 1).
#[inline]
pub fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

/// Numerically stable softmax.
///
/// All-equal scores, and any case where the exponent sum is not a usable
/// positive number, yield the uniform distribution instead of NaN.
pub fn softmax(scores: ArrayView1<f64>) -> Array1<f64> {
    let n = scores.len();
    if n == 0 {
        return Array1::zeros(0);
    }
    let uniform = || Array1::from_elem(n, 1.0 / n as f64);

    let max = scores.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
    let min = scores.fold(f64::INFINITY, |m, &v| m.min(v));
    if !max.is_finite() || !min.is_finite() || max - min < DEGENERATE_SPREAD {
        return uniform();
    }

    let exps = scores.mapv(|v| (v - max).exp());
    let sum = exps.sum();
    if !(sum.is_finite() && sum > 0.0) {
        return uniform();
    }
    exps / sum
}

/// Shannon entropy in nats; `0 * ln 0 := 0`.
pub fn entropy(p: ArrayView1<f64>) -> f64 {
    p.iter()
        .filter(|&&v| v > 0.0)
        .map(|&v| -v * v.ln())
        .sum()
}

/// Fail with the component's identity if any element is NaN or infinite.
pub fn ensure_finite<S, D>(component: Component, values: &ArrayBase<S, D>) -> EngineResult<()>
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(EngineError::NonFinite { component })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn linear_shapes() {
        let mut rng = StdRng::seed_from_u64(1);
        let lin = Linear::new(4, 3, &mut rng);
        assert_eq!(lin.in_features(), 4);
        assert_eq!(lin.out_features(), 3);
        let y = lin.forward(array![1.0, 2.0, 3.0, 4.0].view());
        assert_eq!(y.len(), 3);
        let rows = lin.forward_rows(Array2::ones((5, 4)).view());
        assert_eq!(rows.dim(), (5, 3));
        for r in rows.axis_iter(Axis(0)) {
            assert!((r[0] - rows[[0, 0]]).abs() < 1e-12);
        }
    }

    #[test]
    fn linear_is_deterministic_for_a_seed() {
        let a = Linear::new(8, 8, &mut StdRng::seed_from_u64(7));
        let b = Linear::new(8, 8, &mut StdRng::seed_from_u64(7));
        assert_eq!(a.weight, b.weight);
    }

    #[test]
    fn layer_norm_centres_and_scales() {
        let ln = LayerNorm::new(4);
        let y = ln.forward(array![1.0, 2.0, 3.0, 4.0].view());
        assert!(y.sum().abs() < 1e-9);
        let var = y.mapv(|v| v * v).sum() / 4.0;
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn softmax_sums_to_one() {
        let p = softmax(array![0.1, -3.0, 2.5, 7.0].view());
        assert!((p.sum() - 1.0).abs() < 1e-12);
        assert!(p.iter().all(|&v| v >= 0.0));
        assert!(p[3] > p[2]);
    }

    #[test]
    fn softmax_degenerate_is_uniform() {
        let p = softmax(array![3.0, 3.0, 3.0, 3.0].view());
        for v in p.iter() {
            assert!((v - 0.25).abs() < 1e-15);
        }
    }

    #[test]
    fn softmax_handles_huge_scores() {
        let p = softmax(array![1e300, -1e300, 0.0].view());
        assert!(p.iter().all(|v| v.is_finite()));
        assert!((p.sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn sigmoid_and_logit_are_inverse() {
        for p in [0.01, 0.3, 0.5, 0.98] {
            assert!((sigmoid(logit(p)) - p).abs() < 1e-12);
        }
        assert!(sigmoid(-800.0) >= 0.0);
        assert!(sigmoid(800.0) <= 1.0);
    }

    #[test]
    fn entropy_of_uniform_is_ln_n() {
        let h = entropy(array![0.2, 0.2, 0.2, 0.2, 0.2].view());
        assert!((h - 5f64.ln()).abs() < 1e-12);
        assert_eq!(entropy(array![1.0, 0.0].view()), 0.0);
    }

    #[test]
    fn ensure_finite_reports_component() {
        let bad = array![1.0, f64::NAN];
        let err = ensure_finite(Component::OutputHeads, &bad).unwrap_err();
        assert_eq!(
            err,
            EngineError::NonFinite {
                component: Component::OutputHeads
            }
        );
        assert!(ensure_finite(Component::OutputHeads, &array![1.0, 2.0]).is_ok());
    }
}
