// =============================================================================
// Mode-Specific Reweighting — gated blend of static and dynamic track weights
// =============================================================================
//
// The fusion stage produces a dynamic per-track distribution; a trading mode
// may also carry a static preference profile. The two are combined exactly
// once, never multiplied:
//
//   raw    = gate * dynamic + (1 - gate) * static        (one scalar per row)
//   capped = capped renormalization of raw at `ceiling`
//   final  = minimal mix of capped with uniform reaching `entropy_floor`
//
// `blend_weights` is the single place this arithmetic lives. The limits are
// enforced, not merely expected; breaches of the raw blend are reported back
// so the engine can log them as model-quality signals.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::layers::{entropy, ensure_finite, sigmoid, Linear};
use crate::error::{Component, EngineError, EngineResult};
use crate::runtime_config::{ReweightMode, ReweightParams};
use crate::types::TRACK_COUNT;

/// Blend ratio used by the non-gated fallback.
const RENORMALIZED_GATE: f64 = 0.5;

/// Bisection iterations when searching the uniform-mix coefficient.
const ENTROPY_SEARCH_STEPS: usize = 60;

/// Slack granted to floating-point error when comparing against the limits.
const LIMIT_SLACK: f64 = 1e-9;

/// Normalization limits applied to every final weight vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightLimits {
    pub ceiling: f64,
    pub entropy_floor: f64,
}

impl WeightLimits {
    pub fn from_params(params: &ReweightParams) -> Self {
        Self {
            ceiling: params.weight_ceiling,
            entropy_floor: params.entropy_floor,
        }
    }
}

/// Everything the reweighting stage needs, resolved once from configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReweightPlan {
    pub mode: ReweightMode,
    pub profile: [f64; TRACK_COUNT],
    pub limits: WeightLimits,
}

impl ReweightPlan {
    pub fn from_params(params: &ReweightParams) -> EngineResult<Self> {
        let profile = params.active().ok_or_else(|| {
            EngineError::InvalidConfig(format!(
                "active profile {:?} is not defined",
                params.active_profile
            ))
        })?;
        Ok(Self {
            mode: params.mode,
            profile,
            limits: WeightLimits::from_params(params),
        })
    }
}

/// Result of one blend.
#[derive(Debug, Clone, PartialEq)]
pub struct BlendOutcome {
    pub weights: Array1<f64>,
    /// Raw blend's largest entry exceeded the ceiling.
    pub ceiling_breached: bool,
    /// Raw blend's entropy fell below the floor.
    pub entropy_breached: bool,
}

/// Combine a dynamic and a static distribution through a scalar gate and
/// enforce the limits. Both inputs are clipped at zero and renormalized first.
pub fn blend_weights(
    dynamic: ArrayView1<f64>,
    profile: ArrayView1<f64>,
    gate: f64,
    limits: WeightLimits,
) -> BlendOutcome {
    let gate = gate.clamp(0.0, 1.0);
    let raw = normalize(&(normalize(&dynamic.to_owned()) * gate + normalize(&profile.to_owned()) * (1.0 - gate)));

    let max = raw.fold(0.0_f64, |m, &v| m.max(v));
    let ceiling_breached = max > limits.ceiling + LIMIT_SLACK;
    let entropy_breached = entropy(raw.view()) < limits.entropy_floor - LIMIT_SLACK;

    let capped = cap_weights(raw, limits.ceiling);
    let weights = lift_entropy(capped, limits.entropy_floor);

    BlendOutcome {
        weights,
        ceiling_breached,
        entropy_breached,
    }
}

/// Scale to unit sum; an all-zero or non-finite input becomes uniform.
fn normalize(w: &Array1<f64>) -> Array1<f64> {
    let n = w.len();
    let clipped = w.mapv(|v| if v.is_finite() { v.max(0.0) } else { 0.0 });
    let sum = clipped.sum();
    if sum > 0.0 {
        clipped / sum
    } else {
        Array1::from_elem(n, 1.0 / n as f64)
    }
}

/// Capped renormalization: clamp entries above `ceiling` and hand the excess
/// to the uncapped entries in proportion to their mass, repeating until no
/// entry exceeds the ceiling. Requires `ceiling * n >= 1`.
fn cap_weights(mut w: Array1<f64>, ceiling: f64) -> Array1<f64> {
    let n = w.len();
    let mut capped = vec![false; n];
    for _ in 0..n {
        let excess: f64 = w
            .iter()
            .zip(capped.iter_mut())
            .map(|(&v, is_capped)| {
                if !*is_capped && v > ceiling {
                    *is_capped = true;
                    v - ceiling
                } else {
                    0.0
                }
            })
            .sum();
        if excess <= 0.0 {
            break;
        }
        for (v, &is_capped) in w.iter_mut().zip(capped.iter()) {
            if is_capped {
                *v = ceiling;
            }
        }
        let free_mass: f64 = w
            .iter()
            .zip(capped.iter())
            .filter(|(_, &c)| !c)
            .map(|(&v, _)| v)
            .sum();
        let free_count = capped.iter().filter(|&&c| !c).count();
        if free_count == 0 {
            break;
        }
        for (v, &is_capped) in w.iter_mut().zip(capped.iter()) {
            if !is_capped {
                *v += if free_mass > 0.0 {
                    excess * *v / free_mass
                } else {
                    excess / free_count as f64
                };
            }
        }
    }
    w
}

/// Smallest mix `(1-λ)·w + λ·uniform` whose entropy reaches `floor`.
/// Entropy is non-decreasing along that segment, so bisection is exact
/// enough; mixing toward uniform never raises the maximum entry.
fn lift_entropy(w: Array1<f64>, floor: f64) -> Array1<f64> {
    if entropy(w.view()) >= floor {
        return w;
    }
    let n = w.len();
    let uniform = Array1::from_elem(n, 1.0 / n as f64);
    let mix = |lambda: f64| &w * (1.0 - lambda) + &uniform * lambda;

    let (mut lo, mut hi) = (0.0_f64, 1.0_f64);
    for _ in 0..ENTROPY_SEARCH_STEPS {
        let mid = 0.5 * (lo + hi);
        if entropy(mix(mid).view()) >= floor {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    mix(hi)
}

// =============================================================================
// ModeReweighter — the learned gate and strategy selection
// =============================================================================

/// Final per-track weights for a batch plus what produced them.
#[derive(Debug, Clone)]
pub struct ReweightOutput {
    /// `[B, 5]`, each row non-negative and summing to one.
    pub weights: Array2<f64>,
    /// Gate value per row (1.0 when reweighting is disabled).
    pub gates: Array1<f64>,
    pub ceiling_breaches: usize,
    pub entropy_breaches: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeReweighter {
    /// Scalar gate from the dynamically fused vector.
    gate: Linear,
}

impl ModeReweighter {
    pub fn new(model_width: usize, rng: &mut StdRng) -> Self {
        Self {
            gate: Linear::new(model_width, 1, rng),
        }
    }

    pub fn model_width(&self) -> usize {
        self.gate.in_features()
    }

    /// Gate value in (0, 1) for one dynamically fused vector.
    pub fn gate(&self, fused: ArrayView1<f64>) -> f64 {
        sigmoid(self.gate.forward(fused)[0])
    }

    /// Produce final weights for each batch row.
    ///
    /// `dynamic` is `[B, 5]`, `fused_dynamic` is `[B, D]` (the summaries
    /// weighted by `dynamic`), `profile` is the validated static profile.
    pub fn reweight(
        &self,
        plan: &ReweightPlan,
        dynamic: ArrayView2<f64>,
        fused_dynamic: ArrayView2<f64>,
    ) -> EngineResult<ReweightOutput> {
        let batch = dynamic.nrows();
        if dynamic.ncols() != TRACK_COUNT || fused_dynamic.nrows() != batch {
            return Err(EngineError::shape(
                "reweighting input",
                (batch, TRACK_COUNT),
                dynamic.dim(),
            ));
        }
        let profile = ArrayView1::from(&plan.profile[..]);

        let mut weights = Array2::zeros((batch, TRACK_COUNT));
        let mut gates = Array1::zeros(batch);
        let mut ceiling_breaches = 0;
        let mut entropy_breaches = 0;

        for (b, dyn_row) in dynamic.axis_iter(Axis(0)).enumerate() {
            let gate = match plan.mode {
                ReweightMode::Disabled => 1.0,
                ReweightMode::Gated => self.gate(fused_dynamic.row(b)),
                ReweightMode::Renormalized => RENORMALIZED_GATE,
            };
            let outcome = blend_weights(dyn_row, profile, gate, plan.limits);
            ceiling_breaches += usize::from(outcome.ceiling_breached);
            entropy_breaches += usize::from(outcome.entropy_breached);
            weights.row_mut(b).assign(&outcome.weights);
            gates[b] = gate;
        }

        ensure_finite(Component::ModeReweighting, &weights)?;
        Ok(ReweightOutput {
            weights,
            gates,
            ceiling_breaches,
            entropy_breaches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    const LIMITS: WeightLimits = WeightLimits {
        ceiling: 0.6,
        entropy_floor: 1.0,
    };

    fn assert_distribution(w: &Array1<f64>) {
        assert!((w.sum() - 1.0).abs() < 1e-6, "sum {}", w.sum());
        assert!(w.iter().all(|&v| v >= 0.0), "negative entry in {w}");
    }

    #[test]
    fn adversarial_agreement_is_capped() {
        let peaked = array![0.9, 0.025, 0.025, 0.025, 0.025];
        for gate in [0.0, 0.3, 0.5, 0.8, 1.0] {
            let out = blend_weights(peaked.view(), peaked.view(), gate, LIMITS);
            assert_distribution(&out.weights);
            let max = out.weights.fold(0.0_f64, |m, &v| m.max(v));
            assert!(max <= 0.6 + 1e-9, "gate {gate}: max {max}");
            assert!(entropy(out.weights.view()) >= 1.0 - 1e-9);
            assert!(out.ceiling_breached);
        }
    }

    #[test]
    fn no_double_weighting_versus_naive_product() {
        let dynamic = array![0.5, 0.2, 0.1, 0.1, 0.1];
        let profile = array![0.5, 0.2, 0.1, 0.1, 0.1];
        let naive = normalize(&(&dynamic * &profile));
        let out = blend_weights(dynamic.view(), profile.view(), 0.5, LIMITS);
        // The naive product concentrates on track 0; the blend does not.
        assert!(naive[0] > 0.75);
        assert!((out.weights[0] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn random_pairs_respect_limits() {
        use rand::Rng;
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..500 {
            let a = Array1::from_iter((0..5).map(|_| rng.gen::<f64>().powi(4)));
            let b = Array1::from_iter((0..5).map(|_| rng.gen::<f64>().powi(4)));
            let gate = rng.gen::<f64>();
            let out = blend_weights(a.view(), b.view(), gate, LIMITS);
            assert_distribution(&out.weights);
            assert!(out.weights.iter().all(|&v| v <= 0.6 + 1e-9));
            assert!(entropy(out.weights.view()) >= 1.0 - 1e-9);
        }
    }

    #[test]
    fn gate_extremes_select_one_source_when_within_limits() {
        let dynamic = array![0.3, 0.2, 0.2, 0.2, 0.1];
        let profile = array![0.1, 0.2, 0.2, 0.2, 0.3];
        let all_dynamic = blend_weights(dynamic.view(), profile.view(), 1.0, LIMITS);
        let all_static = blend_weights(dynamic.view(), profile.view(), 0.0, LIMITS);
        for i in 0..5 {
            assert!((all_dynamic.weights[i] - dynamic[i]).abs() < 1e-12);
            assert!((all_static.weights[i] - profile[i]).abs() < 1e-12);
        }
        assert!(!all_dynamic.ceiling_breached && !all_dynamic.entropy_breached);
    }

    #[test]
    fn entropy_floor_lifts_a_spike() {
        let limits = WeightLimits {
            ceiling: 1.0,
            entropy_floor: 1.2,
        };
        let spike = array![1.0, 0.0, 0.0, 0.0, 0.0];
        let out = blend_weights(spike.view(), spike.view(), 0.5, limits);
        assert_distribution(&out.weights);
        let h = entropy(out.weights.view());
        assert!(h >= 1.2 - 1e-9 && h < 1.2 + 1e-3, "entropy {h}");
        assert!(out.entropy_breached);
        assert!(!out.ceiling_breached);
    }

    #[test]
    fn cap_redistributes_proportionally() {
        let w = cap_weights(array![0.7, 0.2, 0.1, 0.0, 0.0], 0.5);
        assert!((w[0] - 0.5).abs() < 1e-12);
        assert!((w[1] - 0.2 - 0.2 * 2.0 / 3.0).abs() < 1e-12);
        assert!((w[2] - 0.1 - 0.2 / 3.0).abs() < 1e-12);
        assert_eq!(w[3], 0.0);
    }

    #[test]
    fn cap_cascades_when_redistribution_overflows() {
        let w = cap_weights(array![0.55, 0.44, 0.01, 0.0, 0.0], 0.3);
        assert!(w.iter().all(|&v| v <= 0.3 + 1e-12), "{w}");
        assert!((w.sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn reweighter_modes_keep_the_contract_shape() {
        let mut rng = StdRng::seed_from_u64(4);
        let rw = ModeReweighter::new(6, &mut rng);
        let dynamic = array![[0.4, 0.3, 0.1, 0.1, 0.1], [0.2, 0.2, 0.2, 0.2, 0.2]];
        let fused = Array2::from_elem((2, 6), 0.5);
        let profile = [0.05, 0.1, 0.2, 0.3, 0.35];

        for mode in [ReweightMode::Disabled, ReweightMode::Gated, ReweightMode::Renormalized] {
            let plan = ReweightPlan {
                mode,
                profile,
                limits: LIMITS,
            };
            let out = rw.reweight(&plan, dynamic.view(), fused.view()).unwrap();
            assert_eq!(out.weights.dim(), (2, 5));
            for row in out.weights.axis_iter(Axis(0)) {
                assert!((row.sum() - 1.0).abs() < 1e-6);
            }
            match mode {
                ReweightMode::Disabled => {
                    assert_eq!(out.gates[0], 1.0);
                    assert!((out.weights[[0, 0]] - 0.4).abs() < 1e-12);
                }
                ReweightMode::Renormalized => assert_eq!(out.gates[1], 0.5),
                ReweightMode::Gated => assert!(out.gates[0] > 0.0 && out.gates[0] < 1.0),
            }
        }
    }

    #[test]
    fn plan_requires_a_defined_profile() {
        let mut params = ReweightParams::default();
        assert!(ReweightPlan::from_params(&params).is_ok());
        params.active_profile = "missing".into();
        assert!(matches!(
            ReweightPlan::from_params(&params),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn reweighter_rejects_bad_shape() {
        let rw = ModeReweighter::new(4, &mut StdRng::seed_from_u64(1));
        let dynamic = Array2::from_elem((1, 4), 0.25);
        let fused = Array2::zeros((1, 4));
        let plan = ReweightPlan {
            mode: ReweightMode::Gated,
            profile: [0.2; 5],
            limits: LIMITS,
        };
        let err = rw.reweight(&plan, dynamic.view(), fused.view()).unwrap_err();
        assert!(matches!(err, EngineError::ShapeMismatch { .. }));
    }
}
