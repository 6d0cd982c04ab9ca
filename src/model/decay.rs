// =============================================================================
// Freshness Decay — position-dependent down-weighting of older steps
// =============================================================================
//
// In a long window, many near-duplicate old bars can outweigh a short recent
// pattern purely by count. Each hidden step is scaled by a weight that never
// decreases toward the newest position:
//
//   exponential:  w(t) = rate^(L-1-t)
//   linear:       w(t) = (t+1)/L
//
// The newest step always has weight 1 and a window of length 1 is untouched.
// The rate only shapes the exponential form. It is a learned parameter held
// as a logit so it stays inside (0, 1) whatever value training writes into it.

use ndarray::{Array1, Array3, Axis};
use serde::{Deserialize, Serialize};

use super::layers::{logit, sigmoid};
use crate::runtime_config::DecayMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreshnessDecay {
    mode: DecayMode,
    rate_logit: f64,
}

impl FreshnessDecay {
    /// `initial_rate` must lie strictly inside (0, 1); the config validator
    /// guarantees this for engine-built instances.
    pub fn new(mode: DecayMode, initial_rate: f64) -> Self {
        Self {
            mode,
            rate_logit: logit(initial_rate),
        }
    }

    pub fn mode(&self) -> DecayMode {
        self.mode
    }

    pub fn rate(&self) -> f64 {
        sigmoid(self.rate_logit)
    }

    /// Weight for `position` (0 = oldest) inside a window of `len` steps.
    pub fn weight(&self, position: usize, len: usize) -> f64 {
        if len <= 1 {
            return 1.0;
        }
        let position = position.min(len - 1);
        match self.mode {
            DecayMode::Exponential => self.rate().powi((len - 1 - position) as i32),
            DecayMode::Linear => (position + 1) as f64 / len as f64,
        }
    }

    pub fn weights(&self, len: usize) -> Array1<f64> {
        Array1::from_iter((0..len).map(|t| self.weight(t, len)))
    }

    /// Scale a hidden sequence `[B, L, D]` in place along the time axis.
    pub fn apply(&self, hidden: &mut Array3<f64>) {
        let len = hidden.len_of(Axis(1));
        if len <= 1 {
            return;
        }
        let weights = self.weights(len);
        for (t, mut step) in hidden.axis_iter_mut(Axis(1)).enumerate() {
            step *= weights[t];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tail_mass(w: &Array1<f64>, newest: bool) -> f64 {
        let n = (w.len() / 10).max(1);
        if newest {
            w.iter().rev().take(n).sum()
        } else {
            w.iter().take(n).sum()
        }
    }

    #[test]
    fn newest_exceeds_oldest_for_valid_rates() {
        for mode in [DecayMode::Exponential, DecayMode::Linear] {
            for rate in [0.05, 0.5, 0.9, 0.995] {
                let decay = FreshnessDecay::new(mode, rate);
                for len in [2, 48, 288, 480] {
                    let w = decay.weights(len);
                    assert!(
                        w[len - 1] > w[0],
                        "{mode:?} rate={rate} len={len}: newest {} <= oldest {}",
                        w[len - 1],
                        w[0]
                    );
                }
            }
        }
    }

    #[test]
    fn weights_are_monotone_in_recency() {
        for mode in [DecayMode::Exponential, DecayMode::Linear] {
            let w = FreshnessDecay::new(mode, 0.9).weights(96);
            assert!(w.windows(2).into_iter().all(|p| p[1] >= p[0]));
            assert!((w[95] - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn recent_decile_outweighs_oldest_decile() {
        for mode in [DecayMode::Exponential, DecayMode::Linear] {
            for rate in [0.3, 0.98] {
                let w = FreshnessDecay::new(mode, rate).weights(288);
                assert!(tail_mass(&w, true) > tail_mass(&w, false));
            }
        }
    }

    #[test]
    fn single_step_window_is_identity() {
        for mode in [DecayMode::Exponential, DecayMode::Linear] {
            let decay = FreshnessDecay::new(mode, 0.2);
            assert_eq!(decay.weight(0, 1), 1.0);
            let mut hidden = Array3::from_elem((2, 1, 3), 4.5);
            let before = hidden.clone();
            decay.apply(&mut hidden);
            assert_eq!(hidden, before);
        }
    }

    #[test]
    fn linear_is_the_position_ratio_for_any_rate() {
        for rate in [0.1, 0.98] {
            let w = FreshnessDecay::new(DecayMode::Linear, rate).weights(4);
            for (t, v) in w.iter().enumerate() {
                assert!((v - (t + 1) as f64 / 4.0).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn apply_scales_each_time_step() {
        let decay = FreshnessDecay::new(DecayMode::Exponential, 0.5);
        let mut hidden = Array3::ones((1, 3, 2));
        decay.apply(&mut hidden);
        assert!((hidden[[0, 0, 1]] - 0.25).abs() < 1e-12);
        assert!((hidden[[0, 1, 0]] - 0.5).abs() < 1e-12);
        assert!((hidden[[0, 2, 0]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn rate_roundtrips_through_logit() {
        let decay = FreshnessDecay::new(DecayMode::Exponential, 0.98);
        assert!((decay.rate() - 0.98).abs() < 1e-12);
        assert_eq!(decay.mode(), DecayMode::Exponential);
    }
}
