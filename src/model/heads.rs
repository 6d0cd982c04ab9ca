// =============================================================================
// Output Heads
// =============================================================================
//
// Thin projections of the fused decision vector:
//   direction  softmax over DOWN / NEUTRAL / UP
//   magnitude  0.5 + 4.5·σ(x) pips, one value per configured output
//   trend      σ(x) in [0, 1]

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::layers::{ensure_finite, sigmoid, softmax, Linear};
use crate::error::{Component, EngineError, EngineResult};
use crate::types::DirectionClass;

const MAGNITUDE_FLOOR_PIPS: f64 = 0.5;
const MAGNITUDE_SPAN_PIPS: f64 = 4.5;

/// Raw head outputs for a batch.
#[derive(Debug, Clone)]
pub struct HeadOutput {
    /// `[B, 3]`
    pub direction: Array2<f64>,
    /// `[B, M]`
    pub magnitude: Array2<f64>,
    /// `[B]`
    pub trend: Array1<f64>,
}

impl HeadOutput {
    pub fn direction_class(&self, row: usize) -> DirectionClass {
        let probs = self.direction.row(row);
        let (idx, _) = probs
            .iter()
            .enumerate()
            .fold((1, f64::NEG_INFINITY), |best, (i, &p)| if p > best.1 { (i, p) } else { best });
        DirectionClass::from_index(idx).unwrap_or(DirectionClass::Neutral)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputHeads {
    direction: Linear,
    magnitude: Linear,
    trend: Linear,
}

impl OutputHeads {
    pub fn new(model_width: usize, magnitude_outputs: usize, rng: &mut StdRng) -> Self {
        Self {
            direction: Linear::new(model_width, DirectionClass::ALL.len(), rng),
            magnitude: Linear::new(model_width, magnitude_outputs, rng),
            trend: Linear::new(model_width, 1, rng),
        }
    }

    pub fn model_width(&self) -> usize {
        self.direction.in_features()
    }

    pub fn magnitude_outputs(&self) -> usize {
        self.magnitude.out_features()
    }

    pub fn forward(&self, fused: ArrayView2<f64>) -> EngineResult<HeadOutput> {
        if fused.ncols() != self.model_width() {
            return Err(EngineError::shape(
                "fused decision vector width",
                self.model_width(),
                fused.ncols(),
            ));
        }

        let logits = self.direction.forward_rows(fused);
        let mut direction = Array2::zeros(logits.raw_dim());
        for (src, mut dst) in logits.axis_iter(Axis(0)).zip(direction.axis_iter_mut(Axis(0))) {
            dst.assign(&softmax(src));
        }
        let magnitude = self
            .magnitude
            .forward_rows(fused)
            .mapv(|v| MAGNITUDE_FLOOR_PIPS + MAGNITUDE_SPAN_PIPS * sigmoid(v));
        let trend = self.trend.forward_rows(fused).column(0).mapv(sigmoid);

        ensure_finite(Component::OutputHeads, &direction)?;
        ensure_finite(Component::OutputHeads, &magnitude)?;
        ensure_finite(Component::OutputHeads, &trend)?;
        Ok(HeadOutput {
            direction,
            magnitude,
            trend,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;
    use rand::SeedableRng;

    #[test]
    fn outputs_respect_their_ranges() {
        let heads = OutputHeads::new(6, 3, &mut StdRng::seed_from_u64(2));
        let fused = Array::from_shape_fn((4, 6), |(b, d)| (b as f64 - 1.5) * (d as f64 + 1.0) * 3.0);
        let out = heads.forward(fused.view()).unwrap();

        assert_eq!(out.direction.dim(), (4, 3));
        assert_eq!(out.magnitude.dim(), (4, 3));
        assert_eq!(out.trend.len(), 4);
        for row in out.direction.axis_iter(Axis(0)) {
            assert!((row.sum() - 1.0).abs() < 1e-9);
        }
        assert!(out.magnitude.iter().all(|&m| (0.5..=5.0).contains(&m)));
        assert!(out.trend.iter().all(|&t| (0.0..=1.0).contains(&t)));
    }

    #[test]
    fn direction_class_is_the_argmax() {
        let out = HeadOutput {
            direction: ndarray::array![[0.1, 0.2, 0.7], [0.5, 0.3, 0.2]],
            magnitude: Array2::zeros((2, 1)),
            trend: Array1::zeros(2),
        };
        assert_eq!(out.direction_class(0), DirectionClass::Up);
        assert_eq!(out.direction_class(1), DirectionClass::Down);
    }

    #[test]
    fn width_mismatch_is_rejected() {
        let heads = OutputHeads::new(6, 1, &mut StdRng::seed_from_u64(2));
        assert!(heads.forward(Array2::zeros((1, 5)).view()).is_err());
    }
}
