// =============================================================================
// Resolution Encoder — per-track causal recurrence with output normalization
// =============================================================================
//
// One instance per track, independently parameterized, no cross-track
// interaction. Every step's top-layer hidden output is layer-normalized so
// tracks with very different raw scales produce comparable magnitudes.
//
// Three entry points share a single step routine, which is what makes the
// cached path bit-for-bit comparable with a full recompute:
//   encode()  strict window `[B, L_track, F]` from a zero state
//   run()     any-length sequence continuing from a supplied state
//   step()    exactly one new bar `[B, F]`

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::layers::{ensure_finite, LayerNorm};
use super::lstm::{LstmStack, RecurrentState};
use crate::error::{Component, EngineError, EngineResult};
use crate::runtime_config::TrackSpec;
use crate::types::TrackId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionEncoder {
    spec: TrackSpec,
    lstm: LstmStack,
    norm: LayerNorm,
}

impl ResolutionEncoder {
    pub fn new(
        spec: TrackSpec,
        feature_dim: usize,
        model_width: usize,
        num_layers: usize,
        rng: &mut StdRng,
    ) -> Self {
        Self {
            spec,
            lstm: LstmStack::new(feature_dim, model_width, num_layers, rng),
            norm: LayerNorm::new(model_width),
        }
    }

    pub fn track(&self) -> TrackId {
        self.spec.track
    }

    pub fn window_len(&self) -> usize {
        self.spec.window_len
    }

    pub fn feature_dim(&self) -> usize {
        self.lstm.input_size()
    }

    pub fn model_width(&self) -> usize {
        self.lstm.hidden_size()
    }

    pub fn num_layers(&self) -> usize {
        self.lstm.num_layers()
    }

    pub fn zero_state(&self, batch: usize) -> RecurrentState {
        self.lstm.zero_state(batch)
    }

    /// Full-window encode from a zero state. Rejects any window whose length
    /// is not exactly `L_track` or whose feature count is not `F`.
    pub fn encode(&self, window: ArrayView3<f64>) -> EngineResult<(Array3<f64>, RecurrentState)> {
        let (batch, len, features) = window.dim();
        if len != self.window_len() || features != self.feature_dim() {
            return Err(EngineError::shape(
                format!("{} window", self.track()),
                [batch, self.window_len(), self.feature_dim()],
                [batch, len, features],
            ));
        }
        let mut state = self.zero_state(batch);
        let hidden = self.run(window, &mut state)?;
        Ok((hidden, state))
    }

    /// Continue the recurrence from `state` over every step of `sequence`
    /// `[B, T, F]`, returning the normalized hidden output for each step.
    pub fn run(
        &self,
        sequence: ArrayView3<f64>,
        state: &mut RecurrentState,
    ) -> EngineResult<Array3<f64>> {
        let (batch, len, features) = sequence.dim();
        self.check_step_shape(batch, features, state)?;

        let mut hidden = Array3::zeros((batch, len, self.model_width()));
        for (t, bar) in sequence.axis_iter(Axis(1)).enumerate() {
            let out = self.advance(bar, state);
            hidden.index_axis_mut(Axis(1), t).assign(&out);
        }
        ensure_finite(Component::Encoder(self.track()), &hidden)?;
        Ok(hidden)
    }

    /// Feed exactly one new bar `[B, F]`; cost is independent of window length.
    pub fn step(&self, bar: ArrayView2<f64>, state: &mut RecurrentState) -> EngineResult<Array2<f64>> {
        let (batch, features) = bar.dim();
        self.check_step_shape(batch, features, state)?;
        let out = self.advance(bar, state);
        ensure_finite(Component::Encoder(self.track()), &out)?;
        Ok(out)
    }

    fn advance(&self, bar: ArrayView2<f64>, state: &mut RecurrentState) -> Array2<f64> {
        let top = self.lstm.step(bar, state);
        self.norm.forward_rows(top.view())
    }

    fn check_step_shape(
        &self,
        batch: usize,
        features: usize,
        state: &RecurrentState,
    ) -> EngineResult<()> {
        if features != self.feature_dim() {
            return Err(EngineError::shape(
                format!("{} feature count", self.track()),
                self.feature_dim(),
                features,
            ));
        }
        if batch != state.batch() {
            return Err(EngineError::shape(
                format!("{} batch size", self.track()),
                state.batch(),
                batch,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{s, Array};
    use rand::SeedableRng;

    fn encoder(window_len: usize) -> ResolutionEncoder {
        let mut rng = StdRng::seed_from_u64(11);
        ResolutionEncoder::new(
            TrackSpec {
                track: TrackId::M5,
                window_len,
            },
            3,
            8,
            2,
            &mut rng,
        )
    }

    fn ramp(batch: usize, len: usize, features: usize) -> Array3<f64> {
        Array::from_shape_fn((batch, len, features), |(b, t, f)| {
            ((b + 1) as f64 * 0.3 + t as f64 * 0.07 + f as f64 * 0.11).sin()
        })
    }

    #[test]
    fn encode_returns_every_time_step() {
        let enc = encoder(12);
        let (hidden, state) = enc.encode(ramp(2, 12, 3).view()).unwrap();
        assert_eq!(hidden.dim(), (2, 12, 8));
        assert_eq!(state.h.dim(), (2, 2, 8));
        assert_eq!(state.c.dim(), (2, 2, 8));
    }

    #[test]
    fn wrong_window_length_is_rejected() {
        let enc = encoder(12);
        let err = enc.encode(ramp(1, 11, 3).view()).unwrap_err();
        assert!(matches!(err, EngineError::ShapeMismatch { .. }));
        let err = enc.encode(ramp(1, 13, 3).view()).unwrap_err();
        assert!(matches!(err, EngineError::ShapeMismatch { .. }));
    }

    #[test]
    fn wrong_feature_count_is_rejected() {
        let enc = encoder(12);
        let err = enc.encode(ramp(1, 12, 4).view()).unwrap_err();
        assert!(matches!(err, EngineError::ShapeMismatch { .. }));

        let mut state = enc.zero_state(1);
        let err = enc.step(Array2::zeros((1, 2)).view(), &mut state).unwrap_err();
        assert!(matches!(err, EngineError::ShapeMismatch { .. }));
    }

    #[test]
    fn batch_must_match_state() {
        let enc = encoder(4);
        let mut state = enc.zero_state(2);
        let err = enc.step(Array2::zeros((3, 3)).view(), &mut state).unwrap_err();
        assert!(matches!(err, EngineError::ShapeMismatch { .. }));
    }

    #[test]
    fn encoding_is_causal() {
        let enc = encoder(10);
        let base = ramp(1, 10, 3);
        let mut perturbed = base.clone();
        perturbed.slice_mut(s![.., 6.., ..]).fill(9.0);

        let (a, _) = enc.encode(base.view()).unwrap();
        let (b, _) = enc.encode(perturbed.view()).unwrap();

        for t in 0..6 {
            assert_eq!(a.index_axis(Axis(1), t), b.index_axis(Axis(1), t), "step {t} saw the future");
        }
        assert_ne!(a.index_axis(Axis(1), 6), b.index_axis(Axis(1), 6));
    }

    #[test]
    fn stepping_matches_full_encode() {
        let enc = encoder(10);
        let window = ramp(2, 10, 3);
        let (full, full_state) = enc.encode(window.view()).unwrap();

        let mut state = enc.zero_state(2);
        for t in 0..10 {
            let out = enc.step(window.index_axis(Axis(1), t), &mut state).unwrap();
            assert_eq!(out, full.index_axis(Axis(1), t));
        }
        assert_eq!(state, full_state);
    }

    #[test]
    fn outputs_are_normalized_per_step() {
        let enc = encoder(6);
        let (hidden, _) = enc.encode((ramp(1, 6, 3) * 1e4).view()).unwrap();
        for t in 0..6 {
            let row = hidden.slice(s![0, t, ..]);
            assert!(row.sum().abs() < 1e-6);
        }
    }

    #[test]
    fn non_finite_input_names_the_encoder() {
        let enc = encoder(4);
        let mut window = ramp(1, 4, 3);
        window[[0, 2, 1]] = f64::NAN;
        let err = enc.encode(window.view()).unwrap_err();
        assert_eq!(
            err,
            EngineError::NonFinite {
                component: Component::Encoder(TrackId::M5)
            }
        );
    }
}
