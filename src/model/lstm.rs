// =============================================================================
// Stacked LSTM — the causal recurrence inside every resolution encoder
// =============================================================================
//
// Gate layout follows the conventional fused form: one `[4H, in]` input
// matrix and one `[4H, H]` recurrent matrix, rows ordered input / forget /
// cell / output. Only forward-in-time recurrence exists, so the output at step
// t depends on steps <= t and nothing else.

use ndarray::{s, Array1, Array2, Array3, ArrayView2, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::layers::sigmoid;

/// Per-track recurrent state: hidden and cell memory, each
/// `[num_layers, batch, hidden]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrentState {
    pub h: Array3<f64>,
    pub c: Array3<f64>,
}

impl RecurrentState {
    pub fn zeros(num_layers: usize, batch: usize, hidden: usize) -> Self {
        Self {
            h: Array3::zeros((num_layers, batch, hidden)),
            c: Array3::zeros((num_layers, batch, hidden)),
        }
    }

    pub fn num_layers(&self) -> usize {
        self.h.len_of(Axis(0))
    }

    pub fn batch(&self) -> usize {
        self.h.len_of(Axis(1))
    }
}

/// Single LSTM layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LstmCell {
    hidden_size: usize,
    w_ih: Array2<f64>,
    w_hh: Array2<f64>,
    bias: Array1<f64>,
}

impl LstmCell {
    pub fn new(input_size: usize, hidden_size: usize, rng: &mut StdRng) -> Self {
        let gates = 4 * hidden_size;
        let bound_ih = (6.0 / (input_size + gates) as f64).sqrt();
        let bound_hh = (6.0 / (hidden_size + gates) as f64).sqrt();

        let mut bias = Array1::zeros(gates);
        // Forget gate starts open.
        bias.slice_mut(s![hidden_size..2 * hidden_size]).fill(1.0);

        Self {
            hidden_size,
            w_ih: Array2::random_using((gates, input_size), Uniform::new(-bound_ih, bound_ih), rng),
            w_hh: Array2::random_using((gates, hidden_size), Uniform::new(-bound_hh, bound_hh), rng),
            bias,
        }
    }

    pub fn input_size(&self) -> usize {
        self.w_ih.ncols()
    }

    /// One step for a whole batch: `x [B, in]`, `h, c [B, H]`.
    pub fn forward(
        &self,
        x: ArrayView2<f64>,
        h_prev: ArrayView2<f64>,
        c_prev: ArrayView2<f64>,
    ) -> (Array2<f64>, Array2<f64>) {
        let hs = self.hidden_size;
        let gates = x.dot(&self.w_ih.t()) + h_prev.dot(&self.w_hh.t()) + &self.bias;

        let i_gate = gates.slice(s![.., 0..hs]).mapv(sigmoid);
        let f_gate = gates.slice(s![.., hs..2 * hs]).mapv(sigmoid);
        let g = gates.slice(s![.., 2 * hs..3 * hs]).mapv(f64::tanh);
        let o_gate = gates.slice(s![.., 3 * hs..4 * hs]).mapv(sigmoid);

        let c_next = &f_gate * &c_prev + &i_gate * &g;
        let h_next = &o_gate * &c_next.mapv(f64::tanh);
        (h_next, c_next)
    }
}

/// Multi-layer LSTM; layer 0 reads the features, later layers read the layer
/// below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LstmStack {
    hidden_size: usize,
    cells: Vec<LstmCell>,
}

impl LstmStack {
    pub fn new(input_size: usize, hidden_size: usize, num_layers: usize, rng: &mut StdRng) -> Self {
        let cells = (0..num_layers)
            .map(|layer| {
                let in_size = if layer == 0 { input_size } else { hidden_size };
                LstmCell::new(in_size, hidden_size, rng)
            })
            .collect();
        Self { hidden_size, cells }
    }

    pub fn input_size(&self) -> usize {
        self.cells.first().map_or(0, LstmCell::input_size)
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn num_layers(&self) -> usize {
        self.cells.len()
    }

    pub fn zero_state(&self, batch: usize) -> RecurrentState {
        RecurrentState::zeros(self.num_layers(), batch, self.hidden_size)
    }

    /// Advance every layer by one step, mutating `state` in place, and return
    /// the top layer's hidden output `[B, H]`.
    pub fn step(&self, x: ArrayView2<f64>, state: &mut RecurrentState) -> Array2<f64> {
        let mut input = x.to_owned();
        for (layer, cell) in self.cells.iter().enumerate() {
            let (h, c) = cell.forward(
                input.view(),
                state.h.index_axis(Axis(0), layer),
                state.c.index_axis(Axis(0), layer),
            );
            state.h.index_axis_mut(Axis(0), layer).assign(&h);
            state.c.index_axis_mut(Axis(0), layer).assign(&c);
            input = h;
        }
        input
    }
}
