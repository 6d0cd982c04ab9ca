use ndarray::{s, Array3, ArrayView2, ArrayView3, Axis};

use crate::error::{EngineError, EngineResult};

// ---------------------------------------------------------------------------
// HiddenRing -- the last `capacity` encoder outputs of one track
// ---------------------------------------------------------------------------

/// Fixed-capacity rolling buffer of per-step hidden outputs `[B, D]`, stored
/// as one `[B, capacity, D]` block. Slots rotate by index: once full, a push
/// overwrites the oldest slot and moves `head` forward. Nothing is allocated
/// after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct HiddenRing {
    slots: Array3<f64>,
    /// Slot holding the oldest step.
    head: usize,
    len: usize,
}

impl HiddenRing {
    pub fn new(capacity: usize, batch: usize, width: usize) -> Self {
        Self {
            slots: Array3::zeros((batch, capacity, width)),
            head: 0,
            len: 0,
        }
    }

    /// Ring holding the trailing `capacity` steps of `hidden [B, T, D]`.
    pub fn from_trailing(hidden: ArrayView3<f64>, capacity: usize) -> EngineResult<Self> {
        let len = hidden.len_of(Axis(1));
        if len < capacity {
            return Err(EngineError::shape(
                "hidden history length",
                format!(">= {capacity}"),
                len,
            ));
        }
        Ok(Self {
            slots: hidden.slice(s![.., len - capacity.., ..]).to_owned(),
            head: 0,
            len: capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len_of(Axis(1))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    fn step_dim(&self) -> (usize, usize) {
        let (batch, _, width) = self.slots.dim();
        (batch, width)
    }

    fn check_step(&self, step: &ArrayView2<f64>) -> EngineResult<()> {
        if step.dim() != self.step_dim() {
            return Err(EngineError::shape("hidden step", self.step_dim(), step.dim()));
        }
        Ok(())
    }

    /// Buffered steps, oldest first.
    pub fn steps(&self) -> impl Iterator<Item = ArrayView2<'_, f64>> + '_ {
        let capacity = self.capacity();
        (0..self.len).map(move |i| self.slots.index_axis(Axis(1), (self.head + i) % capacity))
    }

    /// Append the newest step, overwriting the oldest when full.
    pub fn push(&mut self, step: ArrayView2<f64>) -> EngineResult<()> {
        self.check_step(&step)?;
        let capacity = self.capacity();
        if capacity == 0 {
            return Ok(());
        }
        let slot = if self.is_full() {
            let oldest = self.head;
            self.head = (self.head + 1) % capacity;
            oldest
        } else {
            let free = (self.head + self.len) % capacity;
            self.len += 1;
            free
        };
        self.slots.index_axis_mut(Axis(1), slot).assign(&step);
        Ok(())
    }

    /// Oldest-first copy of the buffered steps, `[B, len, D]`.
    pub fn window(&self) -> Array3<f64> {
        let (batch, width) = self.step_dim();
        let mut out = Array3::zeros((batch, self.len, width));
        for (t, step) in self.steps().enumerate() {
            out.index_axis_mut(Axis(1), t).assign(&step);
        }
        out
    }

    /// Write into `dst` the window the ring would hold after pushing `next`,
    /// leaving the ring itself untouched. `dst` is resized only when its
    /// shape differs.
    pub fn window_after(&self, next: ArrayView2<f64>, dst: &mut Array3<f64>) -> EngineResult<()> {
        self.check_step(&next)?;
        let (batch, width) = self.step_dim();
        let capacity = self.capacity();
        let len = (self.len + 1).min(capacity);
        if dst.dim() != (batch, len, width) {
            *dst = Array3::zeros((batch, len, width));
        }
        if capacity == 0 {
            return Ok(());
        }
        let skip = usize::from(self.is_full());
        let chronological = self.steps().skip(skip).chain(std::iter::once(next.view()));
        for (t, step) in chronological.enumerate() {
            dst.index_axis_mut(Axis(1), t).assign(&step);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, Array2};

    fn step(v: f64) -> Array2<f64> {
        Array2::from_elem((2, 3), v)
    }

    #[test]
    fn push_drops_oldest_once_full() {
        let mut ring = HiddenRing::new(3, 2, 3);
        for v in 0..5 {
            ring.push(step(v as f64).view()).unwrap();
        }
        assert!(ring.is_full());
        let w = ring.window();
        assert_eq!(w.dim(), (2, 3, 3));
        assert_eq!(w[[0, 0, 0]], 2.0);
        assert_eq!(w[[1, 2, 2]], 4.0);
    }

    #[test]
    fn from_trailing_keeps_the_last_steps() {
        let hidden = Array::from_shape_fn((1, 10, 2), |(_, t, _)| t as f64);
        let ring = HiddenRing::from_trailing(hidden.view(), 4).unwrap();
        let w = ring.window();
        assert_eq!(w.index_axis(Axis(1), 0)[[0, 0]], 6.0);
        assert_eq!(w.index_axis(Axis(1), 3)[[0, 1]], 9.0);
    }

    #[test]
    fn short_history_is_rejected() {
        let hidden = Array3::zeros((1, 3, 2));
        assert!(HiddenRing::from_trailing(hidden.view(), 4).is_err());
    }

    #[test]
    fn step_shape_must_match() {
        let mut ring = HiddenRing::new(2, 2, 3);
        let err = ring.push(Array2::zeros((2, 4)).view()).unwrap_err();
        assert!(matches!(err, EngineError::ShapeMismatch { .. }));
        assert!(ring.is_empty());
    }

    #[test]
    fn pushes_reuse_the_same_buffer() {
        let hidden = Array::from_shape_fn((2, 6, 3), |(_, t, _)| t as f64);
        let mut ring = HiddenRing::from_trailing(hidden.view(), 4).unwrap();
        let base = ring.slots.as_ptr();
        for v in 10..25 {
            ring.push(step(v as f64).view()).unwrap();
            assert_eq!(ring.slots.as_ptr(), base);
        }
        let oldest: Vec<f64> = ring.steps().map(|s| s[[0, 0]]).collect();
        assert_eq!(oldest, vec![21.0, 22.0, 23.0, 24.0]);
    }

    #[test]
    fn window_after_matches_push_without_mutating() {
        let hidden = Array::from_shape_fn((2, 7, 3), |(b, t, d)| (b * 100 + t * 10 + d) as f64);
        let mut ring = HiddenRing::from_trailing(hidden.view(), 5).unwrap();
        ring.push(step(-1.0).view()).unwrap();
        let before = ring.clone();

        let mut dst = Array3::zeros((2, 5, 3));
        let base = dst.as_ptr();
        ring.window_after(step(-2.0).view(), &mut dst).unwrap();
        assert_eq!(ring, before);
        assert_eq!(dst.as_ptr(), base);

        ring.push(step(-2.0).view()).unwrap();
        assert_eq!(dst, ring.window());
    }

    #[test]
    fn window_after_grows_a_partial_ring() {
        let mut ring = HiddenRing::new(4, 2, 3);
        ring.push(step(1.0).view()).unwrap();
        let mut dst = Array3::zeros((0, 0, 0));
        ring.window_after(step(2.0).view(), &mut dst).unwrap();
        assert_eq!(dst.dim(), (2, 2, 3));
        assert_eq!(dst[[1, 1, 2]], 2.0);
    }
}
