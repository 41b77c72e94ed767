//! Context-keyed tensor accumulation across plate frames.
//!
//! `ContextSum` collects tensors that live under different (possibly
//! nested, possibly disjoint) sets of vectorized frames and can re-aggregate
//! the collection down to any coarser frame context with broadcast-safe
//! reduction. Callers use it to roll per-site quantities into the
//! per-ordinal cost tensors the expectation evaluator consumes.

use crate::EstimatorError;
use pw_core::{Frame, Ordinal, Value};
use pw_tensor::{add, axis_extent, squeeze_leading, sum_axis};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct ContextSum {
    entries: BTreeMap<Ordinal, Value>,
}

impl ContextSum {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Accumulate `value` under the vectorized frames of `frames`.
    /// Sequential frames carry no axis and are dropped from the key. Every
    /// retained frame must address an existing axis of the value (negative
    /// axis, magnitude at most the value's rank); a violation means the
    /// caller's frame bookkeeping is broken and is surfaced immediately.
    pub fn add(&mut self, frames: &[Frame], value: Value) -> Result<(), EstimatorError> {
        let key = Ordinal::vectorized_from(frames.iter());
        for frame in key.iter() {
            let rank = value.rank();
            let addresses_axis = frame
                .dim
                .is_some_and(|dim| dim < 0 && dim.unsigned_abs() as usize <= rank);
            if !addresses_axis {
                return Err(EstimatorError::FrameAxisOutOfRange {
                    frame: frame.name.clone(),
                    axis: frame.dim,
                    rank,
                });
            }
        }

        match self.entries.remove(&key) {
            Some(existing) => {
                let summed = add(&existing, &value)?;
                self.entries.insert(key, summed);
            }
            None => {
                self.entries.insert(key, value);
            }
        }
        Ok(())
    }

    /// Bulk insertion of `(frame stack, value)` pairs.
    pub fn add_all(
        &mut self,
        entries: impl IntoIterator<Item = (Vec<Frame>, Value)>,
    ) -> Result<(), EstimatorError> {
        for (frames, value) in entries {
            self.add(&frames, value)?;
        }
        Ok(())
    }

    /// Reduce every accumulated entry down toward `target` and sum the
    /// results. For each keyed frame outside `target`, the entry is summed
    /// along that frame's axis with keep-dim, but only when the axis has
    /// extent greater than one; an extent-one axis is already at the
    /// broadcast minimum. Leading unit axes are then stripped. Returns
    /// `None` when nothing was accumulated. The result is broadcastable up
    /// to any shape compatible with `target`'s frames.
    pub fn sum_to(&self, target: &Ordinal) -> Result<Option<Value>, EstimatorError> {
        let mut total: Option<Value> = None;
        for (key, value) in &self.entries {
            let mut reduced = value.clone();
            for frame in key.iter() {
                if target.contains(frame) {
                    continue;
                }
                let Some(dim) = frame.dim else { continue };
                if axis_extent(&reduced, dim)? > 1 {
                    reduced = sum_axis(&reduced, dim, true)?;
                }
            }
            let reduced = squeeze_leading(&reduced);
            total = Some(match total {
                Some(running) => add(&running, &reduced)?,
                None => reduced,
            });
        }
        Ok(total)
    }
}
