use std::ops::Range;

use crate::error::{FillError, Result};

/// A `start:stop:step` slice request with Python semantics.
///
/// Missing bounds default according to the sign of `step`, negative bounds count from the end,
/// and out-of-range bounds are clamped rather than rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SliceSpec {
    pub start: Option<isize>,
    pub stop: Option<isize>,
    pub step: isize,
}

impl SliceSpec {
    pub const fn new(start: Option<isize>, stop: Option<isize>, step: isize) -> Self {
        Self { start, stop, step }
    }

    /// Every element, front to back.
    pub const fn full() -> Self {
        Self::new(None, None, 1)
    }

    /// Every element, back to front.
    pub const fn reversed() -> Self {
        Self::new(None, None, -1)
    }

    pub const fn range(start: isize, stop: isize) -> Self {
        Self::new(Some(start), Some(stop), 1)
    }

    pub const fn with_step(self, step: isize) -> Self {
        Self { step, ..self }
    }

    /// Normalize against a sequence of `len` elements.
    pub fn resolve(&self, len: usize) -> Result<ResolvedSlice> {
        if self.step == 0 {
            return Err(FillError::invalid("slice step cannot be zero"));
        }
        let len = len as isize;
        let step = self.step;
        let (lower, upper) = if step < 0 { (-1, len - 1) } else { (0, len) };

        let clamp = |bound: isize| {
            if bound < 0 {
                (bound + len).max(lower)
            } else {
                bound.min(upper)
            }
        };
        let start = match self.start {
            Some(s) => clamp(s),
            None if step < 0 => upper,
            None => lower,
        };
        let stop = match self.stop {
            Some(s) => clamp(s),
            None if step < 0 => lower,
            None => upper,
        };

        let count = if step > 0 && start < stop {
            (stop - start - 1) as usize / step.unsigned_abs() + 1
        } else if step < 0 && stop < start {
            (start - stop - 1) as usize / step.unsigned_abs() + 1
        } else {
            0
        };

        Ok(ResolvedSlice {
            start: start.max(0) as usize,
            step,
            count,
        })
    }
}

impl Default for SliceSpec {
    fn default() -> Self {
        Self::full()
    }
}

impl From<Range<usize>> for SliceSpec {
    fn from(range: Range<usize>) -> Self {
        Self::range(range.start as isize, range.end as isize)
    }
}

/// A slice resolved against a concrete length: `count` indices starting at `start`, `step`
/// apart. `start` is only meaningful when `count > 0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedSlice {
    pub start: usize,
    pub step: isize,
    pub count: usize,
}

impl ResolvedSlice {
    /// Logical index of the `k`-th selected element.
    pub fn index(&self, k: usize) -> usize {
        (self.start as isize + k as isize * self.step) as usize
    }

    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.count).map(move |k| self.index(k))
    }
}

/// Map a possibly-negative index onto `0..len`.
pub(crate) fn normalize_index(index: isize, len: usize) -> Result<usize> {
    let normalized = if index < 0 {
        index + len as isize
    } else {
        index
    };
    if normalized < 0 || normalized as usize >= len {
        return Err(FillError::IndexOutOfRange { index, len });
    }
    Ok(normalized as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn picked(spec: SliceSpec, len: usize) -> Vec<usize> {
        spec.resolve(len).unwrap().indices().collect()
    }

    #[test]
    fn positive_steps_clamp_bounds() {
        assert_eq!(picked(SliceSpec::range(1, 6).with_step(2), 7), vec![1, 3, 5]);
        assert_eq!(picked(SliceSpec::range(-3, 100), 7), vec![4, 5, 6]);
        assert_eq!(picked(SliceSpec::range(-100, 2), 7), vec![0, 1]);
        assert_eq!(picked(SliceSpec::range(5, 2), 7), Vec::<usize>::new());
    }

    #[test]
    fn negative_steps_default_to_the_end() {
        assert_eq!(picked(SliceSpec::reversed(), 4), vec![3, 2, 1, 0]);
        assert_eq!(picked(SliceSpec::full().with_step(-3), 7), vec![6, 3, 0]);
        assert_eq!(
            picked(SliceSpec::new(Some(100), Some(-100), -2), 5),
            vec![4, 2, 0]
        );
        assert_eq!(picked(SliceSpec::new(Some(1), Some(4), -1), 7), Vec::<usize>::new());
    }

    #[test]
    fn extreme_steps_pick_a_single_element() {
        assert_eq!(picked(SliceSpec::full().with_step(isize::MIN), 3), vec![2]);
        assert_eq!(picked(SliceSpec::full().with_step(isize::MAX), 3), vec![0]);
        assert_eq!(
            picked(SliceSpec::new(Some(-1), Some(-100), isize::MIN), 5),
            vec![4]
        );
        assert!(picked(SliceSpec::full().with_step(isize::MIN), 0).is_empty());
    }

    #[test]
    fn empty_sequences_select_nothing() {
        assert_eq!(SliceSpec::reversed().resolve(0).unwrap().count, 0);
        assert_eq!(SliceSpec::full().resolve(0).unwrap().count, 0);
    }

    #[test]
    fn zero_step_is_rejected() {
        assert!(matches!(
            SliceSpec::full().with_step(0).resolve(3),
            Err(FillError::InvalidArgument(_))
        ));
    }

    #[test]
    fn normalize_index_handles_both_directions() {
        assert_eq!(normalize_index(-1, 3).unwrap(), 2);
        assert_eq!(normalize_index(0, 3).unwrap(), 0);
        assert!(matches!(
            normalize_index(3, 3),
            Err(FillError::IndexOutOfRange { index: 3, len: 3 })
        ));
        assert!(normalize_index(-4, 3).is_err());
    }
}
