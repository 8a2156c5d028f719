use std::fmt;

use crate::dtype::{Array, DType, Values};
use crate::error::{FillError, Result};
use crate::slice::SliceSpec;

/// An append-only, typed column buffer.
///
/// Every implementation upholds the same recovery contract: `len` only grows, and only once an
/// `append`/`extend` call has returned `Ok`. A call that fails leaves both the length and all
/// previously committed elements exactly as they were, so it can simply be retried.
pub trait Fillable: fmt::Debug + Send {
    fn dtype(&self) -> DType;

    /// Fixed trailing shape of every element (empty for scalars).
    fn dims(&self) -> &[usize];

    /// Number of committed elements.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append exactly one element.
    fn append(&mut self, value: Values<'_>) -> Result<()>;

    /// Append zero or more elements, laid out row-major.
    fn extend(&mut self, values: Values<'_>) -> Result<()>;

    /// Push any staged elements to durable storage.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Read one element. Negative indices count from the end.
    fn get(&mut self, index: isize) -> Result<Array>;

    /// Materialize a `start:stop:step` slice as a `[count, dims...]` array.
    fn slice(&mut self, spec: SliceSpec) -> Result<Array>;

    /// Flush and release any held resources. Calling it again is a no-op.
    fn close(&mut self) -> Result<()> {
        self.flush()
    }
}

/// `(dtype, dims)` of a fillable plus the derived per-element sizes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ElementLayout {
    pub dtype: DType,
    pub dims: Vec<usize>,
    /// Scalars per element.
    pub width: usize,
    /// Bytes per element.
    pub item_size: usize,
}

impl ElementLayout {
    pub fn new(dtype: DType, dims: &[usize]) -> Result<Self> {
        if dims.iter().any(|&d| d == 0) {
            return Err(FillError::invalid(format!(
                "element dims {dims:?} contain a zero-sized axis"
            )));
        }
        let too_large =
            || FillError::invalid(format!("element dims {dims:?} are too large to address"));
        let width = dims
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(too_large)?;
        let item_size = width.checked_mul(dtype.size()).ok_or_else(too_large)?;
        Ok(Self {
            dtype,
            dims: dims.to_vec(),
            width,
            item_size,
        })
    }

    /// Byte size of a buffer holding `count` elements.
    pub fn buffer_bytes(&self, count: usize) -> Result<usize> {
        count.checked_mul(self.item_size).ok_or_else(|| {
            FillError::invalid(format!(
                "a buffer of {count} elements of {} bytes is too large to address",
                self.item_size
            ))
        })
    }

    /// Validate a batch and return how many whole elements it holds.
    pub fn element_count(&self, values: &Values<'_>) -> Result<usize> {
        if values.dtype() != self.dtype {
            return Err(FillError::invalid(format!(
                "expected {} values, got {}",
                self.dtype,
                values.dtype()
            )));
        }
        let scalars = values.scalar_count();
        if scalars % self.width != 0 {
            return Err(FillError::invalid(format!(
                "{scalars} scalars do not form whole elements of dims {:?}",
                self.dims
            )));
        }
        Ok(scalars / self.width)
    }

    /// Validate that `values` is exactly one element.
    pub fn single(&self, values: &Values<'_>) -> Result<()> {
        match self.element_count(values)? {
            1 => Ok(()),
            n => Err(FillError::invalid(format!(
                "append expects exactly one element, got {n}"
            ))),
        }
    }

    pub fn encode(&self, values: &Values<'_>) -> Vec<u8> {
        let mut out = Vec::with_capacity(values.scalar_count() * self.dtype.size());
        values.encode_extend(&mut out);
        out
    }

    /// Wrap the bytes of one element.
    pub fn element(&self, bytes: Vec<u8>) -> Array {
        Array::from_parts(self.dtype, self.dims.clone(), bytes)
    }

    /// Wrap the bytes of `count` consecutive elements.
    pub fn array(&self, count: usize, bytes: Vec<u8>) -> Array {
        let mut shape = Vec::with_capacity(self.dims.len() + 1);
        shape.push(count);
        shape.extend_from_slice(&self.dims);
        Array::from_parts(self.dtype, shape, bytes)
    }
}
