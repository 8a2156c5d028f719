use crate::dtype::{Array, DType, Values};
use crate::error::Result;
use crate::fillable::{ElementLayout, Fillable};
use crate::slice::{normalize_index, SliceSpec};

/// In-memory fillable backed by one growable byte vector.
///
/// This is the reference implementation: simplest to reason about and fine whenever the whole
/// column fits in memory.
#[derive(Debug)]
pub struct ListFillable {
    layout: ElementLayout,
    data: Vec<u8>,
    committed: usize,
}

impl ListFillable {
    pub fn new(dtype: DType, dims: &[usize]) -> Result<Self> {
        Ok(Self {
            layout: ElementLayout::new(dtype, dims)?,
            data: Vec::new(),
            committed: 0,
        })
    }

    /// Drop anything past the committed cursor left behind by an earlier failed call.
    fn discard_uncommitted(&mut self) {
        let committed_bytes = self.committed * self.layout.item_size;
        if self.data.len() > committed_bytes {
            self.data.truncate(committed_bytes);
        }
    }

    fn element_bytes(&self, index: usize) -> &[u8] {
        let size = self.layout.item_size;
        &self.data[index * size..(index + 1) * size]
    }
}

impl Fillable for ListFillable {
    fn dtype(&self) -> DType {
        self.layout.dtype
    }

    fn dims(&self) -> &[usize] {
        &self.layout.dims
    }

    fn len(&self) -> usize {
        self.committed
    }

    fn append(&mut self, value: Values<'_>) -> Result<()> {
        self.layout.single(&value)?;
        self.discard_uncommitted();
        value.encode_extend(&mut self.data);
        self.committed += 1;
        Ok(())
    }

    fn extend(&mut self, values: Values<'_>) -> Result<()> {
        let count = self.layout.element_count(&values)?;
        self.discard_uncommitted();
        values.encode_extend(&mut self.data);
        self.committed += count;
        Ok(())
    }

    fn get(&mut self, index: isize) -> Result<Array> {
        let index = normalize_index(index, self.committed)?;
        Ok(self.layout.element(self.element_bytes(index).to_vec()))
    }

    fn slice(&mut self, spec: SliceSpec) -> Result<Array> {
        let resolved = spec.resolve(self.committed)?;
        let mut out = Vec::with_capacity(resolved.count * self.layout.item_size);
        for index in resolved.indices() {
            out.extend_from_slice(self.element_bytes(index));
        }
        Ok(self.layout.array(resolved.count, out))
    }
}
