use crate::dtype::{Array, DType, Values};
use crate::error::{FillError, Result};
use crate::fillable::{ElementLayout, Fillable};
use crate::slice::{normalize_index, SliceSpec};

pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// In-memory fillable made of fixed-size chunks allocated on demand.
///
/// Chunk `i` holds logical indices `[i * chunk_size, (i + 1) * chunk_size)`, and every chunk but
/// the last is full. Chunks are never reallocated or freed while the fillable lives, so appends
/// never copy previously written data.
#[derive(Debug)]
pub struct ChunkedFillable {
    layout: ElementLayout,
    chunk_size: usize,
    chunks: Vec<Box<[u8]>>,
    chunk_index: usize,
    index_in_chunk: usize,
}

impl ChunkedFillable {
    pub fn new(dtype: DType, dims: &[usize], chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(FillError::invalid("chunk size must be positive"));
        }
        let layout = ElementLayout::new(dtype, dims)?;
        layout.buffer_bytes(chunk_size)?;
        Ok(Self {
            layout,
            chunk_size,
            chunks: Vec::new(),
            chunk_index: 0,
            index_in_chunk: 0,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks allocated so far.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    fn chunk_bytes(&self) -> usize {
        self.chunk_size * self.layout.item_size
    }

    fn ensure_chunk(&mut self, chunk: usize) {
        while self.chunks.len() <= chunk {
            log::trace!(
                "allocating chunk {} ({} x {} bytes)",
                self.chunks.len(),
                self.chunk_size,
                self.layout.item_size
            );
            self.chunks.push(vec![0u8; self.chunk_bytes()].into_boxed_slice());
        }
    }

    /// Move both cursors so that `len()` equals `len`. A full last chunk is kept as the
    /// current chunk; the next write moves on.
    fn commit_len(&mut self, len: usize) {
        if len == 0 {
            self.chunk_index = 0;
            self.index_in_chunk = 0;
        } else {
            self.chunk_index = (len - 1) / self.chunk_size;
            self.index_in_chunk = len - self.chunk_index * self.chunk_size;
        }
    }

    fn element_bytes(&self, index: usize) -> &[u8] {
        let size = self.layout.item_size;
        let (chunk, offset) = (index / self.chunk_size, index % self.chunk_size);
        &self.chunks[chunk][offset * size..(offset + 1) * size]
    }
}

impl Fillable for ChunkedFillable {
    fn dtype(&self) -> DType {
        self.layout.dtype
    }

    fn dims(&self) -> &[usize] {
        &self.layout.dims
    }

    fn len(&self) -> usize {
        self.chunk_index * self.chunk_size + self.index_in_chunk
    }

    fn append(&mut self, value: Values<'_>) -> Result<()> {
        self.layout.single(&value)?;
        let bytes = self.layout.encode(&value);

        let len = self.len();
        let (chunk, offset) = (len / self.chunk_size, len % self.chunk_size);
        self.ensure_chunk(chunk);
        let size = self.layout.item_size;
        self.chunks[chunk][offset * size..(offset + 1) * size].copy_from_slice(&bytes);

        self.commit_len(len + 1);
        Ok(())
    }

    fn extend(&mut self, values: Values<'_>) -> Result<()> {
        let count = self.layout.element_count(&values)?;
        let bytes = self.layout.encode(&values);
        let size = self.layout.item_size;

        let mut pos = self.len();
        let mut consumed = 0;
        while consumed < count {
            let (chunk, offset) = (pos / self.chunk_size, pos % self.chunk_size);
            self.ensure_chunk(chunk);
            let to_fill = (count - consumed).min(self.chunk_size - offset);
            self.chunks[chunk][offset * size..(offset + to_fill) * size]
                .copy_from_slice(&bytes[consumed * size..(consumed + to_fill) * size]);
            consumed += to_fill;
            pos += to_fill;
        }

        self.commit_len(pos);
        Ok(())
    }

    fn get(&mut self, index: isize) -> Result<Array> {
        let index = normalize_index(index, self.len())?;
        Ok(self.layout.element(self.element_bytes(index).to_vec()))
    }

    fn slice(&mut self, spec: SliceSpec) -> Result<Array> {
        let resolved = spec.resolve(self.len())?;
        let size = self.layout.item_size;
        let step = resolved.step;
        let mut out = Vec::with_capacity(resolved.count * size);

        // Walk chunks in traversal order. `pos` carries the stride phase across chunk
        // boundaries: its in-chunk remainder is where the next chunk's run begins.
        let mut pos = resolved.start;
        let mut taken = 0;
        while taken < resolved.count {
            let (chunk, local) = (pos / self.chunk_size, pos % self.chunk_size);
            let data = &self.chunks[chunk];
            let available = if step > 0 {
                (self.chunk_size - 1 - local) / step as usize + 1
            } else {
                local / step.unsigned_abs() + 1
            };
            let run = available.min(resolved.count - taken);

            if step == 1 {
                out.extend_from_slice(&data[local * size..(local + run) * size]);
            } else {
                for k in 0..run {
                    let at = (local as isize + k as isize * step) as usize;
                    out.extend_from_slice(&data[at * size..(at + 1) * size]);
                }
            }

            taken += run;
            if taken < resolved.count {
                pos = (pos as isize + run as isize * step) as usize;
            }
        }

        Ok(self.layout.array(resolved.count, out))
    }
}
