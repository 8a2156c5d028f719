use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapOptions};

use crate::dtype::{Array, DType, Values};
use crate::error::{FillError, Result};
use crate::fillable::{ElementLayout, Fillable};
use crate::npy::{compose_header, CountField};
use crate::slice::{normalize_index, SliceSpec};

pub const DEFAULT_FLUSH_SIZE: usize = 8192;

/// Progress counters of a [`FileFillable`].
///
/// After every completed operation `flushed + staged == committed`, and the file holds exactly
/// `flushed` valid elements after its data offset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileCursor {
    /// Elements acknowledged to callers.
    pub committed: usize,
    /// Elements held in the in-memory staging chunk.
    pub staged: usize,
    /// Elements written to the file.
    pub flushed: usize,
}

/// The open file plus where its data region (and optional count field) live.
#[derive(Debug)]
struct Sink {
    path: PathBuf,
    file: Option<File>,
    data_pos: u64,
    count: Option<CountField>,
}

impl Sink {
    fn live(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or(FillError::ResourceClosed)
    }

    /// Render the count field for `count` up front so an overflow fails before any write.
    fn render_count(&self, count: usize) -> Result<Option<Vec<u8>>> {
        self.count.as_ref().map(|field| field.render(count)).transpose()
    }

    fn write_elements(&mut self, item_size: usize, at: usize, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let pos = self.data_pos + (at * item_size) as u64;
        let Sink { path, file, .. } = self;
        let file = file.as_mut().ok_or(FillError::ResourceClosed)?;
        file.seek(SeekFrom::Start(pos)).map_err(FillError::io(&*path))?;
        file.write_all(bytes).map_err(FillError::io(&*path))
    }

    fn write_count(&mut self, rendered: Option<Vec<u8>>) -> Result<()> {
        let Sink {
            path, file, count, ..
        } = self;
        let (Some(rendered), Some(field)) = (rendered, count.as_ref()) else {
            return Ok(());
        };
        let file = file.as_mut().ok_or(FillError::ResourceClosed)?;
        file.seek(SeekFrom::Start(field.len_pos))
            .map_err(FillError::io(&*path))?;
        file.write_all(&rendered).map_err(FillError::io(&*path))
    }

    fn read_element(&mut self, item_size: usize, index: usize, flushed: usize) -> Result<Vec<u8>> {
        let pos = self.data_pos + (index * item_size) as u64;
        let restore = self.data_pos + (flushed * item_size) as u64;
        let path = &self.path;
        let mut buf = vec![0u8; item_size];
        match self.file.as_mut() {
            Some(file) => {
                let read = file
                    .seek(SeekFrom::Start(pos))
                    .and_then(|_| file.read_exact(&mut buf));
                let restored = file.seek(SeekFrom::Start(restore));
                read.map_err(FillError::io(path))?;
                restored.map_err(FillError::io(path))?;
            }
            None => {
                let mut file = File::open(path).map_err(FillError::io(path))?;
                file.seek(SeekFrom::Start(pos))
                    .and_then(|_| file.read_exact(&mut buf))
                    .map_err(FillError::io(path))?;
            }
        }
        Ok(buf)
    }
}

/// Disk-backed fillable: one staging chunk in memory, everything else in a file.
///
/// Two layouts share this type. [`FileFillable::create`] writes raw little-endian elements and
/// nothing else; [`FileFillable::create_npy`] prefixes them with a `.npy` header whose element
/// count is rewritten after every flush, so the file alone is enough to read it back.
///
/// Dropping the fillable closes it. Errors raised while closing from `Drop` are logged and
/// swallowed; call [`Fillable::close`] explicitly to observe them.
#[derive(Debug)]
pub struct FileFillable {
    layout: ElementLayout,
    flush_size: usize,
    chunk: Box<[u8]>,
    cursor: FileCursor,
    sink: Sink,
}

impl FileFillable {
    /// Create (or truncate) a headerless file at `path`.
    pub fn create(
        path: impl AsRef<Path>,
        dtype: DType,
        dims: &[usize],
        flush_size: usize,
    ) -> Result<Self> {
        let layout = ElementLayout::new(dtype, dims)?;
        Self::open(path.as_ref(), layout, flush_size, None, &[])
    }

    /// Create (or truncate) a `.npy` file at `path` whose count field is `count_digits` wide.
    pub fn create_npy(
        path: impl AsRef<Path>,
        dtype: DType,
        dims: &[usize],
        flush_size: usize,
        count_digits: usize,
    ) -> Result<Self> {
        let layout = ElementLayout::new(dtype, dims)?;
        let preamble = compose_header(dtype, dims, count_digits)?;
        debug_assert_eq!(preamble.data_pos as usize, preamble.bytes.len());
        Self::open(
            path.as_ref(),
            layout,
            flush_size,
            Some(preamble.count),
            &preamble.bytes,
        )
    }

    fn open(
        path: &Path,
        layout: ElementLayout,
        flush_size: usize,
        count: Option<CountField>,
        header: &[u8],
    ) -> Result<Self> {
        if flush_size == 0 {
            return Err(FillError::invalid("flush size must be positive"));
        }
        let chunk_bytes = layout.buffer_bytes(flush_size)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(FillError::io(path))?;
        file.write_all(header).map_err(FillError::io(path))?;
        log::debug!(
            "created {} column file {} ({}, dims {:?})",
            if count.is_some() { "npy" } else { "plain" },
            path.display(),
            layout.dtype,
            layout.dims
        );

        Ok(Self {
            chunk: vec![0u8; chunk_bytes].into_boxed_slice(),
            layout,
            flush_size,
            cursor: FileCursor::default(),
            sink: Sink {
                path: path.to_path_buf(),
                file: Some(file),
                data_pos: header.len() as u64,
                count,
            },
        })
    }

    pub fn path(&self) -> &Path {
        &self.sink.path
    }

    /// Byte offset of the first element in the file.
    pub fn data_offset(&self) -> u64 {
        self.sink.data_pos
    }

    pub fn flush_size(&self) -> usize {
        self.flush_size
    }

    pub fn cursor(&self) -> FileCursor {
        self.cursor
    }

    pub fn is_closed(&self) -> bool {
        self.sink.file.is_none()
    }

    /// Flush (when still open) and map the data region read-only.
    pub fn view(&mut self) -> Result<FileView> {
        if !self.is_closed() {
            self.flush()?;
        }
        FileView::map(
            &self.sink.path,
            self.layout.clone(),
            self.sink.data_pos,
            self.cursor.flushed,
        )
    }
}

impl Fillable for FileFillable {
    fn dtype(&self) -> DType {
        self.layout.dtype
    }

    fn dims(&self) -> &[usize] {
        &self.layout.dims
    }

    fn len(&self) -> usize {
        self.cursor.committed
    }

    fn append(&mut self, value: Values<'_>) -> Result<()> {
        self.layout.single(&value)?;
        self.sink.live()?;
        let size = self.layout.item_size;
        let slot = self.cursor.staged;
        self.chunk[slot * size..(slot + 1) * size].copy_from_slice(&self.layout.encode(&value));

        let committed = self.cursor.committed + 1;
        if slot + 1 == self.flush_size {
            let count = self.sink.render_count(committed)?;
            self.sink
                .write_elements(size, self.cursor.flushed, &self.chunk[..(slot + 1) * size])?;
            self.sink.write_count(count)?;
            self.cursor = FileCursor {
                committed,
                staged: 0,
                flushed: committed,
            };
        } else {
            self.cursor.committed = committed;
            self.cursor.staged += 1;
        }
        Ok(())
    }

    fn extend(&mut self, values: Values<'_>) -> Result<()> {
        let count = self.layout.element_count(&values)?;
        self.sink.live()?;
        let size = self.layout.item_size;
        let bytes = self.layout.encode(&values);
        let FileCursor {
            committed,
            staged,
            flushed,
        } = self.cursor;

        let room = self.flush_size - staged;
        if count < room {
            self.chunk[staged * size..(staged + count) * size].copy_from_slice(&bytes);
            self.cursor.committed += count;
            self.cursor.staged += count;
            return Ok(());
        }

        // The staging chunk fills up. Top it up and write it, write every further whole chunk
        // straight from the input, and only then stage the remainder. Nothing below `staged`
        // in the chunk is touched until every write has succeeded.
        let rest = count - room;
        let direct = rest - rest % self.flush_size;
        let tail = rest - direct;
        let total = committed + count;

        let rendered = self.sink.render_count(total - tail)?;
        self.chunk[staged * size..].copy_from_slice(&bytes[..room * size]);
        self.sink.write_elements(size, flushed, &self.chunk)?;
        self.sink.write_elements(
            size,
            flushed + self.flush_size,
            &bytes[room * size..(room + direct) * size],
        )?;
        self.sink.write_count(rendered)?;
        log::debug!(
            "flushed {} elements to {}",
            self.flush_size + direct,
            self.sink.path.display()
        );

        self.chunk[..tail * size].copy_from_slice(&bytes[(room + direct) * size..]);
        self.cursor = FileCursor {
            committed: total,
            staged: tail,
            flushed: total - tail,
        };
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.sink.live()?;
        let FileCursor {
            committed,
            staged,
            flushed,
        } = self.cursor;
        let size = self.layout.item_size;

        let rendered = self.sink.render_count(committed)?;
        self.sink
            .write_elements(size, flushed, &self.chunk[..staged * size])?;
        self.sink.write_count(rendered)?;
        if staged > 0 {
            log::debug!("flushed {staged} elements to {}", self.sink.path.display());
        }

        self.cursor.staged = 0;
        self.cursor.flushed = committed;
        Ok(())
    }

    fn get(&mut self, index: isize) -> Result<Array> {
        let index = normalize_index(index, self.cursor.committed)?;
        let size = self.layout.item_size;

        if index >= self.cursor.flushed {
            let slot = index - self.cursor.flushed;
            return Ok(self
                .layout
                .element(self.chunk[slot * size..(slot + 1) * size].to_vec()));
        }
        let bytes = self.sink.read_element(size, index, self.cursor.flushed)?;
        Ok(self.layout.element(bytes))
    }

    fn slice(&mut self, spec: SliceSpec) -> Result<Array> {
        spec.resolve(self.cursor.committed)?;
        self.view()?.slice(spec)
    }

    fn close(&mut self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.flush()?;

        let end = self.sink.data_pos + (self.cursor.flushed * self.layout.item_size) as u64;
        let path = self.sink.path.clone();
        if let Some(file) = self.sink.file.take() {
            // Drop bytes left past the valid region by writes that were never acknowledged.
            file.set_len(end).map_err(FillError::io(&path))?;
            file.sync_data().map_err(FillError::io(&path))?;
        }
        log::debug!(
            "closed {} with {} elements",
            path.display(),
            self.cursor.flushed
        );
        Ok(())
    }
}

impl Drop for FileFillable {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!(
                "failed to close column file {}: {err}",
                self.sink.path.display()
            );
        }
    }
}

/// A read-only memory map over the data region of a column file.
///
/// Element bytes are borrowed straight from the mapping; [`FileView::slice`] and
/// [`FileView::get`] copy only the selected elements.
#[derive(Debug)]
pub struct FileView {
    layout: ElementLayout,
    len: usize,
    map: Option<Mmap>,
}

impl FileView {
    #[allow(unsafe_code)]
    fn map(path: &Path, layout: ElementLayout, data_pos: u64, len: usize) -> Result<Self> {
        let bytes = len * layout.item_size;
        if bytes == 0 {
            return Ok(Self {
                layout,
                len,
                map: None,
            });
        }

        let file = File::open(path).map_err(FillError::io(path))?;
        // SAFETY: the region is mapped read-only, and the only writer of this file is the owning
        // `FileFillable`, which never rewrites elements below its flushed boundary.
        let map = unsafe { MmapOptions::new().offset(data_pos).len(bytes).map(&file) }
            .map_err(FillError::io(path))?;
        Ok(Self {
            layout,
            len,
            map: Some(map),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn dtype(&self) -> DType {
        self.layout.dtype
    }

    pub fn dims(&self) -> &[usize] {
        &self.layout.dims
    }

    /// The whole data region, zero-copy.
    pub fn as_bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    fn element_bytes(&self, index: usize) -> &[u8] {
        let size = self.layout.item_size;
        &self.as_bytes()[index * size..(index + 1) * size]
    }

    pub fn get(&self, index: isize) -> Result<Array> {
        let index = normalize_index(index, self.len)?;
        Ok(self.layout.element(self.element_bytes(index).to_vec()))
    }

    pub fn slice(&self, spec: SliceSpec) -> Result<Array> {
        let resolved = spec.resolve(self.len)?;
        let mut out = Vec::with_capacity(resolved.count * self.layout.item_size);
        if resolved.step == 1 {
            let size = self.layout.item_size;
            out.extend_from_slice(
                &self.as_bytes()[resolved.start * size..(resolved.start + resolved.count) * size],
            );
        } else {
            for index in resolved.indices() {
                out.extend_from_slice(self.element_bytes(index));
            }
        }
        Ok(self.layout.array(resolved.count, out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::npy::read_npy_header;
    use pretty_assertions::assert_eq;

    fn ints(fillable: &mut FileFillable, spec: SliceSpec) -> Vec<i32> {
        fillable.slice(spec).unwrap().to_vec::<i32>().unwrap()
    }

    #[test]
    fn extend_spills_through_several_chunks() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut file = FileFillable::create(dir.path().join("col"), DType::I32, &[], 4).unwrap();
        file.append(Values::from(&[0i32])).unwrap();
        let values: Vec<i32> = (1..=13).collect();
        file.extend(Values::from(&values)).unwrap();

        assert_eq!(
            file.cursor(),
            FileCursor {
                committed: 14,
                staged: 2,
                flushed: 12,
            }
        );
        assert_eq!(
            std::fs::metadata(file.path()).unwrap().len(),
            12 * 4,
            "only whole chunks are written before an explicit flush"
        );
        assert_eq!(ints(&mut file, SliceSpec::full()), (0..14).collect::<Vec<_>>());
        assert_eq!(file.cursor().staged, 0);
    }

    #[test]
    fn extend_that_exactly_fills_the_chunk_writes_it() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut file = FileFillable::create(dir.path().join("col"), DType::U8, &[], 4).unwrap();
        file.extend(Values::from(&[1u8, 2])).unwrap();
        file.extend(Values::from(&[3u8, 4])).unwrap();
        assert_eq!(file.cursor().flushed, 4);
        file.append(Values::from(&[5u8])).unwrap();
        assert_eq!(file.len(), 5);
        assert_eq!(file.get(4).unwrap().scalar::<u8>().unwrap(), 5);
    }

    #[test]
    fn single_reads_restore_the_write_position() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut file = FileFillable::create(dir.path().join("col"), DType::I32, &[], 2).unwrap();
        file.extend(Values::from(&[10i32, 11, 12])).unwrap();

        // Index 0 comes from disk, index 2 is still staged.
        assert_eq!(file.get(0).unwrap().scalar::<i32>().unwrap(), 10);
        assert_eq!(file.get(-1).unwrap().scalar::<i32>().unwrap(), 12);
        file.extend(Values::from(&[13i32, 14])).unwrap();
        assert_eq!(ints(&mut file, SliceSpec::full()), vec![10, 11, 12, 13, 14]);
    }

    #[test]
    fn closed_files_still_serve_reads() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("col");
        let mut file = FileFillable::create(&path, DType::I64, &[2], 8).unwrap();
        file.extend(Values::from(&[1i64, 2, 3, 4, 5, 6])).unwrap();
        file.close().unwrap();
        file.close().unwrap();
        assert!(file.is_closed());

        assert_eq!(file.get(1).unwrap().to_vec::<i64>().unwrap(), vec![3, 4]);
        assert!(matches!(
            file.get(3),
            Err(FillError::IndexOutOfRange { index: 3, len: 3 })
        ));
        let reversed = file.slice(SliceSpec::reversed()).unwrap();
        assert_eq!(reversed.to_vec::<i64>().unwrap(), vec![5, 6, 3, 4, 1, 2]);

        assert!(matches!(
            file.append(Values::from(&[7i64, 8])),
            Err(FillError::ResourceClosed)
        ));
        assert!(matches!(file.flush(), Err(FillError::ResourceClosed)));
        assert_eq!(file.len(), 3);
    }

    #[test]
    fn npy_count_tracks_every_flush() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("col.npy");
        let mut file = FileFillable::create_npy(&path, DType::F32, &[3], 2, 16).unwrap();
        assert_eq!(file.data_offset() % 64, 0);
        assert_eq!(read_npy_header(&path).unwrap().count(), 0);

        let flat: Vec<f32> = (0..15).map(|v| v as f32).collect();
        file.extend(Values::from(&flat)).unwrap();
        // Two whole chunks were written; the fifth element is staged.
        assert_eq!(read_npy_header(&path).unwrap().count(), 4);

        file.flush().unwrap();
        let header = read_npy_header(&path).unwrap();
        assert_eq!(header.count(), 5);
        assert_eq!(header.dims(), &[3]);
        assert_eq!(header.dtype, DType::F32);
        assert_eq!(header.data_offset, file.data_offset());
    }

    #[test]
    fn npy_count_overflow_is_rejected_before_writing() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("tiny.npy");
        let mut file = FileFillable::create_npy(&path, DType::U8, &[], 4, 1).unwrap();
        let values: Vec<u8> = (0..9).collect();
        file.extend(Values::from(&values)).unwrap();
        file.flush().unwrap();

        file.append(Values::from(&[9u8])).unwrap();
        assert!(matches!(file.flush(), Err(FillError::InvalidArgument(_))));
        assert_eq!(read_npy_header(&path).unwrap().count(), 9);
        assert_eq!(file.len(), 10);
    }

    #[test]
    fn zero_flush_size_is_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        assert!(FileFillable::create(dir.path().join("col"), DType::I8, &[], 0).is_err());
    }

    #[test]
    fn oversized_staging_chunk_is_rejected_before_creating_the_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("col");
        assert!(matches!(
            FileFillable::create(&path, DType::F64, &[], usize::MAX),
            Err(FillError::InvalidArgument(_))
        ));
        assert!(!path.exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_chunk_write_keeps_the_previous_state() {
        let device = Path::new("/dev/full");
        if !device.exists() {
            return;
        }
        let mut file = FileFillable::create(device, DType::I32, &[], 4).unwrap();
        file.extend(Values::from(&[1i32, 2, 3])).unwrap();

        let err = file.extend(Values::from(&[4i32, 5, 6])).unwrap_err();
        assert!(matches!(err, FillError::Io { .. }), "{err}");
        assert_eq!(file.len(), 3);
        assert_eq!(
            file.cursor(),
            FileCursor {
                committed: 3,
                staged: 3,
                flushed: 0,
            }
        );
        assert!(file.append(Values::from(&[4i32])).is_err());
        assert_eq!(file.len(), 3);
        assert_eq!(file.get(2).unwrap().scalar::<i32>().unwrap(), 3);
    }
}
