//! The self-describing `.npy` file layout.
//!
//! Files written by [`FileFillable::create_npy`](crate::FileFillable::create_npy) start with a
//! version 1.0 NumPy header:
//!
//! ```text
//! \x93NUMPY | 0x01 0x00 | u16 LE header length | {'descr': '<i4', 'fortran_order': False,
//! 'shape': (            1234, 3), }<spaces>\n | raw little-endian elements ...
//! ```
//!
//! The leading shape component is a right-aligned decimal field of fixed width, so the element
//! count can be rewritten in place after every flush without moving the data region. Counts
//! that need more digits than the field was created with cannot be represented; writers reject
//! them instead of corrupting the header.
//!
//! A field of `digits` characters holds at most `10^digits - 1` elements, so the default
//! 16-digit field caps a column at 9,999,999,999,999,999 elements. Widths range from 1 to 19.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::dtype::DType;
use crate::error::{FillError, Result};

pub const MAGIC: &[u8; 6] = b"\x93NUMPY";
pub const DEFAULT_COUNT_DIGITS: usize = 16;
/// Widest count field whose maximum (`10^digits - 1`) still fits in a `u64`.
pub const MAX_COUNT_DIGITS: usize = 19;

/// The data region starts on a multiple of this, which is also a multiple of every element size.
const HEADER_ALIGN: usize = 64;
const PREAMBLE_V1: usize = MAGIC.len() + 2 + 2;

/// Location and width of the in-place element count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CountField {
    pub len_pos: u64,
    pub digits: usize,
}

impl CountField {
    pub fn max_count(&self) -> u64 {
        10u64.pow(self.digits as u32) - 1
    }

    pub fn render(&self, count: usize) -> Result<Vec<u8>> {
        if count as u64 > self.max_count() {
            return Err(FillError::invalid(format!(
                "element count {count} does not fit the {}-digit header field",
                self.digits
            )));
        }
        Ok(format!("{count:>width$}", width = self.digits).into_bytes())
    }
}

/// A freshly composed header, with the count field set to zero.
#[derive(Clone, Debug)]
pub(crate) struct NpyPreamble {
    pub bytes: Vec<u8>,
    pub count: CountField,
    pub data_pos: u64,
}

pub(crate) fn compose_header(dtype: DType, dims: &[usize], digits: usize) -> Result<NpyPreamble> {
    if !(1..=MAX_COUNT_DIGITS).contains(&digits) {
        return Err(FillError::invalid(format!(
            "count field width must be between 1 and {MAX_COUNT_DIGITS} digits, got {digits}"
        )));
    }

    let head = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': (",
        dtype.descr()
    );
    let tail = if dims.is_empty() {
        ",), }".to_owned()
    } else {
        let rest: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
        format!(", {}), }}", rest.join(", "))
    };

    let unpadded = PREAMBLE_V1 + head.len() + digits + tail.len() + 1;
    let padded = unpadded.div_ceil(HEADER_ALIGN) * HEADER_ALIGN;
    debug_assert_eq!(padded % dtype.size(), 0);
    let header_len = u16::try_from(padded - PREAMBLE_V1)
        .map_err(|_| FillError::invalid("array header does not fit a version 1.0 .npy file"))?;

    let count = CountField {
        len_pos: (PREAMBLE_V1 + head.len()) as u64,
        digits,
    };

    let mut bytes = Vec::with_capacity(padded);
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&[1, 0]);
    bytes.extend_from_slice(&header_len.to_le_bytes());
    bytes.extend_from_slice(head.as_bytes());
    bytes.extend_from_slice(&count.render(0)?);
    bytes.extend_from_slice(tail.as_bytes());
    bytes.resize(padded - 1, b' ');
    bytes.push(b'\n');

    Ok(NpyPreamble {
        bytes,
        count,
        data_pos: padded as u64,
    })
}

/// A parsed `.npy` header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NpyHeader {
    pub dtype: DType,
    pub fortran_order: bool,
    pub shape: Vec<usize>,
    /// Byte offset of the first element.
    pub data_offset: u64,
}

impl NpyHeader {
    /// Number of elements along the leading axis.
    pub fn count(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    /// Trailing shape of one element.
    pub fn dims(&self) -> &[usize] {
        self.shape.get(1..).unwrap_or(&[])
    }
}

/// Read and parse the header of a `.npy` file.
pub fn read_npy_header(path: impl AsRef<Path>) -> Result<NpyHeader> {
    let path = path.as_ref();
    let bad = |reason: &str| FillError::Header {
        path: path.to_path_buf(),
        reason: reason.to_owned(),
    };

    let mut file = File::open(path).map_err(FillError::io(path))?;
    let mut preamble = [0u8; PREAMBLE_V1];
    file.read_exact(&mut preamble)
        .map_err(|_| bad("file is shorter than the .npy preamble"))?;
    if &preamble[..MAGIC.len()] != MAGIC {
        return Err(bad("missing .npy magic"));
    }

    let (header_len, data_start) = match preamble[6] {
        1 => (
            u16::from_le_bytes([preamble[8], preamble[9]]) as usize,
            PREAMBLE_V1,
        ),
        2 | 3 => {
            let mut rest = [0u8; 2];
            file.read_exact(&mut rest)
                .map_err(|_| bad("truncated header length"))?;
            let len = u32::from_le_bytes([preamble[8], preamble[9], rest[0], rest[1]]);
            (len as usize, PREAMBLE_V1 + 2)
        }
        _ => return Err(bad("unsupported .npy version")),
    };

    let mut text = vec![0u8; header_len];
    file.read_exact(&mut text)
        .map_err(|_| bad("truncated header text"))?;
    let text = String::from_utf8(text).map_err(|_| bad("header text is not valid UTF-8"))?;

    let descr = quoted_after(&text, "'descr':").ok_or_else(|| bad("missing 'descr'"))?;
    let dtype = DType::from_descr(descr).ok_or_else(|| bad("unsupported 'descr'"))?;

    let fortran_order = match value_after(&text, "'fortran_order':") {
        Some(v) if v.starts_with("True") => true,
        Some(v) if v.starts_with("False") => false,
        _ => return Err(bad("missing 'fortran_order'")),
    };

    let shape_text = value_after(&text, "'shape':")
        .and_then(|v| v.strip_prefix('('))
        .and_then(|v| v.split_once(')'))
        .map(|(inner, _)| inner)
        .ok_or_else(|| bad("missing 'shape'"))?;
    let shape = shape_text
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<usize>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| bad("non-integer shape component"))?;

    Ok(NpyHeader {
        dtype,
        fortran_order,
        shape,
        data_offset: (data_start + header_len) as u64,
    })
}

fn value_after<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    let at = text.find(key)?;
    Some(text[at + key.len()..].trim_start())
}

fn quoted_after<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    let value = value_after(text, key)?;
    let quote = value.chars().next().filter(|c| *c == '\'' || *c == '"')?;
    let inner = &value[1..];
    inner.find(quote).map(|end| &inner[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn composed_header_is_aligned_and_newline_terminated() {
        let preamble = compose_header(DType::F64, &[3], 16).unwrap();
        assert_eq!(preamble.data_pos as usize, preamble.bytes.len());
        assert_eq!(preamble.bytes.len() % 64, 0);
        assert_eq!(preamble.bytes.last(), Some(&b'\n'));
        assert_eq!(&preamble.bytes[..8], b"\x93NUMPY\x01\x00");

        let text = std::str::from_utf8(&preamble.bytes[10..]).unwrap();
        assert!(
            text.starts_with("{'descr': '<f8', 'fortran_order': False, 'shape': (               0, 3), }"),
            "{text}"
        );

        let start = preamble.count.len_pos as usize;
        assert_eq!(
            &preamble.bytes[start..start + 16],
            b"               0"
        );
    }

    #[test]
    fn scalar_shapes_keep_the_trailing_comma() {
        let preamble = compose_header(DType::Bool, &[], 4).unwrap();
        let text = std::str::from_utf8(&preamble.bytes[10..]).unwrap();
        assert!(text.contains("'shape': (   0,), }"), "{text}");
    }

    #[test]
    fn count_field_rejects_overflow() {
        let field = CountField {
            len_pos: 0,
            digits: 2,
        };
        assert_eq!(field.render(99).unwrap(), b"99".to_vec());
        assert_eq!(field.render(7).unwrap(), b" 7".to_vec());
        assert!(matches!(
            field.render(100),
            Err(FillError::InvalidArgument(_))
        ));
    }

    #[test]
    fn digit_width_is_bounded() {
        assert!(compose_header(DType::I8, &[], 0).is_err());
        assert!(compose_header(DType::I8, &[], 20).is_err());
        assert!(compose_header(DType::I8, &[], 19).is_ok());
    }

    #[test]
    fn parses_what_it_writes() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("arr.npy");
        let preamble = compose_header(DType::U32, &[2, 5], 8).unwrap();
        std::fs::write(&path, &preamble.bytes).expect("write header");

        let header = read_npy_header(&path).unwrap();
        assert_eq!(header.dtype, DType::U32);
        assert!(!header.fortran_order);
        assert_eq!(header.shape, vec![0, 2, 5]);
        assert_eq!(header.dims(), &[2, 5]);
        assert_eq!(header.data_offset, preamble.data_pos);
    }

    #[test]
    fn rejects_files_without_magic() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("plain.bin");
        std::fs::write(&path, [0u8; 32]).expect("write");
        assert!(matches!(
            read_npy_header(&path),
            Err(FillError::Header { .. })
        ));
    }
}
