use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FillError, Result};

/// Primitive scalar type stored in a fillable.
///
/// All types are stored little-endian regardless of the host so files written on one machine
/// read back identically on another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl DType {
    pub const fn size(self) -> usize {
        match self {
            DType::Bool | DType::I8 | DType::U8 => 1,
            DType::I16 | DType::U16 => 2,
            DType::I32 | DType::U32 | DType::F32 => 4,
            DType::I64 | DType::U64 | DType::F64 => 8,
        }
    }

    /// The NumPy `descr` string for this type (byte order included).
    pub const fn descr(self) -> &'static str {
        match self {
            DType::Bool => "|b1",
            DType::I8 => "|i1",
            DType::U8 => "|u1",
            DType::I16 => "<i2",
            DType::I32 => "<i4",
            DType::I64 => "<i8",
            DType::U16 => "<u2",
            DType::U32 => "<u4",
            DType::U64 => "<u8",
            DType::F32 => "<f4",
            DType::F64 => "<f8",
        }
    }

    /// Parse a NumPy `descr` string. Only little-endian or byte-order-free descriptors are
    /// accepted since that is all this crate ever writes.
    pub fn from_descr(descr: &str) -> Option<Self> {
        let (order, code) = match descr.as_bytes().first()? {
            b'<' | b'|' | b'=' => (descr.as_bytes()[0], &descr[1..]),
            _ => (b'=', descr),
        };
        let dtype = match code {
            "b1" | "?" => DType::Bool,
            "i1" => DType::I8,
            "u1" => DType::U8,
            "i2" => DType::I16,
            "i4" => DType::I32,
            "i8" => DType::I64,
            "u2" => DType::U16,
            "u4" => DType::U32,
            "u8" => DType::U64,
            "f4" => DType::F32,
            "f8" => DType::F64,
            _ => return None,
        };
        if order == b'=' && dtype.size() > 1 && cfg!(target_endian = "big") {
            return None;
        }
        Some(dtype)
    }

    pub const fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::I8 => "i8",
            DType::I16 => "i16",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::U8 => "u8",
            DType::U16 => "u16",
            DType::U32 => "u32",
            DType::U64 => "u64",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

mod private {
    pub trait Sealed {}
}

/// A Rust scalar type with a fixed [`DType`] and little-endian encoding.
pub trait NativeType: Copy + PartialEq + fmt::Debug + Send + Sync + 'static + private::Sealed {
    const DTYPE: DType;

    fn write_le(self, out: &mut [u8]);

    fn read_le(bytes: &[u8]) -> Self;

    fn wrap(values: &[Self]) -> Values<'_>;
}

impl private::Sealed for bool {}

impl NativeType for bool {
    const DTYPE: DType = DType::Bool;

    fn write_le(self, out: &mut [u8]) {
        out[0] = self as u8;
    }

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    fn wrap(values: &[Self]) -> Values<'_> {
        Values::Bool(values)
    }
}

macro_rules! native_numeric {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl private::Sealed for $ty {}

            impl NativeType for $ty {
                const DTYPE: DType = DType::$variant;

                fn write_le(self, out: &mut [u8]) {
                    out[..std::mem::size_of::<$ty>()].copy_from_slice(&self.to_le_bytes());
                }

                fn read_le(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    buf.copy_from_slice(&bytes[..std::mem::size_of::<$ty>()]);
                    <$ty>::from_le_bytes(buf)
                }

                fn wrap(values: &[Self]) -> Values<'_> {
                    Values::$variant(values)
                }
            }
        )*
    };
}

native_numeric! {
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
}

/// A borrowed, typed, flat run of scalars handed to `append`/`extend`.
///
/// Elements with non-empty `dims` are laid out row-major, so a batch of `n` elements of dims
/// `(3,)` is a slice of `3 * n` scalars.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Values<'a> {
    Bool(&'a [bool]),
    I8(&'a [i8]),
    I16(&'a [i16]),
    I32(&'a [i32]),
    I64(&'a [i64]),
    U8(&'a [u8]),
    U16(&'a [u16]),
    U32(&'a [u32]),
    U64(&'a [u64]),
    F32(&'a [f32]),
    F64(&'a [f64]),
}

macro_rules! for_each_values {
    ($values:expr, $slice:ident => $body:expr) => {
        match $values {
            Values::Bool($slice) => $body,
            Values::I8($slice) => $body,
            Values::I16($slice) => $body,
            Values::I32($slice) => $body,
            Values::I64($slice) => $body,
            Values::U8($slice) => $body,
            Values::U16($slice) => $body,
            Values::U32($slice) => $body,
            Values::U64($slice) => $body,
            Values::F32($slice) => $body,
            Values::F64($slice) => $body,
        }
    };
}

impl<'a> Values<'a> {
    pub fn dtype(&self) -> DType {
        match self {
            Values::Bool(_) => DType::Bool,
            Values::I8(_) => DType::I8,
            Values::I16(_) => DType::I16,
            Values::I32(_) => DType::I32,
            Values::I64(_) => DType::I64,
            Values::U8(_) => DType::U8,
            Values::U16(_) => DType::U16,
            Values::U32(_) => DType::U32,
            Values::U64(_) => DType::U64,
            Values::F32(_) => DType::F32,
            Values::F64(_) => DType::F64,
        }
    }

    /// Number of scalars (not elements) in the run.
    pub fn scalar_count(&self) -> usize {
        for_each_values!(self, s => s.len())
    }

    /// Append the little-endian encoding of every scalar to `out`.
    pub(crate) fn encode_extend(&self, out: &mut Vec<u8>) {
        let size = self.dtype().size();
        let start = out.len();
        out.resize(start + self.scalar_count() * size, 0);
        let dst = &mut out[start..];
        for_each_values!(self, s => {
            for (value, slot) in s.iter().zip(dst.chunks_exact_mut(size)) {
                value.write_le(slot);
            }
        })
    }
}

impl<'a, T: NativeType> From<&'a [T]> for Values<'a> {
    fn from(values: &'a [T]) -> Self {
        T::wrap(values)
    }
}

impl<'a, T: NativeType, const N: usize> From<&'a [T; N]> for Values<'a> {
    fn from(values: &'a [T; N]) -> Self {
        T::wrap(values.as_slice())
    }
}

impl<'a, T: NativeType> From<&'a Vec<T>> for Values<'a> {
    fn from(values: &'a Vec<T>) -> Self {
        T::wrap(values.as_slice())
    }
}

/// A freshly materialized, owned typed array.
///
/// Slices carry shape `[len, dims...]`; single elements carry shape `dims` (empty for scalars).
#[derive(Clone, Debug, PartialEq)]
pub struct Array {
    dtype: DType,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

impl Array {
    pub(crate) fn from_parts(dtype: DType, shape: Vec<usize>, bytes: Vec<u8>) -> Self {
        debug_assert_eq!(
            bytes.len(),
            shape.iter().product::<usize>() * dtype.size(),
            "array byte length must match its shape"
        );
        Self {
            dtype,
            shape,
            bytes,
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Length of the leading axis, or 1 for a zero-dimensional element.
    pub fn len(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    pub fn is_empty(&self) -> bool {
        self.scalar_count() == 0
    }

    pub fn scalar_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Raw little-endian bytes, row-major.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Decode every scalar as `T`, flattened row-major.
    pub fn to_vec<T: NativeType>(&self) -> Result<Vec<T>> {
        self.check_dtype::<T>()?;
        Ok(self
            .bytes
            .chunks_exact(self.dtype.size())
            .map(T::read_le)
            .collect())
    }

    /// Decode a single-scalar array.
    pub fn scalar<T: NativeType>(&self) -> Result<T> {
        self.check_dtype::<T>()?;
        if self.scalar_count() != 1 {
            return Err(FillError::invalid(format!(
                "array of shape {:?} is not a single scalar",
                self.shape
            )));
        }
        Ok(T::read_le(&self.bytes))
    }

    fn check_dtype<T: NativeType>(&self) -> Result<()> {
        if T::DTYPE != self.dtype {
            return Err(FillError::invalid(format!(
                "cannot read {} array as {}",
                self.dtype,
                T::DTYPE
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descr_roundtrips_for_every_dtype() {
        for dtype in [
            DType::Bool,
            DType::I8,
            DType::I16,
            DType::I32,
            DType::I64,
            DType::U8,
            DType::U16,
            DType::U32,
            DType::U64,
            DType::F32,
            DType::F64,
        ] {
            assert_eq!(DType::from_descr(dtype.descr()), Some(dtype), "{dtype}");
        }
        assert_eq!(DType::from_descr(">i4"), None);
        assert_eq!(DType::from_descr("<c16"), None);
    }

    #[test]
    fn values_encode_little_endian() {
        let mut out = Vec::new();
        Values::from(&[1i16, -2]).encode_extend(&mut out);
        assert_eq!(out, vec![0x01, 0x00, 0xFE, 0xFF]);

        let mut out = Vec::new();
        Values::from(&[true, false, true]).encode_extend(&mut out);
        assert_eq!(out, vec![1, 0, 1]);
    }

    #[test]
    fn array_rejects_mismatched_reads() {
        let bytes = [1.5f64, 2.5].iter().flat_map(|v| v.to_le_bytes()).collect();
        let array = Array::from_parts(DType::F64, vec![2], bytes);
        assert_eq!(array.to_vec::<f64>().unwrap(), vec![1.5, 2.5]);
        assert!(matches!(
            array.to_vec::<i64>(),
            Err(FillError::InvalidArgument(_))
        ));
        assert!(array.scalar::<f64>().is_err());
    }
}
