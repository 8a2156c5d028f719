//! Write-side column buffers for schema-driven columnar data.
//!
//! This crate focuses on:
//! - Appendable, typed column buffers ("fillables") with a shared recovery contract: a failed
//!   append leaves the buffer exactly as it was.
//! - Three backings: one growable in-memory sequence, fixed-size in-memory chunks, and a file
//!   with a single in-memory staging chunk (optionally behind a self-describing `.npy` header).
//! - Walking a schema tree (lists, unions, records, tuples, pointers, masks) and allocating one
//!   fillable per physical array it needs.

#![deny(unsafe_code)]

mod allocate;
mod chunked;
mod dtype;
mod error;
mod file;
mod fillable;
mod list;
pub mod npy;
mod schema;
mod slice;

pub use crate::allocate::{
    build_fillables, build_fillables_with, fillable_arrays, fillable_files, fillable_lists,
    fillable_npy_files, Backing, FillOptions, FillableSet,
};
pub use crate::chunked::{ChunkedFillable, DEFAULT_CHUNK_SIZE};
pub use crate::dtype::{Array, DType, NativeType, Values};
pub use crate::error::{FillError, Result};
pub use crate::file::{FileCursor, FileFillable, FileView, DEFAULT_FLUSH_SIZE};
pub use crate::fillable::Fillable;
pub use crate::list::ListFillable;
pub use crate::npy::{read_npy_header, NpyHeader, DEFAULT_COUNT_DIGITS};
pub use crate::schema::{PointerTarget, Schema, StorageKey};
pub use crate::slice::{ResolvedSlice, SliceSpec};
