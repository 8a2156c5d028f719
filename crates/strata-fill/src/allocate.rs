use std::collections::btree_map::{self, BTreeMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::chunked::{ChunkedFillable, DEFAULT_CHUNK_SIZE};
use crate::dtype::DType;
use crate::error::{FillError, Result};
use crate::file::{FileFillable, DEFAULT_FLUSH_SIZE};
use crate::fillable::Fillable;
use crate::list::ListFillable;
use crate::npy::DEFAULT_COUNT_DIGITS;
use crate::schema::{PointerTarget, Schema, StorageKey};

/// Which derivable arrays to materialize alongside the required ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FillOptions {
    /// Allocate list `starts` as well as `stops`.
    pub include_list_starts: bool,
    /// Allocate union `offsets` as well as `tags`.
    pub include_union_offsets: bool,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_flush_size() -> usize {
    DEFAULT_FLUSH_SIZE
}

fn default_count_digits() -> usize {
    DEFAULT_COUNT_DIGITS
}

/// Backing strategy used for every fillable in a set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backing {
    List,
    Chunked {
        #[serde(default = "default_chunk_size")]
        chunk_size: usize,
    },
    File {
        directory: PathBuf,
        #[serde(default = "default_flush_size")]
        flush_size: usize,
    },
    NpyFile {
        directory: PathBuf,
        #[serde(default = "default_flush_size")]
        flush_size: usize,
        #[serde(default = "default_count_digits")]
        count_digits: usize,
    },
}

impl Default for Backing {
    fn default() -> Self {
        Backing::Chunked {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// The fillables allocated for one schema, keyed by storage key.
#[derive(Debug, Default)]
pub struct FillableSet {
    fillables: BTreeMap<StorageKey, Box<dyn Fillable>>,
}

impl FillableSet {
    pub fn len(&self) -> usize {
        self.fillables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fillables.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fillables.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&dyn Fillable> {
        self.fillables.get(key).map(|f| f.as_ref())
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut (dyn Fillable + 'static)> {
        self.fillables.get_mut(key).map(|f| f.as_mut())
    }

    pub fn keys(&self) -> impl Iterator<Item = &StorageKey> {
        self.fillables.keys()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, StorageKey, Box<dyn Fillable>> {
        self.fillables.iter()
    }

    pub fn iter_mut(&mut self) -> btree_map::IterMut<'_, StorageKey, Box<dyn Fillable>> {
        self.fillables.iter_mut()
    }

    /// Current length of every member.
    pub fn lengths(&self) -> BTreeMap<StorageKey, usize> {
        self.fillables
            .iter()
            .map(|(key, f)| (key.clone(), f.len()))
            .collect()
    }

    pub fn flush_all(&mut self) -> Result<()> {
        for fillable in self.fillables.values_mut() {
            fillable.flush()?;
        }
        Ok(())
    }

    /// Close every member. All members are closed even if one fails; the first error is
    /// returned.
    pub fn close_all(&mut self) -> Result<()> {
        let mut first_err = None;
        for (key, fillable) in self.fillables.iter_mut() {
            if let Err(err) = fillable.close() {
                log::warn!("failed to close fillable {key}: {err}");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn into_inner(self) -> BTreeMap<StorageKey, Box<dyn Fillable>> {
        self.fillables
    }

    fn register(
        &mut self,
        key: &StorageKey,
        dtype: DType,
        dims: &[usize],
        make: &mut dyn FnMut(&StorageKey, DType, &[usize]) -> Result<Box<dyn Fillable>>,
    ) -> Result<()> {
        if self.fillables.contains_key(key) {
            return Err(FillError::schema(format!(
                "storage key {key} is used by more than one array"
            )));
        }
        log::trace!("allocating fillable {key} ({dtype}, dims {dims:?})");
        let fillable = make(key, dtype, dims)?;
        self.fillables.insert(key.clone(), fillable);
        Ok(())
    }
}

impl IntoIterator for FillableSet {
    type Item = (StorageKey, Box<dyn Fillable>);
    type IntoIter = btree_map::IntoIter<StorageKey, Box<dyn Fillable>>;

    fn into_iter(self) -> Self::IntoIter {
        self.fillables.into_iter()
    }
}

/// Walk `schema` depth-first and create one fillable per physical array through `make`.
pub fn build_fillables_with<F>(
    schema: &Schema,
    options: &FillOptions,
    mut make: F,
) -> Result<FillableSet>
where
    F: FnMut(&StorageKey, DType, &[usize]) -> Result<Box<dyn Fillable>>,
{
    let mut set = FillableSet::default();
    walk(schema, options, &mut make, &mut set)?;
    Ok(set)
}

fn walk(
    node: &Schema,
    options: &FillOptions,
    make: &mut dyn FnMut(&StorageKey, DType, &[usize]) -> Result<Box<dyn Fillable>>,
    set: &mut FillableSet,
) -> Result<()> {
    match node {
        Schema::Primitive { data, dtype, dims } => {
            let dtype = dtype.ok_or_else(|| {
                FillError::schema(format!("dtype is unknown for primitive {data}"))
            })?;
            let dims = dims.as_deref().ok_or_else(|| {
                FillError::schema(format!("dims are unknown for primitive {data}"))
            })?;
            set.register(data, dtype, dims, make)
        }
        Schema::List {
            starts,
            stops,
            index_dtype,
            content,
        } => {
            if options.include_list_starts {
                set.register(starts, *index_dtype, &[], make)?;
            }
            set.register(stops, *index_dtype, &[], make)?;
            walk(content, options, make, set)
        }
        Schema::Union {
            tags,
            offsets,
            tag_dtype,
            index_dtype,
            possibilities,
        } => {
            set.register(tags, *tag_dtype, &[], make)?;
            if options.include_union_offsets {
                set.register(offsets, *index_dtype, &[], make)?;
            }
            for possibility in possibilities {
                walk(possibility, options, make, set)?;
            }
            Ok(())
        }
        Schema::Record { fields } => {
            for field in fields.values() {
                walk(field, options, make, set)?;
            }
            Ok(())
        }
        Schema::Tuple { types } => {
            for slot in types {
                walk(slot, options, make, set)?;
            }
            Ok(())
        }
        Schema::Pointer {
            positions,
            index_dtype,
            target,
        } => {
            set.register(positions, *index_dtype, &[], make)?;
            match target {
                // Internal targets are allocated where they appear in the tree.
                PointerTarget::Internal => Ok(()),
                PointerTarget::External(target) => walk(target, options, make, set),
            }
        }
        Schema::Masked { mask, node } => {
            set.register(mask, DType::Bool, &[], make)?;
            walk(node, options, make, set)
        }
    }
}

/// Allocate fillables for `schema` with the given backing.
pub fn build_fillables(
    schema: &Schema,
    backing: &Backing,
    options: &FillOptions,
) -> Result<FillableSet> {
    match backing {
        Backing::List => fillable_lists(schema, options),
        Backing::Chunked { chunk_size } => fillable_arrays(schema, options, *chunk_size),
        Backing::File {
            directory,
            flush_size,
        } => fillable_files(schema, options, directory, *flush_size),
        Backing::NpyFile {
            directory,
            flush_size,
            count_digits,
        } => fillable_npy_files(schema, options, directory, *flush_size, *count_digits),
    }
}

pub fn fillable_lists(schema: &Schema, options: &FillOptions) -> Result<FillableSet> {
    build_fillables_with(schema, options, |_, dtype, dims| {
        Ok(Box::new(ListFillable::new(dtype, dims)?))
    })
}

pub fn fillable_arrays(
    schema: &Schema,
    options: &FillOptions,
    chunk_size: usize,
) -> Result<FillableSet> {
    build_fillables_with(schema, options, |_, dtype, dims| {
        Ok(Box::new(ChunkedFillable::new(dtype, dims, chunk_size)?))
    })
}

/// One headerless file per storage key inside `directory`, which is created if missing.
pub fn fillable_files(
    schema: &Schema,
    options: &FillOptions,
    directory: impl AsRef<Path>,
    flush_size: usize,
) -> Result<FillableSet> {
    let directory = ensure_directory(directory.as_ref())?;
    build_fillables_with(schema, options, |key, dtype, dims| {
        let path = column_path(directory, key)?;
        Ok(Box::new(FileFillable::create(path, dtype, dims, flush_size)?))
    })
}

/// One `.npy` file per storage key inside `directory`, which is created if missing.
pub fn fillable_npy_files(
    schema: &Schema,
    options: &FillOptions,
    directory: impl AsRef<Path>,
    flush_size: usize,
    count_digits: usize,
) -> Result<FillableSet> {
    let directory = ensure_directory(directory.as_ref())?;
    build_fillables_with(schema, options, |key, dtype, dims| {
        let path = column_path(directory, key)?;
        Ok(Box::new(FileFillable::create_npy(
            path,
            dtype,
            dims,
            flush_size,
            count_digits,
        )?))
    })
}

fn ensure_directory(directory: &Path) -> Result<&Path> {
    if !directory.exists() {
        log::debug!("creating column directory {}", directory.display());
        fs::create_dir_all(directory).map_err(FillError::io(directory))?;
    }
    Ok(directory)
}

/// The key must name a single file directly inside `directory`.
fn column_path(directory: &Path, key: &StorageKey) -> Result<PathBuf> {
    let name = Path::new(key.as_str());
    if key.as_str().is_empty() || name.file_name() != Some(name.as_os_str()) {
        return Err(FillError::schema(format!(
            "storage key {key:?} is not usable as a file name"
        )));
    }
    Ok(directory.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::Values;
    use pretty_assertions::assert_eq;

    fn keys(set: &FillableSet) -> Vec<&str> {
        set.keys().map(StorageKey::as_str).collect()
    }

    fn record_with_list() -> Schema {
        Schema::record([
            ("x", Schema::primitive("x", DType::F64)),
            (
                "ys",
                Schema::list("ys-starts", "ys-stops", Schema::primitive("ys", DType::I32)),
            ),
        ])
    }

    #[test]
    fn list_starts_are_optional() {
        let without = fillable_lists(&record_with_list(), &FillOptions::default()).unwrap();
        assert_eq!(keys(&without), vec!["x", "ys", "ys-stops"]);

        let options = FillOptions {
            include_list_starts: true,
            ..FillOptions::default()
        };
        let with = fillable_lists(&record_with_list(), &options).unwrap();
        assert_eq!(keys(&with), vec!["x", "ys", "ys-starts", "ys-stops"]);
        assert_eq!(with.get("ys-starts").unwrap().dtype(), DType::I64);
    }

    #[test]
    fn union_offsets_are_optional() {
        let schema = Schema::union(
            "u-tags",
            "u-offsets",
            vec![
                Schema::primitive("u0", DType::I32),
                Schema::primitive("u1", DType::F32),
            ],
        );
        let set = fillable_arrays(&schema, &FillOptions::default(), 16).unwrap();
        assert_eq!(keys(&set), vec!["u-tags", "u0", "u1"]);
        assert_eq!(set.get("u-tags").unwrap().dtype(), DType::I8);

        let options = FillOptions {
            include_union_offsets: true,
            ..FillOptions::default()
        };
        let set = fillable_arrays(&schema, &options, 16).unwrap();
        assert_eq!(keys(&set), vec!["u-offsets", "u-tags", "u0", "u1"]);
    }

    #[test]
    fn internal_pointers_do_not_rewalk_their_target() {
        let schema = Schema::tuple(vec![
            Schema::primitive("t0", DType::U8),
            Schema::pointer("p-internal", PointerTarget::Internal),
            Schema::pointer(
                "p-external",
                PointerTarget::External(Box::new(Schema::primitive("target", DType::U16))),
            ),
        ]);
        let set = fillable_lists(&schema, &FillOptions::default()).unwrap();
        assert_eq!(keys(&set), vec!["p-external", "p-internal", "t0", "target"]);
    }

    #[test]
    fn masked_nodes_get_a_boolean_mask() {
        let schema = Schema::primitive("v", DType::F32).masked("v-mask");
        let mut set = fillable_lists(&schema, &FillOptions::default()).unwrap();
        assert_eq!(keys(&set), vec!["v", "v-mask"]);

        let mask = set.get_mut("v-mask").unwrap();
        assert_eq!(mask.dtype(), DType::Bool);
        mask.extend(Values::from(&[true, false, true])).unwrap();
        set.get_mut("v")
            .unwrap()
            .append(Values::from(&[1.5f32]))
            .unwrap();

        let lengths = set.lengths();
        assert_eq!(lengths["v-mask"], 3);
        assert_eq!(lengths["v"], 1);
    }

    #[test]
    fn primitives_need_dtype_and_dims() {
        let missing_dtype = Schema::Primitive {
            data: "a".into(),
            dtype: None,
            dims: Some(vec![]),
        };
        let missing_dims = Schema::Primitive {
            data: "b".into(),
            dtype: Some(DType::I8),
            dims: None,
        };
        for schema in [missing_dtype, missing_dims] {
            assert!(matches!(
                fillable_lists(&schema, &FillOptions::default()),
                Err(FillError::Schema(_))
            ));
        }
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let schema = Schema::tuple(vec![
            Schema::primitive("same", DType::I8),
            Schema::primitive("same", DType::I16),
        ]);
        assert!(matches!(
            fillable_lists(&schema, &FillOptions::default()),
            Err(FillError::Schema(_))
        ));
    }

    #[test]
    fn keys_must_be_plain_file_names() {
        let dir = tempfile::tempdir().expect("temp dir");
        for bad in ["", "../escape", "nested/name"] {
            let schema = Schema::primitive(bad, DType::I8);
            assert!(
                matches!(
                    fillable_files(&schema, &FillOptions::default(), dir.path(), 4),
                    Err(FillError::Schema(_))
                ),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn backing_config_parses_with_defaults() {
        let backing: Backing =
            serde_json::from_str(r#"{"kind": "npy_file", "directory": "/tmp/cols"}"#).unwrap();
        assert_eq!(
            backing,
            Backing::NpyFile {
                directory: PathBuf::from("/tmp/cols"),
                flush_size: DEFAULT_FLUSH_SIZE,
                count_digits: DEFAULT_COUNT_DIGITS,
            }
        );
        let options: FillOptions =
            serde_json::from_str(r#"{"include_list_starts": true}"#).unwrap();
        assert!(options.include_list_starts);
        assert!(!options.include_union_offsets);
    }
}
