use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::error::{FillError, Result};

/// Identity of one physical array in a schema, e.g. "stops of list `x`" or "tags of union `u`".
///
/// Keys are chosen by whoever builds the schema and must be unique within one tree. File-backed
/// fillables use the key as the file name inside their directory.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for StorageKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StorageKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for StorageKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

fn index_dtype() -> DType {
    DType::I64
}

fn tag_dtype() -> DType {
    DType::I8
}

/// Where a pointer's targets live.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerTarget {
    /// The target is a node elsewhere in the same tree (possibly an ancestor); its storage is
    /// allocated where that node appears, not here.
    Internal,
    /// The target is only reachable through this pointer.
    External(Box<Schema>),
}

/// A schema tree node, carrying the storage keys of the physical arrays it needs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schema {
    Primitive {
        data: StorageKey,
        dtype: Option<DType>,
        #[serde(default = "scalar_dims")]
        dims: Option<Vec<usize>>,
    },
    List {
        starts: StorageKey,
        stops: StorageKey,
        #[serde(default = "index_dtype")]
        index_dtype: DType,
        content: Box<Schema>,
    },
    Union {
        tags: StorageKey,
        offsets: StorageKey,
        #[serde(default = "tag_dtype")]
        tag_dtype: DType,
        #[serde(default = "index_dtype")]
        index_dtype: DType,
        possibilities: Vec<Schema>,
    },
    Record {
        fields: BTreeMap<String, Schema>,
    },
    Tuple {
        types: Vec<Schema>,
    },
    Pointer {
        positions: StorageKey,
        #[serde(default = "index_dtype")]
        index_dtype: DType,
        target: PointerTarget,
    },
    Masked {
        mask: StorageKey,
        node: Box<Schema>,
    },
}

fn scalar_dims() -> Option<Vec<usize>> {
    Some(Vec::new())
}

impl Schema {
    /// A scalar primitive column.
    pub fn primitive(data: impl Into<StorageKey>, dtype: DType) -> Self {
        Schema::Primitive {
            data: data.into(),
            dtype: Some(dtype),
            dims: Some(Vec::new()),
        }
    }

    /// A primitive column whose elements have a fixed trailing shape.
    pub fn primitive_with_dims(data: impl Into<StorageKey>, dtype: DType, dims: &[usize]) -> Self {
        Schema::Primitive {
            data: data.into(),
            dtype: Some(dtype),
            dims: Some(dims.to_vec()),
        }
    }

    pub fn list(starts: impl Into<StorageKey>, stops: impl Into<StorageKey>, content: Schema) -> Self {
        Schema::List {
            starts: starts.into(),
            stops: stops.into(),
            index_dtype: index_dtype(),
            content: Box::new(content),
        }
    }

    pub fn union(
        tags: impl Into<StorageKey>,
        offsets: impl Into<StorageKey>,
        possibilities: Vec<Schema>,
    ) -> Self {
        Schema::Union {
            tags: tags.into(),
            offsets: offsets.into(),
            tag_dtype: tag_dtype(),
            index_dtype: index_dtype(),
            possibilities,
        }
    }

    pub fn record<K: Into<String>>(fields: impl IntoIterator<Item = (K, Schema)>) -> Self {
        Schema::Record {
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn tuple(types: Vec<Schema>) -> Self {
        Schema::Tuple { types }
    }

    pub fn pointer(positions: impl Into<StorageKey>, target: PointerTarget) -> Self {
        Schema::Pointer {
            positions: positions.into(),
            index_dtype: index_dtype(),
            target,
        }
    }

    /// Wrap `self` in a validity mask.
    pub fn masked(self, mask: impl Into<StorageKey>) -> Self {
        Schema::Masked {
            mask: mask.into(),
            node: Box::new(self),
        }
    }

    /// Parse a schema from its JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|err| FillError::schema(format!("invalid schema: {err}")))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| FillError::schema(format!("unserializable schema: {err}")))
    }
}
