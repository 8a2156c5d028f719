use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum FillError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("index {index} is out of bounds for length {len}")]
    IndexOutOfRange { index: isize, len: usize },
    #[error("schema error: {0}")]
    Schema(String),
    #[error("i/o error on `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("fillable has been closed")]
    ResourceClosed,
    #[error("malformed array header in `{path}`: {reason}")]
    Header { path: PathBuf, reason: String },
}

impl FillError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}

pub type Result<T> = std::result::Result<T, FillError>;
