use std::path::PathBuf;

use thiserror::Error;

use crate::canon::SerializationError;
use crate::derivation::{DrvFileError, ValidationError};
use crate::modulo::CycleError;
use crate::store_path::StorePathError;

/// Everything the engine can fail with. No operation retries; whatever
/// surfaces here has already cleaned up its partial writes.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Validation(
        #[from]
        #[source]
        ValidationError,
    ),
    #[error("{0}")]
    Serialization(
        #[from]
        #[source]
        SerializationError,
    ),
    #[error("{0}")]
    Cycle(
        #[from]
        #[source]
        CycleError,
    ),
    #[error("{0}")]
    StorePath(
        #[from]
        #[source]
        StorePathError,
    ),
    #[error("{0}")]
    DrvFile(
        #[from]
        #[source]
        DrvFileError,
    ),
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed derivation file '{}': {source}", path.display())]
    BadDrvFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("builder for '{drv}' failed with exit code {code}: {stderr}")]
    BuildFailed {
        drv: String,
        code: i32,
        stderr: String,
    },
    #[error("builder for '{drv}' exited successfully but produced no output at '{out_path}'")]
    MissingOutput { drv: String, out_path: String },
    #[error("sandbox failed to start: {0}")]
    Sandbox(
        #[source]
        std::io::Error,
    ),
}

impl Error {
    pub(crate) fn io<P: Into<PathBuf>>(path: P, source: std::io::Error) -> Error {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
