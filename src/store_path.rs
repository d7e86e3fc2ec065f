use std::fmt;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::base32;
use crate::hash;

pub const DIGEST_SIZE: usize = 20;
pub const DIGEST_ENCODED_SIZE: usize = base32::encode_len(DIGEST_SIZE);

pub const DRV_EXTENSION: &str = ".drv";

/// How fixed-output content is ingested when deriving its store path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, derive_more::Display)]
pub enum HashMode {
    #[default]
    #[display("flat")]
    Flat,
    #[display("recursive")]
    Recursive,
}

impl HashMode {
    /// Prefix used inside the fixed-output fingerprint.
    pub const fn fingerprint_prefix(&self) -> &'static str {
        match self {
            HashMode::Flat => "",
            HashMode::Recursive => "r:",
        }
    }
}

/// The directory a store is rooted at.
///
/// All path computation is relative to this; moving the directory changes
/// every digest derived under it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreDir(Arc<String>);

impl StoreDir {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<StoreDir, StorePathError> {
        let path = path.as_ref();
        let s = path
            .to_str()
            .ok_or_else(|| StorePathError::BadStoreDir(path.display().to_string()))?;
        if !path.is_absolute() || s.ends_with('/') {
            return Err(StorePathError::BadStoreDir(s.to_owned()));
        }
        Ok(StoreDir(Arc::new(s.to_owned())))
    }

    pub fn to_str(&self) -> &str {
        &self.0
    }

    /// Computes a store path from a fingerprint.
    ///
    /// ```EBNF
    /// fingerprint = type, ':sha256:', inner_digest, ':', store_dir, ':', name
    /// store_path  = store_dir, '/', nix32(sha256(fingerprint)[0..20]), '-', name
    /// ```
    pub fn make_store_path(
        &self,
        path_type: &str,
        inner_digest: &str,
        name: &str,
    ) -> Result<StorePath, StorePathError> {
        validate_name(name)?;
        let fingerprint = format!("{}:sha256:{}:{}:{}", path_type, inner_digest, self, name);
        let digest = hash::digest(&fingerprint);
        let encoded = base32::encode(digest.truncated());
        Ok(StorePath {
            path: format!("{}/{}-{}", self, encoded, name),
            name_off: self.0.len() + 1 + DIGEST_ENCODED_SIZE + 1,
        })
    }

    /// Fixed-output variant: the inner digest is derived from the declared
    /// content hash and ingestion mode rather than from a derivation.
    pub fn make_fixed_output_path(
        &self,
        mode: HashMode,
        hash_hex: &str,
        name: &str,
    ) -> Result<StorePath, StorePathError> {
        let fingerprint = format!(
            "fixed:out:{}sha256:{}:",
            mode.fingerprint_prefix(),
            hash_hex
        );
        let inner = hash::digest(&fingerprint);
        self.make_store_path("output:out", &inner.to_string(), name)
    }

    /// Parses an absolute path string into a validated [`StorePath`].
    pub fn parse(&self, s: &str) -> Result<StorePath, StorePathError> {
        let rest = s
            .strip_prefix(self.to_str())
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| StorePathError::NotInStore(s.to_owned()))?;
        let bytes = rest.as_bytes();
        if bytes.len() < DIGEST_ENCODED_SIZE + 2 {
            return Err(StorePathError::BadDigest);
        }
        let mut decoded = [0u8; DIGEST_SIZE];
        base32::decode_mut(&bytes[..DIGEST_ENCODED_SIZE], &mut decoded)
            .map_err(|_| StorePathError::BadDigest)?;
        if bytes[DIGEST_ENCODED_SIZE] != b'-' {
            return Err(StorePathError::NotInStore(s.to_owned()));
        }
        // The digest and separator are ASCII, so this slice is on a
        // character boundary.
        validate_name(&rest[DIGEST_ENCODED_SIZE + 1..])?;
        Ok(StorePath {
            path: s.to_owned(),
            name_off: self.0.len() + 1 + DIGEST_ENCODED_SIZE + 1,
        })
    }

    /// Whether `path` points at or below this store directory.
    pub fn contains<P: AsRef<Path>>(&self, path: P) -> bool {
        path.as_ref()
            .to_str()
            .and_then(|s| s.strip_prefix(self.to_str()))
            .is_some_and(|rest| rest.starts_with('/'))
    }
}

impl fmt::Display for StoreDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_str())
    }
}

impl AsRef<Path> for StoreDir {
    fn as_ref(&self) -> &Path {
        Path::new(self.0.as_str())
    }
}

/// An absolute store path: `<store-dir>/<nix32-digest>-<name>`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePath {
    path: String,
    name_off: usize,
}

impl StorePath {
    pub fn as_str(&self) -> &str {
        &self.path
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.path)
    }

    pub fn name(&self) -> &str {
        &self.path[self.name_off..]
    }

    pub fn digest_str(&self) -> &str {
        let start = self.name_off - DIGEST_ENCODED_SIZE - 1;
        &self.path[start..start + DIGEST_ENCODED_SIZE]
    }

    pub fn is_drv(&self) -> bool {
        self.name().ends_with(DRV_EXTENSION)
    }

    /// The matching derivation-file path, the plain path with `.drv`
    /// appended.
    pub fn to_drv_path(&self) -> StorePath {
        StorePath {
            path: format!("{}{}", self.path, DRV_EXTENSION),
            name_off: self.name_off,
        }
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl fmt::Debug for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StorePath")
            .field(&format_args!("{}", self.path))
            .finish()
    }
}

impl AsRef<Path> for StorePath {
    fn as_ref(&self) -> &Path {
        Path::new(&self.path)
    }
}

impl AsRef<str> for StorePath {
    fn as_ref(&self) -> &str {
        &self.path
    }
}

/// Names must be non-empty and free of `/` and NUL.
pub fn validate_name(name: &str) -> Result<(), StorePathError> {
    if name.is_empty() {
        return Err(StorePathError::EmptyName);
    }
    if let Some(idx) = name.bytes().position(|b| b == b'/' || b == 0) {
        return Err(StorePathError::NameSymbol(idx));
    }
    Ok(())
}

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum StorePathError {
    #[error("store directory '{0}' must be an absolute UTF-8 path")]
    BadStoreDir(String),
    #[error("store path name is empty")]
    EmptyName,
    #[error("store path name contains forbidden character at {0}")]
    NameSymbol(usize),
    #[error("path '{0}' is not inside the store directory")]
    NotInStore(String),
    #[error("invalid store path digest")]
    BadDigest,
}
