//! The on-disk content-addressed store.
//!
//! Every installation goes through the same discipline: write into a
//! unique `.tmp-*` directory inside the store (same filesystem), drop
//! write permission bits, then rename into place. A partially written
//! entry is never observable at its final path, and the first writer
//! wins; colliding writers produce identical content by construction.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tokio::fs;
use tracing::debug;

use crate::derivation::DrvFile;
use crate::error::{Error, Result};
use crate::hash;
use crate::store_path::{StoreDir, StorePath};

const FILE_MODE: u32 = 0o444;
const DIR_MODE: u32 = 0o555;

pub struct Store {
    dir: StoreDir,
}

impl Store {
    /// Opens the store rooted at `path`, creating the directory (0o755)
    /// when absent.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Store> {
        let dir = StoreDir::new(path.as_ref())?;
        match fs::metadata(&dir).await {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&dir)
                    .await
                    .map_err(|e| Error::io(dir.to_str(), e))?;
                fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755))
                    .await
                    .map_err(|e| Error::io(dir.to_str(), e))?;
            }
            Err(err) => return Err(Error::io(dir.to_str(), err)),
        }
        Ok(Store { dir })
    }

    pub fn dir(&self) -> &StoreDir {
        &self.dir
    }

    /// Whether `path` exists on disk.
    pub async fn has(&self, path: &StorePath) -> bool {
        fs::symlink_metadata(path).await.is_ok()
    }

    /// Entry names immediately under the store directory, unordered.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| Error::io(self.dir.to_str(), e))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io(self.dir.to_str(), e))?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    /// Raw bytes of a file entry.
    pub async fn read(&self, path: &StorePath) -> Result<Vec<u8>> {
        fs::read(path).await.map_err(|e| Error::io(path.as_path(), e))
    }

    /// Parses a derivation file entry.
    pub async fn read_drv(&self, path: &StorePath) -> Result<DrvFile> {
        let bytes = self.read(path).await?;
        serde_json::from_slice(&bytes).map_err(|source| Error::BadDrvFile {
            path: PathBuf::from(path.as_str()),
            source,
        })
    }

    /// Copies the file at `local` into the store under its content
    /// address. The name defaults to the local basename.
    pub async fn add_source(&self, local: &Path, name: Option<&str>) -> Result<StorePath> {
        let name = match name {
            Some(name) => name,
            None => local
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    Error::io(
                        local,
                        io::Error::new(io::ErrorKind::InvalidInput, "no usable file name"),
                    )
                })?,
        };
        let bytes = fs::read(local).await.map_err(|e| Error::io(local, e))?;
        let content_hash = hash::digest_hex(&bytes);
        let path = self.dir.make_store_path("source", &content_hash, name)?;
        if self.has(&path).await {
            return Ok(path);
        }
        self.install_file(&path, &bytes).await?;
        debug!(source = %local.display(), path = %path, "added source to store");
        Ok(path)
    }

    /// Installs a derivation file. The JSON form is for debuggability;
    /// it is never re-hashed. No-op when the path already exists.
    pub async fn add_drv(&self, path: &StorePath, drv: &DrvFile) -> Result<()> {
        if self.has(path).await {
            return Ok(());
        }
        let bytes = serde_json::to_vec_pretty(drv).map_err(|source| Error::BadDrvFile {
            path: PathBuf::from(path.as_str()),
            source,
        })?;
        self.install_file(path, &bytes).await?;
        debug!(path = %path, "wrote derivation file");
        Ok(())
    }

    /// Locks down `temp` (files 0o444, directories 0o555) and renames it
    /// to `final_path`. When both are the same path only the permission
    /// pass runs; when the final path already exists the temp tree is
    /// discarded, the earlier content wins.
    pub async fn register_output(&self, temp: &Path, final_path: &StorePath) -> Result<()> {
        if temp != AsRef::<Path>::as_ref(final_path) && self.has(final_path).await {
            return discard_tree(temp).await.map_err(|e| Error::io(temp, e));
        }
        lock_down(temp).await.map_err(|e| Error::io(temp, e))?;
        if temp == AsRef::<Path>::as_ref(final_path) {
            return Ok(());
        }
        match fs::rename(temp, final_path).await {
            Ok(()) => {
                debug!(path = %final_path, "registered output");
                Ok(())
            }
            Err(_) if self.has(final_path).await => {
                // Lost the race; the winner's content is equal.
                let _ = discard_tree(temp).await;
                Ok(())
            }
            Err(err) => Err(Error::io(temp, err)),
        }
    }

    /// Creates a unique scratch directory inside the store, so a later
    /// rename stays on one filesystem.
    pub(crate) fn scratch_dir(&self) -> Result<TempDir> {
        tempfile::Builder::new()
            .prefix(".tmp-")
            .tempdir_in(&self.dir)
            .map_err(|e| Error::io(self.dir.to_str(), e))
    }

    async fn install_file(&self, final_path: &StorePath, bytes: &[u8]) -> Result<()> {
        let scratch = self.scratch_dir()?;
        let staged = scratch.path().join(final_path.name());
        fs::write(&staged, bytes)
            .await
            .map_err(|e| Error::io(&staged, e))?;
        fs::set_permissions(&staged, std::fs::Permissions::from_mode(FILE_MODE))
            .await
            .map_err(|e| Error::io(&staged, e))?;
        match fs::rename(&staged, final_path).await {
            Ok(()) => Ok(()),
            Err(_) if self.has(final_path).await => Ok(()),
            Err(err) => Err(Error::io(&staged, err)),
        }
        // `scratch` drops here, removing the temp directory and, on
        // failure, whatever was staged inside it.
    }
}

/// Recursively drops write bits: files 0o444, directories 0o555.
/// Symlinks are left alone.
async fn lock_down(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path).await?;
    if !meta.is_dir() {
        return fs::set_permissions(path, std::fs::Permissions::from_mode(FILE_MODE)).await;
    }
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                fs::set_permissions(entry.path(), std::fs::Permissions::from_mode(FILE_MODE))
                    .await?;
            }
        }
        fs::set_permissions(&dir, std::fs::Permissions::from_mode(DIR_MODE)).await?;
    }
    Ok(())
}

/// Removes a possibly locked-down tree, restoring directory write bits
/// first so the entries can be unlinked.
pub(crate) async fn discard_tree(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path).await?;
    if !meta.is_dir() {
        return fs::remove_file(path).await;
    }
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).await?;
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                stack.push(entry.path());
            }
        }
    }
    fs::remove_dir_all(path).await
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::derivation::DrvOutput;

    async fn temp_store() -> (tempfile::TempDir, Store) {
        let root = tempfile::tempdir().unwrap();
        let store = Store::open(root.path().join("store")).await.unwrap();
        (root, store)
    }

    fn sample_drv(out: &str) -> DrvFile {
        let mut outputs = BTreeMap::new();
        outputs.insert(
            "out".to_string(),
            DrvOutput {
                path: out.to_string(),
                hash: None,
                hash_algo: None,
            },
        );
        DrvFile {
            outputs,
            input_drvs: BTreeMap::new(),
            input_srcs: vec![],
            system: "x86_64-linux".into(),
            builder: "/bin/sh".into(),
            args: vec![],
            env: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn open_creates_directory() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("fresh");
        let store = Store::open(&path).await.unwrap();
        assert!(path.is_dir());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_source_is_content_addressed() {
        let (_root, store) = temp_store().await;
        let src = _root.path().join("greeting.txt");
        fs::write(&src, "hello world\n").await.unwrap();

        let path = store.add_source(&src, None).await.unwrap();
        assert_eq!(path.name(), "greeting.txt");
        assert!(store.has(&path).await);
        assert_eq!(store.read(&path).await.unwrap(), b"hello world\n");

        // Same content, same path; second add is a no-op.
        let again = store.add_source(&src, None).await.unwrap();
        assert_eq!(path, again);

        // Different name, different path.
        let renamed = store.add_source(&src, Some("other.txt")).await.unwrap();
        assert_ne!(path, renamed);
        assert_eq!(renamed.name(), "other.txt");
    }

    #[tokio::test]
    async fn installed_entries_are_read_only() {
        let (_root, store) = temp_store().await;
        let src = _root.path().join("data");
        fs::write(&src, "bytes").await.unwrap();
        let path = store.add_source(&src, None).await.unwrap();
        let mode = fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o444);
    }

    #[tokio::test]
    async fn no_scratch_left_behind() {
        let (_root, store) = temp_store().await;
        let src = _root.path().join("data");
        fs::write(&src, "bytes").await.unwrap();
        store.add_source(&src, None).await.unwrap();
        let leftovers: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .filter(|name| name.starts_with(".tmp-"))
            .collect();
        assert_eq!(leftovers, Vec::<String>::new());
    }

    #[tokio::test]
    async fn add_drv_roundtrips() {
        let (_root, store) = temp_store().await;
        let out = store
            .dir()
            .make_store_path("output:out", &hash::digest_hex("x"), "demo")
            .unwrap();
        let drv_path = out.to_drv_path();
        let drv = sample_drv(out.as_str());

        store.add_drv(&drv_path, &drv).await.unwrap();
        assert!(store.has(&drv_path).await);
        assert_eq!(store.read_drv(&drv_path).await.unwrap(), drv);

        // Existing entries are never rewritten.
        let mut other = drv.clone();
        other.system = "aarch64-linux".into();
        store.add_drv(&drv_path, &other).await.unwrap();
        assert_eq!(store.read_drv(&drv_path).await.unwrap(), drv);
    }

    #[tokio::test]
    async fn read_drv_rejects_garbage() {
        let (_root, store) = temp_store().await;
        let src = _root.path().join("not-json");
        fs::write(&src, "not a derivation").await.unwrap();
        let path = store.add_source(&src, None).await.unwrap();
        assert!(matches!(
            store.read_drv(&path).await,
            Err(Error::BadDrvFile { .. })
        ));
    }

    #[tokio::test]
    async fn register_output_locks_and_renames() {
        let (_root, store) = temp_store().await;
        let out = store
            .dir()
            .make_store_path("output:out", &hash::digest_hex("reg"), "built")
            .unwrap();

        let temp = store.scratch_dir().unwrap().keep();
        fs::create_dir(temp.join("sub")).await.unwrap();
        fs::write(temp.join("sub/file"), "result").await.unwrap();

        store.register_output(&temp, &out).await.unwrap();
        assert!(store.has(&out).await);
        assert!(!temp.exists());

        let dir_mode = fs::metadata(&out).await.unwrap().permissions().mode() & 0o777;
        let sub_mode = fs::metadata(out.as_path().join("sub"))
            .await
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        let file_mode = fs::metadata(out.as_path().join("sub/file"))
            .await
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o555);
        assert_eq!(sub_mode, 0o555);
        assert_eq!(file_mode, 0o444);
    }

    #[tokio::test]
    async fn register_output_discards_loser() {
        let (_root, store) = temp_store().await;
        let out = store
            .dir()
            .make_store_path("output:out", &hash::digest_hex("race"), "built")
            .unwrap();

        let first = store.scratch_dir().unwrap().keep();
        fs::write(first.join("file"), "content").await.unwrap();
        store.register_output(&first, &out).await.unwrap();

        let second = store.scratch_dir().unwrap().keep();
        fs::write(second.join("file"), "content").await.unwrap();
        store.register_output(&second, &out).await.unwrap();

        assert!(store.has(&out).await);
        assert!(!second.exists());
    }
}
