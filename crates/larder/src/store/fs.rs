//! Local-volume object store
//!
//! One file per storage key under a root directory. Writes go to a temporary
//! sibling first and are renamed into place, so a blob is either fully present
//! or absent. File names beginning with a dot are reserved for bookkeeping
//! (e.g. a colocated metadata database) and are never treated as blobs.

use crate::error::{Error, Result};
use crate::key::StorageKey;
use crate::store::ObjectStore;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Suffix of in-flight temporary files; never enumerated as storage keys
const PARTIAL_SUFFIX: &str = ".partial";

/// Object store writing blobs under a root directory on a local volume
#[derive(Debug)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::io(e, &root, "create_dir_all"))?;
        Ok(Self { root })
    }

    /// Root directory of the store
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a storage key onto a path under the root
    ///
    /// Keys must be relative and must not climb out of the root.
    fn resolve(&self, storage_key: &StorageKey) -> Result<PathBuf> {
        let rel = Path::new(storage_key.as_str());
        for component in rel.components() {
            match component {
                Component::Normal(_) => {}
                _ => {
                    return Err(Error::invariant(format!(
                        "storage key {storage_key} escapes the store root"
                    )));
                }
            }
        }
        Ok(self.root.join(rel))
    }

    fn collect_keys(&self, dir: &Path, keys: &mut Vec<StorageKey>) -> Result<()> {
        for entry in fs::read_dir(dir).map_err(|e| Error::io(e, dir, "read_dir"))? {
            let entry = entry.map_err(|e| Error::io(e, dir, "read_dir"))?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            if path.is_dir() {
                self.collect_keys(&path, keys)?;
            } else {
                let rel = path
                    .strip_prefix(&self.root)
                    .map_err(|e| Error::invariant(format!("path escaped store root: {e}")))?;
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                keys.push(StorageKey::new(key));
            }
        }
        Ok(())
    }
}

impl ObjectStore for FsObjectStore {
    fn write(&self, storage_key: &StorageKey, bytes: &[u8]) -> Result<u64> {
        let path = self.resolve(storage_key)?;
        if path.exists() {
            return Err(Error::io(
                io::Error::new(io::ErrorKind::AlreadyExists, storage_key.to_string()),
                &path,
                "write",
            ));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
        }

        // Stale partials from a crashed write are overwritten, never read back
        let mut partial = path.as_os_str().to_owned();
        partial.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial);

        fs::write(&partial, bytes).map_err(|e| Error::io(e, &partial, "write"))?;
        if let Err(e) = fs::rename(&partial, &path) {
            let _ = fs::remove_file(&partial);
            return Err(Error::io(e, &path, "rename"));
        }
        Ok(bytes.len() as u64)
    }

    fn read(&self, storage_key: &StorageKey) -> Result<Vec<u8>> {
        let path = self.resolve(storage_key)?;
        fs::read(&path).map_err(|e| Error::io(e, &path, "read"))
    }

    fn delete(&self, storage_key: &StorageKey) -> Result<()> {
        let path = self.resolve(storage_key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(e, &path, "delete")),
        }
    }

    fn exists(&self, storage_key: &StorageKey) -> Result<bool> {
        Ok(self.resolve(storage_key)?.is_file())
    }

    fn size(&self, storage_key: &StorageKey) -> Result<Option<u64>> {
        let path = self.resolve(storage_key)?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(e, &path, "stat")),
        }
    }

    fn iter_keys(&self) -> Result<Vec<StorageKey>> {
        let mut keys = Vec::new();
        self.collect_keys(&self.root, &mut keys)?;
        keys.sort();
        Ok(keys)
    }

    fn free_space(&self) -> Result<u64> {
        fs2::available_space(&self.root).map_err(|e| Error::io(e, &self.root, "statvfs"))
    }

    fn digest(&self, storage_key: &StorageKey) -> Result<String> {
        let bytes = self.read(storage_key)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}
