use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::{LockStore, StoreConfig, StoreError};

/// A lock store backed by a shared directory.
///
/// Usable across processes on one host, or across hosts on a shared file
/// system with atomic exclusive-create. Layout under `<root>/<namespace>/`:
///
/// - `<key>.value`: the persisted boundary, replaced atomically on write
/// - `<key>.lock`: present while some session holds the key lock
///
/// A lock file left behind by a crashed process must be removed by hand.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    lock: Option<PathBuf>,
    held: bool,
}

impl FileStore {
    /// Opens (creating if needed) the namespace directory below `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be created.
    pub fn open_dir(root: impl AsRef<Path>, namespace: &str) -> Result<Self, StoreError> {
        let dir = root.as_ref().join(namespace);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io("create_dir", e))?;
        Ok(Self {
            dir,
            lock: None,
            held: false,
        })
    }

    /// Opens a session rooted at the first entry of `server.list`.
    ///
    /// # Errors
    ///
    /// Returns an error if no server is configured or the directory cannot be
    /// created.
    pub fn open(config: &StoreConfig) -> Result<Box<dyn LockStore>, StoreError> {
        let root = config
            .servers
            .first()
            .ok_or_else(|| StoreError::Backend("file store needs a root directory".into()))?;
        Ok(Box::new(Self::open_dir(root, &config.namespace)?))
    }

    fn file(&self, key: &str, extension: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{extension}", key.trim_start_matches('/')))
    }
}

impl LockStore for FileStore {
    fn init_lock(&mut self, key: &str) -> Result<(), StoreError> {
        self.try_release()?;
        self.lock = Some(self.file(key, "lock"));
        Ok(())
    }

    fn try_lock(&mut self) -> Result<bool, StoreError> {
        if self.held {
            return Ok(true);
        }
        let path = self.lock.as_ref().ok_or(StoreError::LockNotInitialized)?;
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                self.held = true;
                // owner hint for operators; the lock is the file's existence
                let _ = writeln!(file, "{}", std::process::id());
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StoreError::io("lock", e)),
        }
    }

    fn try_release(&mut self) -> Result<(), StoreError> {
        if !self.held {
            return Ok(());
        }
        self.held = false;
        if let Some(path) = &self.lock {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io("release", e)),
            }
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.file(key, "value")) {
            Ok(value) => Ok(Some(value.trim().to_owned())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io("get", e)),
        }
    }

    fn persist(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| StoreError::io("persist", e))?;
        tmp.write_all(value.as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| StoreError::io("persist", e))?;
        tmp.persist(self.file(key, "value"))
            .map_err(|e| StoreError::io("persist", e.error))?;
        Ok(())
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        let _ = self.try_release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_file_is_exclusive() {
        let root = tempfile::tempdir().unwrap();
        let mut a = FileStore::open_dir(root.path(), "ns").unwrap();
        let mut b = FileStore::open_dir(root.path(), "ns").unwrap();
        a.init_lock("/order").unwrap();
        b.init_lock("/order").unwrap();

        assert!(a.try_lock().unwrap());
        assert!(root.path().join("ns/order.lock").exists());
        assert!(!b.try_lock().unwrap());

        a.try_release().unwrap();
        assert!(!root.path().join("ns/order.lock").exists());
        assert!(b.try_lock().unwrap());
    }

    #[test]
    fn release_without_holding_leaves_foreign_lock() {
        let root = tempfile::tempdir().unwrap();
        let mut a = FileStore::open_dir(root.path(), "ns").unwrap();
        let mut b = FileStore::open_dir(root.path(), "ns").unwrap();
        a.init_lock("/order").unwrap();
        b.init_lock("/order").unwrap();

        assert!(a.try_lock().unwrap());
        b.try_release().unwrap();
        assert!(root.path().join("ns/order.lock").exists());
    }

    #[test]
    fn persist_then_get() {
        let root = tempfile::tempdir().unwrap();
        let mut store = FileStore::open_dir(root.path(), "ns").unwrap();
        assert_eq!(store.get("/order").unwrap(), None);

        store.persist("/order", "10000").unwrap();
        store.persist("/order", "20000").unwrap();
        assert_eq!(store.get("/order").unwrap().as_deref(), Some("20000"));

        let reopened = FileStore::open_dir(root.path(), "ns").unwrap();
        assert_eq!(reopened.get("/order").unwrap().as_deref(), Some("20000"));
    }

    #[test]
    fn drop_removes_held_lock() {
        let root = tempfile::tempdir().unwrap();
        {
            let mut a = FileStore::open_dir(root.path(), "ns").unwrap();
            a.init_lock("/order").unwrap();
            assert!(a.try_lock().unwrap());
        }
        assert!(!root.path().join("ns/order.lock").exists());
    }

    #[test]
    fn open_requires_root() {
        let config = StoreConfig {
            store_type: "file".into(),
            servers: vec![],
            namespace: "ns".into(),
        };
        assert!(matches!(FileStore::open(&config), Err(StoreError::Backend(_))));
    }
}
