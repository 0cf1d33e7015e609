//! Lock-guarded access to the registry file.
//!
//! Readers hold a shared lock for the duration of one read. Writers hold an
//! exclusive lock across read, mutate and write back. The lock lives in a
//! sibling `<registry>.lock` file so the record file itself can be replaced
//! by rename without invalidating the lock.

use std::fs;
use std::fs::Permissions;
use std::io;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;

use tempfile::NamedTempFile;
use tracing::debug;
use tracing::warn;
use utils::flock::FileLock;
use utils::flock::LockMode;
use utils::flock::LockOptions;

use crate::document::RegistryState;
use crate::error::RegistryError;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_options: LockOptions,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>, lock_options: LockOptions) -> Self {
        let path = path.into();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        Self {
            path,
            lock_path: lock_path.into(),
            lock_options,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads a consistent copy of the registry under a shared lock.
    pub fn read(&self) -> Result<RegistryState> {
        let _lock = FileLock::acquire(&self.lock_path, LockMode::Shared, self.lock_options)?;
        self.load()
    }

    /// Runs `mutate` as one read-modify-write transaction.
    ///
    /// Nothing is written when `mutate` fails or leaves the state untouched.
    pub fn transaction<T>(
        &self,
        mutate: impl FnOnce(&mut RegistryState) -> Result<T>,
    ) -> Result<T> {
        let _lock = FileLock::acquire(&self.lock_path, LockMode::Exclusive, self.lock_options)?;

        let before = self.load()?;
        let mut state = before.clone();
        let output = mutate(&mut state)?;

        if state != before {
            state.version = before.version + 1;
            self.store(&state)?;
            debug!(path = %self.path.display(), version = state.version, "registry committed");
        }

        Ok(output)
    }

    fn load(&self) -> Result<RegistryState> {
        match fs::read(&self.path) {
            Ok(bytes) => RegistryState::decode(&bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(RegistryState::default()),
            Err(e) => Err(RegistryError::io(&self.path, e)),
        }
    }

    /// Writes the whole document to a temporary sibling and renames it over
    /// the record file, so readers only ever see complete documents.
    fn store(&self, state: &RegistryState) -> Result<()> {
        let bytes = state.encode()?;
        let directory = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let io_err = |e| RegistryError::io(&self.path, e);

        fs::create_dir_all(directory).map_err(io_err)?;
        let mut file = NamedTempFile::new_in(directory).map_err(io_err)?;
        file.write_all(&bytes).map_err(io_err)?;
        file.as_file()
            .set_permissions(Permissions::from_mode(0o666))
            .map_err(io_err)?;
        file.as_file().sync_all().map_err(io_err)?;
        file.persist(&self.path).map_err(|e| io_err(e.error))?;

        sync_directory(directory);
        Ok(())
    }
}

/// Flushes the directory entry of a rename; returns whether it is durable.
fn sync_directory(directory: &Path) -> bool {
    match fs::File::open(directory).and_then(|dir| dir.sync_all()) {
        Ok(()) => true,
        Err(e) => {
            warn!(directory = %directory.display(), "registry directory not synced: {e}");
            false
        }
    }
}
