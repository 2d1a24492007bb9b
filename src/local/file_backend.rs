use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde_json::{from_str as deserialize_state, to_string as serialize_state};

use crate::error::{internal_error, unavailable, SyncResult};
use crate::local::persistence::{LocalState, PersistenceBackend};

/// Keeps the local cache in a single JSON file. Writes go to a sibling
/// temporary file that is renamed over the target, so a crash mid-write
/// leaves the previous state intact.
#[derive(Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl std::fmt::Debug for FileBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBackend").field("path", &self.path).finish()
    }
}

impl FileBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl PersistenceBackend for FileBackend {
    fn load(&self) -> SyncResult<Option<LocalState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.path)
            .map_err(|err| unavailable(format!("Failed to open local cache file: {err}")))?;
        let mut buffer = String::new();
        file.read_to_string(&mut buffer)
            .map_err(|err| unavailable(format!("Failed to read local cache file: {err}")))?;
        if buffer.trim().is_empty() {
            return Ok(None);
        }
        let state = deserialize_state(&buffer)
            .map_err(|err| internal_error(format!("Failed to parse local cache file: {err}")))?;
        log::debug!("loaded local cache from {}", self.path.display());
        Ok(Some(state))
    }

    fn persist(&self, state: &LocalState) -> SyncResult<()> {
        let serialized = serialize_state(state)
            .map_err(|err| internal_error(format!("Failed to serialize local cache: {err}")))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    unavailable(format!("Failed to create local cache directory: {err}"))
                })?;
            }
        }
        let temp_path = self.temp_path();
        let mut file = File::create(&temp_path)
            .map_err(|err| unavailable(format!("Failed to create local cache file: {err}")))?;
        file.write_all(serialized.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|err| unavailable(format!("Failed to write local cache file: {err}")))?;
        fs::rename(&temp_path, &self.path)
            .map_err(|err| unavailable(format!("Failed to replace local cache file: {err}")))?;
        Ok(())
    }
}
