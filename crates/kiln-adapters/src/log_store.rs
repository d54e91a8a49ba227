//! Build log storage.

use async_trait::async_trait;
use kiln_core::ids::BuildId;
use kiln_core::ports::LogStore;
use kiln_core::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;

/// In-memory log store.
#[derive(Default)]
pub struct MemoryLogStore {
    logs: RwLock<HashMap<(BuildId, u32), Vec<u8>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append_chunk(&self, build_id: BuildId, attempt: u32, bytes: &[u8]) -> Result<()> {
        self.logs
            .write()
            .await
            .entry((build_id, attempt))
            .or_default()
            .extend_from_slice(bytes);
        Ok(())
    }

    async fn read_all(&self, build_id: BuildId, attempt: u32) -> Result<String> {
        Ok(self
            .logs
            .read()
            .await
            .get(&(build_id, attempt))
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default())
    }
}

/// Filesystem log store writing one append-only file per attempt, laid out
/// as `<root>/<build id>/<attempt>.log`.
pub struct FileLogStore {
    root_dir: PathBuf,
}

impl FileLogStore {
    pub fn new(root_dir: PathBuf) -> Self {
        Self { root_dir }
    }

    fn build_dir(&self, build_id: BuildId) -> PathBuf {
        self.root_dir.join(build_id.to_string())
    }

    fn log_path(&self, build_id: BuildId, attempt: u32) -> PathBuf {
        self.build_dir(build_id).join(format!("{attempt}.log"))
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    async fn append_chunk(&self, build_id: BuildId, attempt: u32, bytes: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(self.build_dir(build_id))
            .await
            .map_err(|e| Error::LogStore(format!("Failed to create log dir: {}", e)))?;

        let path = self.log_path(build_id, attempt);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::LogStore(format!("Failed to open {}: {}", path.display(), e)))?;
        file.write_all(bytes)
            .await
            .map_err(|e| Error::LogStore(format!("Failed to append log: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| Error::LogStore(format!("Failed to flush log: {}", e)))?;

        debug!(build_id = %build_id, attempt, bytes = bytes.len(), "Log chunk appended");
        Ok(())
    }

    async fn read_all(&self, build_id: BuildId, attempt: u32) -> Result<String> {
        let path = self.log_path(build_id, attempt);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(Error::LogStore(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }
}
