//! Failure corpus persistence.

use async_trait::async_trait;
use kiln_core::ids::TemplateKey;
use kiln_core::ports::CorpusStore;
use kiln_core::triage::FailureSignature;
use kiln_core::{Error, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// In-memory corpus store.
#[derive(Default)]
pub struct MemoryCorpusStore {
    signatures: Mutex<BTreeMap<TemplateKey, FailureSignature>>,
}

impl MemoryCorpusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_signatures(signatures: Vec<FailureSignature>) -> Self {
        Self {
            signatures: Mutex::new(
                signatures
                    .into_iter()
                    .map(|s| (s.key.clone(), s))
                    .collect(),
            ),
        }
    }

    pub async fn get(&self, key: &TemplateKey) -> Option<FailureSignature> {
        self.signatures.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.signatures.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.signatures.lock().await.is_empty()
    }
}

#[async_trait]
impl CorpusStore for MemoryCorpusStore {
    async fn load_corpus(&self) -> Result<Vec<FailureSignature>> {
        Ok(self.signatures.lock().await.values().cloned().collect())
    }

    async fn persist(&self, signature: &FailureSignature) -> Result<()> {
        self.signatures
            .lock()
            .await
            .insert(signature.key.clone(), signature.clone());
        Ok(())
    }
}

/// Corpus stored as a JSON array in a single file.
///
/// Writes go to a sibling temp file that is renamed over the target, so a
/// reader never observes a half-written corpus.
pub struct JsonFileCorpusStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileCorpusStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn read_map(&self) -> Result<BTreeMap<TemplateKey, FailureSignature>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(Error::CorpusStore(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        let signatures: Vec<FailureSignature> = serde_json::from_str(&contents)?;
        Ok(signatures.into_iter().map(|s| (s.key.clone(), s)).collect())
    }

    async fn write_map(&self, map: &BTreeMap<TemplateKey, FailureSignature>) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::CorpusStore(format!("Failed to create corpus dir: {}", e)))?;
        }

        let signatures: Vec<&FailureSignature> = map.values().collect();
        let json = serde_json::to_vec_pretty(&signatures)?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| Error::CorpusStore(format!("Failed to write corpus: {}", e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::CorpusWriteConflict {
                key: self.path.display().to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }
}

#[async_trait]
impl CorpusStore for JsonFileCorpusStore {
    async fn load_corpus(&self) -> Result<Vec<FailureSignature>> {
        let map = self.read_map().await?;
        info!(path = %self.path.display(), signatures = map.len(), "Corpus loaded");
        Ok(map.into_values().collect())
    }

    async fn persist(&self, signature: &FailureSignature) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut map = self.read_map().await?;
        map.insert(signature.key.clone(), signature.clone());
        self.write_map(&map).await?;
        debug!(key = %signature.key, count = signature.occurrence_count, "Signature persisted");
        Ok(())
    }
}
