//! Embedded filesystem-backed store for persisting documents.
//!
//! Each document is a pair of files under `docs/`: the raw text, and a JSON
//! sidecar holding its language, access token, and last-activity timestamp.
//! The store is single-writer per process; the server serialises writes
//! through the per-document persister.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, bail};
use rand::random;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

use crate::Identifier;

/// Represents a document persisted in the store.
#[derive(PartialEq, Eq, Clone, Debug, Default)]
pub struct PersistedDocument {
    /// Text content of the document.
    pub text: String,
    /// Language of the document for editor syntax highlighting.
    pub language: Option<String>,
    /// Access token required to join the document, if protected.
    pub otp: Option<String>,
}

/// Sidecar metadata stored next to a document's text.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct StoredMeta {
    language: Option<String>,
    otp: Option<String>,
    /// Seconds since the Unix epoch at the last load or store.
    last_accessed: u64,
}

/// A handle on the document store; clones share the same directory.
#[derive(Debug, Clone)]
pub struct Database {
    storage: Arc<StorageDir>,
}

#[derive(Debug)]
struct StorageDir {
    path: PathBuf,
}

impl Database {
    /// Opens a store rooted at the given directory, creating it if needed.
    pub async fn new(storage: PathBuf) -> Result<Self> {
        let this = Self {
            storage: Arc::new(StorageDir { path: storage }),
        };
        fs::create_dir_all(this.document_path())
            .await
            .context("failed to create document storage directory")?;
        Ok(this)
    }

    /// Opens a store in a fresh temporary directory for testing.
    pub async fn temporary() -> Result<Self> {
        let storage = std::env::temp_dir().join(format!("copad_{:x}", random::<u64>()));
        Self::new(storage).await
    }

    /// Loads a document from the store, refreshing its activity timestamp.
    pub async fn load_document(&self, document_id: &Identifier) -> Result<PersistedDocument> {
        let meta_path = self.document_meta_path_for(document_id);
        if !meta_path.exists() {
            bail!("document not found");
        }
        let meta_data = fs::read_to_string(&meta_path).await?;
        let meta: StoredMeta = serde_json::from_str(&meta_data)?;
        let text = fs::read_to_string(self.document_path_for(document_id)).await?;

        // Loading counts as activity for the expiry sweep.
        let refreshed = StoredMeta {
            last_accessed: unix_now(),
            ..meta.clone()
        };
        if let Err(e) = fs::write(&meta_path, serde_json::to_string_pretty(&refreshed)?).await {
            warn!("failed to refresh access time for {}: {}", document_id, e);
        }

        Ok(PersistedDocument {
            text,
            language: meta.language,
            otp: meta.otp,
        })
    }

    /// Stores a document, overwriting any previous version.
    pub async fn store_document(
        &self,
        document_id: &Identifier,
        document: &PersistedDocument,
    ) -> Result<()> {
        let path = self.document_path_for(document_id);
        let meta_path = self.document_meta_path_for(document_id);
        let document = document.clone();
        let meta = StoredMeta {
            language: document.language.clone(),
            otp: document.otp.clone(),
            last_accessed: unix_now(),
        };
        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::write(path, &document.text).context("failed to write document")?;
            std::fs::write(meta_path, serde_json::to_string_pretty(&meta)?)
                .context("failed to write document metadata")?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    /// Removes a document from the store; missing documents are not an error.
    pub async fn delete_document(&self, document_id: &Identifier) -> Result<()> {
        for path in [
            self.document_meta_path_for(document_id),
            self.document_path_for(document_id),
        ] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).context("failed to delete document"),
            }
        }
        Ok(())
    }

    /// Counts the documents currently in the store.
    pub async fn document_count(&self) -> Result<usize> {
        let mut entries = fs::read_dir(self.document_path()).await?;
        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file()
                && entry
                    .file_name()
                    .to_string_lossy()
                    .parse::<Identifier>()
                    .is_ok()
            {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Lists documents that have seen no activity for longer than `max_age`.
    pub async fn expired_documents(&self, max_age: Duration) -> Result<Vec<Identifier>> {
        let now = unix_now();
        let mut expired = Vec::new();
        let mut entries = fs::read_dir(self.document_path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<Identifier>().ok())
            else {
                warn!("skipping stray file in store: {}", path.display());
                continue;
            };
            let meta_data = fs::read_to_string(&path).await?;
            let meta: StoredMeta = match serde_json::from_str(&meta_data) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("unreadable metadata for {}: {}", id, e);
                    continue;
                }
            };
            if now.saturating_sub(meta.last_accessed) > max_age.as_secs() {
                expired.push(id);
            }
        }
        Ok(expired)
    }

    fn document_meta_path_for(&self, document_id: &Identifier) -> PathBuf {
        self.document_path_for(document_id).with_extension("json")
    }

    fn document_path_for(&self, document_id: &Identifier) -> PathBuf {
        self.document_path().join(document_id.as_ref())
    }

    fn document_path(&self) -> PathBuf {
        self.storage.path.join("docs")
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

#[cfg(test)]
impl Drop for StorageDir {
    fn drop(&mut self) {
        // Clean up temporary storage directories on drop.
        if self.path.parent() == Some(std::env::temp_dir().as_path()) {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}
