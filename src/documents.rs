use crate::error::{AppError, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::info;

/// Content-addressed storage for submitted invoice files.
pub struct DocumentStore {
    root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    /// Path relative to the store root.
    pub key: String,
    pub hash: String,
}

impl DocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn hash_bytes(bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }

    /// Store `bytes` under `<hash[0..2]>/<hash>.<ext>`. Writing the same
    /// content twice is a no-op.
    pub fn put(&self, file_name: &str, bytes: &[u8]) -> Result<StoredDocument> {
        let hash = Self::hash_bytes(bytes);
        let ext = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .filter(|e| e.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or_else(|| "bin".to_string());
        let key = format!("{}/{hash}.{ext}", &hash[..2]);
        let path = self.root.join(&key);

        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, bytes)?;
            info!(key = %key, bytes = bytes.len(), "Document stored");
        }
        Ok(StoredDocument { key, hash })
    }

    pub fn read(&self, key: &str) -> Result<Vec<u8>> {
        let relative = Path::new(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(AppError::Invalid(format!("invalid document key '{key}'")));
        }
        let path = self.root.join(relative);
        if !path.exists() {
            return Err(AppError::not_found("document", key));
        }
        Ok(fs::read(path)?)
    }
}

/// MIME type sent in the data URI, guessed from the file extension.
pub fn mime_for(file_name: &str) -> String {
    mime_guess::from_path(file_name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

#[cfg(test)]
pub(crate) fn temp_root(tag: &str) -> PathBuf {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    std::env::temp_dir().join(format!(
        "invoice_flow_{tag}_{}_{nanos}",
        std::process::id()
    ))
}
