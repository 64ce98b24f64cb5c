//! Session credential storage.
//!
//! The credential payload is opaque to wagate: the bridge produces it on
//! every rotation and consumes it on the next connect. The only operation
//! wagate itself gives meaning to is [`CredentialStore::clear`], which
//! forces a fresh pairing.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Opaque session credentials.
pub type Credentials = serde_json::Value;

const CREDS_FILE: &str = "creds.json";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed credentials: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl CredentialError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Durable storage of session credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load stored credentials, `None` if the session was never paired.
    async fn load(&self) -> Result<Option<Credentials>, CredentialError>;

    /// Replace stored credentials.
    async fn save(&self, credentials: &Credentials) -> Result<(), CredentialError>;

    /// Delete the session wholesale.
    async fn clear(&self) -> Result<(), CredentialError>;
}

// ============================================================================
// FileCredentialStore
// ============================================================================

/// Credentials kept as `creds.json` inside a session directory.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn creds_path(&self) -> PathBuf {
        self.dir.join(CREDS_FILE)
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<Credentials>, CredentialError> {
        let path = self.creds_path();
        let contents = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CredentialError::io(&path, e)),
        };
        Ok(Some(serde_json::from_str(&contents)?))
    }

    async fn save(&self, credentials: &Credentials) -> Result<(), CredentialError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CredentialError::io(&self.dir, e))?;
        let data = serde_json::to_vec_pretty(credentials)?;
        replace_file(&self.creds_path(), &data).await
    }

    async fn clear(&self) -> Result<(), CredentialError> {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {
                debug!(dir = %self.dir.display(), "Session directory removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CredentialError::io(&self.dir, e)),
        }
    }
}

/// Replace `path` with `data` in one step.
///
/// The bytes go to a hidden sibling named with a ULID, are synced, and the
/// sibling is renamed over `path`. On failure the sibling is removed.
async fn replace_file(path: &Path, data: &[u8]) -> Result<(), CredentialError> {
    let staged = path.with_file_name(format!(".{CREDS_FILE}.{}.tmp", ulid::Ulid::new()));

    let written = async {
        let mut file = fs::File::create(&staged).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        fs::rename(&staged, path).await?;
        Ok::<_, std::io::Error>(())
    };
    if let Err(e) = written.await {
        let _ = fs::remove_file(&staged).await;
        return Err(CredentialError::io(path, e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_without_session_is_none() {
        let tmp = TempDir::new().unwrap();
        let store = FileCredentialStore::new(tmp.path().join("session"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load() {
        let tmp = TempDir::new().unwrap();
        let store = FileCredentialStore::new(tmp.path().join("session"));

        store.save(&json!({"me": {"id": "628"}})).await.unwrap();
        store.save(&json!({"me": {"id": "629"}})).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded["me"]["id"], "629");

        // No temp files left behind
        let mut entries = fs::read_dir(store.dir()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["creds.json".to_string()]);
    }

    #[tokio::test]
    async fn failed_save_leaves_no_staged_file() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("session");
        fs::create_dir_all(dir.join(CREDS_FILE)).await.unwrap();
        let store = FileCredentialStore::new(&dir);

        let err = store.save(&json!({"k": 1})).await.unwrap_err();
        assert!(matches!(err, CredentialError::Io { ref path, .. } if path == &dir.join(CREDS_FILE)));

        let mut entries = fs::read_dir(&dir).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec![CREDS_FILE.to_string()]);
    }

    #[tokio::test]
    async fn clear_removes_directory_wholesale() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("session");
        let store = FileCredentialStore::new(&dir);

        store.save(&json!({"k": 1})).await.unwrap();
        fs::write(dir.join("pre-key-1.json"), b"{}").await.unwrap();

        store.clear().await.unwrap();
        assert!(!dir.exists());
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_missing_directory_is_ok() {
        let tmp = TempDir::new().unwrap();
        let store = FileCredentialStore::new(tmp.path().join("never-created"));
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn load_malformed_is_error() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("session");
        fs::create_dir_all(&dir).await.unwrap();
        fs::write(dir.join(CREDS_FILE), b"not json").await.unwrap();

        let store = FileCredentialStore::new(&dir);
        assert!(matches!(
            store.load().await,
            Err(CredentialError::Malformed(_))
        ));
    }
}
