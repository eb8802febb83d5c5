//! Remembered machine-auth token.

use super::catalog::LogOnDetails;
use crate::config::CredentialsConfig;
use crate::cursor::write_atomic;
use crate::error::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File-backed auth token. With no path configured, tokens are not remembered.
#[derive(Debug, Clone)]
pub struct AuthTokenStore {
    path: Option<PathBuf>,
}

impl AuthTokenStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read the token. Missing file or blank contents mean none.
    pub async fn load(&self) -> Result<Option<String>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                let token = contents.trim();
                Ok((!token.is_empty()).then(|| token.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a new token with write-then-rename.
    pub async fn save(&self, token: &str) -> Result<()> {
        let Some(path) = &self.path else {
            debug!("No auth token path configured, token not saved");
            return Ok(());
        };
        write_atomic(path, token.as_bytes()).await?;
        info!(path = %path.display(), "Auth token updated");
        Ok(())
    }
}

/// Logon details from configured credentials plus the remembered token.
pub fn log_on_details(credentials: &CredentialsConfig, auth_token: Option<String>) -> LogOnDetails {
    LogOnDetails {
        username: credentials.username.clone(),
        password: credentials.password.clone(),
        auth_token,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_round_trip() {
        let dir = tempdir().unwrap();
        let store = AuthTokenStore::new(Some(dir.path().join("auth_token.txt")));

        assert_eq!(store.load().await.unwrap(), None);
        store.save("abc123").await.unwrap();
        assert_eq!(store.load().await.unwrap().as_deref(), Some("abc123"));
        store.save("rotated").await.unwrap();
        assert_eq!(store.load().await.unwrap().as_deref(), Some("rotated"));
    }

    #[tokio::test]
    async fn test_blank_file_is_no_token() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("auth_token.txt");
        std::fs::write(&path, "  \n").unwrap();
        assert_eq!(AuthTokenStore::new(Some(path)).load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_no_path_is_a_no_op() {
        let store = AuthTokenStore::new(None);
        store.save("ignored").await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[test]
    fn test_log_on_details() {
        let creds = CredentialsConfig {
            username: "bot".to_string(),
            password: "pw".to_string(),
        };
        let details = log_on_details(&creds, Some("t".to_string()));
        assert_eq!(details.username, "bot");
        assert_eq!(details.auth_token.as_deref(), Some("t"));
    }
}
