use super::token::Token;
use crate::error::AuthError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Persistence for the token pair between runs. Protection at rest is the
/// store's concern.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self) -> Result<Option<Token>, AuthError>;
    async fn save(&self, token: &Token) -> Result<(), AuthError>;
    async fn delete(&self) -> Result<(), AuthError>;
}

/// JSON file store, written owner-only on unix
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn store_error(&self, e: impl std::fmt::Display) -> AuthError {
        AuthError::Store {
            details: format!("{}: {}", self.path.display(), e),
        }
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self) -> Result<Option<Token>, AuthError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No stored token at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(self.store_error(e)),
        };

        match serde_json::from_str(&contents) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                warn!("Ignoring unreadable token file {}: {}", self.path.display(), e);
                Ok(None)
            }
        }
    }

    async fn save(&self, token: &Token) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.store_error(e))?;
            }
        }

        let json = serde_json::to_string_pretty(token).map_err(|e| self.store_error(e))?;
        let staging = self.path.with_extension("tmp");
        tokio::fs::write(&staging, json)
            .await
            .map_err(|e| self.store_error(e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| self.store_error(e))?;
        }

        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|e| self.store_error(e))?;
        debug!("Token saved to {}", self.path.display());
        Ok(())
    }

    async fn delete(&self) -> Result<(), AuthError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("Deleted stored token {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.store_error(e)),
        }
    }
}

/// In-memory store
#[derive(Default)]
pub struct MemoryTokenStore {
    token: Mutex<Option<Token>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: Token) -> Self {
        Self {
            token: Mutex::new(Some(token)),
        }
    }

    pub fn current(&self) -> Option<Token> {
        self.token.lock().clone()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self) -> Result<Option<Token>, AuthError> {
        Ok(self.token.lock().clone())
    }

    async fn save(&self, token: &Token) -> Result<(), AuthError> {
        *self.token.lock() = Some(token.clone());
        Ok(())
    }

    async fn delete(&self) -> Result<(), AuthError> {
        *self.token.lock() = None;
        Ok(())
    }
}
