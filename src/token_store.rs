//! Encrypted, persistent storage for the session credential envelope

use crate::error::{ClientError, Result};
use crate::types::CredentialEnvelope;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const NONCE_LEN: usize = 12;

/// Default lifetime of a persisted session
pub const DEFAULT_SESSION_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Durable medium holding the encrypted session blob
///
/// Implementations must replace the value as a whole: a reader sees either
/// the previous blob or the new one, never a mix.
pub trait StorageBackend: Send + Sync + 'static {
    fn read(&self) -> io::Result<Option<String>>;
    fn write(&self, value: &str) -> io::Result<()>;
    /// Removing an absent value is not an error
    fn remove(&self) -> io::Result<()>;
}

/// Process-local storage, mostly for tests and short-lived tools
#[derive(Default)]
pub struct MemoryStorage {
    value: Mutex<Option<String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn read(&self) -> io::Result<Option<String>> {
        Ok(self.value.lock().clone())
    }

    fn write(&self, value: &str) -> io::Result<()> {
        *self.value.lock() = Some(value.to_string());
        Ok(())
    }

    fn remove(&self) -> io::Result<()> {
        self.value.lock().take();
        Ok(())
    }
}

/// Single-file storage, replaced through a temp file + rename
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn staging_path(&self) -> PathBuf {
        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        PathBuf::from(staging)
    }
}

impl StorageBackend for FileStorage {
    fn read(&self) -> io::Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&self, value: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let staging = self.staging_path();
        fs::write(&staging, value)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&staging, fs::Permissions::from_mode(0o600))?;
        }

        fs::rename(&staging, &self.path)
    }

    fn remove(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Credential store settings
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Passphrase the encryption key is derived from
    pub secret: String,
    /// How long a saved session stays loadable
    pub max_age: Duration,
    /// Backing file; `None` keeps the session in memory
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            max_age: DEFAULT_SESSION_MAX_AGE,
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Read `STOREFRONT_SESSION_SECRET` (required) and `STOREFRONT_SESSION_FILE`
    pub fn from_env() -> Result<Self> {
        let secret = std::env::var("STOREFRONT_SESSION_SECRET").map_err(|_| {
            ClientError::Configuration("STOREFRONT_SESSION_SECRET is not set".to_string())
        })?;

        let mut config = Self::new(secret);
        if let Ok(path) = std::env::var("STOREFRONT_SESSION_FILE") {
            config = config.with_path(path);
        }
        Ok(config)
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedSession {
    envelope: CredentialEnvelope,
    expires_at: DateTime<Utc>,
}

struct StoreInner {
    backend: RwLock<Box<dyn StorageBackend>>,
    cipher: Aes256Gcm,
    max_age: chrono::Duration,
}

/// Thread-safe credential store
///
/// Holds at most one session envelope, encrypted at rest. Cloning is cheap
/// and every clone sees the same session.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<StoreInner>,
}

impl CredentialStore {
    pub fn new(backend: impl StorageBackend, config: &StoreConfig) -> Result<Self> {
        if config.secret.is_empty() {
            return Err(ClientError::Configuration(
                "credential store secret must not be empty".to_string(),
            ));
        }

        let key = Sha256::digest(config.secret.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| ClientError::Crypto(format!("Invalid store key: {e}")))?;

        let max_age = chrono::Duration::from_std(config.max_age).map_err(|e| {
            ClientError::Configuration(format!("Invalid session max age: {e}"))
        })?;

        Ok(Self {
            inner: Arc::new(StoreInner {
                backend: RwLock::new(Box::new(backend)),
                cipher,
                max_age,
            }),
        })
    }

    /// Build the store the config describes (file-backed or in-memory)
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        match &config.path {
            Some(path) => Self::new(FileStorage::new(path), config),
            None => Self::new(MemoryStorage::new(), config),
        }
    }

    pub fn in_memory(secret: &str) -> Result<Self> {
        Self::new(MemoryStorage::new(), &StoreConfig::new(secret))
    }

    /// Load the current session
    ///
    /// Anything unreadable (missing, expired, tampered, undecodable) is
    /// reported as "no session" rather than as an error.
    pub fn load(&self) -> Option<CredentialEnvelope> {
        let backend = self.inner.backend.read();
        self.load_locked(&**backend)
    }

    /// Persist `envelope`, replacing any existing session
    pub fn save(&self, envelope: &CredentialEnvelope) -> Result<()> {
        let backend = self.inner.backend.write();
        self.save_locked(&**backend, envelope)
    }

    /// Remove the session; clearing an empty store is a no-op
    pub fn clear(&self) -> Result<()> {
        self.inner.backend.write().remove()?;
        debug!("Cleared stored session");
        Ok(())
    }

    /// Rotate the token pair of the stored session
    ///
    /// Returns `false` without writing anything when there is no session.
    pub fn replace_tokens(&self, access_token: &str, refresh_token: &str) -> Result<bool> {
        if access_token.is_empty() || refresh_token.is_empty() {
            return Err(ClientError::InvalidResponse(
                "refusing to store an empty token".to_string(),
            ));
        }

        let backend = self.inner.backend.write();
        let Some(mut envelope) = self.load_locked(&**backend) else {
            return Ok(false);
        };

        envelope.rotate(access_token, refresh_token);
        self.save_locked(&**backend, &envelope)?;
        Ok(true)
    }

    fn load_locked(&self, backend: &dyn StorageBackend) -> Option<CredentialEnvelope> {
        let blob = match backend.read() {
            Ok(Some(blob)) => blob,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Failed to read stored session, treating as signed out");
                return None;
            }
        };

        let session: PersistedSession = match self.decrypt(&blob) {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Stored session is unreadable, treating as signed out");
                return None;
            }
        };

        if session.expires_at <= Utc::now() {
            debug!(expired_at = %session.expires_at, "Stored session has expired");
            return None;
        }

        Some(session.envelope)
    }

    fn save_locked(&self, backend: &dyn StorageBackend, envelope: &CredentialEnvelope) -> Result<()> {
        let session = PersistedSession {
            envelope: envelope.clone(),
            expires_at: Utc::now() + self.inner.max_age,
        };
        let blob = self.encrypt(&session)?;
        backend.write(&blob)?;
        Ok(())
    }

    fn encrypt(&self, session: &PersistedSession) -> Result<String> {
        let plaintext = serde_json::to_vec(session)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .inner
            .cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| ClientError::Crypto("Failed to encrypt session".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    fn decrypt(&self, blob: &str) -> Result<PersistedSession> {
        let sealed = BASE64
            .decode(blob.trim())
            .map_err(|e| ClientError::Crypto(format!("Invalid session encoding: {e}")))?;

        if sealed.len() <= NONCE_LEN {
            return Err(ClientError::Crypto("Session blob is truncated".to_string()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .inner
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ClientError::Crypto("Failed to decrypt session".to_string()))?;

        Ok(serde_json::from_slice(&plaintext)?)
    }
}
