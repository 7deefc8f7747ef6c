use chrono::{DateTime, Duration, Utc};
use newsdesk_api::{AuthSession, Credential};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

pub const ACCESS_TOKEN: &str = "access_token";
pub const REFRESH_TOKEN: &str = "refresh_token";

/// Serializes file writes from `persist`
static FILE_WRITES: Mutex<()> = Mutex::new(());

/// Secret storage with obfuscation and expiration
///
/// Lives in its own file, away from the payload cache, so clearing one
/// never touches the other by accident. Tokens are XORed with a
/// machine-specific key for basic obfuscation and the file is owner-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenStore {
    tokens: HashMap<String, StoredToken>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredToken {
    /// Obfuscated token value
    encrypted_value: Vec<u8>,
    stored_at: DateTime<Utc>,
    /// How long we trust it locally (default: 30 days)
    valid_for_seconds: i64,
}

impl StoredToken {
    fn expires_at(&self) -> DateTime<Utc> {
        self.stored_at + Duration::seconds(self.valid_for_seconds)
    }
}

impl TokenStore {
    /// Store that only lives in memory; `save` is a no-op
    pub fn in_memory() -> Self {
        Self {
            tokens: HashMap::new(),
            path: None,
        }
    }

    /// Load token store from `path`, empty if the file isn't there yet
    pub fn open(path: impl Into<PathBuf>) -> crate::Result<Self> {
        let path = path.into();

        let mut store = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str::<TokenStore>(&contents)
                .map_err(|e| crate::Error::ConfigError(format!("Failed to parse token store: {}", e)))?
        } else {
            Self::in_memory()
        };

        store.path = Some(path);
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Save token store to disk
    pub fn save(&self) -> crate::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        // Create directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| crate::Error::ConfigError(format!("Failed to serialize token store: {}", e)))?;

        std::fs::write(path, contents)?;
        restrict_permissions(path)?;
        debug!("Saved token store to {}", path.display());
        Ok(())
    }

    /// Write the current contents of `shared` from the blocking pool.
    ///
    /// The snapshot is taken inside the file lock, so overlapping calls
    /// land in order and the file ends on the latest state. No guard is
    /// held on the async side.
    pub async fn persist(shared: Arc<RwLock<TokenStore>>) -> crate::Result<()> {
        tokio::task::spawn_blocking(move || {
            let _writing = FILE_WRITES.lock().map_err(|_| lock_poisoned())?;
            let snapshot = shared.read().map_err(|_| lock_poisoned())?.clone();
            snapshot.save()
        })
        .await
        .map_err(|e| crate::Error::IoError(std::io::Error::other(e)))?
    }

    /// Store a token with expiration
    pub fn set_token(&mut self, name: &str, token: &str, valid_for_days: u64) {
        let encrypted = self.encrypt(token);

        self.tokens.insert(
            name.to_string(),
            StoredToken {
                encrypted_value: encrypted,
                stored_at: Utc::now(),
                valid_for_seconds: (valid_for_days as i64) * 24 * 60 * 60,
            },
        );
    }

    /// Get a token if it exists and hasn't expired
    pub fn get_token(&self, name: &str) -> Option<String> {
        let stored = self.tokens.get(name)?;

        if Utc::now() >= stored.expires_at() {
            return None; // Token expired
        }

        Some(self.decrypt(&stored.encrypted_value))
    }

    /// The access token together with when it was issued
    pub fn credential(&self) -> Option<Credential> {
        let stored = self.tokens.get(ACCESS_TOKEN)?;
        let access_token = self.get_token(ACCESS_TOKEN)?;
        Some(Credential {
            access_token,
            issued_at: stored.stored_at,
        })
    }

    /// Check if a token exists and is valid
    pub fn has_valid_token(&self, name: &str) -> bool {
        self.get_token(name).is_some()
    }

    /// Take the tokens from a sign-in, registration or refresh response.
    ///
    /// A response without a refresh token keeps the one we already have.
    pub fn store_session(&mut self, session: &AuthSession, valid_for_days: u64) {
        self.set_token(ACCESS_TOKEN, &session.access_token, valid_for_days);
        if let Some(refresh) = &session.refresh_token {
            self.set_token(REFRESH_TOKEN, refresh, valid_for_days);
        }
    }

    /// Clear all tokens
    pub fn clear(&mut self) {
        self.tokens.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Get the token store file path
    /// XDG data dir on Unix-like systems, AppData on Windows
    pub fn default_path() -> crate::Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| crate::Error::ConfigError("Could not find data directory".into()))?
            .join("newsdesk");

        Ok(data_dir.join("tokens.json"))
    }

    /// Simple XOR with a machine-specific key
    /// For basic obfuscation - not cryptographically secure
    fn encrypt(&self, data: &str) -> Vec<u8> {
        let key = machine_key();
        data.bytes()
            .enumerate()
            .map(|(i, b)| b ^ key[i % key.len()])
            .collect()
    }

    fn decrypt(&self, data: &[u8]) -> String {
        let key = machine_key();
        let decrypted: Vec<u8> = data
            .iter()
            .enumerate()
            .map(|(i, &b)| b ^ key[i % key.len()])
            .collect();
        String::from_utf8_lossy(&decrypted).to_string()
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

fn lock_poisoned() -> crate::Error {
    crate::Error::AuthError("token store lock poisoned".into())
}

/// 32-byte key seeded from hostname + username
fn machine_key() -> Vec<u8> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let hostname = hostname::get()
        .unwrap_or_else(|_| std::ffi::OsString::from("unknown"))
        .to_string_lossy()
        .to_string();

    let username = whoami::username();
    let seed = format!("newsdesk-{}-{}", hostname, username);

    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    let mut val = hasher.finish();

    let mut key = Vec::with_capacity(32);
    for _ in 0..4 {
        key.extend_from_slice(&val.to_le_bytes());
        val = val.wrapping_mul(1103515245).wrapping_add(12345);
    }
    key
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
