use crate::utils::atomic_write;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use anyhow::{Context, Result};
use base64::Engine;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};


/// Prefix marking an encrypted value inside a settings file.
pub const ENCRYPTED_PREFIX: &str = "encrypted:";
/// Fixed token returned to subscribers in place of a secret value.
pub const MASKED_VALUE: &str = "***configured***";

const KEYRING_SERVICE: &str = "cowork";
const KEYRING_ENTRY: &str = "settings-envelope-key";
const NONCE_LEN: usize = 12;

/// Source of the 32-byte envelope key. The production implementation is the
/// OS keychain; tests substitute a fixed key.
pub trait KeySource: Send + Sync {
    /// Fetch the key, creating it if absent. `Err` means the backing store
    /// is unavailable (not merely empty).
    fn envelope_key(&self) -> Result<[u8; 32]>;
}

/// OS-keychain-backed key source.
pub struct KeychainSource;

impl KeySource for KeychainSource {
    fn envelope_key(&self) -> Result<[u8; 32]> {
        let entry = keyring::Entry::new(KEYRING_SERVICE, KEYRING_ENTRY)
            .context("keychain unavailable")?;
        match entry.get_password() {
            Ok(encoded) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(&encoded)
                    .context("stored envelope key is not valid base64")?;
                bytes
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("stored envelope key has wrong length"))
            }
            Err(keyring::Error::NoEntry) => {
                let mut key = [0u8; 32];
                fastrand::fill(&mut key);
                entry
                    .set_password(&base64::engine::general_purpose::STANDARD.encode(key))
                    .context("failed to store envelope key in keychain")?;
                Ok(key)
            }
            Err(e) => Err(anyhow::anyhow!("keychain error: {e}")),
        }
    }
}

/// Fixed-key source for tests and headless CI.
pub struct StaticKeySource(pub [u8; 32]);

impl KeySource for StaticKeySource {
    fn envelope_key(&self) -> Result<[u8; 32]> {
        Ok(self.0)
    }
}

/// A key source that always fails, modeling a locked/absent keychain.
pub struct UnavailableKeySource;

impl KeySource for UnavailableKeySource {
    fn envelope_key(&self) -> Result<[u8; 32]> {
        anyhow::bail!("keychain unavailable")
    }
}

/// Crash-safe settings files with OS-keychain-encrypted secret fields.
///
/// Every write goes through the temp-file + rename dance; writers for the
/// same file serialize behind a per-file mutex. Secret fields (keys listed
/// per write) are wrapped in the `encrypted:` envelope before hitting disk
/// and never leave [`masked`](SettingsStore::masked) form toward the UI.
pub struct SettingsStore {
    base_dir: PathBuf,
    keys: Box<dyn KeySource>,
    file_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Decrypted values held in memory after load, keyed by `file/json-key`.
    cache: std::sync::Mutex<HashMap<String, String>>,
    /// Batch depth; while > 0, flushes collapse to the closing `end_batch`.
    batch: std::sync::Mutex<BatchState>,
}

#[derive(Default)]
struct BatchState {
    depth: u32,
    pending: HashMap<String, Value>,
}

impl SettingsStore {
    pub fn new(base_dir: PathBuf, keys: Box<dyn KeySource>) -> Result<Self> {
        std::fs::create_dir_all(&base_dir)
            .with_context(|| format!("failed to create settings dir {}", base_dir.display()))?;
        Ok(Self {
            base_dir,
            keys,
            file_locks: Mutex::new(HashMap::new()),
            cache: std::sync::Mutex::new(HashMap::new()),
            batch: std::sync::Mutex::new(BatchState::default()),
        })
    }

    async fn file_lock(&self, file: &str) -> Arc<Mutex<()>> {
        let mut locks = self.file_locks.lock().await;
        locks
            .entry(file.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn path_for(&self, file: &str) -> PathBuf {
        self.base_dir.join(format!("{file}.json"))
    }

    /// Begin collapsing writes; paired with [`end_batch`](Self::end_batch).
    /// Used at startup when many settings land in a burst.
    pub fn begin_batch(&self) {
        let mut batch = self.lock_batch();
        batch.depth += 1;
    }

    pub async fn end_batch(&self) -> Result<()> {
        let pending = {
            let mut batch = self.lock_batch();
            batch.depth = batch.depth.saturating_sub(1);
            if batch.depth > 0 {
                return Ok(());
            }
            std::mem::take(&mut batch.pending)
        };
        for (file, value) in pending {
            self.flush(&file, &value).await?;
        }
        Ok(())
    }

    fn lock_batch(&self) -> std::sync::MutexGuard<'_, BatchState> {
        self.batch
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Persist a settings document, encrypting the named secret keys.
    ///
    /// Secret keys already carrying the `encrypted:` envelope or the masked
    /// token are left untouched (the mask means "keep the stored value").
    pub async fn save(&self, file: &str, mut value: Value, secret_keys: &[&str]) -> Result<()> {
        if let Some(obj) = value.as_object_mut() {
            for &key in secret_keys {
                let raw = match obj.get(key) {
                    Some(Value::String(s)) => s.clone(),
                    _ => continue,
                };
                if raw.is_empty() || raw.starts_with(ENCRYPTED_PREFIX) {
                    continue;
                }
                if raw == MASKED_VALUE {
                    // Mask round-tripped from the UI: keep what is on disk
                    if let Some(stored) = self.stored_value(file, key)? {
                        obj.insert(key.to_string(), Value::String(stored));
                    } else {
                        obj.remove(key);
                    }
                    continue;
                }
                let envelope = self.encrypt(&raw)?;
                self.cache_put(file, key, raw);
                obj.insert(key.to_string(), Value::String(envelope));
            }
        }

        let batched = {
            let mut batch = self.lock_batch();
            if batch.depth > 0 {
                batch.pending.insert(file.to_string(), value.clone());
                true
            } else {
                false
            }
        };
        if batched {
            return Ok(());
        }
        self.flush(file, &value).await
    }

    async fn flush(&self, file: &str, value: &Value) -> Result<()> {
        let lock = self.file_lock(file).await;
        let _guard = lock.lock().await;
        let path = self.path_for(file);
        let content = serde_json::to_string_pretty(value)?;
        atomic_write(&path, &content)?;
        debug!("settings file written: {}", path.display());
        Ok(())
    }

    /// Load a settings document with secret fields decrypted into memory.
    pub async fn load(&self, file: &str, secret_keys: &[&str]) -> Result<Option<Value>> {
        let lock = self.file_lock(file).await;
        let _guard = lock.lock().await;
        let path = self.path_for(file);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let mut value: Value = serde_json::from_str(&content)
            .with_context(|| format!("malformed settings file {}", path.display()))?;
        if let Some(obj) = value.as_object_mut() {
            for &key in secret_keys {
                let envelope = match obj.get(key) {
                    Some(Value::String(s)) => match s.strip_prefix(ENCRYPTED_PREFIX) {
                        Some(envelope) => envelope.to_string(),
                        None => continue,
                    },
                    _ => continue,
                };
                match self.decrypt(&envelope) {
                    Ok(plain) => {
                        self.cache_put(file, key, plain.clone());
                        obj.insert(key.to_string(), Value::String(plain));
                    }
                    Err(e) => {
                        warn!("failed to decrypt {file}.{key}: {e}");
                        obj.remove(key);
                    }
                }
            }
        }
        Ok(Some(value))
    }

    /// Load a settings document with secret fields replaced by the mask.
    /// This is the only form that may be sent to UI or control plane
    /// subscribers.
    pub async fn load_masked(&self, file: &str, secret_keys: &[&str]) -> Result<Option<Value>> {
        let Some(mut value) = self.load(file, secret_keys).await? else {
            return Ok(None);
        };
        if let Some(obj) = value.as_object_mut() {
            for &key in secret_keys {
                if matches!(obj.get(key), Some(Value::String(s)) if !s.is_empty()) {
                    obj.insert(key.to_string(), Value::String(MASKED_VALUE.to_string()));
                }
            }
        }
        Ok(Some(value))
    }

    fn stored_value(&self, file: &str, key: &str) -> Result<Option<String>> {
        let path = self.path_for(file);
        if !path.exists() {
            return Ok(None);
        }
        let value: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        Ok(value
            .get(key)
            .and_then(Value::as_str)
            .map(ToString::to_string))
    }

    fn cache_put(&self, file: &str, key: &str, value: String) {
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        cache.insert(format!("{file}/{key}"), value);
    }

    /// A previously loaded plaintext secret, available even if the keychain
    /// has since become unreachable.
    pub fn cached_secret(&self, file: &str, key: &str) -> Option<String> {
        let cache = self
            .cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        cache.get(&format!("{file}/{key}")).cloned()
    }

    fn encrypt(&self, plaintext: &str) -> Result<String> {
        // Refuse to fall back to plaintext when the keychain is unavailable
        let key = self
            .keys
            .envelope_key()
            .context("refusing to store secret: keychain unavailable")?;
        let cipher = Aes256Gcm::new_from_slice(&key).expect("32-byte key");
        let mut nonce_bytes = [0u8; NONCE_LEN];
        fastrand::fill(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| anyhow::anyhow!("encryption failed"))?;
        let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&ciphertext);
        Ok(format!(
            "{ENCRYPTED_PREFIX}{}",
            base64::engine::general_purpose::STANDARD.encode(envelope)
        ))
    }

    fn decrypt(&self, envelope_b64: &str) -> Result<String> {
        let key = self.keys.envelope_key()?;
        let envelope = base64::engine::general_purpose::STANDARD
            .decode(envelope_b64)
            .context("envelope is not valid base64")?;
        if envelope.len() < NONCE_LEN {
            anyhow::bail!("envelope too short");
        }
        let (nonce_bytes, ciphertext) = envelope.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new_from_slice(&key).expect("32-byte key");
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| anyhow::anyhow!("decryption failed (wrong key?)"))?;
        String::from_utf8(plaintext).context("decrypted secret is not UTF-8")
    }
}
