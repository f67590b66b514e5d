use crate::config::PairingConfig;
use crate::utils::atomic_write;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[cfg(test)]
mod tests;

/// Alphabet for human-friendly pairing codes (no 0/O/1/I to avoid confusion)
const CODE_ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZ";
const CODE_LENGTH: usize = 6;

/// An unredeemed pairing code for a channel. Only the hash is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRecord {
    pub channel: String,
    pub code_hash: String,
    pub expires_at: u64,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PendingData {
    records: Vec<PairingRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct AllowlistData {
    senders: Vec<String>,
}

/// Brute-force lockout state, persisted on its own record so resolved
/// pairings stay immutable.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct BanData {
    /// `channel:user` → failed attempt count inside the current window.
    attempts: HashMap<String, u32>,
    /// `channel:user` → unix seconds the ban lifts.
    banned_until: HashMap<String, u64>,
}

/// Outcome of a verification attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Code matched; the sender is now allowlisted.
    Paired,
    /// Sender was already allowlisted; no pairing record was consumed.
    AlreadyPaired,
    /// No live record matched the code.
    UnknownCode,
    /// The channel+user is inside a ban window. The code was not checked.
    Banned { until: u64 },
}

struct PairingState {
    pending: PendingData,
    allowlists: HashMap<String, AllowlistData>,
    bans: BanData,
}

/// Pairing code lifecycle for external channels: issue, verify with
/// brute-force lockout, and the trust upgrade onto the allowlist.
///
/// Verifications for one channel are serialized under a per-channel mutex
/// so concurrent attempts cannot race the attempt counters.
pub struct PairingService {
    base_dir: PathBuf,
    config: PairingConfig,
    state: Mutex<PairingState>,
    channel_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PairingService {
    pub fn new(base_dir: PathBuf, config: PairingConfig) -> Result<Self> {
        std::fs::create_dir_all(&base_dir)
            .with_context(|| format!("failed to create pairing dir: {}", base_dir.display()))?;
        let mut state = PairingState {
            pending: PendingData::default(),
            allowlists: HashMap::new(),
            bans: BanData::default(),
        };
        load_state(&base_dir, &mut state)?;
        Ok(Self {
            base_dir,
            config,
            state: Mutex::new(state),
            channel_locks: Mutex::new(HashMap::new()),
        })
    }

    async fn channel_lock(&self, channel: &str) -> Arc<Mutex<()>> {
        let mut locks = self.channel_locks.lock().await;
        locks
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    fn generate_code() -> String {
        let mut code = String::with_capacity(CODE_LENGTH);
        for _ in 0..CODE_LENGTH {
            let idx = fastrand::usize(0..CODE_ALPHABET.len());
            code.push(CODE_ALPHABET[idx] as char);
        }
        code
    }

    fn hash_code(code: &str) -> String {
        hex::encode(Sha256::digest(code.to_uppercase().as_bytes()))
    }

    /// Issue a fresh code for a channel. Any previous unredeemed code for
    /// the channel is replaced.
    pub async fn issue(&self, channel: &str) -> Result<String> {
        let lock = self.channel_lock(channel).await;
        let _guard = lock.lock().await;

        let code = Self::generate_code();
        let record = PairingRecord {
            channel: channel.to_string(),
            code_hash: Self::hash_code(&code),
            expires_at: Self::now_secs() + self.config.code_ttl_secs,
            attempts: 0,
        };
        let mut state = self.state.lock().await;
        state.pending.records.retain(|r| r.channel != channel);
        state.pending.records.push(record);
        save_pending(&self.base_dir, &state.pending)?;
        info!("pairing code issued for channel {channel}");
        Ok(code)
    }

    /// Verify a code sent by an external user. The ban window is checked
    /// before any code comparison; a success removes the record entirely
    /// and upgrades the sender onto the channel's allowlist.
    pub async fn verify(&self, channel: &str, user_id: &str, code: &str) -> Result<VerifyOutcome> {
        let lock = self.channel_lock(channel).await;
        let _guard = lock.lock().await;

        let now = Self::now_secs();
        let key = format!("{channel}:{user_id}");
        let mut state = self.state.lock().await;

        if Self::allowlisted(&state, channel, user_id) {
            debug!("sender {user_id} already paired on {channel}");
            return Ok(VerifyOutcome::AlreadyPaired);
        }

        if let Some(&until) = state.bans.banned_until.get(&key) {
            if until > now {
                warn!("pairing attempt from banned sender {key}");
                return Ok(VerifyOutcome::Banned { until });
            }
            // Ban lapsed; the window starts fresh
            state.bans.banned_until.remove(&key);
            state.bans.attempts.remove(&key);
        }

        let code_hash = Self::hash_code(code);
        let matched = state.pending.records.iter().position(|r| {
            let hash_match: bool = r
                .code_hash
                .as_bytes()
                .ct_eq(code_hash.as_bytes())
                .into();
            r.channel == channel && hash_match && r.expires_at > now
        });

        if let Some(idx) = matched {
            state.pending.records.remove(idx);
            state
                .allowlists
                .entry(channel.to_string())
                .or_default()
                .senders
                .push(user_id.to_string());
            // Counters are not reset on success; the record is simply gone
            save_pending(&self.base_dir, &state.pending)?;
            save_allowlist(&self.base_dir, channel, &state.allowlists)?;
            info!("sender {user_id} paired on channel {channel}");
            return Ok(VerifyOutcome::Paired);
        }

        let attempts = state.bans.attempts.entry(key.clone()).or_insert(0);
        *attempts += 1;
        let attempts = *attempts;
        state
            .pending
            .records
            .iter_mut()
            .filter(|r| r.channel == channel)
            .for_each(|r| r.attempts += 1);
        if attempts >= self.config.max_attempts {
            let until = now + self.config.ban_secs;
            state.bans.banned_until.insert(key.clone(), until);
            warn!("sender {key} banned after {attempts} failed pairing attempts");
        }
        save_pending(&self.base_dir, &state.pending)?;
        save_bans(&self.base_dir, &state.bans)?;
        Ok(VerifyOutcome::UnknownCode)
    }

    pub async fn is_paired(&self, channel: &str, user_id: &str) -> bool {
        let state = self.state.lock().await;
        Self::allowlisted(&state, channel, user_id)
    }

    fn allowlisted(state: &PairingState, channel: &str, user_id: &str) -> bool {
        state
            .allowlists
            .get(channel)
            .is_some_and(|a| a.senders.iter().any(|s| s == user_id))
    }

    pub async fn revoke(&self, channel: &str, user_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(allowlist) = state.allowlists.get_mut(channel) else {
            return Ok(false);
        };
        let before = allowlist.senders.len();
        allowlist.senders.retain(|s| s != user_id);
        if allowlist.senders.len() < before {
            save_allowlist(&self.base_dir, channel, &state.allowlists)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Remove expired pending records.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let now = Self::now_secs();
        let mut state = self.state.lock().await;
        let before = state.pending.records.len();
        state.pending.records.retain(|r| r.expires_at > now);
        let removed = before - state.pending.records.len();
        if removed > 0 {
            save_pending(&self.base_dir, &state.pending)?;
        }
        Ok(removed)
    }

    pub async fn pending_count(&self) -> usize {
        let now = Self::now_secs();
        let state = self.state.lock().await;
        state
            .pending
            .records
            .iter()
            .filter(|r| r.expires_at > now)
            .count()
    }

    pub async fn channel_senders(&self, channel: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .allowlists
            .get(channel)
            .map(|a| a.senders.clone())
            .unwrap_or_default()
    }
}

fn load_state(base_dir: &std::path::Path, state: &mut PairingState) -> Result<()> {
    let pending_path = base_dir.join("pending.json");
    if pending_path.exists() {
        let content = std::fs::read_to_string(&pending_path)?;
        state.pending = serde_json::from_str(&content).unwrap_or_default();
    }
    let bans_path = base_dir.join("bans.json");
    if bans_path.exists() {
        let content = std::fs::read_to_string(&bans_path)?;
        state.bans = serde_json::from_str(&content).unwrap_or_default();
    }
    for entry in std::fs::read_dir(base_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(channel) = name.strip_suffix("-allowlist.json") {
            let content = std::fs::read_to_string(entry.path())?;
            let data: AllowlistData = serde_json::from_str(&content).unwrap_or_default();
            state.allowlists.insert(channel.to_string(), data);
        }
    }
    Ok(())
}

fn save_pending(base_dir: &std::path::Path, pending: &PendingData) -> Result<()> {
    atomic_write(
        &base_dir.join("pending.json"),
        &serde_json::to_string_pretty(pending)?,
    )
}

fn save_bans(base_dir: &std::path::Path, bans: &BanData) -> Result<()> {
    atomic_write(&base_dir.join("bans.json"), &serde_json::to_string(bans)?)
}

fn save_allowlist(
    base_dir: &std::path::Path,
    channel: &str,
    allowlists: &HashMap<String, AllowlistData>,
) -> Result<()> {
    let data = allowlists.get(channel).cloned().unwrap_or_default();
    atomic_write(
        &base_dir.join(format!("{channel}-allowlist.json")),
        &serde_json::to_string_pretty(&data)?,
    )
}
