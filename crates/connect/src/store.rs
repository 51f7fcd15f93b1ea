//! Versioned persistence of remote-signer sessions.
//!
//! Records are validated as a whole on read and projected through an
//! allow-list on write. Anything that fails validation is purged; storage
//! failures are logged and absorbed, never surfaced to callers.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::codec::{is_hex_pubkey, normalize_encryption_algorithm, strict_pubkey, Metadata};
use crate::config::KdfConfig;
use crate::crypto::nip44::{self, ConversationKey};
use crate::crypto::Algorithm;
use crate::error::{Nip46Error, Nip46Result};
use crate::util::{summarize_hex, unix_now_ms};

pub const SESSION_RECORD_VERSION: u64 = 1;
const SALT_LEN: usize = 16;

// ============================================================================
// Storage backends
// ============================================================================

/// Key/value persistence used by [`SessionStore`].
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Nip46Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Nip46Result<()>;
    fn remove(&self, key: &str) -> Nip46Result<()>;
}

/// Process-local storage.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<FxHashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn get(&self, key: &str) -> Nip46Result<Option<String>> {
        Ok(self.entries.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Nip46Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Nip46Result<()> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
        Ok(())
    }
}

/// One JSON file per key under a directory.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileStorage { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

fn io_err(path: &Path, e: std::io::Error) -> Nip46Error {
    Nip46Error::Storage(format!("{}: {}", path.display(), e))
}

impl StorageBackend for FileStorage {
    fn get(&self, key: &str) -> Nip46Result<Option<String>> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Nip46Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
        file.write_all(value.as_bytes()).map_err(|e| io_err(&tmp, e))?;
        file.sync_all().map_err(|e| io_err(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))
    }

    fn remove(&self, key: &str) -> Nip46Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&path, e)),
        }
    }
}

// ============================================================================
// Session record
// ============================================================================

/// Passphrase-sealed `{clientPrivateKey, secret}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecrets {
    pub salt: String,
    pub ciphertext: String,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub version: u64,
    #[serde(default)]
    pub client_public_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_private_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_secrets: Option<EncryptedSecrets>,
    pub remote_pubkey: String,
    #[serde(default)]
    pub relays: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<Algorithm>,
    #[serde(default)]
    pub permissions: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub user_pubkey: String,
    #[serde(default)]
    pub last_connected_at: u64,
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("version", &self.version)
            .field("client_public_key", &self.client_public_key)
            .field("has_client_private_key", &!self.client_private_key.is_empty())
            .field("has_secret", &!self.secret.is_empty())
            .field("sealed", &self.encrypted_secrets.is_some())
            .field("remote_pubkey", &self.remote_pubkey)
            .field("relays", &self.relays)
            .field("encryption", &self.encryption)
            .field("permissions", &self.permissions)
            .field("metadata", &self.metadata)
            .field("user_pubkey", &self.user_pubkey)
            .field("last_connected_at", &self.last_connected_at)
            .finish()
    }
}

impl SessionRecord {
    pub fn new(remote_pubkey: &str) -> Self {
        SessionRecord {
            version: SESSION_RECORD_VERSION,
            client_public_key: String::new(),
            client_private_key: String::new(),
            secret: String::new(),
            encrypted_secrets: None,
            remote_pubkey: remote_pubkey.to_string(),
            relays: Vec::new(),
            encryption: None,
            permissions: String::new(),
            metadata: Metadata::default(),
            user_pubkey: String::new(),
            last_connected_at: unix_now_ms(),
        }
    }

    /// Credentials needed to rebuild a session are present in plaintext.
    pub fn has_credentials(&self) -> bool {
        !self.client_private_key.is_empty() && !self.secret.is_empty()
    }

    pub fn is_sealed(&self) -> bool {
        self.encrypted_secrets.is_some()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn trimmed_str<'a>(map: &'a Map<String, Value>, key: &str) -> &'a str {
    map.get(key).and_then(Value::as_str).map(str::trim).unwrap_or("")
}

/// Optional 64-hex field: empty stays empty, anything else must be valid.
fn hex_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    let value = trimmed_str(map, key).to_ascii_lowercase();
    if value.is_empty() || is_hex_pubkey(&value) {
        Some(value)
    } else {
        None
    }
}

/// Older records carried no version tag. Those with a remote pubkey and
/// recognisable key material are lifted to version 1.
fn migrate_legacy(candidate: &Value) -> Option<Value> {
    let map = candidate.as_object()?;
    if map.get("version").map(|v| !v.is_null()).unwrap_or(false) {
        return None;
    }
    let has_remote = !trimmed_str(map, "remotePubkey").is_empty();
    let has_keys = !trimmed_str(map, "clientPrivateKey").is_empty() || !trimmed_str(map, "clientPublicKey").is_empty();
    if !(has_remote && has_keys) {
        return None;
    }
    let mut upgraded = map.clone();
    upgraded.insert("version".to_string(), json!(SESSION_RECORD_VERSION));
    Some(Value::Object(upgraded))
}

/// Validate `candidate` and project it onto the allow-listed schema.
///
/// Returns `None` when the version is not 1, the remote pubkey is missing or
/// invalid, or any present key field is not 64-char hex.
pub fn sanitize_record(candidate: &Value) -> Option<SessionRecord> {
    let map = candidate.as_object()?;
    if map.get("version").and_then(Value::as_u64) != Some(SESSION_RECORD_VERSION) {
        return None;
    }

    let remote_pubkey = strict_pubkey(trimmed_str(map, "remotePubkey"));
    if remote_pubkey.is_empty() {
        return None;
    }
    let client_public_key = hex_field(map, "clientPublicKey")?;
    let client_private_key = hex_field(map, "clientPrivateKey")?;

    let encrypted_secrets = map.get("encryptedSecrets").and_then(Value::as_object).and_then(|sealed| {
        let salt = trimmed_str(sealed, "salt");
        let ciphertext = trimmed_str(sealed, "ciphertext");
        (!salt.is_empty() && !ciphertext.is_empty()).then(|| EncryptedSecrets {
            salt: salt.to_string(),
            ciphertext: ciphertext.to_string(),
        })
    });

    let relays = map
        .get("relays")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let encryption_raw = match trimmed_str(map, "encryption") {
        "" => trimmed_str(map, "algorithm"),
        value => value,
    };

    let metadata = map
        .get("metadata")
        .and_then(Value::as_object)
        .map(|m| Metadata {
            name: trimmed_str(m, "name").to_string(),
            url: trimmed_str(m, "url").to_string(),
            image: trimmed_str(m, "image").to_string(),
        })
        .unwrap_or_default();

    Some(SessionRecord {
        version: SESSION_RECORD_VERSION,
        client_public_key,
        client_private_key,
        secret: trimmed_str(map, "secret").to_string(),
        encrypted_secrets,
        remote_pubkey,
        relays,
        encryption: normalize_encryption_algorithm(encryption_raw),
        permissions: trimmed_str(map, "permissions").to_string(),
        metadata,
        user_pubkey: strict_pubkey(trimmed_str(map, "userPubkey")),
        last_connected_at: map
            .get("lastConnectedAt")
            .and_then(Value::as_u64)
            .unwrap_or_else(unix_now_ms),
    })
}

// ============================================================================
// Passphrase sealing
// ============================================================================

fn derive_passphrase_key(passphrase: &str, salt: &[u8], kdf: &KdfConfig) -> Nip46Result<ConversationKey> {
    let params = argon2::Params::new(kdf.m_cost, kdf.t_cost, kdf.p_cost, Some(32))
        .map_err(|e| Nip46Error::InvalidArgument(format!("invalid Argon2 parameters: {e}")))?;
    let argon2 = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
    let mut output = [0u8; 32];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut output)
        .map_err(|e| Nip46Error::Crypto(format!("Argon2id derivation failed: {e}")))?;
    Ok(ConversationKey::new(output))
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SealedPayload {
    #[serde(default)]
    client_private_key: String,
    #[serde(default)]
    secret: String,
}

fn seal(record: &SessionRecord, passphrase: &str, kdf: &KdfConfig) -> Nip46Result<EncryptedSecrets> {
    let mut salt = [0u8; SALT_LEN];
    getrandom::getrandom(&mut salt).map_err(|e| Nip46Error::Crypto(e.to_string()))?;
    let key = derive_passphrase_key(passphrase, &salt, kdf)?;
    let payload = serde_json::to_string(&SealedPayload {
        client_private_key: record.client_private_key.clone(),
        secret: record.secret.clone(),
    })?;
    Ok(EncryptedSecrets {
        salt: BASE64.encode(salt),
        ciphertext: nip44::encrypt(&payload, &key)?,
    })
}

// ============================================================================
// SessionStore
// ============================================================================

/// Single-writer store for one session record under a fixed key.
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn StorageBackend>,
    key: String,
    kdf: KdfConfig,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore").field("key", &self.key).finish_non_exhaustive()
    }
}

impl SessionStore {
    pub fn new(backend: Arc<dyn StorageBackend>, key: impl Into<String>, kdf: KdfConfig) -> Self {
        SessionStore {
            backend,
            key: key.into(),
            kdf,
        }
    }

    pub fn in_memory() -> Self {
        let config = crate::config::ConnectConfig::default();
        Self::new(Arc::new(MemoryStorage::new()), config.storage_key, config.kdf)
    }

    fn purge(&self, reason: &str) {
        warn!("[nip46] discarding stored session: {}", reason);
        if let Err(e) = self.backend.remove(&self.key) {
            warn!("[nip46] failed to clear corrupt session entry: {}", e);
        }
    }

    /// Load and validate the stored record.
    ///
    /// Invalid records are purged. Legacy or non-normalised records are
    /// rewritten once in their projected form.
    pub fn read(&self) -> Option<SessionRecord> {
        let raw = match self.backend.get(&self.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("[nip46] failed to read stored session: {}", e);
                return None;
            }
        };

        let parsed: Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                self.purge(&format!("not JSON ({})", e));
                return None;
            }
        };

        let migrated = migrate_legacy(&parsed);
        let Some(record) = sanitize_record(migrated.as_ref().unwrap_or(&parsed)) else {
            self.purge("failed validation");
            return None;
        };

        if migrated.is_some() || record.to_value() != parsed {
            debug!(
                "[nip46] rewriting stored session for {} in normalised form",
                summarize_hex(&record.remote_pubkey)
            );
            self.persist(&record);
        }
        Some(record)
    }

    /// Validate and persist `record`. With a non-empty `passphrase`, the
    /// client private key and secret are sealed and their plaintext copies
    /// dropped. Returns whether a record was written.
    pub fn write(&self, record: &SessionRecord, passphrase: Option<&str>) -> bool {
        let Some(mut normalized) = sanitize_record(&record.to_value()) else {
            self.purge("refusing to persist invalid record");
            return false;
        };

        if let Some(passphrase) = passphrase.filter(|p| !p.is_empty()) {
            if !normalized.client_private_key.is_empty() || !normalized.secret.is_empty() {
                match seal(&normalized, passphrase, &self.kdf) {
                    Ok(sealed) => {
                        normalized.encrypted_secrets = Some(sealed);
                        normalized.client_private_key.clear();
                        normalized.secret.clear();
                    }
                    Err(e) => {
                        warn!("[nip46] failed to seal session secrets: {}", e);
                        return false;
                    }
                }
            }
        } else if normalized.has_credentials() {
            normalized.encrypted_secrets = None;
        }

        self.persist(&normalized)
    }

    fn persist(&self, record: &SessionRecord) -> bool {
        let serialized = match serde_json::to_string(record) {
            Ok(s) => s,
            Err(e) => {
                warn!("[nip46] failed to serialise session: {}", e);
                return false;
            }
        };
        match self.backend.set(&self.key, &serialized) {
            Ok(()) => true,
            Err(e) => {
                warn!("[nip46] failed to persist session: {}", e);
                false
            }
        }
    }

    /// Remove the stored record. Idempotent.
    pub fn clear(&self) {
        if let Err(e) = self.backend.remove(&self.key) {
            warn!("[nip46] failed to clear stored session: {}", e);
        }
    }

    /// Open `encryptedSecrets` with `passphrase`, returning a record that
    /// carries the plaintext credentials. Unsealed records pass through.
    pub fn unlock(&self, record: &SessionRecord, passphrase: &str) -> Nip46Result<SessionRecord> {
        let Some(sealed) = &record.encrypted_secrets else {
            return Ok(record.clone());
        };
        if passphrase.is_empty() {
            return Err(Nip46Error::PassphraseRequired);
        }
        let salt = BASE64.decode(&sealed.salt).map_err(|_| Nip46Error::DecryptFailed)?;
        let key = derive_passphrase_key(passphrase, &salt, &self.kdf).map_err(|_| Nip46Error::DecryptFailed)?;
        let plaintext = nip44::decrypt(&sealed.ciphertext, &key).map_err(|_| Nip46Error::DecryptFailed)?;
        let payload: SealedPayload = serde_json::from_str(&plaintext).map_err(|_| Nip46Error::DecryptFailed)?;

        let mut unlocked = record.clone();
        unlocked.client_private_key = payload.client_private_key.trim().to_ascii_lowercase();
        unlocked.secret = payload.secret;
        unlocked.encrypted_secrets = None;
        Ok(unlocked)
    }
}
