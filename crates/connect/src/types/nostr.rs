use k256::schnorr::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use signature::hazmat::PrehashVerifier;
use std::fmt;

use crate::error::{Nip46Error, Nip46Result};

pub type Kind = u16;
pub type Timestamp = u64;

/// NIP-46 request/response event kind.
pub const NIP46_RPC_KIND: Kind = 24133;

fn decode_32(s: &str, what: &str) -> Nip46Result<[u8; 32]> {
    let bytes = hex::decode(s.trim()).map_err(|_| Nip46Error::InvalidArgument(format!("Invalid {} hex", what)))?;
    if bytes.len() != 32 {
        return Err(Nip46Error::InvalidArgument(format!("Invalid {} length", what)));
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

// ============================================================================
// Keys
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub [u8; 32]);

impl EventId {
    pub fn from_hex(s: &str) -> Nip46Result<Self> {
        decode_32(s, "event id").map(EventId)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// x-only secp256k1 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn from_hex(s: &str) -> Nip46Result<Self> {
        let arr = decode_32(s, "pubkey").map_err(|e| Nip46Error::InvalidPublicKey(e.to_string()))?;
        VerifyingKey::from_bytes(&arr)
            .map_err(|_| Nip46Error::InvalidPublicKey("not a curve point".to_string()))?;
        Ok(PublicKey(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey(pub [u8; 32]);

impl SecretKey {
    pub fn from_hex(s: &str) -> Nip46Result<Self> {
        let arr = decode_32(s, "secret key").map_err(|e| Nip46Error::InvalidPrivateKey(e.to_string()))?;
        SigningKey::from_bytes(&arr)
            .map_err(|_| Nip46Error::InvalidPrivateKey("out of range for secp256k1".to_string()))?;
        Ok(SecretKey(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn public_key(&self) -> Nip46Result<PublicKey> {
        let signing_key = SigningKey::from_bytes(&self.0)
            .map_err(|e| Nip46Error::InvalidPrivateKey(e.to_string()))?;
        Ok(PublicKey(signing_key.verifying_key().to_bytes().into()))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

#[derive(Clone, Debug)]
pub struct Keys {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl Keys {
    pub fn new(secret_key: SecretKey) -> Nip46Result<Self> {
        let public_key = secret_key.public_key()?;
        Ok(Self {
            secret_key,
            public_key,
        })
    }

    pub fn parse(secret_hex: &str) -> Nip46Result<Self> {
        Self::new(SecretKey::from_hex(secret_hex)?)
    }

    /// Fresh random keypair from the OS entropy source.
    pub fn generate() -> Nip46Result<Self> {
        loop {
            let mut bytes = [0u8; 32];
            getrandom::getrandom(&mut bytes).map_err(|e| Nip46Error::Crypto(e.to_string()))?;
            // Rejection-sample the (astronomically rare) out-of-range scalars.
            if SigningKey::from_bytes(&bytes).is_ok() {
                return Self::new(SecretKey(bytes));
            }
        }
    }

    pub fn material(&self) -> KeyMaterial {
        KeyMaterial {
            private_key_hex: self.secret_key.to_hex(),
            public_key_hex: self.public_key.to_hex(),
        }
    }
}

/// Hex form of an ephemeral client keypair, as handed to callers and storage.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMaterial {
    pub private_key_hex: String,
    pub public_key_hex: String,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("public_key_hex", &self.public_key_hex)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Event & Filter
// ============================================================================

/// Compute the NIP-01 event id: sha256 of `[0,pubkey,created_at,kind,tags,content]`.
pub fn compute_event_id(
    pubkey_hex: &str,
    created_at: Timestamp,
    kind: Kind,
    tags: &[Vec<String>],
    content: &str,
) -> [u8; 32] {
    let serialized = serde_json::json!([0, pubkey_hex, created_at, kind, tags, content]).to_string();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    hasher.finalize().into()
}

/// Event template before id computation and signing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: Timestamp,
    pub kind: Kind,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
}

impl UnsignedEvent {
    pub fn new(pubkey: &str, kind: Kind, content: String, tags: Vec<Vec<String>>) -> Self {
        UnsignedEvent {
            pubkey: pubkey.to_string(),
            created_at: crate::util::unix_now(),
            kind,
            tags,
            content,
        }
    }

    pub fn id(&self) -> [u8; 32] {
        compute_event_id(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: Timestamp,
    pub kind: Kind,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
    pub sig: String,
}

impl Event {
    /// Values of every tag named `name` (second element).
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.first().map(|n| n == name).unwrap_or(false))
            .filter_map(|t| t.get(1).map(String::as_str))
    }

    pub fn is_tagged_to(&self, pubkey_hex: &str) -> bool {
        self.tag_values("p").any(|v| v.eq_ignore_ascii_case(pubkey_hex))
    }

    /// Check id and BIP-340 signature.
    pub fn verify(&self) -> Nip46Result<()> {
        let expected = compute_event_id(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content);
        if hex::encode(expected) != self.id.to_ascii_lowercase() {
            return Err(Nip46Error::Crypto("event id mismatch".to_string()));
        }
        let pubkey = PublicKey::from_hex(&self.pubkey)?;
        let verifying_key = VerifyingKey::from_bytes(&pubkey.0)
            .map_err(|_| Nip46Error::InvalidPublicKey(self.pubkey.clone()))?;
        let sig_bytes = hex::decode(&self.sig).map_err(|_| Nip46Error::Crypto("Invalid signature hex".to_string()))?;
        let signature = Signature::try_from(sig_bytes.as_slice())
            .map_err(|_| Nip46Error::Crypto("Invalid signature format".to_string()))?;
        verifying_key
            .verify_prehash(&expected, &signature)
            .map_err(|_| Nip46Error::Crypto("Signature verification failed".to_string()))
    }

    pub fn as_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Minimal relay filter.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<Kind>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(rename = "#p", skip_serializing_if = "Option::is_none")]
    pub p_tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: Kind) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    pub fn author(mut self, author: &str) -> Self {
        self.authors.get_or_insert_with(Vec::new).push(author.to_string());
        self
    }

    pub fn pubkey_tag(mut self, pubkey: &str) -> Self {
        self.p_tags.get_or_insert_with(Vec::new).push(pubkey.to_string());
        self
    }

    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a.eq_ignore_ascii_case(&event.pubkey)) {
                return false;
            }
        }
        if let Some(p_tags) = &self.p_tags {
            if !p_tags.iter().any(|p| event.is_tagged_to(p)) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        true
    }

    pub fn as_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
