/*!
Payload encryption for the NIP-46 channel.

- `nip44`      : NIP-44 v2 primitive (ChaCha20 + HMAC-SHA256, padded)
- `nip04`      : legacy AES-256-CBC primitive
- `cipher`     : capability discovery, `CipherHandle` and the per-session `CipherSuite`
- `candidates` : best-effort ciphertext reassembly behind `decrypt_any_candidate`
*/
pub mod candidates;
pub mod cipher;
pub mod nip04;
pub mod nip44;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Nip46Error, Nip46Result};
use crate::types::{PublicKey, SecretKey};

pub use candidates::{normalize_ciphertext_payload, Decrypted, HandshakeDecrypted};
pub use cipher::{CipherCapabilities, CipherHandle, CipherSuite};

/// Encryption families a remote signer may speak, in preference order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "nip44.v2")]
    Nip44V2,
    #[serde(rename = "nip44")]
    Nip44,
    #[serde(rename = "nip04")]
    Nip04,
}

impl Algorithm {
    pub const ALL: [Algorithm; 3] = [Algorithm::Nip44V2, Algorithm::Nip44, Algorithm::Nip04];

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Nip44V2 => "nip44.v2",
            Algorithm::Nip44 => "nip44",
            Algorithm::Nip04 => "nip04",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw x coordinate of the ECDH shared point. Nostr pubkeys are x-only, so
/// the even-y lift is tried first, then odd-y.
pub(crate) fn ecdh_shared_x(secret_key: &SecretKey, public_key: &PublicKey) -> Nip46Result<[u8; 32]> {
    use k256::{ecdh::diffie_hellman, PublicKey as K256PublicKey, SecretKey as K256SecretKey};

    let k256_secret = K256SecretKey::from_slice(&secret_key.0)
        .map_err(|e| Nip46Error::InvalidPrivateKey(e.to_string()))?;

    let mut compressed = [0u8; 33];
    compressed[0] = 0x02;
    compressed[1..].copy_from_slice(&public_key.0);
    let k256_public = K256PublicKey::from_sec1_bytes(&compressed)
        .or_else(|_| {
            compressed[0] = 0x03;
            K256PublicKey::from_sec1_bytes(&compressed)
        })
        .map_err(|e| Nip46Error::InvalidPublicKey(e.to_string()))?;

    let shared = diffie_hellman(k256_secret.to_nonzero_scalar(), k256_public.as_affine());
    let mut out = [0u8; 32];
    out.copy_from_slice(shared.raw_secret_bytes());
    Ok(out)
}
