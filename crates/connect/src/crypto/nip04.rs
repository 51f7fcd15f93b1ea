//! NIP-04: AES-256-CBC over the raw ECDH x coordinate.
//!
//! Deprecated in favour of NIP-44 but still spoken by many remote signers.
//! Payload format is `base64(ciphertext)?iv=base64(iv)`.

use aes::Aes256;
use base64::engine::{general_purpose, Engine};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use super::ecdh_shared_x;
use crate::error::Nip46Error;
use crate::types::{PublicKey, SecretKey};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

#[derive(Debug, thiserror::Error)]
pub enum Nip04Error {
    #[error("Invalid content format")]
    InvalidContentFormat,

    #[error("Base64 decode error")]
    Base64Decode,

    #[error("UTF-8 encoding error")]
    Utf8Encode,

    #[error("Wrong block mode")]
    WrongBlockMode,

    #[error("Invalid IV length")]
    InvalidIv,

    #[error("Random generation failed")]
    RandomGenerationFailed,
}

impl From<Nip04Error> for Nip46Error {
    fn from(e: Nip04Error) -> Self {
        Nip46Error::Crypto(format!("nip04: {}", e))
    }
}

/// Shared AES key for a keypair pair. Unhashed, unlike textbook ECDH.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SharedKey([u8; 32]);

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedKey(<sensitive>)")
    }
}

impl SharedKey {
    pub fn derive(secret_key: &SecretKey, public_key: &PublicKey) -> Result<Self, Nip46Error> {
        ecdh_shared_x(secret_key, public_key).map(SharedKey)
    }
}

fn generate_iv() -> Result<[u8; 16], Nip04Error> {
    let mut iv = [0u8; 16];
    getrandom::getrandom(&mut iv).map_err(|_| Nip04Error::RandomGenerationFailed)?;
    Ok(iv)
}

pub fn encrypt(key: &SharedKey, content: &str) -> Result<String, Nip04Error> {
    encrypt_with_iv(key, content, generate_iv()?)
}

pub fn encrypt_with_iv(key: &SharedKey, content: &str, iv: [u8; 16]) -> Result<String, Nip04Error> {
    let cipher = Aes256CbcEnc::new(&key.0.into(), &iv.into());
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(content.as_bytes());
    Ok(format!(
        "{}?iv={}",
        general_purpose::STANDARD.encode(ciphertext),
        general_purpose::STANDARD.encode(iv)
    ))
}

pub fn decrypt(key: &SharedKey, encrypted_content: &str) -> Result<String, Nip04Error> {
    let bytes = decrypt_to_bytes(key, encrypted_content)?;
    String::from_utf8(bytes).map_err(|_| Nip04Error::Utf8Encode)
}

pub fn decrypt_to_bytes(key: &SharedKey, encrypted_content: &str) -> Result<Vec<u8>, Nip04Error> {
    let (content, iv) = encrypted_content
        .trim()
        .split_once("?iv=")
        .ok_or(Nip04Error::InvalidContentFormat)?;
    if iv.contains("?iv=") {
        return Err(Nip04Error::InvalidContentFormat);
    }

    let mut encrypted = general_purpose::STANDARD
        .decode(content)
        .map_err(|_| Nip04Error::Base64Decode)?;
    let iv = general_purpose::STANDARD
        .decode(iv)
        .map_err(|_| Nip04Error::Base64Decode)?;
    if iv.len() != 16 {
        return Err(Nip04Error::InvalidIv);
    }

    let cipher = Aes256CbcDec::new(&key.0.into(), iv.as_slice().into());
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&mut encrypted)
        .map_err(|_| Nip04Error::WrongBlockMode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Keys;

    #[test]
    fn test_roundtrip_between_peers() {
        let alice = Keys::generate().unwrap();
        let bob = Keys::generate().unwrap();
        let ab = SharedKey::derive(&alice.secret_key, &bob.public_key).unwrap();
        let ba = SharedKey::derive(&bob.secret_key, &alice.public_key).unwrap();
        assert_eq!(ab, ba);

        let payload = encrypt(&ab, "hello remote signer").unwrap();
        assert!(payload.contains("?iv="));
        assert_eq!(decrypt(&ba, &payload).unwrap(), "hello remote signer");
    }

    #[test]
    fn test_fixed_iv_output_shape() {
        let key = SharedKey([3u8; 32]);
        let payload = encrypt_with_iv(&key, "abc", [0u8; 16]).unwrap();
        assert!(payload.ends_with("?iv=AAAAAAAAAAAAAAAAAAAAAA=="));
        assert_eq!(decrypt(&key, &payload).unwrap(), "abc");
    }

    #[test]
    fn test_rejects_malformed_content() {
        let key = SharedKey([3u8; 32]);
        assert!(matches!(decrypt(&key, "no-iv"), Err(Nip04Error::InvalidContentFormat)));
        assert!(matches!(decrypt(&key, "!!!?iv=AAAA"), Err(Nip04Error::Base64Decode)));
        assert!(matches!(decrypt(&key, "AAAA?iv=AAAA"), Err(Nip04Error::InvalidIv)));
    }
}
