// Copyright (c) 2022-2023 Yuki Kishimoto
// Copyright (c) 2023-2025 Rust Nostr Developers
// Distributed under the MIT software license

//! NIP44 (v2) - Encrypted Payloads
//!
//! <https://github.com/nostr-protocol/nips/blob/master/44.md>

use std::fmt;
use std::ops::Range;
use std::string::FromUtf8Error;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::ecdh_shared_x;
use crate::error::Nip46Error;
use crate::types::{PublicKey, SecretKey};

const VERSION: u8 = 2;
const SALT: &[u8] = b"nip44-v2";
const MESSAGE_KEYS_SIZE: usize = 76;
const CHACHA_KEY_SIZE: usize = 32;
const CHACHA_NONCE_SIZE: usize = 12;
const CHACHA_KEY_RANGE: Range<usize> = 0..CHACHA_KEY_SIZE;
const CHACHA_NONCE_RANGE: Range<usize> = CHACHA_KEY_SIZE..CHACHA_KEY_SIZE + CHACHA_NONCE_SIZE;
const HMAC_KEY_RANGE: Range<usize> = CHACHA_KEY_SIZE + CHACHA_NONCE_SIZE..MESSAGE_KEYS_SIZE;

const MIN_PLAINTEXT_SIZE: usize = 1;
const MAX_PLAINTEXT_SIZE: usize = 65535;

#[derive(Debug, PartialEq, Eq)]
pub enum ErrorV2 {
    Utf8Encode(FromUtf8Error),
    HkdfLength,
    MessageEmpty,
    MessageTooLong,
    InvalidHmac,
    InvalidPadding,
    InvalidPayload,
    UnknownVersion(u8),
    DecodingError(String),
    Random(String),
}

impl std::error::Error for ErrorV2 {}

impl fmt::Display for ErrorV2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Utf8Encode(e) => write!(f, "error while encoding to UTF-8: {e}"),
            Self::HkdfLength => f.write_str("invalid length for HKDF"),
            Self::MessageEmpty => f.write_str("message empty"),
            Self::MessageTooLong => f.write_str("message too long"),
            Self::InvalidHmac => f.write_str("invalid HMAC"),
            Self::InvalidPadding => f.write_str("invalid padding"),
            Self::InvalidPayload => f.write_str("invalid payload"),
            Self::UnknownVersion(v) => write!(f, "unknown version: {}", v),
            Self::DecodingError(s) => write!(f, "decoding error: {}", s),
            Self::Random(s) => write!(f, "failed to generate nonce: {}", s),
        }
    }
}

impl From<FromUtf8Error> for ErrorV2 {
    fn from(e: FromUtf8Error) -> Self {
        Self::Utf8Encode(e)
    }
}

impl From<ErrorV2> for Nip46Error {
    fn from(e: ErrorV2) -> Self {
        Nip46Error::Crypto(format!("nip44: {}", e))
    }
}

struct MessageKeys {
    chacha_key: [u8; 32],
    chacha_nonce: [u8; 12],
    hmac_key: [u8; 32],
}

impl MessageKeys {
    /// HKDF-expand the conversation key with the per-message nonce.
    fn derive(conversation_key: &ConversationKey, nonce: &[u8; 32]) -> Result<Self, ErrorV2> {
        let hk = Hkdf::<Sha256>::from_prk(conversation_key.as_bytes()).map_err(|_| ErrorV2::HkdfLength)?;
        let mut okm = [0u8; MESSAGE_KEYS_SIZE];
        hk.expand(nonce, &mut okm).map_err(|_| ErrorV2::HkdfLength)?;

        let mut keys = MessageKeys {
            chacha_key: [0u8; 32],
            chacha_nonce: [0u8; 12],
            hmac_key: [0u8; 32],
        };
        keys.chacha_key.copy_from_slice(&okm[CHACHA_KEY_RANGE]);
        keys.chacha_nonce.copy_from_slice(&okm[CHACHA_NONCE_RANGE]);
        keys.hmac_key.copy_from_slice(&okm[HMAC_KEY_RANGE]);
        Ok(keys)
    }

    fn mac(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Hmac<Sha256>, ErrorV2> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.hmac_key).map_err(|_| ErrorV2::HkdfLength)?;
        mac.update(nonce);
        mac.update(ciphertext);
        Ok(mac)
    }
}

/// NIP44 v2 conversation key, symmetric for a (local, remote) keypair pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConversationKey([u8; 32]);

impl fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Conversation key: <sensitive>")
    }
}

impl ConversationKey {
    #[inline]
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// HKDF-extract(salt = "nip44-v2", ikm = ECDH shared x).
    pub fn derive(secret_key: &SecretKey, public_key: &PublicKey) -> Result<Self, Nip46Error> {
        let shared_x = ecdh_shared_x(secret_key, public_key)?;
        let (prk, _) = Hkdf::<Sha256>::extract(Some(SALT), &shared_x);
        let mut conversation_key = [0u8; 32];
        conversation_key.copy_from_slice(&prk);
        Ok(Self(conversation_key))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

fn calc_padded_len(unpadded_len: usize) -> usize {
    if unpadded_len <= 32 {
        return 32;
    }

    let next_power = 1 << ((unpadded_len - 1).ilog2() + 1);
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };

    chunk * ((unpadded_len - 1) / chunk + 1)
}

fn pad(plaintext: &[u8]) -> Result<Vec<u8>, ErrorV2> {
    let len = plaintext.len();
    if len < MIN_PLAINTEXT_SIZE {
        return Err(ErrorV2::MessageEmpty);
    }
    if len > MAX_PLAINTEXT_SIZE {
        return Err(ErrorV2::MessageTooLong);
    }

    let padded_len = calc_padded_len(len);
    let mut padded = Vec::with_capacity(2 + padded_len);
    padded.extend_from_slice(&(len as u16).to_be_bytes());
    padded.extend_from_slice(plaintext);
    padded.resize(2 + padded_len, 0);
    Ok(padded)
}

fn unpad(padded: &[u8]) -> Result<Vec<u8>, ErrorV2> {
    if padded.len() < 2 {
        return Err(ErrorV2::InvalidPadding);
    }
    let unpadded_len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if unpadded_len == 0 {
        return Err(ErrorV2::MessageEmpty);
    }
    if padded.len() < 2 + unpadded_len || padded.len() != 2 + calc_padded_len(unpadded_len) {
        return Err(ErrorV2::InvalidPadding);
    }
    Ok(padded[2..2 + unpadded_len].to_vec())
}

/// Encrypt to the raw (not base64) payload `version || nonce || ciphertext || mac`.
pub fn encrypt_to_bytes(conversation_key: &ConversationKey, plaintext: &[u8]) -> Result<Vec<u8>, ErrorV2> {
    let mut nonce = [0u8; 32];
    getrandom::getrandom(&mut nonce).map_err(|e| ErrorV2::Random(e.to_string()))?;
    encrypt_to_bytes_with_nonce(conversation_key, plaintext, &nonce)
}

fn encrypt_to_bytes_with_nonce(
    conversation_key: &ConversationKey,
    plaintext: &[u8],
    nonce: &[u8; 32],
) -> Result<Vec<u8>, ErrorV2> {
    let keys = MessageKeys::derive(conversation_key, nonce)?;

    let mut ciphertext = pad(plaintext)?;
    let mut cipher = ChaCha20::new(&keys.chacha_key.into(), &keys.chacha_nonce.into());
    cipher.apply_keystream(&mut ciphertext);

    let mac_bytes = keys.mac(nonce, &ciphertext)?.finalize().into_bytes();

    let mut payload = Vec::with_capacity(1 + 32 + ciphertext.len() + 32);
    payload.push(VERSION);
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(&ciphertext);
    payload.extend_from_slice(&mac_bytes);
    Ok(payload)
}

/// Decrypt a raw (already base64-decoded) payload.
pub fn decrypt_to_bytes(conversation_key: &ConversationKey, payload: &[u8]) -> Result<Vec<u8>, ErrorV2> {
    let len = payload.len();
    if !(99..=65603).contains(&len) {
        return Err(ErrorV2::InvalidPayload);
    }
    if payload[0] != VERSION {
        return Err(ErrorV2::UnknownVersion(payload[0]));
    }

    let nonce = &payload[1..33];
    let ciphertext = &payload[33..len - 32];
    let mac = &payload[len - 32..];

    let mut nonce_array = [0u8; 32];
    nonce_array.copy_from_slice(nonce);
    let keys = MessageKeys::derive(conversation_key, &nonce_array)?;

    keys.mac(nonce, ciphertext)?
        .verify_slice(mac)
        .map_err(|_| ErrorV2::InvalidHmac)?;

    let mut padded = ciphertext.to_vec();
    let mut cipher = ChaCha20::new(&keys.chacha_key.into(), &keys.chacha_nonce.into());
    cipher.apply_keystream(&mut padded);

    unpad(&padded)
}

/// Encrypt a string into a base64 payload.
pub fn encrypt(plaintext: &str, conversation_key: &ConversationKey) -> Result<String, ErrorV2> {
    let encrypted = encrypt_to_bytes(conversation_key, plaintext.as_bytes())?;
    Ok(BASE64.encode(encrypted))
}

/// Decrypt a base64 payload into a string.
pub fn decrypt(payload: &str, conversation_key: &ConversationKey) -> Result<String, ErrorV2> {
    if payload.starts_with('#') {
        return Err(ErrorV2::UnknownVersion(0));
    }
    let plen = payload.len();
    if !(132..=87472).contains(&plen) {
        return Err(ErrorV2::InvalidPayload);
    }
    let data = BASE64
        .decode(payload)
        .map_err(|e| ErrorV2::DecodingError(e.to_string()))?;
    let plaintext = decrypt_to_bytes(conversation_key, &data)?;
    Ok(String::from_utf8(plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Keys;

    #[test]
    fn test_calc_padded_len() {
        assert_eq!(calc_padded_len(1), 32);
        assert_eq!(calc_padded_len(32), 32);
        assert_eq!(calc_padded_len(33), 64);
        assert_eq!(calc_padded_len(64), 64);
        assert_eq!(calc_padded_len(65), 96);
        assert_eq!(calc_padded_len(256), 256);
        assert_eq!(calc_padded_len(257), 320);
    }

    #[test]
    fn test_padding() {
        let padded = pad(b"hello").unwrap();
        assert_eq!(padded.len(), 2 + 32);
        assert_eq!(padded[0..2], [0x00, 0x05]);
        assert_eq!(&padded[2..7], b"hello");
        assert_eq!(unpad(&padded).unwrap(), b"hello");
        assert_eq!(pad(b""), Err(ErrorV2::MessageEmpty));
    }

    #[test]
    fn test_conversation_key_is_symmetric() {
        let alice = Keys::generate().unwrap();
        let bob = Keys::generate().unwrap();
        let ab = ConversationKey::derive(&alice.secret_key, &bob.public_key).unwrap();
        let ba = ConversationKey::derive(&bob.secret_key, &alice.public_key).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_encrypt_decrypt_and_tamper() {
        let alice = Keys::generate().unwrap();
        let bob = Keys::generate().unwrap();
        let key = ConversationKey::derive(&alice.secret_key, &bob.public_key).unwrap();
        let other = ConversationKey::derive(&bob.secret_key, &alice.public_key).unwrap();

        let payload = encrypt("{\"id\":\"1\",\"result\":\"pong\"}", &key).unwrap();
        assert_eq!(decrypt(&payload, &other).unwrap(), "{\"id\":\"1\",\"result\":\"pong\"}");

        let mut raw = BASE64.decode(&payload).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert_eq!(decrypt(&BASE64.encode(raw), &other), Err(ErrorV2::InvalidHmac));
        assert_eq!(decrypt("#future", &other), Err(ErrorV2::UnknownVersion(0)));
    }

    #[test]
    fn test_fixed_nonce_is_deterministic() {
        let key = ConversationKey::new([7u8; 32]);
        let nonce = [1u8; 32];
        let a = encrypt_to_bytes_with_nonce(&key, b"a", &nonce).unwrap();
        let b = encrypt_to_bytes_with_nonce(&key, b"a", &nonce).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 1 + 32 + 34 + 32);
        assert_eq!(decrypt_to_bytes(&key, &a).unwrap(), b"a");
    }
}
