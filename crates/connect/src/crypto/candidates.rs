//! Best-effort reassembly of ciphertext from loosely structured payloads.
//!
//! Some signers wrap the ciphertext in objects, split it from its nonce or
//! ship it as a byte buffer. Everything heuristic about that lives here,
//! behind [`CipherSuite::decrypt_any_candidate`].

use rustc_hash::FxHashSet;
use serde_json::Value;
use tracing::{debug, warn};

use super::cipher::CipherSuite;
use super::Algorithm;
use crate::codec::strict_pubkey;
use crate::error::{Nip46Error, Nip46Result};
use crate::types::PublicKey;
use crate::util::summarize_hex;

const MAX_CANDIDATES: usize = 64;
const MAX_DEPTH: usize = 6;
const CIPHERTEXT_KEYS: &[&str] = &["ciphertext", "cipher_text", "content", "payload", "result", "value", "data"];
const NONCE_KEYS: &[&str] = &["nonce", "iv"];
const NESTED_KEYS: &[&str] = &["ciphertext", "cipher_text", "payload", "result", "value", "data", "content"];

/// Successful heuristic decryption.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decrypted {
    pub plaintext: String,
    pub algorithm: Algorithm,
}

/// Successful handshake decryption, with the remote key that worked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeDecrypted {
    pub plaintext: String,
    pub algorithm: Algorithm,
    pub remote_pubkey: String,
}

#[derive(Default)]
struct CandidateSet {
    seen: FxHashSet<String>,
    ordered: Vec<String>,
}

impl CandidateSet {
    fn add(&mut self, value: &str) {
        let trimmed = value.trim();
        if trimmed.is_empty() || self.ordered.len() >= MAX_CANDIDATES {
            return;
        }
        if self.seen.insert(trimmed.to_string()) {
            self.ordered.push(trimmed.to_string());
        }
    }

    fn add_with_nonce(&mut self, ciphertext: &str, nonce: &str) {
        let ciphertext = ciphertext.trim();
        let nonce = nonce.trim();
        if ciphertext.is_empty() {
            return;
        }
        self.add(ciphertext);
        if nonce.is_empty() {
            return;
        }
        let stripped = strip_iv_prefix(nonce);
        self.add(&format!("{}\n{}", ciphertext, stripped));
        self.add(&format!("{}?iv={}", ciphertext, stripped));
        if stripped != nonce {
            self.add(&format!("{}{}", ciphertext, nonce));
        }
    }
}

fn strip_iv_prefix(nonce: &str) -> &str {
    if nonce.len() >= 4 && nonce[..4].eq_ignore_ascii_case("?iv=") {
        &nonce[4..]
    } else {
        nonce
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// UTF-8 text from a JSON byte array (`[104, 105]`).
fn bytes_to_utf8(values: &[Value]) -> Option<String> {
    if values.is_empty() {
        return None;
    }
    let bytes = values
        .iter()
        .map(|v| v.as_u64().filter(|n| *n <= 255).map(|n| n as u8))
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

fn first_string_field<'a>(map: &'a serde_json::Map<String, Value>, keys: &[&str]) -> &'a str {
    keys.iter()
        .filter_map(|k| map.get(*k).and_then(Value::as_str))
        .find(|s| !s.trim().is_empty())
        .unwrap_or("")
}

fn coerce(value: &Value, set: &mut CandidateSet, depth: usize) {
    if depth > MAX_DEPTH || set.ordered.len() >= MAX_CANDIDATES {
        return;
    }
    match value {
        Value::Null => {}
        Value::String(s) => {
            set.add(s);
            let trimmed = s.trim();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                if let Ok(inner) = serde_json::from_str::<Value>(trimmed) {
                    coerce(&inner, set, depth + 1);
                }
            }
        }
        Value::Number(_) | Value::Bool(_) => {
            if let Some(s) = scalar_string(value) {
                set.add(&s);
            }
        }
        Value::Array(entries) => {
            if let Some(decoded) = bytes_to_utf8(entries) {
                set.add(&decoded);
                return;
            }
            let scalars: Vec<String> = entries
                .iter()
                .filter_map(scalar_string)
                .filter(|s| !s.is_empty())
                .collect();
            for scalar in &scalars {
                set.add(scalar);
            }
            for i in 0..scalars.len() {
                for j in i + 1..scalars.len() {
                    set.add_with_nonce(&scalars[i], &scalars[j]);
                    set.add_with_nonce(&scalars[j], &scalars[i]);
                }
            }
            for entry in entries.iter().filter(|e| e.is_object() || e.is_array()) {
                coerce(entry, set, depth + 1);
            }
        }
        Value::Object(map) => {
            let is_buffer = map
                .get("type")
                .and_then(Value::as_str)
                .map(|t| t.eq_ignore_ascii_case("buffer"))
                .unwrap_or(false);
            if is_buffer {
                if let Some(decoded) = map.get("data").and_then(Value::as_array).and_then(|d| bytes_to_utf8(d)) {
                    set.add(&decoded);
                    return;
                }
            }

            let ciphertext = first_string_field(map, CIPHERTEXT_KEYS);
            let nonce = first_string_field(map, NONCE_KEYS);
            if !ciphertext.is_empty() || !nonce.is_empty() {
                set.add_with_nonce(ciphertext, nonce);
            }

            for key in NESTED_KEYS {
                if let Some(nested) = map.get(*key) {
                    if nested.is_object() || nested.is_array() {
                        coerce(nested, set, depth + 1);
                    }
                }
            }
        }
    }
}

/// Ordered, de-duplicated ciphertext candidates extracted from `payload`.
pub fn normalize_ciphertext_payload(payload: &Value) -> Vec<String> {
    let mut set = CandidateSet::default();
    coerce(payload, &mut set, 0);
    set.ordered
}

impl CipherSuite {
    /// Try every available cipher against every candidate reassembly of
    /// `payload`; the first successful decryption wins.
    pub fn decrypt_any_candidate(&self, remote: &PublicKey, payload: &Value) -> Nip46Result<Decrypted> {
        let ciphers = self.resolve_available_ciphers(remote, None);
        if ciphers.is_empty() {
            return Err(Nip46Error::CipherUnavailable);
        }
        let candidates = normalize_ciphertext_payload(payload);

        let mut attempts = 0usize;
        for cipher in &ciphers {
            for candidate in &candidates {
                attempts += 1;
                if let Ok(plaintext) = cipher.decrypt(candidate) {
                    return Ok(Decrypted {
                        plaintext,
                        algorithm: cipher.algorithm(),
                    });
                }
            }
        }

        Err(Nip46Error::Crypto(format!(
            "Failed to decrypt NIP-46 payload with available candidates ({} attempts)",
            attempts
        )))
    }

    /// [`decrypt_any_candidate`](Self::decrypt_any_candidate) for each
    /// distinct valid remote pubkey candidate, in order.
    pub fn attempt_handshake_decrypt<S: AsRef<str>>(
        &self,
        candidate_remote_pubkeys: &[S],
        payload: &Value,
    ) -> Nip46Result<HandshakeDecrypted> {
        let mut seen = FxHashSet::default();
        let mut failures = 0usize;

        for candidate in candidate_remote_pubkeys {
            let normalized = strict_pubkey(candidate.as_ref());
            if normalized.is_empty() || !seen.insert(normalized.clone()) {
                continue;
            }
            let remote = match PublicKey::from_hex(&normalized) {
                Ok(pk) => pk,
                Err(_) => continue,
            };
            match self.decrypt_any_candidate(&remote, payload) {
                Ok(decrypted) => {
                    debug!(
                        "[nip46] handshake decrypt succeeded for {} via {}",
                        summarize_hex(&normalized),
                        decrypted.algorithm
                    );
                    return Ok(HandshakeDecrypted {
                        plaintext: decrypted.plaintext,
                        algorithm: decrypted.algorithm,
                        remote_pubkey: normalized,
                    });
                }
                Err(e) => {
                    failures += 1;
                    debug!("[nip46] handshake decrypt failed for {}: {}", summarize_hex(&normalized), e);
                }
            }
        }

        warn!("[nip46] exhausted handshake decrypt candidates ({} tried)", failures);
        Err(Nip46Error::Crypto(
            "Failed to decrypt remote signer handshake payload with provided keys.".to_string(),
        ))
    }
}
