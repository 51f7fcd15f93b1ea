//! Cipher negotiation: which families this process supports, and the
//! per-remote handles derived from the local secret key.

use std::fmt;
use std::sync::{Mutex, OnceLock};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::nip04::{self, SharedKey};
use super::nip44::{self, ConversationKey};
use super::Algorithm;
use crate::error::{Nip46Error, Nip46Result};
use crate::types::{PublicKey, SecretKey};
use crate::util::summarize_hex;

/// Which encryption families are usable in this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherCapabilities {
    pub nip44_v2: bool,
    pub nip44: bool,
    pub nip04: bool,
}

impl CipherCapabilities {
    /// Probe every backend with a loopback self-test. Runs once per process;
    /// later calls return the cached result.
    pub fn discover() -> Self {
        static DISCOVERED: OnceLock<CipherCapabilities> = OnceLock::new();
        *DISCOVERED.get_or_init(|| {
            let caps = CipherCapabilities {
                nip44_v2: self_test(Algorithm::Nip44V2),
                nip44: self_test(Algorithm::Nip44),
                nip04: self_test(Algorithm::Nip04),
            };
            info!("[nip46] cipher capabilities discovered: {:?}", caps.algorithms());
            caps
        })
    }

    pub fn none() -> Self {
        CipherCapabilities {
            nip44_v2: false,
            nip44: false,
            nip04: false,
        }
    }

    /// Restrict to the listed families.
    pub fn only(algorithms: &[Algorithm]) -> Self {
        let mut caps = Self::none();
        for algorithm in algorithms {
            match algorithm {
                Algorithm::Nip44V2 => caps.nip44_v2 = true,
                Algorithm::Nip44 => caps.nip44 = true,
                Algorithm::Nip04 => caps.nip04 = true,
            }
        }
        caps
    }

    pub fn supports(&self, algorithm: Algorithm) -> bool {
        match algorithm {
            Algorithm::Nip44V2 => self.nip44_v2,
            Algorithm::Nip44 => self.nip44,
            Algorithm::Nip04 => self.nip04,
        }
    }

    /// Supported families in preference order.
    pub fn algorithms(&self) -> Vec<Algorithm> {
        Algorithm::ALL.into_iter().filter(|a| self.supports(*a)).collect()
    }
}

impl Default for CipherCapabilities {
    fn default() -> Self {
        Self::discover()
    }
}

fn self_test(algorithm: Algorithm) -> bool {
    let probe = || -> Nip46Result<bool> {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        a[31] = 1;
        b[31] = 2;
        let alice = SecretKey(a);
        let bob = SecretKey(b);
        let outbound = CipherHandle::derive(algorithm, &alice, &bob.public_key()?)?;
        let inbound = CipherHandle::derive(algorithm, &bob, &alice.public_key()?)?;
        let ciphertext = outbound.encrypt("nip46-probe")?;
        Ok(inbound.decrypt(&ciphertext)? == "nip46-probe")
    };
    match probe() {
        Ok(ok) => ok,
        Err(e) => {
            debug!("[nip46] cipher self-test failed for {}: {}", algorithm, e);
            false
        }
    }
}

#[derive(Clone, Copy)]
enum CipherKey {
    Conversation(ConversationKey),
    Shared(SharedKey),
}

/// One usable cipher for a (local secret, remote pubkey) pair.
#[derive(Clone)]
pub struct CipherHandle {
    algorithm: Algorithm,
    key: CipherKey,
}

impl fmt::Debug for CipherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherHandle")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl CipherHandle {
    /// Derive the key material for `algorithm`.
    ///
    /// The legacy `nip44` family has no distinct primitive natively; it uses
    /// the v2 conversation key and payload format under its own name.
    pub fn derive(algorithm: Algorithm, secret: &SecretKey, remote: &PublicKey) -> Nip46Result<Self> {
        let key = match algorithm {
            Algorithm::Nip44V2 | Algorithm::Nip44 => CipherKey::Conversation(ConversationKey::derive(secret, remote)?),
            Algorithm::Nip04 => CipherKey::Shared(SharedKey::derive(secret, remote)?),
        };
        Ok(CipherHandle { algorithm, key })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn encrypt(&self, plaintext: &str) -> Nip46Result<String> {
        match &self.key {
            CipherKey::Conversation(key) => Ok(nip44::encrypt(plaintext, key)?),
            CipherKey::Shared(key) => Ok(nip04::encrypt(key, plaintext)?),
        }
    }

    pub fn decrypt(&self, ciphertext: &str) -> Nip46Result<String> {
        match &self.key {
            CipherKey::Conversation(key) => Ok(nip44::decrypt(ciphertext.trim(), key)?),
            CipherKey::Shared(key) => Ok(nip04::decrypt(key, ciphertext)?),
        }
    }
}

/// Cipher resolution for one local secret key.
///
/// Capabilities are fixed at construction; derived handles are cached per
/// (algorithm, remote pubkey).
pub struct CipherSuite {
    secret: SecretKey,
    capabilities: CipherCapabilities,
    cache: Mutex<FxHashMap<(Algorithm, [u8; 32]), CipherHandle>>,
}

impl fmt::Debug for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherSuite")
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl CipherSuite {
    pub fn new(secret: SecretKey, capabilities: CipherCapabilities) -> Self {
        CipherSuite {
            secret,
            capabilities,
            cache: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn capabilities(&self) -> CipherCapabilities {
        self.capabilities
    }

    fn handle_for(&self, algorithm: Algorithm, remote: &PublicKey) -> Nip46Result<CipherHandle> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = cache.get(&(algorithm, remote.0)) {
            return Ok(handle.clone());
        }
        let handle = CipherHandle::derive(algorithm, &self.secret, remote)?;
        cache.insert((algorithm, remote.0), handle.clone());
        Ok(handle)
    }

    /// Every usable cipher for `remote`, in preference order. An available
    /// `preferred` family is moved to the front; families whose key
    /// derivation fails are skipped.
    pub fn resolve_available_ciphers(&self, remote: &PublicKey, preferred: Option<Algorithm>) -> Vec<CipherHandle> {
        let mut available: Vec<CipherHandle> = self
            .capabilities
            .algorithms()
            .into_iter()
            .filter_map(|algorithm| match self.handle_for(algorithm, remote) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    debug!(
                        "[nip46] skipping unavailable cipher {} for {}: {}",
                        algorithm,
                        summarize_hex(&remote.to_hex()),
                        e
                    );
                    None
                }
            })
            .collect();

        if let Some(preferred) = preferred {
            if let Some(index) = available.iter().position(|h| h.algorithm == preferred) {
                let handle = available.remove(index);
                available.insert(0, handle);
            }
        }
        available
    }

    /// The best cipher for `remote`, or `CipherUnavailable`.
    pub fn create_cipher(&self, remote: &PublicKey, preferred: Option<Algorithm>) -> Nip46Result<CipherHandle> {
        self.resolve_available_ciphers(remote, preferred)
            .into_iter()
            .next()
            .ok_or(Nip46Error::CipherUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Keys;

    fn algorithms(handles: &[CipherHandle]) -> Vec<&'static str> {
        handles.iter().map(|h| h.algorithm().as_str()).collect()
    }

    #[test]
    fn test_discover_reports_all_native_backends() {
        let caps = CipherCapabilities::discover();
        assert_eq!(caps.algorithms(), Algorithm::ALL.to_vec());
    }

    #[test]
    fn test_default_order() {
        let local = Keys::generate().unwrap();
        let remote = Keys::generate().unwrap();
        let suite = CipherSuite::new(local.secret_key, CipherCapabilities::only(&Algorithm::ALL));
        let handles = suite.resolve_available_ciphers(&remote.public_key, None);
        assert_eq!(algorithms(&handles), vec!["nip44.v2", "nip44", "nip04"]);
    }

    #[test]
    fn test_only_nip04() {
        let local = Keys::generate().unwrap();
        let remote = Keys::generate().unwrap();
        let suite = CipherSuite::new(local.secret_key, CipherCapabilities::only(&[Algorithm::Nip04]));
        let handles = suite.resolve_available_ciphers(&remote.public_key, Some(Algorithm::Nip44V2));
        assert_eq!(algorithms(&handles), vec!["nip04"]);
    }

    #[test]
    fn test_preferred_moves_to_front() {
        let local = Keys::generate().unwrap();
        let remote = Keys::generate().unwrap();
        let suite = CipherSuite::new(local.secret_key, CipherCapabilities::only(&Algorithm::ALL));
        let handles = suite.resolve_available_ciphers(&remote.public_key, Some(Algorithm::Nip04));
        assert_eq!(algorithms(&handles), vec!["nip04", "nip44.v2", "nip44"]);
    }

    #[test]
    fn test_no_capabilities_is_unavailable() {
        let local = Keys::generate().unwrap();
        let remote = Keys::generate().unwrap();
        let suite = CipherSuite::new(local.secret_key, CipherCapabilities::none());
        let err = suite.create_cipher(&remote.public_key, None).unwrap_err();
        assert_eq!(err.code(), "cipher-unavailable");
    }

    #[test]
    fn test_handles_interoperate_across_peers() {
        let local = Keys::generate().unwrap();
        let remote = Keys::generate().unwrap();
        for algorithm in Algorithm::ALL {
            let ours = CipherHandle::derive(algorithm, &local.secret_key, &remote.public_key).unwrap();
            let theirs = CipherHandle::derive(algorithm, &remote.secret_key, &local.public_key).unwrap();
            let ct = ours.encrypt("{\"id\":\"x\"}").unwrap();
            assert_eq!(theirs.decrypt(&ct).unwrap(), "{\"id\":\"x\"}");
        }
    }
}
