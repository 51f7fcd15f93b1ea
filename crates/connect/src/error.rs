//! Error taxonomy for the NIP-46 engine.
//!
//! Every user-visible failure carries a stable machine-readable code
//! (see [`Nip46Error::code`]) alongside its human message.

/// Errors surfaced by the connect engine.
///
/// Cloneable so that a single terminal error (e.g. session teardown) can be
/// delivered to every outstanding caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Nip46Error {
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Client public key does not match the generated private key")]
    ClientPublicKeyMismatch,

    #[error("Missing client private key for nostrconnect handshake")]
    MissingClientPrivateKey,

    #[error("Remote signer pubkey is required")]
    MissingRemotePubkey,

    #[error("No supported encryption algorithm is available")]
    CipherUnavailable,

    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    #[error("Timed out waiting for remote signer response to {method}")]
    Timeout { method: String },

    #[error("Timed out waiting for remote signer handshake")]
    HandshakeTimeout,

    #[error("Remote signer secret mismatch. Rejecting response.")]
    SecretMismatch,

    #[error("Remote signer requires additional authentication: {url}")]
    AuthChallenge { url: String },

    #[error("Remote signer error: {0}")]
    Remote(String),

    #[error("Invalid response from remote signer: {0}")]
    MalformedResponse(String),

    #[error("Remote signer returned an empty response")]
    EmptyResponse,

    #[error("Remote signer returned an empty pubkey")]
    EmptyPubkey,

    #[error("Relay rate-limited the request: {0}")]
    RateLimited(String),

    #[error("Failed to publish request: {0}")]
    Publish(String),

    #[error("Relay transport error: {0}")]
    Transport(String),

    #[error("Remote signer session closed.")]
    Destroyed,

    #[error("Login cancelled")]
    Cancelled,

    #[error("No stored remote signer session is available.")]
    NoStoredSession,

    #[error("A passphrase is required to unlock the stored remote signer session.")]
    PassphraseRequired,

    #[error("Failed to decrypt stored remote signer session.")]
    DecryptFailed,

    #[error("Stored remote signer session is missing credentials.")]
    MissingCredentials,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl Nip46Error {
    /// Stable code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            Nip46Error::InvalidConnectionString(_) => "invalid-connection-string",
            Nip46Error::InvalidPrivateKey(_) => "invalid-private-key",
            Nip46Error::InvalidPublicKey(_) => "invalid-public-key",
            Nip46Error::ClientPublicKeyMismatch => "client-public-key-mismatch",
            Nip46Error::MissingClientPrivateKey => "missing-client-private-key",
            Nip46Error::MissingRemotePubkey => "missing-remote-pubkey",
            Nip46Error::CipherUnavailable => "cipher-unavailable",
            Nip46Error::Crypto(_) => "crypto-error",
            Nip46Error::Timeout { .. } => "nip46-timeout",
            Nip46Error::HandshakeTimeout => "nip46-handshake-timeout",
            Nip46Error::SecretMismatch => "nip46-secret-mismatch",
            Nip46Error::AuthChallenge { .. } => "auth-challenge",
            Nip46Error::Remote(_) => "nip46-error",
            Nip46Error::MalformedResponse(_) => "nip46-invalid-response",
            Nip46Error::EmptyResponse => "nip46-empty-response",
            Nip46Error::EmptyPubkey => "nip46-empty-pubkey",
            Nip46Error::RateLimited(_) => "rate-limited",
            Nip46Error::Publish(_) => "publish-failed",
            Nip46Error::Transport(_) => "transport-error",
            Nip46Error::Destroyed => "session-destroyed",
            Nip46Error::Cancelled => "login-cancelled",
            Nip46Error::NoStoredSession => "no-stored-session",
            Nip46Error::PassphraseRequired => "passphrase-required",
            Nip46Error::DecryptFailed => "decrypt-failed",
            Nip46Error::MissingCredentials => "stored-session-missing-credentials",
            Nip46Error::AccessDenied(_) => "access-denied",
            Nip46Error::InvalidArgument(_) => "invalid-argument",
            Nip46Error::Storage(_) => "storage-error",
        }
    }

    /// Errors that may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Nip46Error::Timeout { .. }
                | Nip46Error::Publish(_)
                | Nip46Error::Transport(_)
                | Nip46Error::RateLimited(_)
        )
    }

    /// Errors that make a stored session unusable and should purge it.
    pub fn is_fatal_for_stored_session(&self) -> bool {
        matches!(
            self,
            Nip46Error::SecretMismatch
                | Nip46Error::InvalidPrivateKey(_)
                | Nip46Error::ClientPublicKeyMismatch
                | Nip46Error::InvalidConnectionString(_)
        )
    }
}

impl From<serde_json::Error> for Nip46Error {
    fn from(err: serde_json::Error) -> Self {
        Nip46Error::MalformedResponse(err.to_string())
    }
}

impl From<hex::FromHexError> for Nip46Error {
    fn from(err: hex::FromHexError) -> Self {
        Nip46Error::InvalidArgument(err.to_string())
    }
}

/// Result type for connect operations
pub type Nip46Result<T> = Result<T, Nip46Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(
            Nip46Error::Timeout {
                method: "ping".into()
            }
            .code(),
            "nip46-timeout"
        );
        assert_eq!(Nip46Error::SecretMismatch.code(), "nip46-secret-mismatch");
        assert_eq!(
            Nip46Error::MissingCredentials.code(),
            "stored-session-missing-credentials"
        );
    }

    #[test]
    fn test_retry_classes() {
        assert!(Nip46Error::Publish("no relay".into()).is_retryable());
        assert!(!Nip46Error::MalformedResponse("x".into()).is_retryable());
        assert!(!Nip46Error::AuthChallenge { url: "u".into() }.is_retryable());
        assert!(Nip46Error::SecretMismatch.is_fatal_for_stored_session());
        assert!(Nip46Error::ClientPublicKeyMismatch.is_fatal_for_stored_session());
        assert!(!Nip46Error::Timeout { method: "x".into() }.is_fatal_for_stored_session());
    }
}
