//! Connection establishment: nostrconnect handshakes, bunker connects and
//! restoring stored sessions.
//!
//! The coordinator owns no session itself. Every successful flow hands back
//! a live [`RpcSession`], persists it when asked and registers it with the
//! optional [`SignerRegistry`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::mpsc;
use futures::future::{AbortHandle, Abortable};
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::codec::{
    build_connection_uri, generate_secret, normalize_pubkey, parse_connection_string, resolve_relays,
    strict_pubkey, ConnectionKind, Metadata,
};
use crate::config::ConnectConfig;
use crate::crypto::{Algorithm, CipherCapabilities, CipherSuite};
use crate::error::{Nip46Error, Nip46Result};
use crate::registry::SignerRegistry;
use crate::rpc::{RpcSession, SessionOptions};
use crate::store::{SessionRecord, SessionStore};
use crate::transport::{EventSigner, RelayMessage, RelayTransport, Subscription};
use crate::types::{Event, Filter, KeyMaterial, Keys, PublicKey, NIP46_RPC_KIND};
use crate::util::{summarize_hex, summarize_secret, summarize_url, unix_now_ms};

const HANDSHAKE_SECRET_BYTES: usize = 16;

/// Keys searched, in order, when a handshake field arrives as an object.
const STRUCTURED_KEYS: &[&str] = &[
    "secret",
    "message",
    "status",
    "reason",
    "detail",
    "description",
    "value",
    "result",
    "url",
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HandshakeState {
    #[default]
    Idle,
    WaitingForAck,
    AuthChallenge,
    Connected,
    Failed,
    TimedOut,
    Cancelled,
}

/// Progress reports for UI layers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectStatus {
    WaitingForHandshake { client_pubkey: String },
    HandshakeAcknowledged { remote_pubkey: String },
    RequestingApproval { remote_pubkey: String },
    AwaitingAuth { remote_pubkey: String, attempt: u32 },
    Reconnecting { remote_pubkey: String },
    Connected { remote_pubkey: String, user_pubkey: String },
    /// `forgotten` is set when the stored session was purged as a result.
    Failed {
        code: &'static str,
        message: String,
        forgotten: bool,
    },
    Disconnected { kept_stored: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthPhase {
    Handshake,
    Connect,
}

/// An `auth_url` challenge the user has to complete out of band.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthPrompt {
    pub url: String,
    pub phase: AuthPhase,
    pub remote_pubkey: String,
    /// Id of the response that carried the challenge, when known.
    pub request_id: String,
    pub attempt: u32,
}

pub type StatusCallback = Arc<dyn Fn(&ConnectStatus) + Send + Sync>;
pub type AuthUrlCallback = Arc<dyn Fn(&AuthPrompt) + Send + Sync>;
/// Decides whether a user pubkey may sign in.
pub type PubkeyValidator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PrepareOptions {
    pub metadata: Metadata,
    pub relays: Vec<String>,
    /// Generated when blank.
    pub secret: String,
    pub permissions: String,
}

/// Material for a client-initiated connection, ready to show as a QR code.
#[derive(Clone, PartialEq, Eq)]
pub struct PreparedHandshake {
    pub uri: String,
    pub keys: KeyMaterial,
    pub relays: Vec<String>,
    pub secret: String,
    pub permissions: String,
    pub metadata: Metadata,
}

impl fmt::Debug for PreparedHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedHandshake")
            .field("client", &summarize_hex(&self.keys.public_key_hex))
            .field("relays", &self.relays)
            .field("secret", &summarize_secret(&self.secret))
            .field("permissions", &self.permissions)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct HandshakeWait {
    pub client_private_key: String,
    pub client_public_key: String,
    pub relays: Vec<String>,
    pub secret: String,
    /// Falls back to the configured handshake timeout when unset or zero.
    pub timeout_ms: Option<u64>,
    /// Tried before the event author when decrypting replies.
    pub expected_remote_pubkey: String,
}

impl fmt::Debug for HandshakeWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeWait")
            .field("client", &summarize_hex(&self.client_public_key))
            .field("relays", &self.relays)
            .field("secret", &summarize_secret(&self.secret))
            .field("timeout_ms", &self.timeout_ms)
            .field("expected", &summarize_hex(&self.expected_remote_pubkey))
            .finish_non_exhaustive()
    }
}

impl From<&PreparedHandshake> for HandshakeWait {
    fn from(prepared: &PreparedHandshake) -> Self {
        HandshakeWait {
            client_private_key: prepared.keys.private_key_hex.clone(),
            client_public_key: prepared.keys.public_key_hex.clone(),
            relays: prepared.relays.clone(),
            secret: prepared.secret.clone(),
            timeout_ms: None,
            expected_remote_pubkey: String::new(),
        }
    }
}

/// The remote signer's acceptance of a handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeAck {
    pub remote_pubkey: String,
    pub event_pubkey: String,
    pub response: Value,
    pub algorithm: Algorithm,
}

#[derive(Clone)]
pub struct ConnectRequest {
    pub connection_string: String,
    /// Persist the session on success. When unset the store is cleared.
    pub remember: bool,
    pub client_private_key: String,
    pub client_public_key: String,
    /// Used only when the connection string names no relays.
    pub relays: Vec<String>,
    pub secret: String,
    pub permissions: String,
    /// Overrides applied on top of the connection string's metadata.
    pub metadata: Metadata,
    pub handshake_timeout_ms: Option<u64>,
    /// Seals the persisted credentials when non-empty.
    pub passphrase: Option<String>,
    pub validator: Option<PubkeyValidator>,
}

impl ConnectRequest {
    pub fn new(connection_string: impl Into<String>) -> Self {
        ConnectRequest {
            connection_string: connection_string.into(),
            remember: true,
            client_private_key: String::new(),
            client_public_key: String::new(),
            relays: Vec::new(),
            secret: String::new(),
            permissions: String::new(),
            metadata: Metadata::default(),
            handshake_timeout_ms: None,
            passphrase: None,
            validator: None,
        }
    }

    /// Connect with the keys from a [`PreparedHandshake`].
    pub fn from_prepared(prepared: &PreparedHandshake) -> Self {
        let mut request = Self::new(prepared.uri.clone());
        request.client_private_key = prepared.keys.private_key_hex.clone();
        request.client_public_key = prepared.keys.public_key_hex.clone();
        request.secret = prepared.secret.clone();
        request.permissions = prepared.permissions.clone();
        request
    }
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("connection_string", &summarize_url(&self.connection_string))
            .field("remember", &self.remember)
            .field("client", &summarize_hex(&self.client_public_key))
            .field("relays", &self.relays)
            .field("secret", &summarize_secret(&self.secret))
            .field("permissions", &self.permissions)
            .field("sealed", &self.passphrase.is_some())
            .field("validator", &self.validator.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Default)]
pub struct ReconnectOptions {
    pub passphrase: Option<String>,
    /// Purge the stored record on any failure, not only fatal ones.
    pub forget_on_error: bool,
    pub validator: Option<PubkeyValidator>,
}

impl fmt::Debug for ReconnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectOptions")
            .field("passphrase", &self.passphrase.is_some())
            .field("forget_on_error", &self.forget_on_error)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

/// A session that completed `connect` and returned the user's pubkey.
#[derive(Clone, Debug)]
pub struct ConnectedSigner {
    pub user_pubkey: String,
    pub session: RpcSession,
}

struct PendingWait {
    id: u64,
    abort: AbortHandle,
}

/// Reduce a handshake `result`/`error` field to a single trimmed string.
///
/// Strings are trimmed, arrays yield their first non-empty entry and objects
/// are searched through [`STRUCTURED_KEYS`] before any remaining value.
pub fn coerce_structured_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Array(entries) => entries
            .iter()
            .map(coerce_structured_string)
            .find(|s| !s.is_empty())
            .unwrap_or_default(),
        Value::Object(map) => STRUCTURED_KEYS
            .iter()
            .filter_map(|key| map.get(*key))
            .chain(map.values())
            .map(coerce_structured_string)
            .find(|s| !s.is_empty())
            .unwrap_or_default(),
        _ => String::new(),
    }
}

/// Whether a handshake `result` accepts the connection.
fn acknowledges(result: &str, secret: &str) -> bool {
    if !secret.is_empty() {
        return result == secret || result.eq_ignore_ascii_case("ack");
    }
    result.is_empty() || ["ack", "ok", "success"].iter().any(|w| result.eq_ignore_ascii_case(w))
}

fn first_non_empty(preferred: &str, fallback: &str) -> String {
    let preferred = preferred.trim();
    if preferred.is_empty() {
        fallback.trim().to_string()
    } else {
        preferred.to_string()
    }
}

fn non_blank(value: &str) -> Option<&str> {
    Some(value.trim()).filter(|v| !v.is_empty())
}

fn record_for(session: &RpcSession, user_pubkey: &str) -> SessionRecord {
    let mut record = SessionRecord::new(session.remote_pubkey());
    record.client_public_key = session.client_pubkey().to_string();
    record.client_private_key = session.client_keys().secret_key.to_hex();
    record.secret = session.secret().to_string();
    record.relays = session.relays().to_vec();
    record.encryption = session.algorithm();
    record.permissions = session.permissions().to_string();
    record.metadata = session.metadata().clone();
    record.user_pubkey = user_pubkey.to_string();
    record.last_connected_at = unix_now_ms();
    record
}

/// Drives connection flows against one relay transport and session store.
///
/// Clones share state, so one clone may [`abort`](Self::abort) a handshake
/// another is waiting on.
#[derive(Clone)]
pub struct HandshakeCoordinator {
    config: Arc<ConnectConfig>,
    transport: Arc<dyn RelayTransport>,
    signer: Arc<dyn EventSigner>,
    store: SessionStore,
    registry: Option<SignerRegistry>,
    capabilities: CipherCapabilities,
    on_status: Option<StatusCallback>,
    on_auth_url: Option<AuthUrlCallback>,
    state: Arc<Mutex<HandshakeState>>,
    pending: Arc<Mutex<Option<PendingWait>>>,
    next_wait_id: Arc<AtomicU64>,
}

impl fmt::Debug for HandshakeCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeCoordinator")
            .field("state", &self.state())
            .field("store", &self.store)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl HandshakeCoordinator {
    pub fn new(
        config: Arc<ConnectConfig>,
        transport: Arc<dyn RelayTransport>,
        signer: Arc<dyn EventSigner>,
        store: SessionStore,
    ) -> Self {
        HandshakeCoordinator {
            config,
            transport,
            signer,
            store,
            registry: None,
            capabilities: CipherCapabilities::discover(),
            on_status: None,
            on_auth_url: None,
            state: Arc::new(Mutex::new(HandshakeState::Idle)),
            pending: Arc::new(Mutex::new(None)),
            next_wait_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_registry(mut self, registry: SignerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_capabilities(mut self, capabilities: CipherCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn on_status<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ConnectStatus) + Send + Sync + 'static,
    {
        self.on_status = Some(Arc::new(callback));
        self
    }

    pub fn on_auth_url<F>(mut self, callback: F) -> Self
    where
        F: Fn(&AuthPrompt) + Send + Sync + 'static,
    {
        self.on_auth_url = Some(Arc::new(callback));
        self
    }

    pub fn state(&self) -> HandshakeState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn registry(&self) -> Option<&SignerRegistry> {
        self.registry.as_ref()
    }

    fn set_state(&self, state: HandshakeState) {
        let mut slot = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *slot != state {
            debug!("[nip46] handshake state {:?} -> {:?}", *slot, state);
            *slot = state;
        }
    }

    fn emit(&self, status: ConnectStatus) {
        if let Some(callback) = &self.on_status {
            callback(&status);
        }
    }

    fn notify_auth(&self, prompt: AuthPrompt) {
        self.set_state(HandshakeState::AuthChallenge);
        info!(
            "[nip46] {:?} auth challenge from {} at {}",
            prompt.phase,
            summarize_hex(&prompt.remote_pubkey),
            summarize_url(&prompt.url)
        );
        if let Some(callback) = &self.on_auth_url {
            callback(&prompt);
        }
    }

    fn record_failure(&self, error: &Nip46Error) {
        self.set_state(match error {
            Nip46Error::HandshakeTimeout => HandshakeState::TimedOut,
            Nip46Error::Cancelled => HandshakeState::Cancelled,
            _ => HandshakeState::Failed,
        });
    }

    /// Validate an existing keypair or generate a fresh one.
    pub fn create_key_pair(&self, existing_private: Option<&str>, existing_public: Option<&str>) -> Nip46Result<Keys> {
        let keys = match existing_private.and_then(non_blank) {
            Some(private) => Keys::parse(&private.to_ascii_lowercase())
                .map_err(|_| Nip46Error::InvalidPrivateKey("expected 64-char hex secret key".to_string()))?,
            None => Keys::generate()?,
        };
        if let Some(public) = existing_public.and_then(non_blank) {
            if normalize_pubkey(public) != keys.public_key.to_hex() {
                return Err(Nip46Error::ClientPublicKeyMismatch);
            }
        }
        Ok(keys)
    }

    /// Generate ephemeral keys and the `nostrconnect://` URI advertising them.
    pub fn prepare_handshake(&self, options: PrepareOptions) -> Nip46Result<PreparedHandshake> {
        let keys = self.create_key_pair(None, None)?;
        let metadata = options.metadata.sanitized();
        let permissions = options.permissions.trim().to_string();
        let relays = resolve_relays(&options.relays, &[], &self.config.default_relays, self.config.enforce_tls);
        let secret = match non_blank(&options.secret) {
            Some(secret) => secret.to_string(),
            None => generate_secret(HANDSHAKE_SECRET_BYTES)?,
        };

        let material = keys.material();
        let uri = build_connection_uri(&material.public_key_hex, &relays, &secret, &permissions, &metadata);
        debug!(
            "[nip46] prepared handshake for {} on {} relay(s), secret {}",
            summarize_hex(&material.public_key_hex),
            relays.len(),
            summarize_secret(&secret)
        );

        Ok(PreparedHandshake {
            uri,
            keys: material,
            relays,
            secret,
            permissions,
            metadata,
        })
    }

    /// Wait for a remote signer to answer a published `nostrconnect://` URI.
    ///
    /// Auth challenges are reported and the wait continues. Replies that do
    /// not acknowledge the secret are ignored.
    pub async fn wait_for_handshake(&self, wait: HandshakeWait) -> Nip46Result<HandshakeAck> {
        let client_hex = strict_pubkey(&wait.client_public_key);
        if client_hex.is_empty() {
            return Err(Nip46Error::InvalidPublicKey(
                "a client public key is required for the handshake".to_string(),
            ));
        }
        if non_blank(&wait.client_private_key).is_none() {
            return Err(Nip46Error::MissingClientPrivateKey);
        }
        let keys = self.create_key_pair(Some(wait.client_private_key.as_str()), Some(client_hex.as_str()))?;
        let relays = resolve_relays(&wait.relays, &[], &self.config.default_relays, self.config.enforce_tls);
        if relays.is_empty() {
            return Err(Nip46Error::InvalidArgument(
                "no relays available for the handshake".to_string(),
            ));
        }
        let timeout_ms = wait
            .timeout_ms
            .filter(|t| *t > 0)
            .unwrap_or(self.config.handshake_timeout_ms);

        let filter = Filter::new().kind(NIP46_RPC_KIND).pubkey_tag(&client_hex);
        let Subscription { mut events, handle } = self.transport.subscribe(&relays, vec![filter]).await?;

        let (abort, registration) = AbortHandle::new_pair();
        let wait_id = self.next_wait_id.fetch_add(1, Ordering::SeqCst);
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(PendingWait { id: wait_id, abort });
        self.set_state(HandshakeState::WaitingForAck);
        info!(
            "[nip46] waiting {}ms for handshake to {} on {} relay(s)",
            timeout_ms,
            summarize_hex(&client_hex),
            relays.len()
        );

        let listener = HandshakeListener {
            suite: CipherSuite::new(keys.secret_key, self.capabilities),
            client_hex,
            secret: wait.secret.trim().to_string(),
            expected: strict_pubkey(&wait.expected_remote_pubkey),
        };
        let outcome = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            Abortable::new(self.listen(&listener, &mut events), registration),
        )
        .await;

        handle.unsubscribe();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if pending.as_ref().map(|p| p.id) == Some(wait_id) {
                *pending = None;
            }
        }

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_aborted)) => Err(Nip46Error::Cancelled),
            Err(_elapsed) => {
                warn!("[nip46] handshake wait timed out after {}ms", timeout_ms);
                Err(Nip46Error::HandshakeTimeout)
            }
        };
        match &result {
            Ok(ack) => self.emit(ConnectStatus::HandshakeAcknowledged {
                remote_pubkey: ack.remote_pubkey.clone(),
            }),
            Err(e) => self.record_failure(e),
        }
        result
    }

    async fn listen(
        &self,
        listener: &HandshakeListener,
        events: &mut mpsc::UnboundedReceiver<RelayMessage>,
    ) -> Nip46Result<HandshakeAck> {
        while let Some(message) = events.next().await {
            if let RelayMessage::Event(event) = message {
                if let Some(ack) = self.inspect(listener, &event) {
                    return Ok(ack);
                }
            }
        }
        Err(Nip46Error::Transport("handshake subscription closed".to_string()))
    }

    fn inspect(&self, listener: &HandshakeListener, event: &Event) -> Option<HandshakeAck> {
        if event.kind != NIP46_RPC_KIND || !event.is_tagged_to(&listener.client_hex) {
            return None;
        }
        let event_pubkey = strict_pubkey(&event.pubkey);
        let candidates = [listener.expected.as_str(), event_pubkey.as_str()];

        let decrypted = match listener
            .suite
            .attempt_handshake_decrypt(&candidates, &Value::String(event.content.clone()))
        {
            Ok(decrypted) => decrypted,
            Err(e) => {
                warn!("[nip46] undecryptable handshake event {}: {}", summarize_hex(&event.id), e);
                return None;
            }
        };
        let response: Value = match serde_json::from_str(&decrypted.plaintext) {
            Ok(value) => value,
            Err(e) => {
                warn!("[nip46] handshake payload is not JSON: {}", e);
                return None;
            }
        };

        let result = coerce_structured_string(response.get("result").unwrap_or(&Value::Null));
        let error = coerce_structured_string(response.get("error").unwrap_or(&Value::Null));
        let request_id = response.get("id").and_then(Value::as_str).unwrap_or_default().to_string();

        if result == "auth_url" && !error.is_empty() {
            self.notify_auth(AuthPrompt {
                url: error,
                phase: AuthPhase::Handshake,
                remote_pubkey: decrypted.remote_pubkey,
                request_id,
                attempt: 0,
            });
            return None;
        }
        if !acknowledges(&result, &listener.secret) {
            debug!(
                "[nip46] ignoring handshake reply {} that does not acknowledge the secret",
                summarize_hex(&request_id)
            );
            return None;
        }

        info!(
            "[nip46] handshake acknowledged by {} via {}",
            summarize_hex(&decrypted.remote_pubkey),
            decrypted.algorithm
        );
        Some(HandshakeAck {
            remote_pubkey: decrypted.remote_pubkey,
            event_pubkey,
            response,
            algorithm: decrypted.algorithm,
        })
    }

    /// Establish a session from a `bunker://` or `nostrconnect://` string.
    pub async fn connect(&self, request: ConnectRequest) -> Nip46Result<ConnectedSigner> {
        self.set_state(HandshakeState::Idle);
        let outcome = self.establish(&request).await;
        match &outcome {
            Ok(connected) => {
                self.set_state(HandshakeState::Connected);
                info!(
                    "[nip46] connected to {} as {}",
                    summarize_hex(connected.session.remote_pubkey()),
                    summarize_hex(&connected.user_pubkey)
                );
            }
            Err(e) => {
                warn!("[nip46] remote signer connection failed: {} ({})", e, e.code());
                if !request.remember {
                    self.store.clear();
                }
                self.record_failure(e);
                self.emit(ConnectStatus::Failed {
                    code: e.code(),
                    message: e.to_string(),
                    forgotten: false,
                });
            }
        }
        outcome
    }

    async fn establish(&self, request: &ConnectRequest) -> Nip46Result<ConnectedSigner> {
        let descriptor = parse_connection_string(&request.connection_string).ok_or_else(|| {
            Nip46Error::InvalidConnectionString(summarize_url(&request.connection_string))
        })?;

        let metadata = descriptor.metadata.merged_with(&request.metadata);
        let relay_source = if descriptor.relays.is_empty() {
            &request.relays
        } else {
            &descriptor.relays
        };
        let relays = resolve_relays(relay_source, &[], &self.config.default_relays, self.config.enforce_tls);
        let mut secret = first_non_empty(&request.secret, &descriptor.secret);
        let permissions = first_non_empty(&request.permissions, &descriptor.permissions);

        let (client_keys, remote_pubkey, encryption) = match descriptor.kind {
            ConnectionKind::Client => {
                let private_key = non_blank(&request.client_private_key).ok_or(Nip46Error::MissingClientPrivateKey)?;
                let public_hint = first_non_empty(&request.client_public_key, &descriptor.client_pubkey);
                let keys = self.create_key_pair(Some(private_key), Some(public_hint.as_str()))?;
                if !descriptor.client_pubkey.is_empty() && descriptor.client_pubkey != keys.public_key.to_hex() {
                    return Err(Nip46Error::ClientPublicKeyMismatch);
                }
                if secret.is_empty() {
                    secret = generate_secret(HANDSHAKE_SECRET_BYTES)?;
                }

                let material = keys.material();
                self.emit(ConnectStatus::WaitingForHandshake {
                    client_pubkey: material.public_key_hex.clone(),
                });
                let ack = self
                    .wait_for_handshake(HandshakeWait {
                        client_private_key: material.private_key_hex,
                        client_public_key: material.public_key_hex,
                        relays: relays.clone(),
                        secret: secret.clone(),
                        timeout_ms: request.handshake_timeout_ms,
                        expected_remote_pubkey: descriptor.remote_pubkey.clone(),
                    })
                    .await?;
                (keys, ack.remote_pubkey, Some(ack.algorithm))
            }
            ConnectionKind::Remote => {
                let keys = self.create_key_pair(
                    Some(request.client_private_key.as_str()),
                    Some(request.client_public_key.as_str()),
                )?;
                (keys, descriptor.remote_pubkey.clone(), None)
            }
        };

        if remote_pubkey.is_empty() {
            return Err(Nip46Error::MissingRemotePubkey);
        }
        let remote = PublicKey::from_hex(&remote_pubkey)
            .map_err(|_| Nip46Error::InvalidPublicKey(summarize_hex(&remote_pubkey)))?;

        let mut options = SessionOptions::new(client_keys, remote);
        options.relays = relays;
        options.secret = secret;
        options.permissions = permissions;
        options.metadata = metadata;
        options.encryption = encryption;
        options.capabilities = self.capabilities;
        let session = RpcSession::new(options, self.transport.clone(), self.signer.clone(), self.config.clone())?;

        let user_pubkey = match self.bring_up(&session, request.validator.as_ref()).await {
            Ok(user_pubkey) => user_pubkey,
            Err(e) => {
                session.destroy();
                return Err(e);
            }
        };

        if request.remember {
            let passphrase = request.passphrase.as_deref();
            if !self.store.write(&record_for(&session, &user_pubkey), passphrase) {
                warn!("[nip46] session for {} was not persisted", summarize_hex(&remote_pubkey));
            }
        } else {
            self.store.clear();
        }
        self.finish(session, user_pubkey)
    }

    /// Subscribe, drive `connect` through any auth challenges, fetch the
    /// user pubkey and run the validator.
    async fn bring_up(&self, session: &RpcSession, validator: Option<&PubkeyValidator>) -> Nip46Result<String> {
        session.ensure_subscription().await?;
        let remote_pubkey = session.remote_pubkey().to_string();
        self.emit(ConnectStatus::RequestingApproval {
            remote_pubkey: remote_pubkey.clone(),
        });

        let max_attempts = self.config.auth_challenge_max_attempts.max(1);
        let mut attempts = 0u32;
        loop {
            match session.connect(None).await {
                Ok(_) => break,
                Err(Nip46Error::AuthChallenge { url }) => {
                    attempts += 1;
                    session.log_auth_url(&url);
                    self.emit(ConnectStatus::AwaitingAuth {
                        remote_pubkey: remote_pubkey.clone(),
                        attempt: attempts,
                    });
                    self.notify_auth(AuthPrompt {
                        url: url.clone(),
                        phase: AuthPhase::Connect,
                        remote_pubkey: remote_pubkey.clone(),
                        request_id: String::new(),
                        attempt: attempts,
                    });
                    if attempts >= max_attempts {
                        warn!("[nip46] giving up after {} auth challenge(s)", attempts);
                        return Err(Nip46Error::AuthChallenge { url });
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let user_pubkey = session.get_user_pubkey().await?;
        if let Some(validator) = validator {
            if !validator(&user_pubkey) {
                return Err(Nip46Error::AccessDenied(format!(
                    "user {} is not allowed",
                    summarize_hex(&user_pubkey)
                )));
            }
        }
        Ok(user_pubkey)
    }

    fn finish(&self, session: RpcSession, user_pubkey: String) -> Nip46Result<ConnectedSigner> {
        if let Some(registry) = &self.registry {
            if let Some(previous) = registry.register(session.clone())? {
                if !previous.ptr_eq(&session) {
                    previous.destroy();
                }
            }
        }
        self.emit(ConnectStatus::Connected {
            remote_pubkey: session.remote_pubkey().to_string(),
            user_pubkey: user_pubkey.clone(),
        });
        Ok(ConnectedSigner { user_pubkey, session })
    }

    /// Rebuild the session saved by a previous `connect(remember = true)`.
    pub async fn reconnect_stored(&self, options: ReconnectOptions) -> Nip46Result<ConnectedSigner> {
        let stored = self.store.read().ok_or(Nip46Error::NoStoredSession)?;
        let stored = if stored.is_sealed() {
            let passphrase = options
                .passphrase
                .as_deref()
                .filter(|p| !p.is_empty())
                .ok_or(Nip46Error::PassphraseRequired)?;
            self.store.unlock(&stored, passphrase)?
        } else {
            stored
        };
        if !stored.has_credentials() {
            return Err(Nip46Error::MissingCredentials);
        }

        self.set_state(HandshakeState::Idle);
        self.emit(ConnectStatus::Reconnecting {
            remote_pubkey: stored.remote_pubkey.clone(),
        });
        debug!(
            "[nip46] reconnecting to {} ({:?}, {} relay(s))",
            summarize_hex(&stored.remote_pubkey),
            stored.encryption,
            stored.relays.len()
        );

        match self.resume(&stored, &options).await {
            Ok(connected) => {
                self.set_state(HandshakeState::Connected);
                Ok(connected)
            }
            Err(e) => {
                let forget = options.forget_on_error || e.is_fatal_for_stored_session();
                if forget {
                    self.store.clear();
                    warn!(
                        "[nip46] stored session for {} cleared after failure: {}",
                        summarize_hex(&stored.remote_pubkey),
                        e
                    );
                } else {
                    warn!("[nip46] stored session reconnection failed: {}", e);
                }
                self.record_failure(&e);
                self.emit(ConnectStatus::Failed {
                    code: e.code(),
                    message: e.to_string(),
                    forgotten: forget,
                });
                Err(e)
            }
        }
    }

    async fn resume(&self, stored: &SessionRecord, options: &ReconnectOptions) -> Nip46Result<ConnectedSigner> {
        let keys = self.create_key_pair(
            Some(stored.client_private_key.as_str()),
            Some(stored.client_public_key.as_str()),
        )?;
        let remote = PublicKey::from_hex(&stored.remote_pubkey)
            .map_err(|_| Nip46Error::InvalidPublicKey(summarize_hex(&stored.remote_pubkey)))?;

        let mut session_options = SessionOptions::new(keys, remote);
        session_options.relays = stored.relays.clone();
        session_options.secret = stored.secret.clone();
        session_options.permissions = stored.permissions.clone();
        session_options.metadata = stored.metadata.clone();
        session_options.encryption = stored.encryption;
        session_options.capabilities = self.capabilities;
        let session = RpcSession::new(session_options, self.transport.clone(), self.signer.clone(), self.config.clone())?;

        let user_pubkey = match self.bring_up(&session, options.validator.as_ref()).await {
            Ok(user_pubkey) => user_pubkey,
            Err(e) => {
                session.destroy();
                return Err(e);
            }
        };

        let mut refreshed = record_for(&session, &user_pubkey);
        refreshed.relays = stored.relays.clone();
        if !self.store.write(&refreshed, options.passphrase.as_deref()) {
            warn!("[nip46] failed to refresh stored session for {}", summarize_hex(&stored.remote_pubkey));
        }
        self.finish(session, user_pubkey)
    }

    /// Cancel a pending handshake wait. No-op when nothing is waiting.
    pub fn abort(&self) {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pending) = pending {
            debug!("[nip46] cancelling pending handshake wait");
            pending.abort.abort();
        }
    }

    /// Abort any pending handshake and optionally forget the stored session.
    pub fn disconnect(&self, keep_stored: bool) {
        self.abort();
        if !keep_stored {
            self.store.clear();
        }
        self.set_state(HandshakeState::Idle);
        self.emit(ConnectStatus::Disconnected { kept_stored: keep_stored });
    }
}

struct HandshakeListener {
    suite: CipherSuite,
    client_hex: String,
    secret: String,
    expected: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KdfConfig;
    use crate::crypto::CipherHandle;
    use crate::store::MemoryStorage;
    use crate::transport::{LocalKeySigner, MemoryRelay};
    use crate::types::UnsignedEvent;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    const RELAY: &str = "wss://relay.test";

    fn test_config() -> ConnectConfig {
        ConnectConfig {
            default_relays: vec![RELAY.to_string()],
            kdf: KdfConfig {
                m_cost: 256,
                t_cost: 1,
                p_cost: 1,
            },
            ..ConnectConfig::default()
        }
    }

    fn coordinator_with(relay: &MemoryRelay, config: ConnectConfig) -> HandshakeCoordinator {
        let config = Arc::new(config);
        let store = SessionStore::new(Arc::new(MemoryStorage::new()), config.storage_key.clone(), config.kdf);
        HandshakeCoordinator::new(config, Arc::new(relay.clone()), Arc::new(LocalKeySigner), store)
    }

    fn coordinator(relay: &MemoryRelay) -> HandshakeCoordinator {
        coordinator_with(relay, test_config())
    }

    fn reply(from: &Keys, to: &str, body: &Value) -> Event {
        let client = PublicKey::from_hex(to).unwrap();
        let cipher = CipherHandle::derive(Algorithm::Nip44V2, &from.secret_key, &client).unwrap();
        let unsigned = UnsignedEvent::new(
            &from.public_key.to_hex(),
            NIP46_RPC_KIND,
            cipher.encrypt(&body.to_string()).unwrap(),
            vec![vec!["p".to_string(), to.to_string()]],
        );
        LocalKeySigner.sign_event(unsigned, &from.secret_key).unwrap()
    }

    /// Play the remote signer: decrypt each request and answer with the body
    /// `handler` returns.
    fn serve<F>(relay: &MemoryRelay, remote: &Keys, handler: F)
    where
        F: Fn(&str, &[String]) -> Value + Send + Sync + 'static,
    {
        let remote = remote.clone();
        relay.set_responder(move |event| {
            let Ok(client) = PublicKey::from_hex(&event.pubkey) else {
                return Vec::new();
            };
            let cipher = CipherHandle::derive(Algorithm::Nip44V2, &remote.secret_key, &client).unwrap();
            let Ok(plaintext) = cipher.decrypt(&event.content) else {
                return Vec::new();
            };
            let request: Value = serde_json::from_str(&plaintext).unwrap();
            let params: Vec<String> = serde_json::from_value(request["params"].clone()).unwrap();
            let mut body = handler(request["method"].as_str().unwrap(), &params);
            body["id"] = request["id"].clone();
            vec![reply(&remote, &event.pubkey, &body)]
        });
    }

    async fn subscribed(relay: &MemoryRelay, count: usize) {
        while relay.subscription_count() < count {
            tokio::task::yield_now().await;
        }
    }

    fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |item: &T| sink.lock().unwrap().push(item.clone()))
    }

    #[test]
    fn test_coerce_structured_string() {
        assert_eq!(coerce_structured_string(&json!("  abc ")), "abc");
        assert_eq!(coerce_structured_string(&json!(["", "  ", "x"])), "x");
        assert_eq!(coerce_structured_string(&json!({ "other": "o", "status": "ok" })), "ok");
        assert_eq!(coerce_structured_string(&json!({ "nested": { "value": "v" } })), "v");
        assert_eq!(coerce_structured_string(&json!(42)), "");
        assert_eq!(coerce_structured_string(&Value::Null), "");
    }

    #[test]
    fn test_acknowledges() {
        assert!(acknowledges("abc123", "abc123"));
        assert!(acknowledges("ACK", "abc123"));
        assert!(!acknowledges("", "abc123"));
        assert!(!acknowledges("ok", "abc123"));

        assert!(acknowledges("", ""));
        assert!(acknowledges("OK", ""));
        assert!(acknowledges("success", ""));
        assert!(!acknowledges("nope", ""));
    }

    #[test]
    fn test_create_key_pair() {
        let relay = MemoryRelay::new();
        let coordinator = coordinator(&relay);
        let generated = coordinator.create_key_pair(None, None).unwrap();

        let private = generated.secret_key.to_hex().to_uppercase();
        let public = generated.public_key.to_hex();
        let parsed = coordinator.create_key_pair(Some(&private), Some(&public)).unwrap();
        assert_eq!(parsed.public_key, generated.public_key);

        assert!(matches!(
            coordinator.create_key_pair(Some("zz"), None),
            Err(Nip46Error::InvalidPrivateKey(_))
        ));
        let other = Keys::generate().unwrap().public_key.to_hex();
        assert_eq!(
            coordinator.create_key_pair(Some(&private), Some(&other)).unwrap_err(),
            Nip46Error::ClientPublicKeyMismatch
        );
    }

    #[test]
    fn test_prepare_handshake_builds_uri() {
        let relay = MemoryRelay::new();
        let coordinator = coordinator(&relay);
        let prepared = coordinator
            .prepare_handshake(PrepareOptions {
                permissions: " sign_event:1 ".to_string(),
                metadata: Metadata {
                    name: "Viewer".to_string(),
                    ..Metadata::default()
                },
                ..PrepareOptions::default()
            })
            .unwrap();

        assert_eq!(prepared.relays, vec![RELAY.to_string()]);
        assert_eq!(prepared.secret.len(), 32);
        assert_eq!(prepared.permissions, "sign_event:1");

        let parsed = parse_connection_string(&prepared.uri).unwrap();
        assert_eq!(parsed.kind, ConnectionKind::Client);
        assert_eq!(parsed.client_pubkey, prepared.keys.public_key_hex);
        assert_eq!(parsed.secret, prepared.secret);
        assert_eq!(parsed.permissions, "sign_event:1");
        assert_eq!(parsed.metadata.name, "Viewer");

        let fixed = coordinator
            .prepare_handshake(PrepareOptions {
                secret: " s3cret ".to_string(),
                ..PrepareOptions::default()
            })
            .unwrap();
        assert_eq!(fixed.secret, "s3cret");
    }

    #[tokio::test]
    async fn test_wait_accepts_secret_echo_from_author() {
        let relay = MemoryRelay::new();
        let (statuses, sink) = recorder::<ConnectStatus>();
        let coordinator = coordinator(&relay).on_status(sink);
        let prepared = coordinator.prepare_handshake(PrepareOptions::default()).unwrap();
        let remote = Keys::generate().unwrap();
        let client = prepared.keys.public_key_hex.clone();

        let wait = tokio::spawn({
            let coordinator = coordinator.clone();
            let wait = HandshakeWait::from(&prepared);
            async move { coordinator.wait_for_handshake(wait).await }
        });
        subscribed(&relay, 1).await;
        assert_eq!(coordinator.state(), HandshakeState::WaitingForAck);

        relay.inject(&reply(&remote, &client, &json!({ "id": "a", "result": "not-the-secret" })));
        relay.inject(&reply(&remote, &client, &json!({ "id": "b", "result": { "secret": prepared.secret } })));

        let ack = wait.await.unwrap().unwrap();
        assert_eq!(ack.remote_pubkey, remote.public_key.to_hex());
        assert_eq!(ack.event_pubkey, remote.public_key.to_hex());
        assert_eq!(ack.algorithm, Algorithm::Nip44V2);
        assert_eq!(ack.response["id"], "b");
        assert_eq!(relay.subscription_count(), 0);
        assert_eq!(
            statuses.lock().unwrap().last(),
            Some(&ConnectStatus::HandshakeAcknowledged {
                remote_pubkey: remote.public_key.to_hex()
            })
        );
    }

    #[tokio::test]
    async fn test_wait_reports_auth_url_and_keeps_waiting() {
        let relay = MemoryRelay::new();
        let (prompts, sink) = recorder::<AuthPrompt>();
        let coordinator = coordinator(&relay).on_auth_url(sink);
        let prepared = coordinator.prepare_handshake(PrepareOptions::default()).unwrap();
        let remote = Keys::generate().unwrap();
        let client = prepared.keys.public_key_hex.clone();

        let wait = tokio::spawn({
            let coordinator = coordinator.clone();
            let wait = HandshakeWait::from(&prepared);
            async move { coordinator.wait_for_handshake(wait).await }
        });
        subscribed(&relay, 1).await;

        relay.inject(&reply(
            &remote,
            &client,
            &json!({ "id": "c1", "result": "auth_url", "error": "https://signer.example/approve" }),
        ));
        relay.inject(&reply(&remote, &client, &json!({ "id": "c2", "result": "ack" })));

        assert!(wait.await.unwrap().is_ok());
        let prompts = prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].url, "https://signer.example/approve");
        assert_eq!(prompts[0].phase, AuthPhase::Handshake);
        assert_eq!(prompts[0].request_id, "c1");
        assert_eq!(prompts[0].remote_pubkey, remote.public_key.to_hex());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let relay = MemoryRelay::new();
        let coordinator = coordinator(&relay);
        let prepared = coordinator.prepare_handshake(PrepareOptions::default()).unwrap();
        let mut wait = HandshakeWait::from(&prepared);
        wait.timeout_ms = Some(1_000);

        let start = tokio::time::Instant::now();
        assert_eq!(coordinator.wait_for_handshake(wait).await, Err(Nip46Error::HandshakeTimeout));
        assert!(start.elapsed() >= Duration::from_millis(1_000));
        assert_eq!(coordinator.state(), HandshakeState::TimedOut);
        assert_eq!(relay.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_abort_cancels_wait() {
        let relay = MemoryRelay::new();
        let coordinator = coordinator(&relay);
        let prepared = coordinator.prepare_handshake(PrepareOptions::default()).unwrap();

        let wait = tokio::spawn({
            let coordinator = coordinator.clone();
            let wait = HandshakeWait::from(&prepared);
            async move { coordinator.wait_for_handshake(wait).await }
        });
        subscribed(&relay, 1).await;

        coordinator.abort();
        assert_eq!(wait.await.unwrap(), Err(Nip46Error::Cancelled));
        assert_eq!(coordinator.state(), HandshakeState::Cancelled);
        assert_eq!(relay.subscription_count(), 0);
        coordinator.abort();
    }

    #[tokio::test]
    async fn test_wait_requires_client_keys() {
        let relay = MemoryRelay::new();
        let coordinator = coordinator(&relay);
        let keys = Keys::generate().unwrap();

        let missing = HandshakeWait {
            client_public_key: keys.public_key.to_hex(),
            ..HandshakeWait::default()
        };
        assert_eq!(
            coordinator.wait_for_handshake(missing).await,
            Err(Nip46Error::MissingClientPrivateKey)
        );
        assert!(matches!(
            coordinator.wait_for_handshake(HandshakeWait::default()).await,
            Err(Nip46Error::InvalidPublicKey(_))
        ));
        assert_eq!(relay.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_bunker_connect_survives_auth_challenge() {
        let relay = MemoryRelay::new();
        let remote = Keys::generate().unwrap();
        let user = Keys::generate().unwrap().public_key.to_hex();
        let connects = Arc::new(AtomicUsize::new(0));

        let counter = connects.clone();
        let reply_user = user.clone();
        serve(&relay, &remote, move |method, params| match method {
            "connect" => {
                assert_eq!(params[1], "s3cret");
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    json!({ "result": "auth_url", "error": "https://signer.example/auth" })
                } else {
                    json!({ "result": "ack" })
                }
            }
            "get_public_key" => json!({ "result": reply_user }),
            _ => json!({ "error": "unsupported" }),
        });

        let registry = SignerRegistry::new();
        let (prompts, sink) = recorder::<AuthPrompt>();
        let coordinator = coordinator(&relay).with_registry(registry.clone()).on_auth_url(sink);
        let uri = format!("bunker://{}?relay={}&secret=s3cret", remote.public_key.to_hex(), RELAY);

        let connected = coordinator.connect(ConnectRequest::new(uri)).await.unwrap();
        assert_eq!(connected.user_pubkey, user);
        assert_eq!(coordinator.state(), HandshakeState::Connected);
        assert_eq!(connects.load(Ordering::SeqCst), 2);

        let prompts = prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].phase, AuthPhase::Connect);
        assert_eq!(prompts[0].attempt, 1);

        let stored = coordinator.store().read().unwrap();
        assert!(stored.has_credentials());
        assert_eq!(stored.secret, "s3cret");
        assert_eq!(stored.user_pubkey, user);
        assert_eq!(stored.remote_pubkey, remote.public_key.to_hex());
        assert_eq!(stored.encryption, Some(Algorithm::Nip44V2));
        assert!(registry.active().unwrap().ptr_eq(&connected.session));
    }

    #[tokio::test]
    async fn test_auth_challenges_are_bounded() {
        let relay = MemoryRelay::new();
        let remote = Keys::generate().unwrap();
        serve(&relay, &remote, |_, _| {
            json!({ "result": "auth_url", "error": "https://signer.example/auth" })
        });

        let (prompts, sink) = recorder::<AuthPrompt>();
        let config = ConnectConfig {
            auth_challenge_max_attempts: 2,
            ..test_config()
        };
        let coordinator = coordinator_with(&relay, config).on_auth_url(sink);
        let mut request = ConnectRequest::new(format!("bunker://{}?relay={}", remote.public_key.to_hex(), RELAY));
        request.remember = false;

        let result = coordinator.connect(request).await;
        assert!(matches!(result, Err(Nip46Error::AuthChallenge { .. })));
        assert_eq!(prompts.lock().unwrap().len(), 2);
        assert_eq!(coordinator.state(), HandshakeState::Failed);
        assert!(coordinator.store().read().is_none());
        assert_eq!(relay.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_validator_rejection() {
        let relay = MemoryRelay::new();
        let remote = Keys::generate().unwrap();
        let user = Keys::generate().unwrap().public_key.to_hex();
        let reply_user = user.clone();
        serve(&relay, &remote, move |method, _| match method {
            "get_public_key" => json!({ "result": reply_user }),
            _ => json!({ "result": "ack" }),
        });

        let (statuses, sink) = recorder::<ConnectStatus>();
        let coordinator = coordinator(&relay).on_status(sink);
        let mut request = ConnectRequest::new(format!("bunker://{}?relay={}", remote.public_key.to_hex(), RELAY));
        request.validator = Some(Arc::new(|_: &str| false));

        let result = coordinator.connect(request).await;
        assert!(matches!(result, Err(Nip46Error::AccessDenied(_))));
        assert!(coordinator.store().read().is_none());
        assert!(matches!(
            statuses.lock().unwrap().last(),
            Some(ConnectStatus::Failed {
                code: "access-denied",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_input() {
        let relay = MemoryRelay::new();
        let coordinator = coordinator(&relay);

        assert!(matches!(
            coordinator.connect(ConnectRequest::new("https://example.com")).await,
            Err(Nip46Error::InvalidConnectionString(_))
        ));
        let client = Keys::generate().unwrap().public_key.to_hex();
        assert_eq!(
            coordinator
                .connect(ConnectRequest::new(format!("nostrconnect://{}?relay={}", client, RELAY)))
                .await
                .unwrap_err(),
            Nip46Error::MissingClientPrivateKey
        );
        assert!(matches!(
            coordinator
                .connect(ConnectRequest::new(format!("bunker://my-signer?relay={}", RELAY)))
                .await,
            Err(Nip46Error::InvalidPublicKey(_))
        ));
        assert_eq!(relay.publish_count(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_error_paths() {
        let relay = MemoryRelay::new();
        let coordinator = coordinator(&relay);
        assert_eq!(
            coordinator.reconnect_stored(ReconnectOptions::default()).await.unwrap_err(),
            Nip46Error::NoStoredSession
        );

        let mut record = SessionRecord::new(&Keys::generate().unwrap().public_key.to_hex());
        record.client_public_key = Keys::generate().unwrap().public_key.to_hex();
        assert!(coordinator.store().write(&record, None));
        assert_eq!(
            coordinator.reconnect_stored(ReconnectOptions::default()).await.unwrap_err(),
            Nip46Error::MissingCredentials
        );
    }

    #[tokio::test]
    async fn test_reconnect_mismatched_client_keys_purges_store() {
        let relay = MemoryRelay::new();
        let coordinator = coordinator(&relay);
        let mut record = SessionRecord::new(&Keys::generate().unwrap().public_key.to_hex());
        record.client_private_key = Keys::generate().unwrap().secret_key.to_hex();
        record.client_public_key = Keys::generate().unwrap().public_key.to_hex();
        record.secret = "s3cret".to_string();
        assert!(coordinator.store().write(&record, None));

        assert_eq!(
            coordinator.reconnect_stored(ReconnectOptions::default()).await.unwrap_err(),
            Nip46Error::ClientPublicKeyMismatch
        );
        assert!(coordinator.store().read().is_none());
        assert_eq!(relay.publish_count(), 0);
        assert_eq!(
            coordinator.reconnect_stored(ReconnectOptions::default()).await.unwrap_err(),
            Nip46Error::NoStoredSession
        );
    }

    #[tokio::test]
    async fn test_reconnect_secret_mismatch_purges_store() {
        let relay = MemoryRelay::new();
        let remote = Keys::generate().unwrap();
        let user = Keys::generate().unwrap().public_key.to_hex();
        let honest = Arc::new(std::sync::atomic::AtomicBool::new(true));

        let flag = honest.clone();
        let reply_user = user.clone();
        serve(&relay, &remote, move |method, _| match method {
            "connect" if flag.load(Ordering::SeqCst) => json!({ "result": "ack" }),
            "connect" => json!({ "result": "someone-else" }),
            _ => json!({ "result": reply_user }),
        });

        let (statuses, sink) = recorder::<ConnectStatus>();
        let coordinator = coordinator(&relay).on_status(sink);
        let uri = format!("bunker://{}?relay={}&secret=s3cret", remote.public_key.to_hex(), RELAY);
        let first = coordinator.connect(ConnectRequest::new(uri)).await.unwrap();
        first.session.destroy();

        honest.store(false, Ordering::SeqCst);
        assert_eq!(
            coordinator.reconnect_stored(ReconnectOptions::default()).await.unwrap_err(),
            Nip46Error::SecretMismatch
        );
        assert!(coordinator.store().read().is_none());
        assert_eq!(
            statuses.lock().unwrap().last(),
            Some(&ConnectStatus::Failed {
                code: "nip46-secret-mismatch",
                message: Nip46Error::SecretMismatch.to_string(),
                forgotten: true,
            })
        );
    }

    #[tokio::test]
    async fn test_disconnect_forgets_when_asked() {
        let relay = MemoryRelay::new();
        let coordinator = coordinator(&relay);
        let record = SessionRecord::new(&Keys::generate().unwrap().public_key.to_hex());
        assert!(coordinator.store().write(&record, None));

        coordinator.disconnect(true);
        assert!(coordinator.store().read().is_some());
        coordinator.disconnect(false);
        assert!(coordinator.store().read().is_none());
        assert_eq!(coordinator.state(), HandshakeState::Idle);
    }
}
