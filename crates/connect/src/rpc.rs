//! Encrypted request/response channel to one remote signer.
//!
//! Requests are serialised through a [`RequestQueue`]; responses arrive on a
//! relay subscription pumped by a background task and are correlated by the
//! request id embedded in the encrypted payload.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use futures::channel::{mpsc, oneshot};
use futures::StreamExt;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::codec::{normalize_pubkey, Metadata};
use crate::config::ConnectConfig;
use crate::crypto::{Algorithm, CipherCapabilities, CipherHandle, CipherSuite};
use crate::error::{Nip46Error, Nip46Result};
use crate::queue::{Priority, RequestQueue};
use crate::transport::{assert_any_relay_accepted, EventSigner, RelayMessage, RelayTransport, Subscription, SubscriptionHandle};
use crate::types::{Event, Filter, Keys, PublicKey, UnsignedEvent, NIP46_RPC_KIND};
use crate::util::{request_id, summarize_hex, summarize_url, unix_now_ms};

/// Per-call overrides for [`RpcSession::send_rpc`]. Unset fields fall back
/// to the session configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RpcOptions {
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    pub priority: Priority,
}

impl RpcOptions {
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Everything needed to open a session with a known remote signer.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub client_keys: Keys,
    pub remote_pubkey: PublicKey,
    pub relays: Vec<String>,
    /// Shared secret echoed by `connect`; empty when none was established.
    pub secret: String,
    pub permissions: String,
    pub metadata: Metadata,
    /// Algorithm to pin first, typically the one the handshake used.
    pub encryption: Option<Algorithm>,
    pub capabilities: CipherCapabilities,
}

impl SessionOptions {
    pub fn new(client_keys: Keys, remote_pubkey: PublicKey) -> Self {
        SessionOptions {
            client_keys,
            remote_pubkey,
            relays: Vec::new(),
            secret: String::new(),
            permissions: String::new(),
            metadata: Metadata::default(),
            encryption: None,
            capabilities: CipherCapabilities::discover(),
        }
    }
}

struct PendingRequest {
    method: String,
    responder: oneshot::Sender<Nip46Result<Value>>,
    registered_at: Instant,
}

struct ActiveSubscription {
    handle: Box<dyn SubscriptionHandle>,
    pump: tokio::task::JoinHandle<()>,
}

impl ActiveSubscription {
    fn close(self) {
        self.handle.unsubscribe();
        self.pump.abort();
    }
}

struct SessionInner {
    config: Arc<ConnectConfig>,
    client_keys: Keys,
    client_hex: String,
    remote: PublicKey,
    remote_hex: String,
    relays: Vec<String>,
    secret: String,
    permissions: String,
    metadata: Metadata,
    preferred: Option<Algorithm>,

    transport: Arc<dyn RelayTransport>,
    signer: Arc<dyn EventSigner>,
    ciphers: CipherSuite,
    cipher: Mutex<Option<CipherHandle>>,

    pending: Mutex<FxHashMap<String, PendingRequest>>,
    queue: RequestQueue<Value>,
    subscription: async_lock::Mutex<Option<ActiveSubscription>>,

    user_pubkey: Mutex<String>,
    last_seen: AtomicU64,
    destroyed: AtomicBool,
}

impl SessionInner {
    fn ensure_alive(&self) -> Nip46Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            Err(Nip46Error::Destroyed)
        } else {
            Ok(())
        }
    }

    /// The pinned cipher, or the best available one until a response has
    /// decrypted.
    fn active_cipher(&self) -> Nip46Result<CipherHandle> {
        if let Some(handle) = self.cipher.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            return Ok(handle.clone());
        }
        self.ciphers.create_cipher(&self.remote, self.preferred)
    }

    /// Pin `handle` unless a cipher is already pinned.
    fn pin_cipher(&self, handle: CipherHandle) {
        let mut slot = self.cipher.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            debug!(
                "[nip46] pinned {} cipher for {}",
                handle.algorithm(),
                summarize_hex(&self.remote_hex)
            );
            *slot = Some(handle);
        }
    }

    fn decrypt_payload(&self, content: &str) -> Nip46Result<String> {
        let handle = self.active_cipher()?;
        match handle.decrypt(content) {
            Ok(plaintext) => {
                self.pin_cipher(handle);
                Ok(plaintext)
            }
            Err(e) => {
                debug!("[nip46] {} decrypt failed ({}), trying all candidates", handle.algorithm(), e);
                let decrypted = self
                    .ciphers
                    .decrypt_any_candidate(&self.remote, &Value::String(content.to_string()))?;
                match self.ciphers.create_cipher(&self.remote, Some(decrypted.algorithm)) {
                    Ok(winner) if winner.algorithm() == decrypted.algorithm => self.pin_cipher(winner),
                    _ => {}
                }
                Ok(decrypted.plaintext)
            }
        }
    }

    fn register_pending(
        &self,
        id: &str,
        method: &str,
        responder: oneshot::Sender<Nip46Result<Value>>,
    ) -> Nip46Result<()> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        self.ensure_alive()?;
        pending.insert(
            id.to_string(),
            PendingRequest {
                method: method.to_string(),
                responder,
                registered_at: Instant::now(),
            },
        );
        Ok(())
    }

    fn remove_pending(&self, id: &str) {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(id);
    }

    fn reject_all_pending(&self, error: Nip46Error) {
        let drained: Vec<(String, PendingRequest)> =
            self.pending.lock().unwrap_or_else(|e| e.into_inner()).drain().collect();
        if !drained.is_empty() {
            warn!(
                "[nip46] rejecting {} pending request(s) for {}: {}",
                drained.len(),
                summarize_hex(&self.remote_hex),
                error
            );
        }
        for (_, request) in drained {
            let _ = request.responder.send(Err(error.clone()));
        }
    }

    fn handle_event(&self, event: &Event) {
        if self.destroyed.load(Ordering::SeqCst) || event.kind != NIP46_RPC_KIND {
            return;
        }
        if normalize_pubkey(&event.pubkey) != self.remote_hex || !event.is_tagged_to(&self.client_hex) {
            return;
        }

        debug!(
            "[nip46] event {} from {} ({} bytes)",
            summarize_hex(&event.id),
            summarize_hex(&event.pubkey),
            event.content.len()
        );

        let plaintext = match self.decrypt_payload(&event.content) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!("[nip46] failed to decrypt remote signer payload: {}", e);
                return;
            }
        };
        let response: Value = match serde_json::from_str(&plaintext) {
            Ok(value @ Value::Object(_)) => value,
            Ok(_) | Err(_) => {
                warn!("[nip46] remote signer returned malformed payload");
                return;
            }
        };

        let id = response.get("id").and_then(Value::as_str).unwrap_or_default();
        let request = match self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(id) {
            Some(request) => request,
            None => {
                debug!("[nip46] dropping response for unknown request {}", summarize_hex(id));
                return;
            }
        };

        self.last_seen.store(unix_now_ms(), Ordering::SeqCst);
        debug!(
            "[nip46] {} response for {} after {:?}",
            request.method,
            summarize_hex(id),
            request.registered_at.elapsed()
        );
        let _ = request.responder.send(interpret_response(&response));
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(active) = self.subscription.get_mut().take() {
            active.close();
        }
    }
}

/// Map a decrypted `{id, result?, error?}` object onto the call outcome.
fn interpret_response(response: &Value) -> Nip46Result<Value> {
    let error = response.get("error").and_then(Value::as_str).map(str::trim).unwrap_or("");
    let result = response.get("result").cloned().unwrap_or(Value::Null);

    if result.as_str() == Some("auth_url") && !error.is_empty() {
        return Err(Nip46Error::AuthChallenge { url: error.to_string() });
    }
    if !error.is_empty() {
        return Err(Nip46Error::Remote(error.to_string()));
    }
    Ok(result)
}

fn result_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

async fn pump_events(session: Weak<SessionInner>, mut events: mpsc::UnboundedReceiver<RelayMessage>) {
    while let Some(message) = events.next().await {
        let Some(inner) = session.upgrade() else {
            break;
        };
        match message {
            RelayMessage::Event(event) => inner.handle_event(&event),
            RelayMessage::EndOfStoredEvents => debug!("[nip46] subscription caught up"),
        }
    }
    debug!("[nip46] subscription pump ended");
}

/// Live NIP-46 session with one remote signer. Cheap to clone.
#[derive(Clone)]
pub struct RpcSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcSession")
            .field("client", &summarize_hex(&self.inner.client_hex))
            .field("remote", &summarize_hex(&self.inner.remote_hex))
            .field("relays", &self.inner.relays)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

impl RpcSession {
    pub fn new(
        options: SessionOptions,
        transport: Arc<dyn RelayTransport>,
        signer: Arc<dyn EventSigner>,
        config: Arc<ConnectConfig>,
    ) -> Nip46Result<Self> {
        let relays = crate::codec::resolve_relays(&options.relays, &[], &config.default_relays, config.enforce_tls);
        if relays.is_empty() {
            return Err(Nip46Error::InvalidArgument("no usable relays for remote signer session".to_string()));
        }

        let client_hex = options.client_keys.public_key.to_hex();
        let remote_hex = options.remote_pubkey.to_hex();
        let ciphers = CipherSuite::new(options.client_keys.secret_key.clone(), options.capabilities);

        info!(
            "[nip46] session {} -> {} on {} relay(s)",
            summarize_hex(&client_hex),
            summarize_hex(&remote_hex),
            relays.len()
        );

        Ok(RpcSession {
            inner: Arc::new(SessionInner {
                queue: RequestQueue::from_config(&config),
                config,
                client_keys: options.client_keys,
                client_hex,
                remote: options.remote_pubkey,
                remote_hex,
                relays,
                secret: options.secret.trim().to_string(),
                permissions: options.permissions.trim().to_string(),
                metadata: options.metadata.sanitized(),
                preferred: options.encryption,
                transport,
                signer,
                ciphers,
                cipher: Mutex::new(None),
                pending: Mutex::new(FxHashMap::default()),
                subscription: async_lock::Mutex::new(None),
                user_pubkey: Mutex::new(String::new()),
                last_seen: AtomicU64::new(0),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    /// Open the response subscription once. Concurrent callers share it.
    pub async fn ensure_subscription(&self) -> Nip46Result<()> {
        let mut slot = self.inner.subscription.lock().await;
        self.inner.ensure_alive()?;
        if slot.is_some() {
            return Ok(());
        }

        let filter = Filter::new()
            .kind(NIP46_RPC_KIND)
            .author(&self.inner.remote_hex)
            .pubkey_tag(&self.inner.client_hex);
        let Subscription { events, handle } = self.inner.transport.subscribe(&self.inner.relays, vec![filter]).await?;

        if self.is_destroyed() {
            handle.unsubscribe();
            return Err(Nip46Error::Destroyed);
        }

        let pump = tokio::spawn(pump_events(Arc::downgrade(&self.inner), events));
        *slot = Some(ActiveSubscription { handle, pump });
        debug!(
            "[nip46] subscription open for {} on {} relay(s)",
            summarize_hex(&self.inner.remote_hex),
            self.inner.relays.len()
        );
        Ok(())
    }

    /// Feed a relay event into response correlation. Events of the wrong
    /// kind, author or recipient are ignored, as is anything unmatched.
    pub fn handle_event(&self, event: &Event) {
        self.inner.handle_event(event);
    }

    pub async fn send_rpc(&self, method: &str, params: Vec<String>, options: RpcOptions) -> Nip46Result<Value> {
        self.inner.ensure_alive()?;

        let timeout_ms = options
            .timeout_ms
            .filter(|t| *t > 0)
            .unwrap_or(self.inner.config.response_timeout_ms);
        let retries = options.retries.unwrap_or(self.inner.config.max_retries);
        let session = self.clone();
        let method = method.to_string();

        self.inner
            .queue
            .enqueue(options.priority, async move {
                session.run_rpc(&method, params, timeout_ms, retries).await
            })
            .await
    }

    async fn run_rpc(&self, method: &str, params: Vec<String>, timeout_ms: u64, retries: u32) -> Nip46Result<Value> {
        debug!(
            "[nip46] rpc {} start (timeout={}ms, retries={})",
            method, timeout_ms, retries
        );
        let mut last_error = None;

        for attempt in 0..=retries {
            self.inner.ensure_alive()?;
            self.ensure_subscription().await?;

            match self.attempt(method, &params, timeout_ms).await {
                Ok(result) => return Ok(result),
                Err(Nip46Error::RateLimited(message)) => {
                    let delay = self.inner.config.backoff_for_attempt(attempt);
                    warn!(
                        "[nip46] rpc {} rate limited on attempt {}: {}",
                        method,
                        attempt + 1,
                        message
                    );
                    if attempt < retries {
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(Nip46Error::RateLimited(message));
                }
                Err(e) if e.is_retryable() => {
                    warn!("[nip46] rpc {} attempt {} failed: {}", method, attempt + 1, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        let error = last_error.unwrap_or_else(|| Nip46Error::Remote(format!("request for {} failed", method)));
        warn!("[nip46] rpc {} exhausted: {}", method, error);
        Err(error)
    }

    async fn attempt(&self, method: &str, params: &[String], timeout_ms: u64) -> Nip46Result<Value> {
        let inner = &self.inner;
        let id = request_id();
        let payload = json!({ "id": id, "method": method, "params": params }).to_string();

        let content = inner.active_cipher()?.encrypt(&payload)?;
        let unsigned = UnsignedEvent::new(
            &inner.client_hex,
            NIP46_RPC_KIND,
            content,
            vec![vec!["p".to_string(), inner.remote_hex.clone()]],
        );
        let event = inner.signer.sign_event(unsigned, &inner.client_keys.secret_key)?;

        let (tx, rx) = oneshot::channel();
        inner.register_pending(&id, method, tx)?;

        let published = tokio::time::timeout(inner.config.publish_timeout(), inner.transport.publish(&event, &inner.relays))
            .await
            .unwrap_or_else(|_| {
                Err(Nip46Error::Publish(format!(
                    "no relay acknowledged within {}ms",
                    inner.config.publish_timeout_ms
                )))
            })
            .and_then(|outcomes| assert_any_relay_accepted(&outcomes));
        if let Err(e) = published {
            inner.remove_pending(&id);
            return Err(e);
        }
        debug!("[nip46] rpc {} published as {}", method, summarize_hex(&id));

        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_cancelled)) => Err(Nip46Error::Destroyed),
            Err(_) => {
                inner.remove_pending(&id);
                warn!("[nip46] rpc {} timed out after {}ms", method, timeout_ms);
                Err(Nip46Error::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    /// Initial `connect` call. When a secret is configured the remote must
    /// echo it, or answer `ack`.
    pub async fn connect(&self, permissions: Option<&str>) -> Nip46Result<String> {
        let requested = permissions
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(&self.inner.permissions)
            .to_string();
        let secret = &self.inner.secret;

        let mut params = vec![self.inner.remote_hex.clone()];
        if !secret.is_empty() || !requested.is_empty() {
            params.push(secret.clone());
        }
        if !requested.is_empty() {
            params.push(requested);
        }

        let result = self
            .send_rpc(
                "connect",
                params,
                RpcOptions::default()
                    .with_timeout(self.inner.config.connect_timeout_ms())
                    .with_retries(0)
                    .with_priority(Priority::High),
            )
            .await?;
        let text = result_text(&result);

        if !secret.is_empty() {
            let echoed = text.trim();
            if echoed.is_empty() || (echoed != secret && !echoed.eq_ignore_ascii_case("ack")) {
                warn!("[nip46] remote signer {} failed secret check", summarize_hex(&self.inner.remote_hex));
                return Err(Nip46Error::SecretMismatch);
            }
        }
        info!("[nip46] connect acknowledged by {}", summarize_hex(&self.inner.remote_hex));
        Ok(text)
    }

    /// The user's pubkey as hex, fetched once and cached.
    pub async fn get_user_pubkey(&self) -> Nip46Result<String> {
        if let Some(cached) = self.user_pubkey() {
            return Ok(cached);
        }
        let result = self
            .send_rpc(
                "get_public_key",
                Vec::new(),
                RpcOptions::default().with_retries(0).with_priority(Priority::High),
            )
            .await?;
        let raw = result_text(&result);
        if raw.trim().is_empty() {
            return Err(Nip46Error::EmptyPubkey);
        }
        let pubkey = normalize_pubkey(&raw);
        *self.inner.user_pubkey.lock().unwrap_or_else(|e| e.into_inner()) = pubkey.clone();
        debug!("[nip46] user pubkey {}", summarize_hex(&pubkey));
        Ok(pubkey)
    }

    /// `true` when the remote answers `pong`. Failures are logged, not raised.
    pub async fn ping(&self) -> bool {
        let options = RpcOptions::default()
            .with_timeout(self.inner.config.ping_timeout_ms)
            .with_retries(0)
            .with_priority(Priority::High);
        match self.send_rpc("ping", Vec::new(), options).await {
            Ok(result) => result_text(&result).trim().eq_ignore_ascii_case("pong"),
            Err(e) => {
                warn!("[nip46] ping to {} failed: {}", summarize_hex(&self.inner.remote_hex), e);
                false
            }
        }
    }

    /// Ask the remote to sign `template`. A blank template pubkey is filled
    /// with the cached user pubkey.
    pub async fn sign_event(&self, template: UnsignedEvent) -> Nip46Result<Event> {
        let options = RpcOptions::default()
            .with_timeout(self.inner.config.sign_event_timeout_ms)
            .with_priority(Priority::High);
        self.sign_event_with(template, options).await
    }

    pub async fn sign_event_with(&self, mut template: UnsignedEvent, options: RpcOptions) -> Nip46Result<Event> {
        if template.pubkey.trim().is_empty() {
            template.pubkey = self.user_pubkey().unwrap_or_default();
        } else {
            template.pubkey = template.pubkey.trim().to_string();
        }
        let serialized = serde_json::to_string(&template)?;
        let result = self.send_rpc("sign_event", vec![serialized], options).await?;

        let event: Event = match result {
            Value::Null => return Err(Nip46Error::EmptyResponse),
            Value::String(s) if s.trim().is_empty() => return Err(Nip46Error::EmptyResponse),
            Value::String(s) => serde_json::from_str(&s)
                .map_err(|e| Nip46Error::MalformedResponse(format!("malformed signed event: {}", e)))?,
            object @ Value::Object(_) => serde_json::from_value(object)
                .map_err(|e| Nip46Error::MalformedResponse(format!("malformed signed event: {}", e)))?,
            other => {
                return Err(Nip46Error::MalformedResponse(format!(
                    "unexpected sign_event result type: {}",
                    other
                )))
            }
        };
        event
            .verify()
            .map_err(|e| Nip46Error::MalformedResponse(format!("signed event failed verification: {}", e)))?;
        Ok(event)
    }

    async fn third_party_crypto(&self, method: &str, pubkey: &str, payload: &str, options: RpcOptions) -> Nip46Result<String> {
        if pubkey.trim().is_empty() || payload.is_empty() {
            return Err(Nip46Error::InvalidArgument(format!("{} requires a pubkey and a payload", method)));
        }
        match self
            .send_rpc(method, vec![pubkey.trim().to_string(), payload.to_string()], options)
            .await?
        {
            Value::String(s) => Ok(s),
            other => Err(Nip46Error::MalformedResponse(format!("{} returned {}", method, other))),
        }
    }

    fn bulk() -> RpcOptions {
        RpcOptions::default().with_priority(Priority::Low)
    }

    pub async fn nip04_encrypt(&self, pubkey: &str, plaintext: &str) -> Nip46Result<String> {
        self.third_party_crypto("nip04_encrypt", pubkey, plaintext, Self::bulk()).await
    }

    pub async fn nip04_decrypt(&self, pubkey: &str, ciphertext: &str) -> Nip46Result<String> {
        self.third_party_crypto("nip04_decrypt", pubkey, ciphertext, Self::bulk()).await
    }

    pub async fn nip44_encrypt(&self, pubkey: &str, plaintext: &str) -> Nip46Result<String> {
        self.third_party_crypto("nip44_encrypt", pubkey, plaintext, Self::bulk()).await
    }

    pub async fn nip44_decrypt(&self, pubkey: &str, ciphertext: &str) -> Nip46Result<String> {
        self.third_party_crypto("nip44_decrypt", pubkey, ciphertext, Self::bulk()).await
    }

    /// Close the subscription and reject everything outstanding with
    /// [`Nip46Error::Destroyed`]. Later calls fail fast.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(
            "[nip46] destroying session with {} ({} pending)",
            summarize_hex(&self.inner.remote_hex),
            self.pending_len()
        );

        match self.inner.subscription.try_lock() {
            Some(mut slot) => {
                if let Some(active) = slot.take() {
                    active.close();
                }
            }
            None => {
                // ensure_subscription holds the slot; close once it lets go.
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let inner = self.inner.clone();
                    runtime.spawn(async move {
                        if let Some(active) = inner.subscription.lock().await.take() {
                            active.close();
                        }
                    });
                }
            }
        }

        self.inner.queue.clear(Nip46Error::Destroyed);
        self.inner.reject_all_pending(Nip46Error::Destroyed);
    }

    pub fn client_pubkey(&self) -> &str {
        &self.inner.client_hex
    }

    pub fn remote_pubkey(&self) -> &str {
        &self.inner.remote_hex
    }

    pub fn user_pubkey(&self) -> Option<String> {
        let cached = self.inner.user_pubkey.lock().unwrap_or_else(|e| e.into_inner());
        (!cached.is_empty()).then(|| cached.clone())
    }

    #[cfg(test)]
    pub(crate) fn set_user_pubkey(&self, pubkey: &str) {
        *self.inner.user_pubkey.lock().unwrap_or_else(|e| e.into_inner()) = normalize_pubkey(pubkey);
    }

    pub fn relays(&self) -> &[String] {
        &self.inner.relays
    }

    /// Pinned algorithm, or the preferred one until a response decrypts.
    pub fn algorithm(&self) -> Option<Algorithm> {
        let pinned = self.inner.cipher.lock().unwrap_or_else(|e| e.into_inner());
        pinned.as_ref().map(CipherHandle::algorithm).or(self.inner.preferred)
    }

    pub fn permissions(&self) -> &str {
        &self.inner.permissions
    }

    pub fn metadata(&self) -> &Metadata {
        &self.inner.metadata
    }

    pub(crate) fn secret(&self) -> &str {
        &self.inner.secret
    }

    pub(crate) fn client_keys(&self) -> &Keys {
        &self.inner.client_keys
    }

    /// Unix milliseconds of the last correlated response; 0 before any.
    pub fn last_seen(&self) -> u64 {
        self.inner.last_seen.load(Ordering::SeqCst)
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether both handles refer to the same underlying session.
    pub fn ptr_eq(&self, other: &RpcSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    pub(crate) fn log_auth_url(&self, url: &str) {
        info!(
            "[nip46] {} requested authentication at {}",
            summarize_hex(&self.inner.remote_hex),
            summarize_url(url)
        );
    }
}
