//! Relay and signing seams consumed by the engine, plus in-process
//! implementations of both.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures::channel::mpsc;
use k256::schnorr::SigningKey;
use signature::hazmat::PrehashSigner;
use tracing::{debug, warn};

use crate::error::{Nip46Error, Nip46Result};
use crate::types::{Event, Filter, SecretKey, UnsignedEvent};

/// Per-relay acknowledgement of a publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishOutcome {
    pub relay: String,
    pub ok: bool,
    pub message: String,
}

impl PublishOutcome {
    pub fn accepted(relay: &str) -> Self {
        PublishOutcome {
            relay: relay.to_string(),
            ok: true,
            message: String::new(),
        }
    }

    pub fn rejected(relay: &str, message: impl Into<String>) -> Self {
        PublishOutcome {
            relay: relay.to_string(),
            ok: false,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayMessage {
    Event(Event),
    EndOfStoredEvents,
}

pub trait SubscriptionHandle: Send + Sync {
    fn unsubscribe(&self);
}

pub struct Subscription {
    pub events: mpsc::UnboundedReceiver<RelayMessage>,
    pub handle: Box<dyn SubscriptionHandle>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Relay pool used for NIP-46 traffic.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn publish(&self, event: &Event, relays: &[String]) -> Nip46Result<Vec<PublishOutcome>>;

    async fn subscribe(&self, relays: &[String], filters: Vec<Filter>) -> Nip46Result<Subscription>;
}

/// Signing primitive supplied by the embedding application.
pub trait EventSigner: Send + Sync {
    fn sign_event(&self, unsigned: UnsignedEvent, secret: &SecretKey) -> Nip46Result<Event>;
}

fn is_rate_limit_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("rate-limited") || lower.contains("noting too much")
}

/// Succeeds when at least one relay accepted the event.
pub fn assert_any_relay_accepted(outcomes: &[PublishOutcome]) -> Nip46Result<()> {
    if outcomes.iter().any(|o| o.ok) {
        return Ok(());
    }
    if outcomes.is_empty() {
        return Err(Nip46Error::Publish("no relays available".to_string()));
    }

    let summary = outcomes
        .iter()
        .map(|o| {
            if o.message.is_empty() {
                format!("{}: rejected", o.relay)
            } else {
                format!("{}: {}", o.relay, o.message)
            }
        })
        .collect::<Vec<_>>()
        .join("; ");

    if outcomes.iter().any(|o| is_rate_limit_message(&o.message)) {
        Err(Nip46Error::RateLimited(summary))
    } else {
        Err(Nip46Error::Publish(summary))
    }
}

/// BIP-340 signer over a local secret key.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalKeySigner;

impl EventSigner for LocalKeySigner {
    fn sign_event(&self, unsigned: UnsignedEvent, secret: &SecretKey) -> Nip46Result<Event> {
        let id = unsigned.id();
        let signing_key =
            SigningKey::from_bytes(&secret.0).map_err(|e| Nip46Error::InvalidPrivateKey(e.to_string()))?;
        let signature = signing_key
            .sign_prehash(&id)
            .map_err(|e| Nip46Error::Crypto(format!("Schnorr prehash sign failed: {}", e)))?;

        Ok(Event {
            id: hex::encode(id),
            pubkey: unsigned.pubkey,
            created_at: unsigned.created_at,
            kind: unsigned.kind,
            tags: unsigned.tags,
            content: unsigned.content,
            sig: hex::encode(signature.to_bytes()),
        })
    }
}

// ============================================================================
// MemoryRelay
// ============================================================================

/// Produces reply events for a published event.
pub type Responder = Arc<dyn Fn(&Event) -> Vec<Event> + Send + Sync>;

struct MemorySubscription {
    id: u64,
    filters: Vec<Filter>,
    sender: mpsc::UnboundedSender<RelayMessage>,
}

#[derive(Default)]
struct MemoryRelayInner {
    subscriptions: Mutex<Vec<MemorySubscription>>,
    stored: Mutex<Vec<Event>>,
    published: Mutex<Vec<Event>>,
    responder: Mutex<Option<Responder>>,
    reject_with: Mutex<Option<String>>,
    next_sub_id: AtomicU64,
    publish_count: AtomicUsize,
    store_events: AtomicBool,
}

impl MemoryRelayInner {
    fn deliver(&self, event: &Event) {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        subscriptions.retain(|sub| {
            if !sub.filters.iter().any(|f| f.matches(event)) {
                return !sub.sender.is_closed();
            }
            sub.sender.unbounded_send(RelayMessage::Event(event.clone())).is_ok()
        });
    }
}

/// Loopback relay: every published event that verifies is delivered to all
/// matching live subscriptions. Replies produced by the responder hook are
/// delivered the same way.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<MemoryRelayInner>,
}

impl fmt::Debug for MemoryRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRelay")
            .field("subscriptions", &self.subscription_count())
            .field("publish_count", &self.publish_count())
            .finish()
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep published events and replay matching ones to new subscriptions.
    pub fn with_storage(self) -> Self {
        self.inner.store_events.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&Event) -> Vec<Event> + Send + Sync + 'static,
    {
        *self.inner.responder.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(responder));
    }

    pub fn clear_responder(&self) {
        *self.inner.responder.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Reject every publish with `message` until reset with `None`.
    pub fn reject_publishes(&self, message: Option<&str>) {
        *self.inner.reject_with.lock().unwrap_or_else(|e| e.into_inner()) = message.map(str::to_string);
    }

    /// Deliver `event` to subscribers as if another client had published it.
    pub fn inject(&self, event: &Event) {
        self.inner.deliver(event);
    }

    pub fn publish_count(&self) -> usize {
        self.inner.publish_count.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<Event> {
        self.inner.published.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Live subscriptions whose receivers are still held.
    pub fn subscription_count(&self) -> usize {
        let mut subscriptions = self.inner.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        subscriptions.retain(|sub| !sub.sender.is_closed());
        subscriptions.len()
    }
}

struct MemorySubscriptionHandle {
    relay: Weak<MemoryRelayInner>,
    id: u64,
}

impl SubscriptionHandle for MemorySubscriptionHandle {
    fn unsubscribe(&self) {
        if let Some(relay) = self.relay.upgrade() {
            let mut subscriptions = relay.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            subscriptions.retain(|sub| sub.id != self.id);
            debug!("[memory-relay] closed subscription {}", self.id);
        }
    }
}

#[async_trait]
impl RelayTransport for MemoryRelay {
    async fn publish(&self, event: &Event, relays: &[String]) -> Nip46Result<Vec<PublishOutcome>> {
        self.inner.publish_count.fetch_add(1, Ordering::SeqCst);

        let rejection = self.inner.reject_with.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(message) = rejection {
            return Ok(relays.iter().map(|r| PublishOutcome::rejected(r, message.clone())).collect());
        }

        if let Err(e) = event.verify() {
            warn!("[memory-relay] rejecting invalid event {}: {}", event.id, e);
            return Ok(relays
                .iter()
                .map(|r| PublishOutcome::rejected(r, format!("invalid: {}", e)))
                .collect());
        }

        self.inner.published.lock().unwrap_or_else(|e| e.into_inner()).push(event.clone());
        if self.inner.store_events.load(Ordering::SeqCst) {
            self.inner.stored.lock().unwrap_or_else(|e| e.into_inner()).push(event.clone());
        }
        self.inner.deliver(event);

        let responder = self.inner.responder.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(responder) = responder {
            for reply in responder(event) {
                self.inner.deliver(&reply);
            }
        }

        Ok(relays.iter().map(|r| PublishOutcome::accepted(r)).collect())
    }

    async fn subscribe(&self, relays: &[String], filters: Vec<Filter>) -> Nip46Result<Subscription> {
        if relays.is_empty() {
            return Err(Nip46Error::Transport("no relays to subscribe to".to_string()));
        }
        let (sender, events) = mpsc::unbounded();

        let stored = self.inner.stored.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for event in stored.iter().filter(|e| filters.iter().any(|f| f.matches(e))) {
            let _ = sender.unbounded_send(RelayMessage::Event(event.clone()));
        }
        let _ = sender.unbounded_send(RelayMessage::EndOfStoredEvents);

        let id = self.inner.next_sub_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(MemorySubscription { id, filters, sender });
        debug!("[memory-relay] opened subscription {} on {} relay(s)", id, relays.len());

        Ok(Subscription {
            events,
            handle: Box::new(MemorySubscriptionHandle {
                relay: Arc::downgrade(&self.inner),
                id,
            }),
        })
    }
}
