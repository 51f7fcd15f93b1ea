#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use nostr_connect::crypto::CipherHandle;
use nostr_connect::{
    parse_connection_string, Algorithm, ConnectConfig, Event, EventSigner, HandshakeCoordinator, KdfConfig, Keys,
    LocalKeySigner, MemoryRelay, PublicKey, SessionStore, UnsignedEvent, NIP46_RPC_KIND,
};
use serde_json::{json, Value};

pub const RELAY: &str = "wss://relay.test";

pub fn test_config() -> ConnectConfig {
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

pub fn coordinator(relay: &MemoryRelay, store: SessionStore) -> HandshakeCoordinator {
    HandshakeCoordinator::new(
        Arc::new(test_config()),
        Arc::new(relay.clone()),
        Arc::new(LocalKeySigner),
        store,
    )
}

pub async fn wait_for_subscriptions(relay: &MemoryRelay, count: usize) {
    while relay.subscription_count() < count {
        tokio::task::yield_now().await;
    }
}

struct SignerState {
    secret: Mutex<String>,
    auth_challenges: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

/// A bunker that answers NIP-46 requests addressed to it over a
/// [`MemoryRelay`], signing on behalf of `user`.
#[derive(Clone)]
pub struct SimulatedSigner {
    pub bunker: Keys,
    pub user: Keys,
    relay: MemoryRelay,
    state: Arc<SignerState>,
}

impl SimulatedSigner {
    pub fn install(relay: &MemoryRelay, secret: &str) -> Self {
        let signer = SimulatedSigner {
            bunker: Keys::generate().unwrap(),
            user: Keys::generate().unwrap(),
            relay: relay.clone(),
            state: Arc::new(SignerState {
                secret: Mutex::new(secret.to_string()),
                auth_challenges: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
            }),
        };
        let responder = signer.clone();
        relay.set_responder(move |event| responder.respond(event).into_iter().collect());
        signer
    }

    pub fn bunker_uri(&self) -> String {
        let secret = self.state.secret.lock().unwrap().clone();
        format!("bunker://{}?relay={}&secret={}", self.bunker.public_key.to_hex(), RELAY, secret)
    }

    pub fn user_hex(&self) -> String {
        self.user.public_key.to_hex()
    }

    /// Answer the next `count` connect requests with an auth challenge.
    pub fn require_auth(&self, count: usize) {
        self.state.auth_challenges.store(count, Ordering::SeqCst);
    }

    pub fn rotate_secret(&self, secret: &str) {
        *self.state.secret.lock().unwrap() = secret.to_string();
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.calls.lock().unwrap().clone()
    }

    /// Scan a `nostrconnect://` URI and acknowledge it the way a signer app
    /// does: by echoing the secret to the client key.
    pub fn answer_handshake(&self, uri: &str) {
        let descriptor = parse_connection_string(uri).unwrap();
        *self.state.secret.lock().unwrap() = descriptor.secret.clone();
        let body = json!({ "id": "handshake", "result": descriptor.secret });
        self.relay.inject(&self.reply_to(&descriptor.client_pubkey, &body));
    }

    fn cipher_for(&self, client_hex: &str) -> Option<CipherHandle> {
        let client = PublicKey::from_hex(client_hex).ok()?;
        CipherHandle::derive(Algorithm::Nip44V2, &self.bunker.secret_key, &client).ok()
    }

    fn reply_to(&self, client_hex: &str, body: &Value) -> Event {
        let cipher = self.cipher_for(client_hex).unwrap();
        let unsigned = UnsignedEvent::new(
            &self.bunker.public_key.to_hex(),
            NIP46_RPC_KIND,
            cipher.encrypt(&body.to_string()).unwrap(),
            vec![vec!["p".to_string(), client_hex.to_string()]],
        );
        LocalKeySigner.sign_event(unsigned, &self.bunker.secret_key).unwrap()
    }

    fn respond(&self, event: &Event) -> Option<Event> {
        if event.kind != NIP46_RPC_KIND || !event.is_tagged_to(&self.bunker.public_key.to_hex()) {
            return None;
        }
        let plaintext = self.cipher_for(&event.pubkey)?.decrypt(&event.content).ok()?;
        let request: Value = serde_json::from_str(&plaintext).ok()?;
        let method = request["method"].as_str()?.to_string();
        let params: Vec<String> = serde_json::from_value(request["params"].clone()).ok()?;
        self.state.calls.lock().unwrap().push(method.clone());

        let mut body = self.handle(&method, &params);
        body["id"] = request["id"].clone();
        Some(self.reply_to(&event.pubkey, &body))
    }

    fn handle(&self, method: &str, params: &[String]) -> Value {
        match method {
            "connect" => {
                let pending = self.state.auth_challenges.load(Ordering::SeqCst);
                if pending > 0 {
                    self.state.auth_challenges.store(pending - 1, Ordering::SeqCst);
                    return json!({ "result": "auth_url", "error": "https://signer.test/approve" });
                }
                let secret = self.state.secret.lock().unwrap().clone();
                let offered = params.get(1).map(String::as_str).unwrap_or("");
                if secret.is_empty() || offered == secret {
                    json!({ "result": "ack" })
                } else {
                    json!({ "result": "wrong-secret" })
                }
            }
            "get_public_key" => json!({ "result": self.user_hex() }),
            "ping" => json!({ "result": "pong" }),
            "sign_event" => {
                let mut template: UnsignedEvent = match serde_json::from_str(&params[0]) {
                    Ok(template) => template,
                    Err(e) => return json!({ "error": e.to_string() }),
                };
                template.pubkey = self.user_hex();
                let signed = LocalKeySigner.sign_event(template, &self.user.secret_key).unwrap();
                json!({ "result": signed.as_json() })
            }
            _ => json!({ "error": format!("unsupported method {}", method) }),
        }
    }
}
