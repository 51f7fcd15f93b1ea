#![allow(clippy::needless_return)]
#![allow(clippy::should_implement_trait)]

//! NIP-46 remote signing ("Nostr Connect").
//!
//! - `codec`: `bunker://` / `nostrconnect://` strings, `npub` and relay lists
//! - `crypto`: NIP-44 v2 / NIP-04 payload ciphers and candidate decryption
//! - `store`: versioned, optionally passphrase-sealed session records
//! - `queue`: prioritised single-flight request queue
//! - `rpc`: one encrypted request/response session with a remote signer
//! - `handshake`: connect, handshake and reconnect flows
//! - `registry`: which session signs for which user
//!
//! Relays are reached through the [`RelayTransport`] trait; [`MemoryRelay`]
//! is an in-process loopback implementation.

pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod queue;
pub mod registry;
pub mod rpc;
pub mod store;
pub mod telemetry;
pub mod transport;
pub mod types;
pub mod util;

pub use codec::{build_connection_uri, parse_connection_string, ConnectionDescriptor, ConnectionKind, Metadata};
pub use config::{ConnectConfig, KdfConfig};
pub use crypto::{Algorithm, CipherCapabilities, CipherSuite};
pub use error::{Nip46Error, Nip46Result};
pub use handshake::{
    AuthPhase, AuthPrompt, ConnectRequest, ConnectStatus, ConnectedSigner, HandshakeAck, HandshakeCoordinator,
    HandshakeState, HandshakeWait, PrepareOptions, PreparedHandshake, PubkeyValidator, ReconnectOptions,
};
pub use queue::{Priority, RequestQueue};
pub use registry::SignerRegistry;
pub use rpc::{RpcOptions, RpcSession, SessionOptions};
pub use store::{FileStorage, MemoryStorage, SessionRecord, SessionStore, StorageBackend};
pub use transport::{EventSigner, LocalKeySigner, MemoryRelay, PublishOutcome, RelayMessage, RelayTransport, Subscription};
pub use types::{Event, Filter, Keys, PublicKey, SecretKey, UnsignedEvent, NIP46_RPC_KIND};
