//! Connection material codecs: `npub` bech32 and NIP-46 connection URIs.

pub mod bech32;
pub mod uri;

pub use bech32::{decode_npub, encode_pubkey, is_hex_pubkey, normalize_pubkey, strict_pubkey};
pub use uri::{
    build_connection_uri, generate_secret, normalize_encryption_algorithm, parse_connection_string,
    resolve_relays, sanitize_relay_list, ConnectionDescriptor, ConnectionKind, ConnectionScheme,
    Metadata,
};
