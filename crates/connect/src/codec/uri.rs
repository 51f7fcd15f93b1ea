//! Connection-string parsing and generation for `bunker://` and
//! `nostrconnect://` URIs, plus the relay/metadata normalisers they share.

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use url::{form_urlencoded, Url};

use super::bech32::normalize_pubkey;
use crate::crypto::Algorithm;
use crate::error::{Nip46Error, Nip46Result};

/// Which side minted the connection string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// `nostrconnect://`: the authority is the local client's ephemeral key.
    Client,
    /// `bunker://`: the authority is the remote signer (or an alias).
    Remote,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionScheme {
    #[serde(rename = "bunker")]
    Bunker,
    #[serde(rename = "nostrconnect")]
    NostrConnect,
    #[serde(rename = "web+nostrconnect")]
    WebNostrConnect,
}

impl ConnectionScheme {
    fn parse(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "bunker" => Some(Self::Bunker),
            "nostrconnect" => Some(Self::NostrConnect),
            "web+nostrconnect" => Some(Self::WebNostrConnect),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bunker => "bunker",
            Self::NostrConnect => "nostrconnect",
            Self::WebNostrConnect => "web+nostrconnect",
        }
    }

    pub fn kind(&self) -> ConnectionKind {
        match self {
            Self::Bunker => ConnectionKind::Remote,
            _ => ConnectionKind::Client,
        }
    }
}

/// Client application metadata advertised to the signer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
}

impl Metadata {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.url.is_empty() && self.image.is_empty()
    }

    /// Trimmed copy; blank fields become empty.
    pub fn sanitized(&self) -> Metadata {
        Metadata {
            name: self.name.trim().to_string(),
            url: self.url.trim().to_string(),
            image: self.image.trim().to_string(),
        }
    }

    /// Field-wise merge; non-empty fields of `overrides` win.
    pub fn merged_with(&self, overrides: &Metadata) -> Metadata {
        let pick = |a: &String, b: &String| if b.trim().is_empty() { a.clone() } else { b.trim().to_string() };
        Metadata {
            name: pick(&self.name, &overrides.name),
            url: pick(&self.url, &overrides.url),
            image: pick(&self.image, &overrides.image),
        }
        .sanitized()
    }

    fn pairs(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [("name", self.name.as_str()), ("url", self.url.as_str()), ("image", self.image.as_str())]
            .into_iter()
            .filter(|(_, v)| !v.is_empty())
    }
}

/// Parsed connection string. Produced only by [`parse_connection_string`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub scheme: ConnectionScheme,
    pub kind: ConnectionKind,
    pub remote_pubkey: String,
    pub client_pubkey: String,
    pub relays: Vec<String>,
    pub secret: String,
    pub permissions: String,
    pub metadata: Metadata,
    pub user_pubkey_hint: String,
}

const REMOTE_SIGNER_PARAM_KEYS: &[&str] = &[
    "remote-signer-key",
    "remote_signer_key",
    "remotesignerkey",
    "remoteSignerKey",
    "remote-signer-pubkey",
    "remote_signer_pubkey",
    "remoteSignerPubkey",
];
const REMOTE_FALLBACK_PARAM_KEYS: &[&str] = &["remote", "remotePubkey", "signer"];
const USER_PARAM_KEYS: &[&str] = &["user", "user_pubkey", "user-pubkey", "pubkey", "npub", "profile"];

struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    fn from_url(url: &Url) -> Self {
        QueryParams(
            url.query_pairs()
                .map(|(k, v)| (k.into_owned(), v.trim().to_string()))
                .collect(),
        )
    }

    /// First non-empty value for `key`.
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, v)| k == key && !v.is_empty())
            .map(|(_, v)| v.as_str())
    }

    fn get_all(&self, key: &str) -> Vec<String> {
        self.0
            .iter()
            .filter(|(k, v)| k == key && !v.is_empty())
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn first_of(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.get(k))
    }
}

/// Authority of the URI, falling back to the path for `scheme:value` forms.
fn authority(url: &Url) -> String {
    match url.host_str() {
        Some(host) if !host.is_empty() => host.to_string(),
        _ => url.path().trim_start_matches('/').to_string(),
    }
}

/// Parse a `bunker://` or `nostrconnect://` connection string.
///
/// Returns `None` for blank input, unparsable URLs and unknown schemes; a
/// partially understood descriptor is never returned.
pub fn parse_connection_string(uri: &str) -> Option<ConnectionDescriptor> {
    let value = uri.trim();
    if value.is_empty() {
        return None;
    }
    let url = Url::parse(value).ok()?;
    let scheme = ConnectionScheme::parse(url.scheme())?;
    let params = QueryParams::from_url(&url);

    let relays = params.get_all("relay");
    let permissions = params
        .first_of(&["perms", "permissions"])
        .unwrap_or_default()
        .to_string();
    let metadata = Metadata {
        name: params.get("name").unwrap_or_default().to_string(),
        url: params.get("url").unwrap_or_default().to_string(),
        image: params.get("image").unwrap_or_default().to_string(),
    };

    let remote_signer_param = params.first_of(REMOTE_SIGNER_PARAM_KEYS).unwrap_or_default();
    let mut remote_pubkey = if remote_signer_param.is_empty() {
        params.first_of(REMOTE_FALLBACK_PARAM_KEYS).unwrap_or_default().to_string()
    } else {
        remote_signer_param.to_string()
    };
    let mut client_pubkey = String::new();
    let mut user_pubkey_hint = String::new();

    match scheme.kind() {
        ConnectionKind::Remote => {
            let identifier = normalize_pubkey(&authority(&url));
            if !remote_signer_param.is_empty() {
                user_pubkey_hint = identifier.clone();
            } else if remote_pubkey.is_empty() {
                remote_pubkey = identifier.clone();
            }

            if user_pubkey_hint.is_empty() {
                user_pubkey_hint = USER_PARAM_KEYS
                    .iter()
                    .filter_map(|k| params.get(k))
                    .map(normalize_pubkey)
                    .find(|v| !v.is_empty())
                    .unwrap_or_default();
                let remote_normalized = normalize_pubkey(&remote_pubkey);
                if user_pubkey_hint.is_empty() && !identifier.is_empty() && identifier != remote_normalized {
                    user_pubkey_hint = identifier;
                }
            }
        }
        ConnectionKind::Client => {
            client_pubkey = authority(&url);
        }
    }

    Some(ConnectionDescriptor {
        scheme,
        kind: scheme.kind(),
        remote_pubkey: normalize_pubkey(&remote_pubkey),
        client_pubkey: normalize_pubkey(&client_pubkey),
        relays,
        secret: params.get("secret").unwrap_or_default().to_string(),
        permissions,
        metadata,
        user_pubkey_hint: normalize_pubkey(&user_pubkey_hint),
    })
}

/// Build the canonical client-initiated `nostrconnect://` URI.
pub fn build_connection_uri(
    client_pubkey: &str,
    relays: &[String],
    secret: &str,
    permissions: &str,
    metadata: &Metadata,
) -> String {
    let mut query = form_urlencoded::Serializer::new(String::new());
    for relay in relays {
        query.append_pair("relay", relay);
    }
    if !secret.is_empty() {
        query.append_pair("secret", secret);
    }
    if !permissions.trim().is_empty() {
        query.append_pair("perms", permissions.trim());
    }
    for (key, value) in metadata.sanitized().pairs() {
        query.append_pair(key, value);
    }
    let query = query.finish();
    if query.is_empty() {
        format!("nostrconnect://{}", client_pubkey)
    } else {
        format!("nostrconnect://{}?{}", client_pubkey, query)
    }
}

/// Clean a relay list: `ws://`/`wss://` only, no whitespace, no trailing
/// slashes, order-preserving de-duplication. With `enforce_tls`, `ws://`
/// relays are upgraded to `wss://`.
pub fn sanitize_relay_list<S: AsRef<str>>(list: &[S], enforce_tls: bool) -> Vec<String> {
    let mut seen = FxHashSet::default();
    let mut out = Vec::with_capacity(list.len());

    for value in list {
        let trimmed = value.as_ref().trim();
        if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
            continue;
        }
        let lower = trimmed.to_ascii_lowercase();
        if !(lower.starts_with("ws://") || lower.starts_with("wss://")) {
            continue;
        }
        let Some(mut normalized) = normalize_relay_url(trimmed.trim_end_matches('/')) else {
            continue;
        };
        if enforce_tls && normalized.starts_with("ws://") {
            normalized = format!("wss://{}", &normalized["ws://".len()..]);
        }
        if seen.insert(normalized.clone()) {
            out.push(normalized);
        }
    }
    out
}

fn normalize_relay_url(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str().filter(|h| !h.is_empty())?;
    let port = parsed.port().map(|p| format!(":{}", p)).unwrap_or_default();
    let path = parsed.path().trim_end_matches('/');
    let query = parsed.query().map(|q| format!("?{}", q)).unwrap_or_default();
    Some(format!("{}://{}{}{}{}", parsed.scheme(), host, port, path, query))
}

/// First non-empty sanitised list among `primary`, `fallback`, `defaults`.
pub fn resolve_relays(
    primary: &[String],
    fallback: &[String],
    defaults: &[String],
    enforce_tls: bool,
) -> Vec<String> {
    for list in [primary, fallback] {
        let sanitized = sanitize_relay_list(list, enforce_tls);
        if !sanitized.is_empty() {
            return sanitized;
        }
    }
    sanitize_relay_list(defaults, enforce_tls)
}

/// Random shared secret as hex; `len` bytes clamped to 8..=64.
///
/// Fails when the OS entropy source is unavailable.
pub fn generate_secret(len: usize) -> Nip46Result<String> {
    let mut bytes = vec![0u8; len.clamp(8, 64)];
    getrandom::getrandom(&mut bytes).map_err(|e| Nip46Error::Crypto(format!("secret generation failed: {}", e)))?;
    Ok(hex::encode(bytes))
}

/// Map algorithm names and their common aliases onto [`Algorithm`].
pub fn normalize_encryption_algorithm(value: &str) -> Option<Algorithm> {
    match value.trim().to_ascii_lowercase().as_str() {
        "nip44.v2" | "nip44v2" | "nip44-v2" | "nip44_v2" => Some(Algorithm::Nip44V2),
        "nip44" | "nip44-v1" | "nip44v1" | "nip44_v1" | "nip-44" => Some(Algorithm::Nip44),
        "nip04" | "nip-04" | "nip04.v1" => Some(Algorithm::Nip04),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REMOTE: &str = "7e7e9c42a91bfef19fa929e5fda1b72e0ebc1a4c1141673e2794234d86addf4e";
    const USER: &str = "3bf0c63fcb93463407af97a5e5ee64fa883d107ef9e558472c4eb9aaaefa459d";
    const USER_NPUB: &str = "npub180cvv07tjdrrgpa0j7j7tmnyl2yr6yr7l8j4s3evf6u64th6gkwsyjh6w6";

    #[test]
    fn test_parse_bunker_uri() {
        let uri = format!(
            "bunker://{}?relay=wss%3A%2F%2Frelay.one&relay=wss://relay.two&secret=s3cr3t&perms=sign_event%3A1,nip44_encrypt",
            REMOTE
        );
        let parsed = parse_connection_string(&uri).unwrap();
        assert_eq!(parsed.scheme, ConnectionScheme::Bunker);
        assert_eq!(parsed.kind, ConnectionKind::Remote);
        assert_eq!(parsed.remote_pubkey, REMOTE);
        assert_eq!(parsed.relays, vec!["wss://relay.one", "wss://relay.two"]);
        assert_eq!(parsed.secret, "s3cr3t");
        assert_eq!(parsed.permissions, "sign_event:1,nip44_encrypt");
        assert_eq!(parsed.user_pubkey_hint, "");
    }

    #[test]
    fn test_bunker_remote_signer_param_overrides_authority() {
        let uri = format!("bunker://{}?remote-signer-key={}&relay=wss://r", USER_NPUB, REMOTE);
        let parsed = parse_connection_string(&uri).unwrap();
        assert_eq!(parsed.remote_pubkey, REMOTE);
        assert_eq!(parsed.user_pubkey_hint, USER);
    }

    #[test]
    fn test_bunker_user_param_hint() {
        let uri = format!("bunker://{}?user={}", REMOTE, USER_NPUB);
        let parsed = parse_connection_string(&uri).unwrap();
        assert_eq!(parsed.remote_pubkey, REMOTE);
        assert_eq!(parsed.user_pubkey_hint, USER);
    }

    #[test]
    fn test_parse_nostrconnect_uri() {
        let uri = format!(
            "nostrconnect://{}?relay=wss://r1&secret=abc123&name=My%20App&perms=sign_event",
            USER
        );
        let parsed = parse_connection_string(&uri).unwrap();
        assert_eq!(parsed.kind, ConnectionKind::Client);
        assert_eq!(parsed.client_pubkey, USER);
        assert_eq!(parsed.remote_pubkey, "");
        assert_eq!(parsed.metadata.name, "My App");
        assert_eq!(parsed.secret, "abc123");
        assert_eq!(parsed.permissions, "sign_event");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_connection_string("").is_none());
        assert!(parse_connection_string("   ").is_none());
        assert!(parse_connection_string("not a uri").is_none());
        assert!(parse_connection_string("https://example.com/?relay=wss://r").is_none());
    }

    #[test]
    fn test_build_then_parse() {
        let metadata = Metadata {
            name: "Demo & Co".into(),
            url: "https://demo.example".into(),
            image: String::new(),
        };
        let relays = vec!["wss://relay.one".to_string(), "wss://relay.two/path".to_string()];
        let uri = build_connection_uri(USER, &relays, "feedface", "sign_event:1", &metadata);
        assert!(uri.starts_with(&format!("nostrconnect://{}?relay=", USER)));

        let parsed = parse_connection_string(&uri).unwrap();
        assert_eq!(parsed.client_pubkey, USER);
        assert_eq!(parsed.relays, relays);
        assert_eq!(parsed.secret, "feedface");
        assert_eq!(parsed.permissions, "sign_event:1");
        assert_eq!(parsed.metadata, metadata);
    }

    #[test]
    fn test_sanitize_relay_list() {
        let relays = vec![
            " wss://relay.one/ ",
            "wss://relay.one",
            "https://not-a-relay",
            "ws://plain.relay//",
            "wss://bad relay",
            "",
        ];
        assert_eq!(
            sanitize_relay_list(&relays, false),
            vec!["wss://relay.one", "ws://plain.relay"]
        );
        assert_eq!(
            sanitize_relay_list(&relays, true),
            vec!["wss://relay.one", "wss://plain.relay"]
        );
    }

    #[test]
    fn test_resolve_relays_fallbacks() {
        let defaults = vec!["wss://default".to_string()];
        let fallback = vec!["wss://fallback".to_string()];
        assert_eq!(resolve_relays(&[], &fallback, &defaults, true), fallback);
        assert_eq!(resolve_relays(&["junk".to_string()], &[], &defaults, true), defaults);
    }

    #[test]
    fn test_generate_secret_clamps() {
        assert_eq!(generate_secret(16).unwrap().len(), 32);
        assert_eq!(generate_secret(1).unwrap().len(), 16);
        assert_eq!(generate_secret(500).unwrap().len(), 128);
        assert_ne!(generate_secret(16).unwrap(), generate_secret(16).unwrap());
    }

    #[test]
    fn test_algorithm_aliases() {
        assert_eq!(normalize_encryption_algorithm("NIP44-V2"), Some(Algorithm::Nip44V2));
        assert_eq!(normalize_encryption_algorithm("nip-44"), Some(Algorithm::Nip44));
        assert_eq!(normalize_encryption_algorithm("nip04.v1"), Some(Algorithm::Nip04));
        assert_eq!(normalize_encryption_algorithm("rot13"), None);
    }
}
