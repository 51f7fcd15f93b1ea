//! Small helpers shared across the engine: randomness, clock, log summaries.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Milliseconds since the unix epoch.
pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// `len` random bytes as lowercase hex. Falls back to a clock-derived value
/// if the OS entropy source fails, so only request ids are built from it.
fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    if getrandom::getrandom(&mut bytes).is_err() {
        let seed = unix_now_ms().to_be_bytes();
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = seed[i % seed.len()].wrapping_add(i as u8);
        }
    }
    hex::encode(bytes)
}

/// Request correlation id: 16 random bytes as hex.
pub fn request_id() -> String {
    random_hex(16)
}

/// `0123abcd…ef89 (len:64)` style summary of a hex value.
pub fn summarize_hex(value: &str) -> String {
    let normalized = value.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return String::new();
    }
    if normalized.len() <= 12 || !normalized.is_ascii() {
        return format!("{} (len:{})", normalized, normalized.len());
    }
    format!(
        "{}…{} (len:{})",
        &normalized[..8],
        &normalized[normalized.len() - 4..],
        normalized.len()
    )
}

/// Masked summary of a secret, revealing only its length.
pub fn summarize_secret(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }
    let len = trimmed.chars().count();
    let visible = if len <= 4 { "*".repeat(len) } else { "***…".to_string() };
    format!("{} (len:{})", visible, len)
}

/// Origin and path of a URL without its query string.
pub fn summarize_url(value: &str) -> String {
    let trimmed = value.trim();
    match url::Url::parse(trimmed) {
        Ok(parsed) => format!(
            "{}{}{}",
            parsed.origin().ascii_serialization(),
            parsed.path(),
            if parsed.query().is_some() { "?…" } else { "" }
        ),
        Err(_) => {
            let len = trimmed.chars().count();
            if len <= 64 {
                format!("{} (len:{})", trimmed, len)
            } else {
                let head: String = trimmed.chars().take(32).collect();
                format!("{}… (len:{})", head, len)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summaries() {
        assert_eq!(summarize_hex("ABCDEF"), "abcdef (len:6)");
        assert_eq!(
            summarize_hex(&"ab".repeat(32)),
            "abababab…abab (len:64)"
        );
        assert_eq!(summarize_secret(""), "<empty>");
        assert_eq!(summarize_secret("abc"), "*** (len:3)");
        assert_eq!(summarize_secret("abc123"), "***… (len:6)");
        assert_eq!(
            summarize_url("https://signer.example/auth?token=xyz"),
            "https://signer.example/auth?…"
        );
    }

    #[test]
    fn test_request_id_shape() {
        let id = request_id();
        assert_eq!(id.len(), 32);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(id, request_id());
    }
}
