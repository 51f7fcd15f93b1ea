//! Manual bech32 codec for `npub` public keys (NIP-19).
//!
//! Only the `npub` human readable part is supported; that is all the
//! connection engine needs to accept user-supplied pubkeys.

const CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";
const GENERATORS: [u32; 5] = [0x3b6a_57b2, 0x2650_8e6d, 0x1ea1_19fa, 0x3d42_33dd, 0x2a14_62b3];
const CHECKSUM_LEN: usize = 6;
const MAX_LEN: usize = 90;

pub const NPUB_HRP: &str = "npub";

fn decode_char(c: u8) -> Option<u8> {
    CHARSET.iter().position(|&x| x == c).map(|p| p as u8)
}

fn polymod(values: &[u8]) -> u32 {
    let mut chk: u32 = 1;
    for &v in values {
        let top = chk >> 25;
        chk = ((chk & 0x01ff_ffff) << 5) ^ v as u32;
        for (i, gen) in GENERATORS.iter().enumerate() {
            if (top >> i) & 1 == 1 {
                chk ^= gen;
            }
        }
    }
    chk
}

fn hrp_expand(hrp: &str) -> Vec<u8> {
    let bytes = hrp.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() * 2 + 1);
    out.extend(bytes.iter().map(|b| b >> 5));
    out.push(0);
    out.extend(bytes.iter().map(|b| b & 0x1f));
    out
}

fn create_checksum(hrp: &str, data: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut values = hrp_expand(hrp);
    values.extend_from_slice(data);
    values.extend_from_slice(&[0u8; CHECKSUM_LEN]);
    let pm = polymod(&values) ^ 1;
    let mut out = [0u8; CHECKSUM_LEN];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = ((pm >> (5 * (5 - i))) & 0x1f) as u8;
    }
    out
}

/// Regroup a bit stream. With `pad`, a trailing partial group is zero-filled;
/// without it, leftover bits must be zero padding shorter than `from_bits`.
fn convert_bits(data: &[u8], from_bits: u32, to_bits: u32, pad: bool) -> Option<Vec<u8>> {
    let mut acc = 0u32;
    let mut bits = 0u32;
    let mut ret = Vec::with_capacity(data.len() * from_bits as usize / to_bits as usize + 1);
    let maxv = (1u32 << to_bits) - 1;

    for &value in data {
        if (value as u32) >> from_bits != 0 {
            return None;
        }
        acc = (acc << from_bits) | value as u32;
        bits += from_bits;
        while bits >= to_bits {
            bits -= to_bits;
            ret.push(((acc >> bits) & maxv) as u8);
        }
    }

    if pad {
        if bits > 0 {
            ret.push(((acc << (to_bits - bits)) & maxv) as u8);
        }
    } else if bits >= from_bits || ((acc << (to_bits - bits)) & maxv) != 0 {
        return None;
    }

    Some(ret)
}

/// Encode bytes under `hrp`.
pub fn encode(hrp: &str, payload: &[u8]) -> Option<String> {
    let data = convert_bits(payload, 8, 5, true)?;
    let checksum = create_checksum(hrp, &data);
    let mut out = String::with_capacity(hrp.len() + 1 + data.len() + CHECKSUM_LEN);
    out.push_str(hrp);
    out.push('1');
    for d in data.iter().chain(checksum.iter()) {
        out.push(CHARSET[*d as usize] as char);
    }
    Some(out)
}

/// Decode a bech32 string into `(hrp, payload)`. Rejects mixed case, unknown
/// characters and bad checksums.
pub fn decode(input: &str) -> Option<(String, Vec<u8>)> {
    if input.len() > MAX_LEN || !input.is_ascii() {
        return None;
    }
    let has_lower = input.bytes().any(|b| b.is_ascii_lowercase());
    let has_upper = input.bytes().any(|b| b.is_ascii_uppercase());
    if has_lower && has_upper {
        return None;
    }
    let lowered = input.to_ascii_lowercase();
    let sep = lowered.rfind('1')?;
    if sep == 0 || sep + 1 + CHECKSUM_LEN > lowered.len() {
        return None;
    }
    let hrp = &lowered[..sep];
    if hrp.bytes().any(|b| !(33..=126).contains(&b)) {
        return None;
    }

    let data = lowered[sep + 1..]
        .bytes()
        .map(decode_char)
        .collect::<Option<Vec<u8>>>()?;

    let mut values = hrp_expand(hrp);
    values.extend_from_slice(&data);
    if polymod(&values) != 1 {
        return None;
    }

    let payload = convert_bits(&data[..data.len() - CHECKSUM_LEN], 5, 8, false)?;
    Some((hrp.to_string(), payload))
}

/// Decode an `npub` into 64-char lowercase hex, or `None`.
pub fn decode_npub(value: &str) -> Option<String> {
    let (hrp, payload) = decode(value.trim())?;
    if hrp != NPUB_HRP || payload.len() != 32 {
        return None;
    }
    Some(hex::encode(payload))
}

/// Encode a 64-char hex pubkey as `npub`. Returns `""` for anything else.
pub fn encode_pubkey(hex_value: &str) -> String {
    let trimmed = hex_value.trim();
    if !is_hex_pubkey(trimmed) {
        return String::new();
    }
    match hex::decode(trimmed) {
        Ok(bytes) => encode(NPUB_HRP, &bytes).unwrap_or_default(),
        Err(_) => String::new(),
    }
}

pub fn is_hex_pubkey(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Normalise a user-supplied pubkey.
///
/// Hex and valid `npub` inputs yield 64-char lowercase hex. Any other
/// non-empty value is returned trimmed and lowercased so that ambiguous
/// identifiers still flow through as hints; blank input yields `""`.
pub fn normalize_pubkey(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if is_hex_pubkey(trimmed) {
        return trimmed.to_ascii_lowercase();
    }
    if trimmed.to_ascii_lowercase().starts_with("npub1") {
        if let Some(hex) = decode_npub(trimmed) {
            return hex;
        }
    }
    trimmed.to_ascii_lowercase()
}

/// Strict variant: 64-char hex or `""`.
pub fn strict_pubkey(value: &str) -> String {
    let normalized = normalize_pubkey(value);
    if is_hex_pubkey(&normalized) {
        normalized
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, RngCore, SeedableRng};

    const VECTORS: &[(&str, &str)] = &[
        (
            "7e7e9c42a91bfef19fa929e5fda1b72e0ebc1a4c1141673e2794234d86addf4e",
            "npub10elfcs4fr0l0r8af98jlmgdh9c8tcxjvz9qkw038js35mp4dma8qzvjptg",
        ),
        (
            "3bf0c63fcb93463407af97a5e5ee64fa883d107ef9e558472c4eb9aaaefa459d",
            "npub180cvv07tjdrrgpa0j7j7tmnyl2yr6yr7l8j4s3evf6u64th6gkwsyjh6w6",
        ),
    ];

    #[test]
    fn test_known_vectors() {
        for (hex, npub) in VECTORS {
            assert_eq!(encode_pubkey(hex), *npub);
            assert_eq!(decode_npub(npub).as_deref(), Some(*hex));
            assert_eq!(normalize_pubkey(npub), *hex);
        }
    }

    #[test]
    fn test_roundtrip_random_keys() {
        let mut rng = SmallRng::seed_from_u64(46);
        for _ in 0..64 {
            let mut bytes = [0u8; 32];
            rng.fill_bytes(&mut bytes);
            let hex = hex::encode(bytes);
            let npub = encode_pubkey(&hex);
            assert_eq!(decode_npub(&npub).as_deref(), Some(hex.as_str()));
            assert_eq!(encode_pubkey(&decode_npub(&npub).unwrap()), npub);
        }
    }

    #[test]
    fn test_corrupted_checksum_rejected() {
        let (_, npub) = VECTORS[0];
        for idx in 5..npub.len() {
            let mut chars: Vec<u8> = npub.bytes().collect();
            chars[idx] = if chars[idx] == b'q' { b'p' } else { b'q' };
            let corrupted = String::from_utf8(chars).unwrap();
            assert_eq!(decode_npub(&corrupted), None, "accepted corruption at {}", idx);
        }
    }

    #[test]
    fn test_rejects_mixed_case_and_wrong_hrp() {
        let (hex, npub) = VECTORS[1];
        let mixed = format!("N{}", &npub[1..]);
        assert_eq!(decode_npub(&mixed), None);
        assert_eq!(decode_npub(&npub.to_uppercase()).as_deref(), Some(hex));

        let bytes = hex::decode(hex).unwrap();
        let note = encode("note", &bytes).unwrap();
        assert_eq!(decode_npub(&note), None);
    }

    #[test]
    fn test_normalize_pubkey_variants() {
        let (hex, _) = VECTORS[0];
        assert_eq!(normalize_pubkey(&format!("  {}  ", hex.to_uppercase())), hex);
        assert_eq!(normalize_pubkey("   "), "");
        assert_eq!(normalize_pubkey("Alice@Example.com"), "alice@example.com");
        assert_eq!(strict_pubkey("alice"), "");
        assert_eq!(encode_pubkey("not-hex"), "");
    }
}
