//! Decoding of pre-exchanged public key text.
//!
//! RSA and ECDSA keys carry a format prefix: `0x` (hex, `_` separators
//! allowed), `0s` (base64) or `0t` (literal text). The generic `pubkey`
//! option is plain base64 with no prefix.

use base64::{Engine as _, engine::general_purpose};

use crate::message::PubkeyAlg;

/// Decode `text` for `alg` into raw key bytes.
pub fn decode(alg: PubkeyAlg, text: &str) -> Result<Vec<u8>, String> {
    match alg {
        PubkeyAlg::Rsa | PubkeyAlg::Ecdsa => decode_prefixed(text),
        PubkeyAlg::Raw => decode_base64(text),
    }
}

/// Decode text whose first two characters name its encoding.
pub fn decode_prefixed(text: &str) -> Result<Vec<u8>, String> {
    let (prefix, body) = text
        .split_at_checked(2)
        .ok_or_else(|| "input too short for a format prefix".to_string())?;
    match prefix {
        "0x" | "0X" => decode_hex(body),
        "0s" | "0S" => decode_base64(body),
        "0t" | "0T" => Ok(body.as_bytes().to_vec()),
        _ => Err(format!("unknown format prefix {prefix:?}")),
    }
}

fn decode_base64(body: &str) -> Result<Vec<u8>, String> {
    let compact: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err("empty key".to_string());
    }
    general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| format!("bad base64: {e}"))
}

fn decode_hex(body: &str) -> Result<Vec<u8>, String> {
    let compact: String = body.chars().filter(|c| *c != '_').collect();
    if compact.is_empty() {
        return Err("empty key".to_string());
    }
    hex::decode(&compact).map_err(|e| format!("bad hex: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_hex_with_separators() {
        assert_eq!(
            decode_prefixed("0x0301_00ff").unwrap(),
            vec![0x03, 0x01, 0x00, 0xff]
        );
        assert_eq!(decode_prefixed("0XABcd").unwrap(), vec![0xab, 0xcd]);
    }

    #[test]
    fn test_base64_prefix() {
        assert_eq!(decode_prefixed("0sAwEAAQ==").unwrap(), vec![3, 1, 0, 1]);
    }

    #[test]
    fn test_text_prefix() {
        assert_eq!(decode_prefixed("0tkey").unwrap(), b"key".to_vec());
    }

    #[test]
    fn test_raw_pubkey_is_plain_base64() {
        assert_eq!(decode(PubkeyAlg::Raw, "AwEAAQ==").unwrap(), vec![3, 1, 0, 1]);
        // a prefix is not understood for the generic form
        assert!(decode(PubkeyAlg::Raw, "0x0301").is_err());
    }

    #[test]
    fn test_malformed_inputs() {
        assert!(decode(PubkeyAlg::Rsa, "AwEAAQ==").is_err());
        assert!(decode(PubkeyAlg::Rsa, "0x123").is_err());
        assert!(decode(PubkeyAlg::Rsa, "0xzz").is_err());
        assert!(decode(PubkeyAlg::Rsa, "0s!!!").is_err());
        assert!(decode(PubkeyAlg::Ecdsa, "0").is_err());
        assert!(decode(PubkeyAlg::Ecdsa, "0x").is_err());
    }

    #[test]
    fn test_hex_errors_name_the_encoding() {
        assert!(decode_prefixed("0x0g").unwrap_err().starts_with("bad hex"));
        assert!(decode_prefixed("0x12_3").unwrap_err().starts_with("bad hex"));
        assert_eq!(decode_prefixed("0x__").unwrap_err(), "empty key");
    }
}
