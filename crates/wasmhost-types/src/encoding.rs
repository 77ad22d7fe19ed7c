//! Text encodings used by tooling (state files, CLI arguments and output).

use anyhow::{anyhow, Result};
use base64::Engine;

/// Encode bytes as standard base64.
pub fn base64_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Decode a standard base64 string.
///
/// The `context` parameter is used in error messages to identify what was
/// being decoded.
pub fn base64_decode(encoded: &str, context: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| anyhow!("Invalid {} base64: {}", context, e))
}

/// Parse a hex string with or without a `0x` prefix.
pub fn parse_hex(value: &str, context: &str) -> Result<Vec<u8>> {
    let value = value.trim();
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    hex::decode(digits).map_err(|e| anyhow!("Invalid {} hex '{}': {}", context, value, e))
}

/// Render bytes for display: the UTF-8 text when printable, hex otherwise.
pub fn display_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) if !text.is_empty() && text.chars().all(|c| !c.is_control()) => text.to_string(),
        _ => format!("0x{}", hex::encode(bytes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_roundtrip() {
        let original = b"hello world";
        let encoded = base64_encode(original);
        let decoded = base64_decode(&encoded, "test").unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_base64_decode_error() {
        let result = base64_decode("not-valid-base64!!!", "state value");
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid state value base64"));
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0x0a0b", "param").unwrap(), vec![10, 11]);
        assert_eq!(parse_hex("ff", "param").unwrap(), vec![255]);
        assert!(parse_hex("0xg1", "param").is_err());
    }

    #[test]
    fn test_display_bytes() {
        assert_eq!(display_bytes(b"counter"), "counter");
        assert_eq!(display_bytes(&[42, 0, 0, 0]), "0x2a000000");
        assert_eq!(display_bytes(&[]), "0x");
    }
}
