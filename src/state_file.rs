//! JSON persistence of contract state between CLI runs.
//!
//! The file is a flat object mapping each raw store key to its base64
//! value. Keys that are not UTF-8, or that would be mistaken for hex, are
//! written as `0x`-prefixed hex.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use wasmhost_core::Dict;
use wasmhost_types::encoding::{base64_decode, base64_encode, parse_hex};

const HEX_PREFIX: &str = "0x";

fn encode_key(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(text) if !text.starts_with(HEX_PREFIX) => text.to_string(),
        _ => format!("{HEX_PREFIX}{}", hex::encode(key)),
    }
}

fn decode_key(key: &str) -> Result<Vec<u8>> {
    if key.starts_with(HEX_PREFIX) {
        parse_hex(key, "state key")
    } else {
        Ok(key.as_bytes().to_vec())
    }
}

/// Render a store as the state-file object.
pub fn to_json(state: &Dict) -> serde_json::Map<String, serde_json::Value> {
    state
        .entries()
        .into_iter()
        .map(|(key, value)| (encode_key(&key), serde_json::Value::String(base64_encode(&value))))
        .collect()
}

pub fn from_json(text: &str) -> Result<Dict> {
    let raw: BTreeMap<String, String> =
        serde_json::from_str(text).context("State file must be a JSON object of base64 strings")?;
    let mut entries = BTreeMap::new();
    for (key, value) in raw {
        let decoded = base64_decode(&value, &format!("state value for '{key}'"))?;
        entries.insert(decode_key(&key)?, decoded);
    }
    Ok(Dict::from(entries))
}

/// Load a state file; a missing file is an empty state.
pub fn load(path: &Path) -> Result<Dict> {
    if !path.exists() {
        return Ok(Dict::new());
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read state file {}", path.display()))?;
    from_json(&text).with_context(|| format!("Invalid state file {}", path.display()))
}

pub fn save(path: &Path, state: &Dict) -> Result<()> {
    let json = serde_json::to_string_pretty(&to_json(state))?;
    fs::write(path, json + "\n")
        .with_context(|| format!("Failed to write state file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_survive_the_file_format() {
        let state = Dict::new();
        state.insert(b"counter".to_vec(), 7i64.to_le_bytes().to_vec());
        state.insert(b"list#0".to_vec(), b"first".to_vec());
        state.insert(vec![0xff, 0x00], vec![1]);
        state.insert(b"0xlooks-like-hex".to_vec(), vec![2]);

        let json = to_json(&state);
        assert!(json.contains_key("counter"));
        assert!(json.contains_key("0xff00"));

        let text = serde_json::to_string(&json).unwrap();
        assert_eq!(from_json(&text).unwrap(), state);
    }

    #[test]
    fn test_missing_file_is_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let state = load(&dir.path().join("absent.json")).unwrap();
        assert!(state.is_empty());
    }

    #[test]
    fn test_bad_base64_names_the_key() {
        let err = from_json(r#"{"counter": "%%%"}"#).unwrap_err();
        assert!(format!("{err:#}").contains("counter"));
    }
}
