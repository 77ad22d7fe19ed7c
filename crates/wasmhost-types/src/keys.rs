//! Predefined keys.
//!
//! Predefined keys carry fixed negative IDs that guests compile in, so the
//! numbering is part of the wire contract: entries may be appended, never
//! reordered. Key names start with `$` so they never collide with keys a
//! contract interns for its own data.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Interned key identifier. Negative values are predefined, non-negative
/// values are assigned per call in registration order.
pub type KeyId = i32;

pub const KEY_ACCOUNT_ID: KeyId = -1;
pub const KEY_BALANCES: KeyId = -2;
pub const KEY_CALLER: KeyId = -3;
pub const KEY_CHAIN_ID: KeyId = -4;
pub const KEY_CHAIN_OWNER_ID: KeyId = -5;
pub const KEY_COLOR: KeyId = -6;
pub const KEY_CONTRACT: KeyId = -7;
pub const KEY_CONTRACT_CREATOR: KeyId = -8;
pub const KEY_EVENT: KeyId = -9;
pub const KEY_EXPORTS: KeyId = -10;
pub const KEY_INCOMING: KeyId = -11;
pub const KEY_LENGTH: KeyId = -12;
pub const KEY_LOG: KeyId = -13;
pub const KEY_MAPS: KeyId = -14;
pub const KEY_MINTED: KeyId = -15;
pub const KEY_PANIC: KeyId = -16;
pub const KEY_PARAMS: KeyId = -17;
pub const KEY_REQUEST_ID: KeyId = -18;
pub const KEY_RESULTS: KeyId = -19;
pub const KEY_RETURN: KeyId = -20;
pub const KEY_STATE: KeyId = -21;
pub const KEY_TIMESTAMP: KeyId = -22;
pub const KEY_TRACE: KeyId = -23;
pub const KEY_TRANSFERS: KeyId = -24;
pub const KEY_UTILITY: KeyId = -25;

/// Names of the predefined keys; entry `i` has ID `-(i + 1)`.
pub const PREDEFINED_KEYS: [&str; 25] = [
    "$accountID",
    "$balances",
    "$caller",
    "$chainID",
    "$chainOwnerID",
    "$color",
    "$contract",
    "$contractCreator",
    "$event",
    "$exports",
    "$incoming",
    "$length",
    "$log",
    "$maps",
    "$minted",
    "$panic",
    "$params",
    "$requestID",
    "$results",
    "$return",
    "$state",
    "$timestamp",
    "$trace",
    "$transfers",
    "$utility",
];

fn predefined_index() -> &'static HashMap<&'static [u8], KeyId> {
    static INDEX: OnceLock<HashMap<&'static [u8], KeyId>> = OnceLock::new();
    INDEX.get_or_init(|| {
        PREDEFINED_KEYS
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_bytes(), -(i as KeyId) - 1))
            .collect()
    })
}

/// Look up the fixed ID of a predefined key.
pub fn predefined_key_id(key: &[u8]) -> Option<KeyId> {
    predefined_index().get(key).copied()
}

/// Name of a predefined key, or `None` for non-negative or unknown IDs.
pub fn predefined_key(id: KeyId) -> Option<&'static str> {
    if id >= 0 {
        return None;
    }
    let index = usize::try_from(-(i64::from(id)) - 1).ok()?;
    PREDEFINED_KEYS.get(index).copied()
}

/// Iterate the full predefined table as `(id, name)` pairs.
pub fn predefined_keys() -> impl Iterator<Item = (KeyId, &'static str)> {
    PREDEFINED_KEYS
        .iter()
        .enumerate()
        .map(|(i, name)| (-(i as KeyId) - 1, *name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_match_table_positions() {
        assert_eq!(predefined_key(KEY_STATE), Some("$state"));
        assert_eq!(predefined_key(KEY_LENGTH), Some("$length"));
        assert_eq!(predefined_key(KEY_UTILITY), Some("$utility"));
        assert_eq!(predefined_key_id(b"$exports"), Some(KEY_EXPORTS));
    }

    #[test]
    fn lookup_is_a_bijection_over_the_table() {
        for (id, name) in predefined_keys() {
            assert!(id < 0);
            assert_eq!(predefined_key_id(name.as_bytes()), Some(id));
            assert_eq!(predefined_key(id), Some(name));
        }
    }

    #[test]
    fn out_of_table_ids_have_no_name() {
        assert_eq!(predefined_key(0), None);
        assert_eq!(predefined_key(7), None);
        assert_eq!(predefined_key(-26), None);
        assert_eq!(predefined_key(KeyId::MIN), None);
        assert_eq!(predefined_key_id(b"state"), None);
    }
}
