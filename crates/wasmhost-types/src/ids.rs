//! Fixed-size chain identifiers.
//!
//! All identifiers travel as raw bytes of a fixed width; the constructors
//! here are the only place that width is checked.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("invalid {kind}: expected {expected} bytes, got {actual}")]
    BadLength {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("invalid {kind} hex: {reason}")]
    BadHex { kind: &'static str, reason: String },
}

macro_rules! fixed_id {
    ($(#[$meta:meta])* $name:ident, $len:expr, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; $len]);

        impl $name {
            pub const LENGTH: usize = $len;

            pub const fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdError> {
                let array: [u8; $len] = bytes.try_into().map_err(|_| IdError::BadLength {
                    kind: $kind,
                    expected: $len,
                    actual: bytes.len(),
                })?;
                Ok(Self(array))
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn to_vec(&self) -> Vec<u8> {
                self.0.to_vec()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self([0; $len])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let digits = s.strip_prefix("0x").unwrap_or(s);
                let bytes = hex::decode(digits).map_err(|e| IdError::BadHex {
                    kind: $kind,
                    reason: e.to_string(),
                })?;
                Self::from_bytes(&bytes)
            }
        }
    };
}

fixed_id!(
    /// Ledger address: one kind byte followed by a 32-byte hash.
    ScAddress,
    33,
    "address"
);
fixed_id!(
    /// Agent: an address plus the hname of a contract on that chain.
    ScAgentId,
    37,
    "agent id"
);
fixed_id!(ScChainId, 33, "chain id");
fixed_id!(
    /// Token color.
    ScColor,
    32,
    "color"
);
fixed_id!(ScHash, 32, "hash");
fixed_id!(
    /// Transaction id (32) followed by an output index (2).
    ScRequestId,
    34,
    "request id"
);

impl ScAddress {
    pub fn from_parts(kind: u8, hash: &[u8; 32]) -> Self {
        let mut bytes = [0u8; 33];
        bytes[0] = kind;
        bytes[1..].copy_from_slice(hash);
        Self(bytes)
    }

    pub fn kind(&self) -> u8 {
        self.0[0]
    }
}

impl ScAgentId {
    pub fn from_parts(address: &ScAddress, hname: ScHname) -> Self {
        let mut bytes = [0u8; 37];
        bytes[..33].copy_from_slice(address.as_bytes());
        bytes[33..].copy_from_slice(&hname.to_bytes());
        Self(bytes)
    }

    pub fn address(&self) -> ScAddress {
        let mut bytes = [0u8; 33];
        bytes.copy_from_slice(&self.0[..33]);
        ScAddress(bytes)
    }

    pub fn hname(&self) -> ScHname {
        ScHname(u32::from_le_bytes([self.0[33], self.0[34], self.0[35], self.0[36]]))
    }
}

impl ScChainId {
    /// The chain's own ledger address shares the chain id bytes.
    pub fn address(&self) -> ScAddress {
        ScAddress(self.0)
    }
}

impl ScColor {
    /// Color of the base token.
    pub const IOTA: ScColor = ScColor([0; 32]);
    /// Placeholder color meaning "mint a new color from this request".
    pub const MINT: ScColor = ScColor([0xff; 32]);
}

impl ScRequestId {
    pub fn from_parts(tx_id: &ScHash, output_index: u16) -> Self {
        let mut bytes = [0u8; 34];
        bytes[..32].copy_from_slice(tx_id.as_bytes());
        bytes[32..].copy_from_slice(&output_index.to_le_bytes());
        Self(bytes)
    }
}

/// Hashed contract or function name, 4 bytes little-endian on the wire.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScHname(pub u32);

impl ScHname {
    pub const LENGTH: usize = 4;

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdError> {
        let array: [u8; 4] = bytes.try_into().map_err(|_| IdError::BadLength {
            kind: "hname",
            expected: 4,
            actual: bytes.len(),
        })?;
        Ok(Self(u32::from_le_bytes(array)))
    }

    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for ScHname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl fmt::Debug for ScHname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScHname({self})")
    }
}

impl FromStr for ScHname {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u32::from_str_radix(s.strip_prefix("0x").unwrap_or(s), 16)
            .map(ScHname)
            .map_err(|e| IdError::BadHex {
                kind: "hname",
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_bytes_checks_width() {
        assert!(ScColor::from_bytes(&[7; 32]).is_ok());
        let err = ScAddress::from_bytes(&[0; 32]).unwrap_err();
        assert_eq!(
            err,
            IdError::BadLength {
                kind: "address",
                expected: 33,
                actual: 32
            }
        );
        assert!(ScHname::from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn agent_id_splits_into_address_and_hname() {
        let address = ScAddress::from_parts(1, &[9; 32]);
        let agent = ScAgentId::from_parts(&address, ScHname(0xdeadbeef));
        assert_eq!(agent.address(), address);
        assert_eq!(agent.hname(), ScHname(0xdeadbeef));
        assert_eq!(agent.as_bytes()[33..], [0xef, 0xbe, 0xad, 0xde]);
    }

    #[test]
    fn hex_display_parses_back() {
        let color = ScColor::new([0xab; 32]);
        let shown = color.to_string();
        assert!(shown.starts_with("0xabab"));
        assert_eq!(shown.parse::<ScColor>().unwrap(), color);
        assert_eq!("cafe0001".parse::<ScHname>().unwrap(), ScHname(0xcafe0001));
        assert!("0xzz".parse::<ScHash>().is_err());
    }
}
