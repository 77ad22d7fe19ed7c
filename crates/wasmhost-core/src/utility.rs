//! Hashing, signature and encoding helpers behind the utility dispatch
//! functions.
//!
//! All cryptographic operations use fastcrypto.

use fastcrypto::bls12381::min_sig;
use fastcrypto::ed25519::{Ed25519PublicKey, Ed25519Signature};
use fastcrypto::groups::bls12381 as bls;
use fastcrypto::hash::{Blake2b256, HashFunction, Sha3_256};
use fastcrypto::serde_helpers::ToFromByteArray;
use fastcrypto::traits::{ToFromBytes, VerifyingKey};
use wasmhost_types::{ScAddress, ScHash, ScHname};

use crate::error::{HostError, HostResult};

/// Address kind byte of an ed25519-controlled address.
pub const ADDRESS_ED25519: u8 = 0;
/// Address kind byte of a BLS-controlled address.
pub const ADDRESS_BLS: u8 = 1;

pub const ED25519_PUBLIC_KEY_LENGTH: usize = 32;
pub const BLS_PUBLIC_KEY_LENGTH: usize = 96;
pub const BLS_SIGNATURE_LENGTH: usize = 48;

pub fn blake2b(data: &[u8]) -> ScHash {
    ScHash::new(Blake2b256::digest(data).digest)
}

pub fn sha3(data: &[u8]) -> ScHash {
    ScHash::new(Sha3_256::digest(data).digest)
}

/// Contract/function name hash: the first four bytes of the blake2b digest,
/// little-endian, skipping the reserved values 0 and `u32::MAX`.
pub fn hname_from_name(name: &str) -> ScHname {
    let digest = Blake2b256::digest(name.as_bytes()).digest;
    let first = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
    if first != 0 && first != u32::MAX {
        return ScHname(first);
    }
    ScHname(u32::from_le_bytes([digest[4], digest[5], digest[6], digest[7]]))
}

pub fn base58_encode(data: &[u8]) -> String {
    bs58::encode(data).into_string()
}

pub fn base58_decode(text: &str) -> HostResult<Vec<u8>> {
    bs58::decode(text)
        .into_vec()
        .map_err(|e| HostError::domain(format!("invalid base58: {e}")))
}

pub fn ed25519_address(public_key: &[u8]) -> HostResult<ScAddress> {
    <Ed25519PublicKey as ToFromBytes>::from_bytes(public_key)
        .map_err(|e| HostError::domain(format!("invalid ed25519 public key: {e}")))?;
    Ok(ScAddress::from_parts(ADDRESS_ED25519, &Blake2b256::digest(public_key).digest))
}

pub fn ed25519_valid(data: &[u8], public_key: &[u8], signature: &[u8]) -> bool {
    let Ok(signature) = <Ed25519Signature as ToFromBytes>::from_bytes(signature) else {
        return false;
    };
    let Ok(public_key) = <Ed25519PublicKey as ToFromBytes>::from_bytes(public_key) else {
        return false;
    };
    public_key.verify(data, &signature).is_ok()
}

fn bls_public_key(bytes: &[u8]) -> Option<min_sig::BLS12381PublicKey> {
    let pk = <min_sig::BLS12381PublicKey as ToFromBytes>::from_bytes(bytes).ok()?;
    pk.validate().ok()?;
    Some(pk)
}

pub fn bls_address(public_key: &[u8]) -> HostResult<ScAddress> {
    if bls_public_key(public_key).is_none() {
        return Err(HostError::domain("invalid BLS public key"));
    }
    Ok(ScAddress::from_parts(ADDRESS_BLS, &Blake2b256::digest(public_key).digest))
}

pub fn bls_valid(data: &[u8], public_key: &[u8], signature: &[u8]) -> bool {
    let Ok(signature) = <min_sig::BLS12381Signature as ToFromBytes>::from_bytes(signature) else {
        return false;
    };
    let Some(public_key) = bls_public_key(public_key) else {
        return false;
    };
    public_key.verify(data, &signature).is_ok()
}

/// Aggregate public keys (G2) and signatures (G1) by point addition.
pub fn bls_aggregate(
    public_keys: &[Vec<u8>],
    signatures: &[Vec<u8>],
) -> HostResult<(Vec<u8>, Vec<u8>)> {
    if public_keys.is_empty() || signatures.is_empty() {
        return Err(HostError::domain("nothing to aggregate"));
    }

    let mut keys = public_keys.iter().map(|bytes| {
        let raw: &[u8; BLS_PUBLIC_KEY_LENGTH] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| HostError::domain("BLS public key must be 96 bytes"))?;
        bls::G2Element::from_byte_array(raw)
            .map_err(|_| HostError::domain("invalid BLS public key"))
    });
    let mut key_sum = keys.next().ok_or_else(|| HostError::domain("nothing to aggregate"))??;
    for key in keys {
        key_sum = key_sum + key?;
    }

    let mut sigs = signatures.iter().map(|bytes| {
        let raw: &[u8; BLS_SIGNATURE_LENGTH] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| HostError::domain("BLS signature must be 48 bytes"))?;
        bls::G1Element::from_byte_array(raw)
            .map_err(|_| HostError::domain("invalid BLS signature"))
    });
    let mut sig_sum = sigs.next().ok_or_else(|| HostError::domain("nothing to aggregate"))??;
    for sig in sigs {
        sig_sum = sig_sum + sig?;
    }

    Ok((
        key_sum.to_byte_array().to_vec(),
        sig_sum.to_byte_array().to_vec(),
    ))
}
