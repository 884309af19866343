//! Test identity used to deploy the registry and issue records.

use super::{Address, B256};
use crate::Error;
use k256::ecdsa::SigningKey;

/// Derive the account address controlled by a hex-encoded secp256k1 private key.
pub fn address_from_private_key(private_key: &str) -> Result<Address, Error> {
    let key: B256 = private_key
        .trim()
        .parse()
        .map_err(|e| Error::InvalidIdentity(format!("{e}")))?;
    let signer =
        SigningKey::from_slice(key.as_slice()).map_err(|e| Error::InvalidIdentity(e.to_string()))?;

    // Uncompressed SEC1 encoding is 0x04 || X || Y
    let point = signer.verifying_key().to_encoded_point(false);
    Ok(Address::from_raw_public_key(&point.as_bytes()[1..]))
}
