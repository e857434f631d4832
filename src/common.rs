// Shared primitives: the canonical hash, addresses, wall-clock formatting,
// and the protocol constants every module agrees on.

use chrono::{DateTime, SecondsFormat, Utc};
use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer, Verifier};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::error::Error;

pub type Hash = [u8; 32];
pub type Address = String;

pub const ZERO_HASH: Hash = [0u8; 32];

/// Confirmed time of the genesis block; the first commit of SEBAK.
pub const GENESIS_BLOCK_CONFIRMED_TIME: &str = "2018-04-17T05:07:31.000000000Z";

/// A ballot whose confirmed time differs from the local clock by more than
/// this is considered not well-formed.
pub const BALLOT_CONFIRMED_TIME_ALLOW_DURATION: Duration = Duration::from_secs(60);

/// Maximum number of transactions in one proposed ballot.
pub const MAX_TRANSACTIONS_IN_BALLOT: usize = 1000;
/// Maximum number of operations in one transaction.
pub const MAX_OPERATIONS_IN_TRANSACTION: usize = 1000;

/// Canonical object hash: sha256 over the serde_json encoding. Struct field
/// order fixes the canonical form, so reordering fields is a wire break.
pub fn make_object_hash<T: Serialize>(value: &T) -> Hash {
    let encoded = serde_json::to_vec(value).expect("object hash encoding");
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    hasher.finalize().into()
}

pub fn hash_to_hex(hash: &Hash) -> String {
    hex::encode(hash)
}

pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_iso8601(s: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::MessageNotWellFormed(format!("bad timestamp: {}", e)))
}

/// The stable string form of a public key: lowercase hex, 64 chars.
pub fn address_from_pubkey(pubkey: &PublicKey) -> Address {
    hex::encode(pubkey.to_bytes())
}

pub fn parse_address(address: &str) -> Result<PublicKey, Error> {
    let bytes = hex::decode(address).map_err(|_| Error::InvalidAddress(address.to_string()))?;
    if bytes.len() != 32 {
        return Err(Error::InvalidAddress(address.to_string()));
    }
    PublicKey::from_bytes(&bytes).map_err(|_| Error::InvalidAddress(address.to_string()))
}

pub fn keypair_from_seed(seed: [u8; 32]) -> Keypair {
    let secret = SecretKey::from_bytes(&seed).expect("secret key must be 32 bytes");
    let public: PublicKey = (&secret).into();
    Keypair { secret, public }
}

/// Sign `network_id ∥ hash`; the network id binds signatures to one chain.
pub fn sign_hash(keypair: &Keypair, network_id: &[u8], hash: &Hash) -> String {
    let mut message = Vec::with_capacity(network_id.len() + hash.len());
    message.extend_from_slice(network_id);
    message.extend_from_slice(hash);
    hex::encode(keypair.sign(&message).to_bytes())
}

pub fn verify_hash_signature(
    address: &str,
    network_id: &[u8],
    hash: &Hash,
    signature: &str,
) -> Result<(), Error> {
    let pubkey = parse_address(address)?;
    let bytes = hex::decode(signature).map_err(|_| Error::SignatureVerificationFailed)?;
    if bytes.len() != 64 {
        return Err(Error::SignatureVerificationFailed);
    }
    let mut raw = [0u8; 64];
    raw.copy_from_slice(&bytes);
    let signature =
        Signature::from_bytes(&raw).map_err(|_| Error::SignatureVerificationFailed)?;
    let mut message = Vec::with_capacity(network_id.len() + hash.len());
    message.extend_from_slice(network_id);
    message.extend_from_slice(hash);
    pubkey
        .verify(&message, &signature)
        .map_err(|_| Error::SignatureVerificationFailed)
}
