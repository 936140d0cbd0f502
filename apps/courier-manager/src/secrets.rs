//! Opaque secret generation and digesting. Raw device credentials and lease tokens
//! leave the manager once, in the response that issues them; only digests are stored.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{distributions::Uniform, rngs::OsRng, Rng, RngCore};
use sha2::{Digest, Sha256};

const CREDENTIAL_BYTES: usize = 32;
const LEASE_TOKEN_BYTES: usize = 24;
const PAIRING_CODE_LEN: usize = 8;
// No 0/O/1/I so codes survive being read aloud.
const PAIRING_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub fn new_device_credential() -> String {
    random_token(CREDENTIAL_BYTES)
}

pub fn new_lease_token() -> String {
    random_token(LEASE_TOKEN_BYTES)
}

pub fn new_pairing_code() -> String {
    let dist = Uniform::from(0..PAIRING_ALPHABET.len());
    let mut rng = OsRng;
    (0..PAIRING_CODE_LEN)
        .map(|_| PAIRING_ALPHABET[rng.sample(dist)] as char)
        .collect()
}

/// Hex-encoded SHA-256 of a secret.
pub fn digest(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.trim().as_bytes());
    hex::encode(hasher.finalize())
}

fn random_token(len: usize) -> String {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}
