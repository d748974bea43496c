#![forbid(unsafe_code)]

use sha2::{Digest, Sha256};

use tally_kernel_contracts::report::ContentHash;
use tally_kernel_contracts::ContractViolation;

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn content_hash(bytes: &[u8]) -> Result<ContentHash, ContractViolation> {
    ContentHash::new(sha256_hex(bytes))
}

/// Case-insensitive comparison of two hex digests.
pub fn hashes_match(stored: &str, computed: &str) -> bool {
    stored.len() == computed.len() && stored.eq_ignore_ascii_case(computed)
}
