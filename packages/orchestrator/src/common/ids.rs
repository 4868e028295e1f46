//! Id minting and fingerprint helpers.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Mint a fresh row id.
pub fn db_id() -> Uuid {
    Uuid::new_v4()
}

/// Hex sha256 of a canonical string.
pub fn fingerprint_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// First `len` hex chars of the sha256 of `input`.
///
/// Used for deterministic request-id suffixes where the full digest would
/// bloat correlation columns.
pub fn short_hash(input: &str, len: usize) -> String {
    let mut digest = fingerprint_hex(input);
    digest.truncate(len);
    digest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        assert_eq!(fingerprint_hex("abc"), fingerprint_hex("abc"));
        assert_ne!(fingerprint_hex("abc"), fingerprint_hex("abd"));
    }

    #[test]
    fn short_hash_truncates() {
        assert_eq!(short_hash("abc", 12).len(), 12);
    }
}
