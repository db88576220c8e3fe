//! Hashing and unguessable id generation
//!
//! Session tokens and signaling transaction ids are both minted here:
//! a 64-char lowercase hex SHA-256 digest derived from fresh random draws,
//! so they are opaque strings correlated by equality only.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

/// SHA-256 digest of `text` as a 64-char lowercase hex string.
///
/// Deterministic; used for password comparison and as the final step of
/// token derivation.
pub fn hash256(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generator for unguessable 64-char identifiers.
///
/// Each id mixes two independent random draws: every round hashes a random
/// i64 concatenated with a 10-byte random word, and the two round digests
/// are concatenated and hashed once more. Callers treat the output as
/// opaque.
pub struct IdGenerator {
    rng: Mutex<StdRng>,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Mint a fresh 64-char hex id.
    pub fn next_id(&self) -> String {
        let first = self.hash_round();
        let second = self.hash_round();
        hash256(&format!("{}{}", first, second))
    }

    fn hash_round(&self) -> String {
        let (raw, word) = {
            let mut rng = self.rng.lock();
            let raw: i64 = rng.gen();
            let word: Vec<u8> = (0..10).map(|_| rng.gen::<u8>()).collect();
            (raw, word)
        };
        let mut seed = raw.to_string();
        seed.push_str(&String::from_utf8_lossy(&word));
        hash256(&seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_hash256_known_digest() {
        // SHA-256("abc"), a fixed test vector
        assert_eq!(
            hash256("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hash256_is_deterministic() {
        assert_eq!(hash256("password"), hash256("password"));
        assert_ne!(hash256("password"), hash256("Password"));
    }

    #[test]
    fn test_id_is_64_hex_chars() {
        let gen = IdGenerator::new();
        let id = gen.next_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_ids_do_not_repeat() {
        let gen = IdGenerator::new();
        let ids: HashSet<String> = (0..1000).map(|_| gen.next_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
