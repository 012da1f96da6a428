//! Random identifier generation: 128-bit tokens used for agent keys and
//! rendezvous proxy ids.

use rand::rng;
use rand::RngExt;

/// Returns a fresh 128-bit random value, hex-encoded (32 characters).
pub fn random_hex128() -> String {
    let value: u128 = rng().random();
    hex::encode(value.to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_32_hex_characters() {
        let id = random_hex128();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn two_calls_differ() {
        assert_ne!(random_hex128(), random_hex128());
    }
}
