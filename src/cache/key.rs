//! Content addressing for disk-backed cache entries.
//!
//! Keys are arbitrary strings (usually URLs).  Before touching the
//! filesystem they are hashed with SHA-256 so that every entry maps to a
//! fixed-length, lowercase-hex file name with no path separators.

use sha2::{Digest, Sha256};

/// Length in characters of an address token.
pub const TOKEN_LEN: usize = 64;

/// Hash `key` into its address token.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Return `true` if `name` looks like a token produced by [`hash_key`].
pub fn is_token(name: &str) -> bool {
    name.len() == TOKEN_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        assert_eq!(
            hash_key("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn token_is_fixed_length_lowercase_hex() {
        for key in ["", "a", "https://api.github.com/repos/acme/widgets/tags?page=2"] {
            let token = hash_key(key);
            assert_eq!(token.len(), TOKEN_LEN);
            assert!(is_token(&token));
            assert!(!token.contains('/'));
        }
    }

    #[test]
    fn deterministic_and_distinct() {
        assert_eq!(hash_key("acme/widgets"), hash_key("acme/widgets"));
        assert_ne!(hash_key("acme/widgets"), hash_key("acme/widgets/"));
        assert_ne!(hash_key("/r?a=1"), hash_key("/r?a=2"));
    }

    #[test]
    fn is_token_rejects_other_names() {
        assert!(!is_token("abc"));
        assert!(!is_token(&"A".repeat(TOKEN_LEN)));
        assert!(!is_token(&format!("{}.tmp", hash_key("x"))));
    }
}
