//! Content hashing for change detection.
//!
//! Documents and chunks are tracked by SHA-256 hex digests. File hashes
//! decide whether a re-ingest can be skipped; chunk hashes feed the
//! incremental diff.

use sha2::{Digest, Sha256};

/// SHA-256 hex digest of raw bytes.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// SHA-256 hex digest of text content.
pub fn hash_text(text: &str) -> String {
    hash_bytes(text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_digests() {
        assert_eq!(hash_text("hello"), hash_text("hello"));
        assert_ne!(hash_text("hello"), hash_text("hello "));
    }

    #[test]
    fn test_text_matches_bytes() {
        assert_eq!(hash_text("abc"), hash_bytes(b"abc"));
    }

    #[test]
    fn test_known_vector() {
        // SHA-256("")
        assert_eq!(
            hash_text(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
