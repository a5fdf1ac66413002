//! Segment digests: fixed-width hashes of one path segment at a time.

use xxhash_rust::xxh3::xxh3_64;

/// Fixed-width hash of one path segment, used as the B-tree's sort key.
pub type Digest = u64;

/// Hashes a single path segment (already stripped of separators).
pub fn digest_segment(segment: &str) -> Digest {
    xxh3_64(segment.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(digest_segment("alpha"), digest_segment("alpha"));
    }

    #[test]
    fn different_segments_differ() {
        assert_ne!(digest_segment("alpha"), digest_segment("beta"));
    }
}
