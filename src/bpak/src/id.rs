//! Stable 32-bit name hashing.
//!
//! Every human-readable name (part name, metadata key) is folded once at
//! build time into a 32-bit id via CRC-32/IEEE — the same polynomial used
//! by `zlib`/`cksum` and by existing producers of this format, so ids are
//! interoperable across independent implementations.

/// `id = stable_hash(name)`.
pub fn stable_hash(name: &str) -> u32 {
    crc32fast::hash(name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // "" hashes to 0 under CRC-32/IEEE.
        assert_eq!(stable_hash(""), 0);
    }

    #[test]
    fn stable_across_calls() {
        let a = stable_hash("kernel");
        let b = stable_hash("kernel");
        assert_eq!(a, b);
    }

    #[test]
    fn distinguishes_names() {
        assert_ne!(stable_hash("kernel"), stable_hash("rootfs"));
    }
}
