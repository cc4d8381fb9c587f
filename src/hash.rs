use sha2::{Digest, Sha256};

/// Derive a per-source seed so sibling sources never share a shuffle order.
///
/// SHA-256 over the little-endian seed followed by the label; the first eight
/// digest bytes are read back little-endian. The result does not depend on
/// the toolchain.
pub fn derive_seed(seed: u64, label: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update(label.as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}
