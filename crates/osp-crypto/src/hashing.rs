use osp_core::Hash32;
use rand::RngCore;

/// Hash arbitrary data using BLAKE3.
pub fn hash(data: &[u8]) -> Hash32 {
    Hash32(*blake3::hash(data).as_bytes())
}

/// Hash lock committed to by a preimage.
pub fn hash_lock(preimage: &[u8]) -> Hash32 {
    hash(preimage)
}

pub fn verify_preimage(lock: &Hash32, preimage: &[u8]) -> bool {
    &hash_lock(preimage) == lock
}

/// Fresh 32-byte secret for a source-generated hash lock.
pub fn random_preimage() -> Vec<u8> {
    let mut secret = vec![0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    secret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(hash(b"osp"), hash(b"osp"));
        assert_ne!(hash(b"osp"), hash(b"osq"));
    }

    #[test]
    fn test_preimage_matches_lock() {
        let secret = random_preimage();
        let lock = hash_lock(&secret);
        assert!(verify_preimage(&lock, &secret));
        assert!(!verify_preimage(&lock, b"wrong"));
    }

    #[test]
    fn test_random_preimages_differ() {
        assert_ne!(random_preimage(), random_preimage());
    }
}
