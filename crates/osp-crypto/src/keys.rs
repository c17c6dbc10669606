use ed25519_dalek::{SigningKey, VerifyingKey};
use osp_core::Address;
use rand::rngs::OsRng;
use std::path::Path;
use zeroize::Zeroize;

use crate::error::CryptoError;

/// Derive the account address of a public key: the first 20 bytes of its BLAKE3 hash.
pub fn address_of(public_key: &[u8; 32]) -> Address {
    let digest = blake3::hash(public_key);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest.as_bytes()[..20]);
    Address(out)
}

/// Ed25519 key pair a node signs channel states with.
/// Private key material is zeroized on drop by ed25519-dalek.
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random key pair using OS-provided entropy.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create a key pair from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Create a key pair from raw bytes (32 bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(bytes);
        let kp = Self::from_seed(&seed);
        seed.zeroize();
        Ok(kp)
    }

    /// Load a hex-encoded seed from `path`, or generate one and write it there.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            let mut contents = std::fs::read_to_string(path)?;
            let decoded = hex::decode(contents.trim())
                .map_err(|e| CryptoError::InvalidInput(format!("invalid key file: {}", e)));
            contents.zeroize();
            let mut bytes = decoded?;
            let kp = Self::from_bytes(&bytes);
            bytes.zeroize();
            return kp;
        }

        let kp = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut encoded = hex::encode(kp.signing_key.to_bytes());
        std::fs::write(path, &encoded)?;
        encoded.zeroize();
        tracing::info!(path = %path.display(), address = %kp.address(), "generated node key");
        Ok(kp)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying_key: self.signing_key.verifying_key(),
        }
    }

    /// Account address of this key pair.
    pub fn address(&self) -> Address {
        address_of(self.signing_key.verifying_key().as_bytes())
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }
}

/// Ed25519 public key for verification operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    verifying_key: VerifyingKey,
}

impl PublicKey {
    /// Create from raw bytes (32 bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes_arr: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        let verifying_key = VerifyingKey::from_bytes(&bytes_arr)
            .map_err(|e| CryptoError::InvalidInput(format!("invalid public key: {}", e)))?;
        Ok(Self { verifying_key })
    }

    /// Parse a key and check that it belongs to `expected`.
    pub fn for_address(bytes: &[u8], expected: &Address) -> Result<Self, CryptoError> {
        let key = Self::from_bytes(bytes)?;
        if &key.address() != expected {
            return Err(CryptoError::AddressMismatch(expected.to_string()));
        }
        Ok(key)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.verifying_key.as_bytes()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    pub fn address(&self) -> Address {
        address_of(self.as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex_str.trim_start_matches("0x"))
            .map_err(|e| CryptoError::InvalidInput(format!("invalid hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    pub(crate) fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_seed_deterministic() {
        let kp1 = KeyPair::from_seed(&[42u8; 32]);
        let kp2 = KeyPair::from_seed(&[42u8; 32]);
        assert_eq!(kp1.public_key(), kp2.public_key());
        assert_eq!(kp1.address(), kp2.address());
    }

    #[test]
    fn test_address_matches_public_key() {
        let kp = KeyPair::generate();
        assert_eq!(kp.address(), kp.public_key().address());
        assert!(PublicKey::for_address(&kp.public_key().to_vec(), &kp.address()).is_ok());
    }

    #[test]
    fn test_for_address_rejects_foreign_key() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let result = PublicKey::for_address(&kp.public_key().to_vec(), &other.address());
        assert!(matches!(result, Err(CryptoError::AddressMismatch(_))));
    }

    #[test]
    fn test_from_bytes_invalid_length() {
        assert!(KeyPair::from_bytes(&[0u8; 16]).is_err());
        assert!(PublicKey::from_bytes(&[0u8; 31]).is_err());
    }

    #[test]
    fn test_public_key_hex_roundtrip() {
        let pk = KeyPair::generate().public_key();
        assert_eq!(PublicKey::from_hex(&pk.to_hex()).unwrap(), pk);
    }

    #[test]
    fn test_load_or_generate_persists_key() {
        let dir = std::env::temp_dir().join(format!("osp-key-{}", std::process::id()));
        let path = dir.join("node.key");
        let _ = std::fs::remove_file(&path);

        let first = KeyPair::load_or_generate(&path).unwrap();
        let second = KeyPair::load_or_generate(&path).unwrap();
        assert_eq!(first.address(), second.address());

        std::fs::remove_dir_all(&dir).ok();
    }
}
