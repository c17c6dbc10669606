use ed25519_dalek::Signer;
use ed25519_dalek::Verifier;
use osp_core::{SignedSimplexState, SimplexState};

use crate::error::CryptoError;
use crate::keys::{KeyPair, PublicKey};

/// Ed25519 signature (64 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    inner: ed25519_dalek::Signature,
}

impl Signature {
    pub fn to_bytes(&self) -> [u8; 64] {
        self.inner.to_bytes()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.to_bytes().to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes_arr: [u8; 64] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidInput(format!("signature must be 64 bytes, got {}", bytes.len()))
        })?;
        Ok(Self {
            inner: ed25519_dalek::Signature::from_bytes(&bytes_arr),
        })
    }
}

/// Sign a message using Ed25519.
pub fn sign(message: &[u8], keypair: &KeyPair) -> Signature {
    Signature {
        inner: keypair.signing_key().sign(message),
    }
}

/// Verify an Ed25519 signature given as raw bytes.
pub fn verify(message: &[u8], signature: &[u8], pubkey: &PublicKey) -> Result<(), CryptoError> {
    let sig = Signature::from_bytes(signature)?;
    pubkey
        .verifying_key()
        .verify(message, &sig.inner)
        .map_err(|_| CryptoError::SignatureVerificationFailed)
}

/// Sign a simplex state's canonical payload.
pub fn sign_simplex(state: &SimplexState, keypair: &KeyPair) -> Vec<u8> {
    sign(&state.signing_payload(), keypair).to_vec()
}

/// Verify one participant's signature over a simplex state.
pub fn verify_simplex(state: &SimplexState, signature: &[u8], pubkey: &PublicKey) -> Result<(), CryptoError> {
    verify(&state.signing_payload(), signature, pubkey)
}

/// Verify both signatures of a committed simplex state.
pub fn verify_cosigned(
    signed: &SignedSimplexState,
    from_key: &PublicKey,
    to_key: &PublicKey,
) -> Result<(), CryptoError> {
    if signed.sig_of_peer_from.is_empty() {
        return Err(CryptoError::MissingSignature("peer_from"));
    }
    if signed.sig_of_peer_to.is_empty() {
        return Err(CryptoError::MissingSignature("peer_to"));
    }
    if from_key.address() != signed.state.peer_from {
        return Err(CryptoError::AddressMismatch(signed.state.peer_from.to_string()));
    }
    verify_simplex(&signed.state, &signed.sig_of_peer_from, from_key)?;
    verify_simplex(&signed.state, &signed.sig_of_peer_to, to_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use osp_core::{ChannelId, SimplexState};

    #[test]
    fn test_sign_verify_roundtrip() {
        let kp = KeyPair::generate();
        let sig = sign(b"hello", &kp);
        assert!(verify(b"hello", &sig.to_vec(), &kp.public_key()).is_ok());
        assert!(verify(b"tampered", &sig.to_vec(), &kp.public_key()).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let sig = sign(b"msg", &kp);
        assert!(matches!(
            verify(b"msg", &sig.to_vec(), &other.public_key()),
            Err(CryptoError::SignatureVerificationFailed)
        ));
    }

    #[test]
    fn test_cosigned_state() {
        let from = KeyPair::from_seed(&[1; 32]);
        let to = KeyPair::from_seed(&[2; 32]);
        let mut state = SimplexState::initial(ChannelId([3; 32]), from.address());
        state.seq_num = 4;

        let signed = SignedSimplexState {
            sig_of_peer_from: sign_simplex(&state, &from),
            sig_of_peer_to: sign_simplex(&state, &to),
            state: state.clone(),
        };
        assert!(verify_cosigned(&signed, &from.public_key(), &to.public_key()).is_ok());

        // Keys swapped: peer_from does not match the from key.
        assert!(verify_cosigned(&signed, &to.public_key(), &from.public_key()).is_err());

        let half = SignedSimplexState {
            sig_of_peer_to: Vec::new(),
            ..signed
        };
        assert!(matches!(
            verify_cosigned(&half, &from.public_key(), &to.public_key()),
            Err(CryptoError::MissingSignature("peer_to"))
        ));
    }

    #[test]
    fn test_bad_signature_length() {
        let kp = KeyPair::generate();
        assert!(verify(b"x", &[0u8; 10], &kp.public_key()).is_err());
    }
}
