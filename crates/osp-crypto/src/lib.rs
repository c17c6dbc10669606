pub mod error;
pub mod keys;
pub mod signing;
pub mod hashing;

pub use error::CryptoError;
pub use keys::{address_of, KeyPair, PublicKey};
pub use signing::{sign, sign_simplex, verify, verify_cosigned, verify_simplex, Signature};
pub use hashing::{hash, hash_lock, random_preimage, verify_preimage};
