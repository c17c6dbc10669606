use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Token amount in the smallest unit (wei for the native token).
pub type Amount = u128;

/// On-chain block height.
pub type BlockNumber = u64;

/// Identifier of an independently operated sub-network.
pub type NetId = u64;

macro_rules! hex_id {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub fn from_slice(bytes: &[u8]) -> Result<Self, CoreError> {
                let arr: [u8; $len] = bytes.try_into().map_err(|_| CoreError::InvalidLength {
                    kind: stringify!($name),
                    expected: $len,
                    actual: bytes.len(),
                })?;
                Ok(Self(arr))
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            /// `0x`-prefixed lowercase hex.
            pub fn to_hex(&self) -> String {
                format!("0x{}", hex::encode(self.0))
            }

            /// First four bytes in hex, for log lines.
            pub fn short(&self) -> String {
                hex::encode(&self.0[..4])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = s.strip_prefix("0x").unwrap_or(s);
                let bytes = hex::decode(raw).map_err(|e| CoreError::InvalidHex(e.to_string()))?;
                Self::from_slice(&bytes)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_id!(
    /// 20-byte account address, derived from a node's public key.
    Address,
    20
);
hex_id!(
    /// 32-byte channel identifier.
    ChannelId,
    32
);
hex_id!(
    /// 32-byte pay identifier: BLAKE3 of the pay's canonical encoding.
    PayId,
    32
);
hex_id!(
    /// Generic 32-byte hash (hash locks, tx hashes, virtual contract addresses).
    Hash32,
    32
);

impl ChannelId {
    /// Derive the channel id from its participants, token and open nonce.
    /// Participant order does not matter.
    pub fn derive(a: &Address, b: &Address, token: &TokenInfo, nonce: u64) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let mut payload = Vec::with_capacity(20 * 3 + 9);
        payload.extend_from_slice(lo.as_bytes());
        payload.extend_from_slice(hi.as_bytes());
        payload.extend_from_slice(&token.canonical_bytes());
        payload.extend_from_slice(&nonce.to_be_bytes());
        Self(*blake3::hash(&payload).as_bytes())
    }
}

/// Token standard of a channel's asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Native,
    Erc20,
}

/// The asset a channel or pay is denominated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenInfo {
    pub kind: TokenKind,
    pub address: Address,
}

impl TokenInfo {
    pub fn native() -> Self {
        Self {
            kind: TokenKind::Native,
            address: Address::default(),
        }
    }

    pub fn erc20(address: Address) -> Self {
        Self {
            kind: TokenKind::Erc20,
            address,
        }
    }

    pub fn canonical_bytes(&self) -> [u8; 21] {
        let mut out = [0u8; 21];
        out[0] = match self.kind {
            TokenKind::Native => 1,
            TokenKind::Erc20 => 2,
        };
        out[1..].copy_from_slice(self.address.as_bytes());
        out
    }
}

impl Default for TokenInfo {
    fn default() -> Self {
        Self::native()
    }
}

impl fmt::Display for TokenInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TokenKind::Native => write!(f, "native"),
            TokenKind::Erc20 => write!(f, "erc20:{}", self.address),
        }
    }
}

/// Serde helper: amounts travel as decimal strings so JSON and TOML
/// consumers never truncate them. Plain integers are accepted on input.
pub mod amount_str {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(u64),
    }

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Str(s) => s.trim().parse().map_err(de::Error::custom),
            Raw::Num(n) => Ok(n as u128),
        }
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(value: &Option<u128>, serializer: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => serializer.serialize_some(&v.to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u128>, D::Error> {
            let raw: Option<String> = Option::deserialize(deserializer)?;
            raw.map(|s| s.trim().parse().map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

/// Serde helper: byte blobs (signatures, contract args, preimages) as `0x` hex.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        let raw = s.strip_prefix("0x").unwrap_or(&s);
        hex::decode(raw).map_err(serde::de::Error::custom)
    }
}
