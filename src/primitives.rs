//! Fixed-size byte types shared by the chain boundary and the document model.
//!
//! Both render as `0x`-prefixed lowercase hex and parse with or without the prefix.

use crate::error::{Result, SdkError};
use rand::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

macro_rules! fixed_bytes {
    ($name:ident, $len:expr, $label:expr) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub const fn zero() -> Self {
                Self([0u8; $len])
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn from_slice(bytes: &[u8]) -> Result<Self> {
                if bytes.len() != $len {
                    return Err(SdkError::Validation(format!(
                        "{} must be {} bytes, got {}",
                        $label,
                        $len,
                        bytes.len()
                    )));
                }
                let mut out = [0u8; $len];
                out.copy_from_slice(bytes);
                Ok(Self(out))
            }

            pub fn to_hex(&self) -> String {
                format!("0x{}", hex::encode(self.0))
            }

            /// Hex without the `0x` prefix.
            pub fn to_plain_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl FromStr for $name {
            type Err = SdkError;

            fn from_str(s: &str) -> Result<Self> {
                let raw = strip_0x(s.trim());
                let bytes = hex::decode(raw)
                    .map_err(|e| SdkError::Validation(format!("invalid {} '{}': {}", $label, s, e)))?;
                Self::from_slice(&bytes)
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

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    };
}

fixed_bytes!(Address, 20, "address");
fixed_bytes!(Bytes32, 32, "bytes32");
fixed_bytes!(Bytes4, 4, "bytes4");

impl Bytes32 {
    /// Random 32-byte identifier, used for agreement ids and DIDs.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Left-aligns up to 32 bytes of ASCII text, zero-padding the rest.
    /// Mirrors how short strings are stored in `bytes32` slots.
    pub fn from_ascii(text: &str) -> Result<Self> {
        let raw = text.as_bytes();
        if raw.len() > 32 {
            return Err(SdkError::Validation(format!(
                "'{}' does not fit in bytes32 ({} bytes)",
                text,
                raw.len()
            )));
        }
        let mut out = [0u8; 32];
        out[..raw.len()].copy_from_slice(raw);
        Ok(Self(out))
    }
}

/// Random id as 64 lowercase hex characters without prefix.
pub fn generate_id() -> String {
    Bytes32::random().to_plain_hex()
}

pub fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

pub fn zero_x(s: &str) -> String {
    format!("0x{}", strip_0x(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse_and_display() {
        let addr: Address = "0x00000000000000000000000000000000000000AB".parse().unwrap();
        assert_eq!(addr.to_string(), "0x00000000000000000000000000000000000000ab");

        let no_prefix: Address = "00000000000000000000000000000000000000ab".parse().unwrap();
        assert_eq!(addr, no_prefix);
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!("0x1234".parse::<Address>().is_err());
        assert!("0x1234".parse::<Bytes32>().is_err());
        assert!("0xzz".parse::<Bytes32>().is_err());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let id = Bytes32([7u8; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"0x{}\"", "07".repeat(32)));
        let back: Bytes32 = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_from_ascii() {
        let b = Bytes32::from_ascii("abc").unwrap();
        assert_eq!(&b.0[..3], b"abc");
        assert!(b.0[3..].iter().all(|x| *x == 0));
        assert!(Bytes32::from_ascii(&"x".repeat(33)).is_err());
    }

    #[test]
    fn test_generate_id_shape() {
        let id = generate_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(generate_id(), id);
    }
}
