//! Accounts and personal-message signatures.

use crate::abi::keccak256;
use crate::error::{Result, SdkError};
use crate::primitives::{strip_0x, Address, Bytes32};
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// 65-byte recoverable signature laid out as `r || s || v`, `v` in {27, 28}.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(pub [u8; 65]);

impl Signature {
    pub fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }

    pub fn v(&self) -> u8 {
        self.0[64]
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 65 {
            return Err(SdkError::Signature(format!(
                "signature must be 65 bytes, got {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; 65];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    fn split(&self) -> Result<(EcdsaSignature, RecoveryId)> {
        let sig = EcdsaSignature::from_slice(&self.0[..64])?;
        let v = match self.0[64] {
            27 | 28 => self.0[64] - 27,
            0 | 1 => self.0[64],
            other => return Err(SdkError::Signature(format!("invalid recovery byte {}", other))),
        };
        let recid = RecoveryId::from_byte(v)
            .ok_or_else(|| SdkError::Signature(format!("invalid recovery byte {}", v)))?;
        Ok((sig, recid))
    }
}

impl FromStr for Signature {
    type Err = SdkError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(strip_0x(s.trim()))
            .map_err(|e| SdkError::Signature(format!("invalid signature hex: {}", e)))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// keccak256(prefix || decimal length || message).
pub fn hash_personal_message(prefix: &str, message: &[u8]) -> Bytes32 {
    let mut data = Vec::with_capacity(prefix.len() + 4 + message.len());
    data.extend_from_slice(prefix.as_bytes());
    data.extend_from_slice(message.len().to_string().as_bytes());
    data.extend_from_slice(message);
    Bytes32(keccak256(&data))
}

/// Recovers the address that produced `signature` over the prefixed `message`.
pub fn recover_personal(prefix: &str, message: &[u8], signature: &Signature) -> Result<Address> {
    let digest = hash_personal_message(prefix, message);
    let (sig, recid) = signature.split()?;
    let key = VerifyingKey::recover_from_prehash(digest.as_bytes(), &sig, recid)?;
    Ok(address_of(&key))
}

pub fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&hash[12..]);
    Address(out)
}

/// A chain account. Accounts built with [`Account::watch`] carry no key and
/// can only be used as a transaction sender on node-managed transports.
#[derive(Clone)]
pub struct Account {
    address: Address,
    key: Option<SigningKey>,
}

impl Account {
    pub fn from_private_key(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(strip_0x(hex_key.trim()))
            .map_err(|e| SdkError::Signature(format!("invalid private key hex: {}", e)))?;
        let key = SigningKey::from_slice(&bytes)?;
        Ok(Self {
            address: address_of(key.verifying_key()),
            key: Some(key),
        })
    }

    pub fn random() -> Self {
        let key = SigningKey::random(&mut rand::rngs::OsRng);
        Self {
            address: address_of(key.verifying_key()),
            key: Some(key),
        }
    }

    pub fn watch(address: Address) -> Self {
        Self { address, key: None }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn can_sign(&self) -> bool {
        self.key.is_some()
    }

    pub fn private_key_hex(&self) -> Option<String> {
        self.key.as_ref().map(|k| format!("0x{}", hex::encode(k.to_bytes())))
    }

    /// Signs `message` with the personal-message prefix.
    pub fn sign_personal(&self, prefix: &str, message: &[u8]) -> Result<Signature> {
        let key = self.key.as_ref().ok_or_else(|| {
            SdkError::Signature(format!("account {} has no signing key", self.address))
        })?;
        let digest = hash_personal_message(prefix, message);
        let (sig, recid) = key.sign_prehash_recoverable(digest.as_bytes())?;

        let mut out = [0u8; 65];
        out[..64].copy_from_slice(&sig.to_bytes());
        out[64] = recid.to_byte() + 27;
        Ok(Signature(out))
    }

    pub fn sign_hash(&self, prefix: &str, hash: &Bytes32) -> Result<Signature> {
        self.sign_personal(prefix, hash.as_bytes())
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("address", &self.address)
            .field("can_sign", &self.can_sign())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MESSAGE_PREFIX;

    // Well-known development key (ganache account 0).
    const DEV_KEY: &str = "0x4f3edf983ac636a65a842ce7c78d9aa706d3b113bce9c46f30d7d21715b23b1d";

    #[test]
    fn test_address_from_known_key() {
        let account = Account::from_private_key(DEV_KEY).unwrap();
        assert_eq!(
            account.address().to_string(),
            "0x90f8bf6a479f320ead074411a4b0e7944ea8c9c1"
        );
    }

    #[test]
    fn test_sign_and_recover() {
        let account = Account::random();
        let hash = Bytes32([5u8; 32]);
        let sig = account.sign_hash(DEFAULT_MESSAGE_PREFIX, &hash).unwrap();
        assert!(sig.v() == 27 || sig.v() == 28);

        let signer = recover_personal(DEFAULT_MESSAGE_PREFIX, hash.as_bytes(), &sig).unwrap();
        assert_eq!(signer, account.address());
    }

    #[test]
    fn test_signing_is_deterministic() {
        let account = Account::from_private_key(DEV_KEY).unwrap();
        let a = account.sign_personal(DEFAULT_MESSAGE_PREFIX, b"hello").unwrap();
        let b = account.sign_personal(DEFAULT_MESSAGE_PREFIX, b"hello").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_prefix_changes_recovered_signer() {
        let account = Account::random();
        let sig = account.sign_personal(DEFAULT_MESSAGE_PREFIX, b"msg").unwrap();
        let other = recover_personal("other prefix", b"msg", &sig).ok();
        assert_ne!(other, Some(account.address()));
    }

    #[test]
    fn test_watch_only_account_cannot_sign() {
        let account = Account::watch(Address([1u8; 20]));
        let err = account.sign_personal(DEFAULT_MESSAGE_PREFIX, b"x").unwrap_err();
        assert!(matches!(err, SdkError::Signature(_)));
    }

    #[test]
    fn test_signature_hex_roundtrip() {
        let sig = Account::random()
            .sign_personal(DEFAULT_MESSAGE_PREFIX, b"x")
            .unwrap();
        let parsed: Signature = sig.to_hex().parse().unwrap();
        assert_eq!(parsed, sig);
        assert!("0x00".parse::<Signature>().is_err());
    }
}
