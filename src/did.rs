//! Decentralized identifiers and their on-chain registry.

use crate::abi::{AbiType, AbiValue};
use crate::account::Account;
use crate::chain::{ChainClient, TransactionReceipt, DID_REGISTRY};
use crate::contract::ContractHandle;
use crate::error::{Result, SdkError};
use crate::events::{EventBridge, EventFilter};
use crate::primitives::{strip_0x, Address, Bytes32};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

pub const DID_PREFIX: &str = "did:op:";

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Did(Bytes32);

impl Did {
    pub fn generate() -> Self {
        Did(Bytes32::random())
    }

    pub fn from_id(id: Bytes32) -> Self {
        Did(id)
    }

    pub fn parse(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix(DID_PREFIX)
            .ok_or_else(|| SdkError::Validation(format!("'{}' is not a {} DID", s, DID_PREFIX)))?;
        let id = strip_0x(rest);
        if id.len() != 64 {
            return Err(SdkError::Validation(format!("DID '{}' must carry 64 hex characters", s)));
        }
        Ok(Did(id.parse()?))
    }

    pub fn is_did(s: &str) -> bool {
        Self::parse(s).is_ok()
    }

    pub fn id(&self) -> Bytes32 {
        self.0
    }

    /// The id as 64 hex characters without prefix.
    pub fn short_id(&self) -> String {
        self.0.to_plain_hex()
    }
}

impl FromStr for Did {
    type Err = SdkError;

    fn from_str(s: &str) -> Result<Self> {
        Did::parse(s)
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", DID_PREFIX, self.short_id())
    }
}

impl fmt::Debug for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Did({})", self)
    }
}

impl Serialize for Did {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Did {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Did::parse(&s).map_err(de::Error::custom)
    }
}

#[derive(Clone)]
pub struct DidRegistry {
    contract: ContractHandle,
    events: EventBridge,
}

impl DidRegistry {
    pub fn new(chain: Arc<dyn ChainClient>, events: EventBridge) -> Self {
        Self {
            contract: ContractHandle::new(DID_REGISTRY, chain),
            events,
        }
    }

    /// Records `value` (usually the metadata service URL) for the DID. The
    /// checksum is the DDO's 32-character checksum stored as ASCII.
    pub async fn register_attribute(
        &self,
        did: &Did,
        checksum: &str,
        value: &str,
        owner: &Account,
    ) -> Result<TransactionReceipt> {
        let checksum = Bytes32::from_ascii(checksum)?;
        info!(%did, value, owner = %owner.address(), "Registering DID attribute");
        let (receipt, _) = self
            .contract
            .send_expecting(
                "registerAttribute",
                vec![
                    AbiValue::Bytes32(did.id()),
                    AbiValue::Bytes32(checksum),
                    AbiValue::String(value.to_string()),
                ],
                owner,
                "DIDAttributeRegistered",
            )
            .await?;
        Ok(receipt)
    }

    pub async fn owner(&self, did: &Did) -> Result<Address> {
        let value = self
            .contract
            .call_one("getDIDOwner", vec![AbiValue::Bytes32(did.id())], AbiType::Address)
            .await?;
        value
            .as_address()
            .ok_or_else(|| SdkError::Abi("getDIDOwner did not return an address".to_string()))
    }

    pub async fn block_number_updated(&self, did: &Did) -> Result<u64> {
        let value = self
            .contract
            .call_one("getBlockNumberUpdated", vec![AbiValue::Bytes32(did.id())], AbiType::Uint256)
            .await?;
        let n = value
            .as_uint()
            .ok_or_else(|| SdkError::Abi("getBlockNumberUpdated did not return an integer".to_string()))?;
        u64::try_from(n).map_err(|_| SdkError::Abi(format!("block number {} out of range", n)))
    }

    /// Latest registered value for the DID, if any.
    pub async fn attribute_value(&self, did: &Did) -> Result<Option<String>> {
        let block = self.block_number_updated(did).await?;
        if block == 0 {
            return Ok(None);
        }
        let filter = EventFilter::new()
            .with("did", AbiValue::Bytes32(did.id()))
            .from_block(block);
        let events = self
            .events
            .past_events(DID_REGISTRY, "DIDAttributeRegistered", &filter)
            .await?;
        Ok(events
            .last()
            .and_then(|e| e.value("value"))
            .and_then(|v| v.as_str())
            .map(str::to_string))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedItem {
    pub did: Did,
    pub owner: Address,
    pub value: String,
    pub block_number: u64,
}

/// Every hop taken while resolving a DID.
#[derive(Debug, Clone, Default)]
pub struct DidResolved {
    pub items: Vec<ResolvedItem>,
}

impl DidResolved {
    pub fn hop_count(&self) -> usize {
        self.items.len()
    }

    pub fn last_item(&self) -> Option<&ResolvedItem> {
        self.items.last()
    }

    /// Final resolved value, e.g. the metadata service URL.
    pub fn value(&self) -> Option<&str> {
        self.last_item().map(|i| i.value.as_str())
    }

    pub fn is_url(&self) -> bool {
        self.value()
            .map(|v| v.starts_with("http://") || v.starts_with("https://"))
            .unwrap_or(false)
    }
}

#[derive(Clone)]
pub struct DidResolver {
    registry: DidRegistry,
}

impl DidResolver {
    pub fn new(registry: DidRegistry) -> Self {
        Self { registry }
    }

    /// Follows attribute values that are themselves DIDs, up to `max_hops`.
    pub async fn resolve(&self, did: &Did, max_hops: usize) -> Result<DidResolved> {
        let mut resolved = DidResolved::default();
        let mut visited = HashSet::new();
        let mut current = *did;

        loop {
            if !visited.insert(current) {
                return Err(SdkError::Validation(format!("DID resolution loops back to {}", current)));
            }
            if resolved.hop_count() >= max_hops {
                return Err(SdkError::Validation(format!(
                    "DID {} did not resolve within {} hops",
                    did, max_hops
                )));
            }

            let value = self
                .registry
                .attribute_value(&current)
                .await?
                .ok_or_else(|| SdkError::NotFound(format!("DID {} is not registered", current)))?;
            let owner = self.registry.owner(&current).await?;
            let block_number = self.registry.block_number_updated(&current).await?;
            debug!(did = %current, value = %value, hop = resolved.hop_count(), "Resolved DID hop");

            let next = Did::parse(&value).ok();
            resolved.items.push(ResolvedItem {
                did: current,
                owner,
                value,
                block_number,
            });
            match next {
                Some(next) => current = next,
                None => return Ok(resolved),
            }
        }
    }
}
