//! The boundary to the chain.
//!
//! Everything above this module talks to contracts by name through [`ChainClient`];
//! the implementations are [`rpc::RpcChain`] for a JSON-RPC node and, with the
//! `dev-chain` feature, `memory::MemoryChain` for in-process development and tests.

#[cfg(any(test, feature = "dev-chain"))]
pub mod memory;
pub mod rpc;

use crate::abi::{AbiType, AbiValue};
use crate::error::Result;
use crate::primitives::{Address, Bytes32};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::broadcast;

pub const OCEAN_TOKEN: &str = "OceanToken";
pub const DISPENSER: &str = "Dispenser";
pub const DID_REGISTRY: &str = "DIDRegistry";
pub const TEMPLATE_STORE_MANAGER: &str = "TemplateStoreManager";
pub const AGREEMENT_STORE_MANAGER: &str = "AgreementStoreManager";
pub const CONDITION_STORE_MANAGER: &str = "ConditionStoreManager";
pub const LOCK_REWARD_CONDITION: &str = "LockRewardCondition";
pub const ACCESS_SECRET_STORE_CONDITION: &str = "AccessSecretStoreCondition";
pub const ESCROW_REWARD: &str = "EscrowReward";

pub const ALL_CONTRACTS: [&str; 9] = [
    OCEAN_TOKEN,
    DISPENSER,
    DID_REGISTRY,
    TEMPLATE_STORE_MANAGER,
    AGREEMENT_STORE_MANAGER,
    CONDITION_STORE_MANAGER,
    LOCK_REWARD_CONDITION,
    ACCESS_SECRET_STORE_CONDITION,
    ESCROW_REWARD,
];

/// A read or write against a named contract method.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractCall {
    pub contract: String,
    pub method: String,
    pub args: Vec<AbiValue>,
    pub outputs: Vec<AbiType>,
}

impl ContractCall {
    pub fn new(contract: impl Into<String>, method: impl Into<String>, args: Vec<AbiValue>) -> Self {
        Self {
            contract: contract.into(),
            method: method.into(),
            args,
            outputs: Vec::new(),
        }
    }

    pub fn returning(mut self, outputs: &[AbiType]) -> Self {
        self.outputs = outputs.to_vec();
        self
    }

    /// Arguments rendered for diagnostics.
    pub fn describe_args(&self) -> String {
        let rendered: Vec<String> = self.args.iter().map(|a| a.to_json().to_string()).collect();
        format!("[{}]", rendered.join(", "))
    }
}

/// A decoded contract event with its named `returnValues`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainEvent {
    pub contract: String,
    pub event: String,
    pub block_number: u64,
    pub transaction_hash: Bytes32,
    pub log_index: u64,
    pub return_values: BTreeMap<String, AbiValue>,
}

impl ChainEvent {
    pub fn value(&self, name: &str) -> Option<&AbiValue> {
        self.return_values.get(name)
    }

    /// Identity of the log entry, used to drop duplicates between history and live feed.
    pub fn log_key(&self) -> (Bytes32, u64) {
        (self.transaction_hash, self.log_index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: Bytes32,
    pub block_number: u64,
    pub from: Address,
    pub status: bool,
    pub gas_used: u64,
    pub events: Vec<ChainEvent>,
}

impl TransactionReceipt {
    pub fn event(&self, name: &str) -> Option<&ChainEvent> {
        self.events.iter().find(|e| e.event == name)
    }
}

/// Historical log query. `filter` holds exact-match constraints on return values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventQuery {
    pub contract: String,
    pub event: String,
    pub filter: BTreeMap<String, AbiValue>,
    pub from_block: u64,
    pub to_block: Option<u64>,
}

impl EventQuery {
    pub fn matches(&self, event: &ChainEvent) -> bool {
        event.contract == self.contract
            && event.event == self.event
            && event.block_number >= self.from_block
            && self.to_block.map_or(true, |to| event.block_number <= to)
            && self
                .filter
                .iter()
                .all(|(name, value)| event.return_values.get(name) == Some(value))
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn contract_address(&self, contract: &str) -> Result<Address>;

    async fn block_number(&self) -> Result<u64>;

    /// Read-only call; returns values decoded per `call.outputs`.
    async fn call(&self, call: &ContractCall) -> Result<Vec<AbiValue>>;

    async fn estimate_gas(&self, call: &ContractCall, from: Address) -> Result<u64>;

    /// Submits the transaction and waits for it to be mined.
    async fn send_transaction(&self, call: &ContractCall, from: Address, gas: u64) -> Result<TransactionReceipt>;

    async fn past_events(&self, query: &EventQuery) -> Result<Vec<ChainEvent>>;

    /// Live feed of every event the transport sees. Fails once the transport is gone.
    fn live_events(&self) -> Result<broadcast::Receiver<ChainEvent>>;
}

/// Event layout used to decode raw logs.
#[derive(Debug, Clone, Copy)]
pub struct EventSpec {
    pub contract: &'static str,
    pub name: &'static str,
    /// (return value name, type, indexed)
    pub inputs: &'static [(&'static str, AbiType, bool)],
}

impl EventSpec {
    pub fn signature(&self) -> String {
        let types: Vec<AbiType> = self.inputs.iter().map(|(_, ty, _)| *ty).collect();
        crate::abi::method_signature(self.name, &types)
    }

    pub fn topic(&self) -> Bytes32 {
        Bytes32(crate::abi::keccak256(self.signature().as_bytes()))
    }
}

pub const EVENTS: &[EventSpec] = &[
    EventSpec {
        contract: OCEAN_TOKEN,
        name: "Approval",
        inputs: &[
            ("owner", AbiType::Address, true),
            ("spender", AbiType::Address, true),
            ("value", AbiType::Uint256, false),
        ],
    },
    EventSpec {
        contract: DISPENSER,
        name: "RequestTokens",
        inputs: &[
            ("requester", AbiType::Address, true),
            ("amount", AbiType::Uint256, false),
        ],
    },
    EventSpec {
        contract: DID_REGISTRY,
        name: "DIDAttributeRegistered",
        inputs: &[
            ("did", AbiType::Bytes32, true),
            ("owner", AbiType::Address, true),
            ("checksum", AbiType::Bytes32, true),
            ("value", AbiType::String, false),
            ("lastUpdatedBy", AbiType::Address, false),
            ("blockNumberUpdated", AbiType::Uint256, false),
        ],
    },
    EventSpec {
        contract: TEMPLATE_STORE_MANAGER,
        name: "TemplateSetup",
        inputs: &[
            ("templateId", AbiType::Bytes32, true),
            ("provider", AbiType::Address, true),
        ],
    },
    EventSpec {
        contract: AGREEMENT_STORE_MANAGER,
        name: "AgreementInitialized",
        inputs: &[
            ("agreementId", AbiType::Bytes32, true),
            ("templateId", AbiType::Bytes32, true),
            ("did", AbiType::Bytes32, true),
            ("consumer", AbiType::Address, false),
            ("creator", AbiType::Address, false),
        ],
    },
    EventSpec {
        contract: LOCK_REWARD_CONDITION,
        name: "Fulfilled",
        inputs: &[
            ("agreementId", AbiType::Bytes32, true),
            ("rewardAddress", AbiType::Address, true),
            ("conditionId", AbiType::Bytes32, false),
            ("amount", AbiType::Uint256, false),
        ],
    },
    EventSpec {
        contract: ACCESS_SECRET_STORE_CONDITION,
        name: "Fulfilled",
        inputs: &[
            ("agreementId", AbiType::Bytes32, true),
            ("documentId", AbiType::Bytes32, true),
            ("grantee", AbiType::Address, true),
            ("conditionId", AbiType::Bytes32, false),
        ],
    },
    EventSpec {
        contract: ESCROW_REWARD,
        name: "Fulfilled",
        inputs: &[
            ("agreementId", AbiType::Bytes32, true),
            ("receiver", AbiType::Address, true),
            ("conditionId", AbiType::Bytes32, false),
            ("amount", AbiType::Uint256, false),
        ],
    },
];

pub fn event_spec(contract: &str, name: &str) -> Option<&'static EventSpec> {
    EVENTS.iter().find(|e| e.contract == contract && e.name == name)
}

static BY_TOPIC: Lazy<HashMap<Bytes32, Vec<&'static EventSpec>>> = Lazy::new(|| {
    let mut index: HashMap<Bytes32, Vec<&'static EventSpec>> = HashMap::new();
    for spec in EVENTS {
        index.entry(spec.topic()).or_default().push(spec);
    }
    index
});

/// Looks up an event by its emitting contract and `topic0`.
pub fn event_by_topic(contract: &str, topic: &Bytes32) -> Option<&'static EventSpec> {
    BY_TOPIC
        .get(topic)?
        .iter()
        .find(|e| e.contract == contract)
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(block: u64) -> ChainEvent {
        let mut values = BTreeMap::new();
        values.insert("agreementId".to_string(), AbiValue::Bytes32(Bytes32([1u8; 32])));
        ChainEvent {
            contract: AGREEMENT_STORE_MANAGER.to_string(),
            event: "AgreementInitialized".to_string(),
            block_number: block,
            transaction_hash: Bytes32([2u8; 32]),
            log_index: 0,
            return_values: values,
        }
    }

    #[test]
    fn test_query_matches_on_exact_filter() {
        let mut query = EventQuery {
            contract: AGREEMENT_STORE_MANAGER.to_string(),
            event: "AgreementInitialized".to_string(),
            ..Default::default()
        };
        assert!(query.matches(&sample_event(3)));

        query
            .filter
            .insert("agreementId".to_string(), AbiValue::Bytes32(Bytes32([9u8; 32])));
        assert!(!query.matches(&sample_event(3)));
    }

    #[test]
    fn test_query_block_range() {
        let query = EventQuery {
            contract: AGREEMENT_STORE_MANAGER.to_string(),
            event: "AgreementInitialized".to_string(),
            from_block: 5,
            to_block: Some(6),
            ..Default::default()
        };
        assert!(!query.matches(&sample_event(4)));
        assert!(query.matches(&sample_event(6)));
        assert!(!query.matches(&sample_event(7)));
    }

    #[test]
    fn test_event_table_signatures() {
        let spec = event_spec(LOCK_REWARD_CONDITION, "Fulfilled").unwrap();
        assert_eq!(spec.signature(), "Fulfilled(bytes32,address,bytes32,uint256)");
        assert!(event_spec(OCEAN_TOKEN, "Fulfilled").is_none());

        let found = event_by_topic(LOCK_REWARD_CONDITION, &spec.topic()).unwrap();
        assert_eq!(found.contract, LOCK_REWARD_CONDITION);
        // Same signature, different emitter.
        assert_eq!(event_by_topic(ESCROW_REWARD, &spec.topic()).unwrap().contract, ESCROW_REWARD);
        assert!(event_by_topic(ACCESS_SECRET_STORE_CONDITION, &spec.topic()).is_none());
    }
}
