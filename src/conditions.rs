//! Condition fulfillment clients.
//!
//! The three condition kinds share one client type, dispatched on the closed
//! [`ConditionKind`] enum. Identity hashing is pure and must agree byte for byte
//! with the contracts; fulfillment submits a transaction and succeeds only if the
//! receipt carries the condition's `Fulfilled` event. No dependency checks are
//! done here; the chain rejects out-of-order fulfillment.

use crate::abi::{solidity_sha3, AbiType, AbiValue};
use crate::account::Account;
use crate::chain::{
    ChainClient, ChainEvent, TransactionReceipt, ACCESS_SECRET_STORE_CONDITION, CONDITION_STORE_MANAGER,
    ESCROW_REWARD, LOCK_REWARD_CONDITION,
};
use crate::contract::ContractHandle;
use crate::error::{Result, SdkError};
use crate::primitives::{Address, Bytes32};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::info;

pub const FULFILLED_EVENT: &str = "Fulfilled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionKind {
    LockReward,
    AccessSecretStore,
    EscrowReward,
}

/// Which party fulfills a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    Consumer,
    Publisher,
}

impl ConditionKind {
    pub const ALL: [ConditionKind; 3] = [
        ConditionKind::LockReward,
        ConditionKind::AccessSecretStore,
        ConditionKind::EscrowReward,
    ];

    /// Condition name as used in templates and DDOs.
    pub fn name(&self) -> &'static str {
        match self {
            ConditionKind::LockReward => "lockReward",
            ConditionKind::AccessSecretStore => "accessSecretStore",
            ConditionKind::EscrowReward => "escrowReward",
        }
    }

    pub fn contract(&self) -> &'static str {
        match self {
            ConditionKind::LockReward => LOCK_REWARD_CONDITION,
            ConditionKind::AccessSecretStore => ACCESS_SECRET_STORE_CONDITION,
            ConditionKind::EscrowReward => ESCROW_REWARD,
        }
    }

    pub fn actor(&self) -> Actor {
        match self {
            ConditionKind::LockReward => Actor::Consumer,
            ConditionKind::AccessSecretStore | ConditionKind::EscrowReward => Actor::Publisher,
        }
    }

    /// Types of the hashed parameters, in on-chain order.
    pub fn parameter_types(&self) -> &'static [AbiType] {
        match self {
            ConditionKind::LockReward => &[AbiType::Address, AbiType::Uint256],
            ConditionKind::AccessSecretStore => &[AbiType::Bytes32, AbiType::Address],
            ConditionKind::EscrowReward => &[
                AbiType::Uint256,
                AbiType::Address,
                AbiType::Address,
                AbiType::Bytes32,
                AbiType::Bytes32,
            ],
        }
    }

    /// Full `fulfill` input list: the agreement id followed by the parameters.
    pub fn fulfill_inputs(&self) -> Vec<AbiType> {
        let mut inputs = vec![AbiType::Bytes32];
        inputs.extend_from_slice(self.parameter_types());
        inputs
    }

    /// Accepts either the condition name or the contract name.
    pub fn parse(name: &str) -> Result<Self> {
        ConditionKind::ALL
            .into_iter()
            .find(|k| k.name() == name || k.contract() == name)
            .ok_or_else(|| SdkError::Validation(format!("Unknown condition '{}'", name)))
    }
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Typed parameters of one condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionParams {
    LockReward {
        reward_address: Address,
        amount: u128,
    },
    AccessSecretStore {
        document_id: Bytes32,
        grantee: Address,
    },
    EscrowReward {
        amount: u128,
        receiver: Address,
        sender: Address,
        lock_condition: Bytes32,
        release_condition: Bytes32,
    },
}

impl ConditionParams {
    pub fn kind(&self) -> ConditionKind {
        match self {
            ConditionParams::LockReward { .. } => ConditionKind::LockReward,
            ConditionParams::AccessSecretStore { .. } => ConditionKind::AccessSecretStore,
            ConditionParams::EscrowReward { .. } => ConditionKind::EscrowReward,
        }
    }

    pub fn value_pairs(&self) -> Vec<AbiValue> {
        match self {
            ConditionParams::LockReward { reward_address, amount } => {
                vec![AbiValue::Address(*reward_address), AbiValue::Uint256(*amount)]
            }
            ConditionParams::AccessSecretStore { document_id, grantee } => {
                vec![AbiValue::Bytes32(*document_id), AbiValue::Address(*grantee)]
            }
            ConditionParams::EscrowReward {
                amount,
                receiver,
                sender,
                lock_condition,
                release_condition,
            } => vec![
                AbiValue::Uint256(*amount),
                AbiValue::Address(*receiver),
                AbiValue::Address(*sender),
                AbiValue::Bytes32(*lock_condition),
                AbiValue::Bytes32(*release_condition),
            ],
        }
    }

    pub fn hash_values(&self) -> Bytes32 {
        solidity_sha3(&self.value_pairs())
    }

    /// Rebuilds typed parameters from ordered values, checking count and types.
    pub fn from_values(kind: ConditionKind, values: &[AbiValue]) -> Result<Self> {
        let expected = kind.parameter_types();
        let actual: Vec<AbiType> = values.iter().map(AbiValue::abi_type).collect();
        if actual != expected {
            return Err(SdkError::Validation(format!(
                "{} expects parameters {:?}, got {:?}",
                kind, expected, actual
            )));
        }

        let address = |i: usize| values[i].as_address().unwrap_or_default();
        let bytes32 = |i: usize| values[i].as_bytes32().unwrap_or_default();
        let uint = |i: usize| values[i].as_uint().unwrap_or_default();

        Ok(match kind {
            ConditionKind::LockReward => ConditionParams::LockReward {
                reward_address: address(0),
                amount: uint(1),
            },
            ConditionKind::AccessSecretStore => ConditionParams::AccessSecretStore {
                document_id: bytes32(0),
                grantee: address(1),
            },
            ConditionKind::EscrowReward => ConditionParams::EscrowReward {
                amount: uint(0),
                receiver: address(1),
                sender: address(2),
                lock_condition: bytes32(3),
                release_condition: bytes32(4),
            },
        })
    }
}

/// `sha3(agreementId, conditionContract, valueHash)`.
pub fn generate_id(agreement_id: &Bytes32, contract: &Address, value_hash: &Bytes32) -> Bytes32 {
    solidity_sha3(&[
        AbiValue::Bytes32(*agreement_id),
        AbiValue::Address(*contract),
        AbiValue::Bytes32(*value_hash),
    ])
}

/// On-chain condition state as stored by the condition store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionState {
    Uninitialized,
    Unfulfilled,
    Fulfilled,
    Aborted,
}

impl ConditionState {
    pub fn from_code(code: u128) -> Result<Self> {
        match code {
            0 => Ok(ConditionState::Uninitialized),
            1 => Ok(ConditionState::Unfulfilled),
            2 => Ok(ConditionState::Fulfilled),
            3 => Ok(ConditionState::Aborted),
            other => Err(SdkError::Abi(format!("unknown condition state {}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Fulfillment {
    pub condition_id: Bytes32,
    pub receipt: TransactionReceipt,
    pub event: ChainEvent,
}

#[derive(Clone)]
pub struct ConditionClient {
    kind: ConditionKind,
    contract: ContractHandle,
}

impl ConditionClient {
    pub fn new(kind: ConditionKind, chain: Arc<dyn ChainClient>) -> Self {
        Self {
            kind,
            contract: ContractHandle::new(kind.contract(), chain),
        }
    }

    pub fn kind(&self) -> ConditionKind {
        self.kind
    }

    pub fn address(&self) -> Result<Address> {
        self.contract.address()
    }

    fn check_kind(&self, params: &ConditionParams) -> Result<()> {
        if params.kind() != self.kind {
            return Err(SdkError::Validation(format!(
                "{} parameters given to the {} condition",
                params.kind(),
                self.kind
            )));
        }
        Ok(())
    }

    pub fn hash_values(&self, params: &ConditionParams) -> Result<Bytes32> {
        self.check_kind(params)?;
        Ok(params.hash_values())
    }

    pub fn compute_condition_id(&self, agreement_id: &Bytes32, params: &ConditionParams) -> Result<Bytes32> {
        let value_hash = self.hash_values(params)?;
        Ok(generate_id(agreement_id, &self.address()?, &value_hash))
    }

    pub async fn fulfill(&self, agreement_id: &Bytes32, params: &ConditionParams, account: &Account) -> Result<Fulfillment> {
        let condition_id = self.compute_condition_id(agreement_id, params)?;
        let mut args = vec![AbiValue::Bytes32(*agreement_id)];
        args.extend(params.value_pairs());

        info!(condition = %self.kind, agreement = %agreement_id, %condition_id, from = %account.address(), "Fulfilling condition");
        let (receipt, event) = self
            .contract
            .send_expecting("fulfill", args, account, FULFILLED_EVENT)
            .await?;

        Ok(Fulfillment {
            condition_id,
            receipt,
            event,
        })
    }

    /// Whether `grantee` may access `document_id`. Only the access condition answers this.
    pub async fn check_permissions(&self, grantee: &Address, document_id: &Bytes32) -> Result<bool> {
        if self.kind != ConditionKind::AccessSecretStore {
            return Err(SdkError::Validation(format!("{} does not track permissions", self.kind)));
        }
        let value = self
            .contract
            .call_one(
                "checkPermissions",
                vec![AbiValue::Address(*grantee), AbiValue::Bytes32(*document_id)],
                AbiType::Bool,
            )
            .await?;
        value
            .as_bool()
            .ok_or_else(|| SdkError::Abi("checkPermissions did not return a bool".to_string()))
    }
}

#[derive(Clone)]
pub struct ConditionStore {
    contract: ContractHandle,
}

impl ConditionStore {
    pub fn new(chain: Arc<dyn ChainClient>) -> Self {
        Self {
            contract: ContractHandle::new(CONDITION_STORE_MANAGER, chain),
        }
    }

    pub async fn state(&self, condition_id: &Bytes32) -> Result<ConditionState> {
        let value = self
            .contract
            .call_one("getConditionState", vec![AbiValue::Bytes32(*condition_id)], AbiType::Uint8)
            .await?;
        let code = value
            .as_uint()
            .ok_or_else(|| SdkError::Abi("getConditionState did not return an integer".to_string()))?;
        ConditionState::from_code(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;

    fn access(document_id: Bytes32, grantee: Address) -> ConditionParams {
        ConditionParams::AccessSecretStore { document_id, grantee }
    }

    #[test]
    fn test_hash_is_deterministic() {
        let params = ConditionParams::LockReward {
            reward_address: Address([1u8; 20]),
            amount: 100,
        };
        assert_eq!(params.hash_values(), params.clone().hash_values());
    }

    #[test]
    fn test_parameter_order_matters() {
        let a = AbiValue::Uint256(100);
        let b = AbiValue::Address(Address([2u8; 20]));
        assert_ne!(solidity_sha3(&[a.clone(), b.clone()]), solidity_sha3(&[b, a]));

        let lock = ConditionParams::LockReward {
            reward_address: Address([2u8; 20]),
            amount: 100,
        };
        let swapped = lock.value_pairs().into_iter().rev().collect::<Vec<_>>();
        assert_ne!(lock.hash_values(), solidity_sha3(&swapped));
    }

    #[test]
    fn test_condition_id_depends_on_agreement_and_contract() {
        let value_hash = access(Bytes32([3u8; 32]), Address([4u8; 20])).hash_values();
        let contract = Address([5u8; 20]);
        let a = generate_id(&Bytes32([1u8; 32]), &contract, &value_hash);
        let b = generate_id(&Bytes32([2u8; 32]), &contract, &value_hash);
        let c = generate_id(&Bytes32([1u8; 32]), &Address([6u8; 20]), &value_hash);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, generate_id(&Bytes32([1u8; 32]), &contract, &value_hash));
    }

    #[test]
    fn test_from_values_checks_types() {
        let params = access(Bytes32([3u8; 32]), Address([4u8; 20]));
        let back = ConditionParams::from_values(ConditionKind::AccessSecretStore, &params.value_pairs()).unwrap();
        assert_eq!(back, params);

        let wrong = ConditionParams::from_values(ConditionKind::LockReward, &params.value_pairs());
        assert!(matches!(wrong, Err(SdkError::Validation(_))));
    }

    #[test]
    fn test_kind_lookup_and_actor() {
        assert_eq!(ConditionKind::parse("lockReward").unwrap(), ConditionKind::LockReward);
        assert_eq!(ConditionKind::parse(ESCROW_REWARD).unwrap(), ConditionKind::EscrowReward);
        assert!(ConditionKind::parse("signCondition").is_err());
        assert_eq!(ConditionKind::LockReward.actor(), Actor::Consumer);
        assert_eq!(ConditionKind::EscrowReward.actor(), Actor::Publisher);
        assert_eq!(ConditionKind::LockReward.fulfill_inputs().len(), 3);
    }

    #[tokio::test]
    async fn test_wrong_params_rejected_before_submission() {
        let mut mock = MockChainClient::new();
        mock.expect_contract_address().returning(|_| Ok(Address([7u8; 20])));
        mock.expect_estimate_gas().never();

        let client = ConditionClient::new(ConditionKind::LockReward, Arc::new(mock));
        let err = client
            .fulfill(&Bytes32([1u8; 32]), &access(Bytes32::zero(), Address::zero()), &Account::random())
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::Validation(_)));
    }

    #[tokio::test]
    async fn test_fulfill_without_event_is_protocol_error() {
        let mut mock = MockChainClient::new();
        mock.expect_contract_address().returning(|_| Ok(Address([7u8; 20])));
        mock.expect_estimate_gas().returning(|_, _| Ok(30_000));
        mock.expect_send_transaction().returning(|call, from, _| {
            assert_eq!(call.method, "fulfill");
            assert_eq!(call.args.len(), 3);
            Ok(TransactionReceipt {
                transaction_hash: Bytes32([8u8; 32]),
                block_number: 3,
                from,
                status: true,
                gas_used: 30_000,
                events: Vec::new(),
            })
        });

        let client = ConditionClient::new(ConditionKind::LockReward, Arc::new(mock));
        let params = ConditionParams::LockReward {
            reward_address: Address([9u8; 20]),
            amount: 10,
        };
        let err = client
            .fulfill(&Bytes32([1u8; 32]), &params, &Account::random())
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::Protocol { ref contract, .. } if contract == LOCK_REWARD_CONDITION));
    }
}
