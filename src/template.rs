//! Agreement templates and their registry client.
//!
//! A template is an ordered list of conditions. The order is the on-chain order:
//! condition ids, value hashes, timeouts and the dependency matrix are all laid out
//! by it, so it must never change after registration.

use crate::abi::{method_signature, selector, solidity_sha3, AbiType, AbiValue};
use crate::account::Account;
use crate::chain::{ChainClient, TransactionReceipt, ESCROW_REWARD, TEMPLATE_STORE_MANAGER};
use crate::conditions::ConditionKind;
use crate::contract::ContractHandle;
use crate::ddo::{ConditionParameter, ServiceCondition};
use crate::error::{Result, SdkError};
use crate::primitives::{Address, Bytes32, Bytes4};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

pub const ESCROW_ACCESS_SECRET_STORE_TEMPLATE: &str = "EscrowAccessSecretStoreTemplate";

/// Each condition's dependencies fit in one 32-bit word, two bits per slot.
pub const MAX_CONDITIONS: usize = 16;

const DEPENDENCY_BIT: u32 = 0b01;
const TIMEOUT_BIT: u32 = 0b10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FulfillmentOperator {
    And,
    Or,
}

impl FulfillmentOperator {
    pub fn code(&self) -> u8 {
        match self {
            FulfillmentOperator::And => 0,
            FulfillmentOperator::Or => 1,
        }
    }
}

/// Recognised condition parameter names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterName {
    RewardAddress,
    Amount,
    DocumentId,
    Grantee,
    Receiver,
    Sender,
    LockCondition,
    ReleaseCondition,
}

/// Values known when an asset is published.
#[derive(Debug, Clone)]
pub struct PublishContext {
    pub asset_id: Bytes32,
    pub price: u128,
    pub publisher: Address,
    pub escrow_address: Address,
}

impl ParameterName {
    pub fn parse(name: &str) -> Result<Self> {
        let parsed = match name.trim_start_matches('_') {
            "rewardAddress" => ParameterName::RewardAddress,
            "amount" => ParameterName::Amount,
            "documentId" => ParameterName::DocumentId,
            "grantee" => ParameterName::Grantee,
            "receiver" => ParameterName::Receiver,
            "sender" => ParameterName::Sender,
            "lockCondition" => ParameterName::LockCondition,
            "releaseCondition" => ParameterName::ReleaseCondition,
            _ => {
                return Err(SdkError::Validation(format!(
                    "Unrecognised condition parameter '{}'",
                    name
                )))
            }
        };
        Ok(parsed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterName::RewardAddress => "_rewardAddress",
            ParameterName::Amount => "_amount",
            ParameterName::DocumentId => "_documentId",
            ParameterName::Grantee => "_grantee",
            ParameterName::Receiver => "_receiver",
            ParameterName::Sender => "_sender",
            ParameterName::LockCondition => "_lockCondition",
            ParameterName::ReleaseCondition => "_releaseCondition",
        }
    }

    pub fn abi_type(&self) -> AbiType {
        match self {
            ParameterName::RewardAddress | ParameterName::Grantee | ParameterName::Receiver | ParameterName::Sender => {
                AbiType::Address
            }
            ParameterName::Amount => AbiType::Uint256,
            ParameterName::DocumentId | ParameterName::LockCondition | ParameterName::ReleaseCondition => {
                AbiType::Bytes32
            }
        }
    }

    /// Publish-time value, or `Null` for values only known once an order is placed.
    pub fn publish_value(&self, ctx: &PublishContext) -> Value {
        match self {
            ParameterName::RewardAddress => Value::String(ctx.escrow_address.to_hex()),
            ParameterName::Amount => Value::String(ctx.price.to_string()),
            ParameterName::DocumentId => Value::String(ctx.asset_id.to_hex()),
            ParameterName::Receiver => Value::String(ctx.publisher.to_hex()),
            ParameterName::Grantee
            | ParameterName::Sender
            | ParameterName::LockCondition
            | ParameterName::ReleaseCondition => Value::Null,
        }
    }

    /// Parameter names of a condition kind, in on-chain order.
    pub fn for_kind(kind: ConditionKind) -> &'static [ParameterName] {
        match kind {
            ConditionKind::LockReward => &[ParameterName::RewardAddress, ParameterName::Amount],
            ConditionKind::AccessSecretStore => &[ParameterName::DocumentId, ParameterName::Grantee],
            ConditionKind::EscrowReward => &[
                ParameterName::Amount,
                ParameterName::Receiver,
                ParameterName::Sender,
                ParameterName::LockCondition,
                ParameterName::ReleaseCondition,
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionDefinition {
    pub name: String,
    pub kind: ConditionKind,
    pub dependencies: Vec<String>,
    pub dependency_timeout_flags: Vec<bool>,
    pub timeout: u64,
    pub timelock: u64,
    pub is_terminal: bool,
}

impl ConditionDefinition {
    pub fn new(kind: ConditionKind) -> Self {
        Self {
            name: kind.name().to_string(),
            kind,
            dependencies: Vec::new(),
            dependency_timeout_flags: Vec::new(),
            timeout: 0,
            timelock: 0,
            is_terminal: false,
        }
    }

    pub fn depends_on(mut self, name: &str, timeout_satisfies: bool) -> Self {
        self.dependencies.push(name.to_string());
        self.dependency_timeout_flags.push(timeout_satisfies);
        self
    }

    pub fn terminal(mut self) -> Self {
        self.is_terminal = true;
        self
    }

    pub fn parameters(&self) -> &'static [ParameterName] {
        ParameterName::for_kind(self.kind)
    }
}

/// Contract address and function selector of a condition's `fulfill`.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodReflection {
    pub condition: String,
    pub contract_name: String,
    pub address: Address,
    pub signature: String,
    pub selector: Bytes4,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateDefinition {
    pub id: Bytes32,
    pub name: String,
    pub conditions: Vec<ConditionDefinition>,
    pub fulfillment_operator: FulfillmentOperator,
}

impl TemplateDefinition {
    pub fn id_for(name: &str) -> Bytes32 {
        solidity_sha3(&[AbiValue::String(name.to_string())])
    }

    /// lockReward, then accessSecretStore, then escrowReward (terminal). The escrow
    /// also releases when the access condition times out, refunding the consumer.
    pub fn escrow_access_secret_store() -> Self {
        Self {
            id: Self::id_for(ESCROW_ACCESS_SECRET_STORE_TEMPLATE),
            name: ESCROW_ACCESS_SECRET_STORE_TEMPLATE.to_string(),
            conditions: vec![
                ConditionDefinition::new(ConditionKind::LockReward),
                ConditionDefinition::new(ConditionKind::AccessSecretStore).depends_on("lockReward", false),
                ConditionDefinition::new(ConditionKind::EscrowReward)
                    .depends_on("lockReward", false)
                    .depends_on("accessSecretStore", true)
                    .terminal(),
            ],
            fulfillment_operator: FulfillmentOperator::And,
        }
    }

    pub fn with_timeout(mut self, condition: &str, timeout: u64) -> Self {
        if let Some(c) = self.conditions.iter_mut().find(|c| c.name == condition) {
            c.timeout = timeout;
        }
        self
    }

    pub fn with_timelock(mut self, condition: &str, timelock: u64) -> Self {
        if let Some(c) = self.conditions.iter_mut().find(|c| c.name == condition) {
            c.timelock = timelock;
        }
        self
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.conditions.iter().position(|c| c.name == name)
    }

    pub fn condition(&self, name: &str) -> Option<&ConditionDefinition> {
        self.conditions.iter().find(|c| c.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_zero() {
            return Err(SdkError::Validation("Template id is missing".to_string()));
        }
        if self.conditions.is_empty() || self.conditions.len() > MAX_CONDITIONS {
            return Err(SdkError::Validation(format!(
                "Template must have between 1 and {} conditions, has {}",
                MAX_CONDITIONS,
                self.conditions.len()
            )));
        }

        let mut seen = HashSet::new();
        for condition in &self.conditions {
            if !seen.insert(condition.name.as_str()) {
                return Err(SdkError::Validation(format!("Duplicate condition '{}'", condition.name)));
            }
            if condition.dependencies.len() != condition.dependency_timeout_flags.len() {
                return Err(SdkError::Validation(format!(
                    "Condition '{}' has {} dependencies but {} timeout flags",
                    condition.name,
                    condition.dependencies.len(),
                    condition.dependency_timeout_flags.len()
                )));
            }
            let mut named = HashSet::new();
            for dependency in &condition.dependencies {
                if !named.insert(dependency.as_str()) {
                    return Err(SdkError::Validation(format!(
                        "Condition '{}' lists dependency '{}' twice",
                        condition.name, dependency
                    )));
                }
                if dependency == &condition.name {
                    return Err(SdkError::Validation(format!("Condition '{}' depends on itself", condition.name)));
                }
                if self.index_of(dependency).is_none() {
                    return Err(SdkError::Validation(format!(
                        "Condition '{}' depends on unknown condition '{}'",
                        condition.name, dependency
                    )));
                }
            }
        }

        if !self.conditions.iter().any(|c| c.is_terminal) {
            return Err(SdkError::Validation("Template has no terminal condition".to_string()));
        }
        Ok(())
    }

    /// One word per condition: for each dependency at slot `j`, bit `2j` marks the
    /// dependency and bit `2j + 1` marks that its timeout also satisfies it.
    pub fn dependency_matrix(&self) -> Result<Vec<u32>> {
        self.validate()?;
        let mut matrix = Vec::with_capacity(self.conditions.len());
        for condition in &self.conditions {
            let mut value = 0u32;
            for (dependency, timeout_flag) in condition.dependencies.iter().zip(&condition.dependency_timeout_flags) {
                let slot = self
                    .index_of(dependency)
                    .ok_or_else(|| SdkError::Validation(format!("Unknown dependency '{}'", dependency)))?;
                value |= DEPENDENCY_BIT << (2 * slot);
                if *timeout_flag {
                    value |= TIMEOUT_BIT << (2 * slot);
                }
            }
            matrix.push(value);
        }
        Ok(matrix)
    }

    /// Inverse of [`TemplateDefinition::dependency_matrix`]: per condition, the
    /// dependency names and their timeout flags in template order.
    pub fn decode_dependencies(&self, matrix: &[u32]) -> Result<Vec<(Vec<String>, Vec<bool>)>> {
        let names: Vec<&str> = self.conditions.iter().map(|c| c.name.as_str()).collect();
        if matrix.len() != names.len() {
            return Err(SdkError::Validation(format!(
                "Dependency matrix has {} entries for {} conditions",
                matrix.len(),
                names.len()
            )));
        }
        matrix.iter().map(|value| decode_dependency_word(*value, &names)).collect()
    }

    pub fn fulfillment_indices(&self) -> Vec<usize> {
        self.conditions
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_terminal)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn method_reflections(&self, chain: &dyn ChainClient) -> Result<Vec<MethodReflection>> {
        self.conditions
            .iter()
            .map(|condition| {
                let inputs = condition.kind.fulfill_inputs();
                Ok(MethodReflection {
                    condition: condition.name.clone(),
                    contract_name: condition.kind.contract().to_string(),
                    address: chain.contract_address(condition.kind.contract())?,
                    signature: method_signature("fulfill", &inputs),
                    selector: selector("fulfill", &inputs),
                })
            })
            .collect()
    }

    pub fn condition_key(&self, reflection: &MethodReflection) -> Bytes32 {
        solidity_sha3(&[
            AbiValue::Bytes32(self.id),
            AbiValue::Address(reflection.address),
            AbiValue::Bytes4(reflection.selector),
        ])
    }

    /// Materialises the template's conditions for a DDO access service.
    pub fn ddo_conditions(&self, chain: &dyn ChainClient, ctx: &PublishContext) -> Result<Vec<ServiceCondition>> {
        self.validate()?;
        let reflections = self.method_reflections(chain)?;
        self.conditions
            .iter()
            .zip(&reflections)
            .enumerate()
            .map(|(index, (condition, reflection))| {
                let parameters = condition
                    .parameters()
                    .iter()
                    .map(|p| ConditionParameter {
                        name: p.as_str().to_string(),
                        abi_type: p.abi_type(),
                        value: p.publish_value(ctx),
                    })
                    .collect();
                Ok(ServiceCondition {
                    name: condition.name.clone(),
                    contract_name: reflection.contract_name.clone(),
                    function_name: "fulfill".to_string(),
                    index,
                    timeout: condition.timeout,
                    timelock: condition.timelock,
                    condition_key: self.condition_key(reflection),
                    parameters,
                    dependencies: condition.dependencies.clone(),
                    dependency_timeout_flags: condition.dependency_timeout_flags.clone(),
                    is_terminal: condition.is_terminal,
                })
            })
            .collect()
    }
}

/// Decodes one dependency word against the template's condition names.
pub fn decode_dependency_word(value: u32, names: &[&str]) -> Result<(Vec<String>, Vec<bool>)> {
    let mut dependencies = Vec::new();
    let mut flags = Vec::new();
    for slot in 0..MAX_CONDITIONS {
        let bits = (value >> (2 * slot)) & 0b11;
        if bits == 0 {
            continue;
        }
        if bits & DEPENDENCY_BIT == 0 {
            return Err(SdkError::Validation(format!("Timeout flag without dependency at slot {}", slot)));
        }
        let name = names
            .get(slot)
            .ok_or_else(|| SdkError::Validation(format!("Dependency slot {} has no condition", slot)))?;
        dependencies.push(name.to_string());
        flags.push(bits & TIMEOUT_BIT != 0);
    }
    Ok((dependencies, flags))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemplateStatus {
    Uninitialized,
    Proposed,
    Approved,
    Revoked,
}

#[derive(Debug, Clone)]
pub enum Registration {
    Registered(TransactionReceipt),
    AlreadyRegistered,
}

#[derive(Clone)]
pub struct TemplateRegistry {
    contract: ContractHandle,
}

impl TemplateRegistry {
    pub fn new(chain: Arc<dyn ChainClient>) -> Self {
        Self {
            contract: ContractHandle::new(TEMPLATE_STORE_MANAGER, chain),
        }
    }

    pub async fn owner(&self, template_id: &Bytes32) -> Result<Address> {
        let value = self
            .contract
            .call_one("getTemplateOwner", vec![AbiValue::Bytes32(*template_id)], AbiType::Address)
            .await?;
        value
            .as_address()
            .ok_or_else(|| SdkError::Abi("getTemplateOwner did not return an address".to_string()))
    }

    pub async fn status(&self, template_id: &Bytes32) -> Result<TemplateStatus> {
        let value = self
            .contract
            .call_one("getTemplateStatus", vec![AbiValue::Bytes32(*template_id)], AbiType::Uint8)
            .await?;
        match value.as_uint() {
            Some(0) => Ok(TemplateStatus::Uninitialized),
            Some(1) => Ok(TemplateStatus::Proposed),
            Some(2) => Ok(TemplateStatus::Approved),
            Some(3) => Ok(TemplateStatus::Revoked),
            other => Err(SdkError::Abi(format!("unknown template status {:?}", other))),
        }
    }

    /// Registers the template under `owner`. Registering again as the same owner is
    /// a no-op; a template held by someone else is an error.
    pub async fn register(&self, template: &TemplateDefinition, owner: &Account) -> Result<Registration> {
        template.validate()?;

        let current = self.owner(&template.id).await?;
        if current == owner.address() {
            info!(template = %template.name, owner = %current, "Template already registered");
            return Ok(Registration::AlreadyRegistered);
        }
        if !current.is_zero() {
            warn!(template = %template.name, owner = %current, "Template owned by another account");
            return Err(SdkError::TemplateOwnership {
                template: template.id.to_string(),
                owner: current.to_string(),
            });
        }

        let reflections = template.method_reflections(self.contract.chain().as_ref())?;
        let matrix = template.dependency_matrix()?;
        let args = vec![
            AbiValue::Bytes32(template.id),
            AbiValue::AddressArray(reflections.iter().map(|r| r.address).collect()),
            AbiValue::Bytes4Array(reflections.iter().map(|r| r.selector).collect()),
            AbiValue::Uint256Array(matrix.iter().map(|v| u128::from(*v)).collect()),
            AbiValue::Uint256Array(template.fulfillment_indices().iter().map(|i| *i as u128).collect()),
            AbiValue::Uint8(template.fulfillment_operator.code()),
            AbiValue::Address(owner.address()),
        ];

        let (receipt, event) = self
            .contract
            .send_expecting("setupTemplate", args, owner, "TemplateSetup")
            .await?;

        let matches = event.value("templateId") == Some(&AbiValue::Bytes32(template.id))
            && event.value("provider") == Some(&AbiValue::Address(owner.address()));
        if !matches {
            return Err(SdkError::Protocol {
                contract: TEMPLATE_STORE_MANAGER.to_string(),
                method: "setupTemplate".to_string(),
                expected_event: format!("TemplateSetup for {}", template.id),
                transaction_hash: receipt.transaction_hash.to_string(),
            });
        }

        info!(template = %template.name, id = %template.id, owner = %owner.address(), "Template registered");
        Ok(Registration::Registered(receipt))
    }
}

/// Address the lock condition pays into.
pub fn escrow_address(chain: &dyn ChainClient) -> Result<Address> {
    chain.contract_address(ESCROW_REWARD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::memory::MemoryChain;

    fn chain_of(n: usize, seed: u64) -> TemplateDefinition {
        // deterministic pseudo-random dependencies on earlier conditions
        let mut state = seed;
        let mut next = || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            state >> 33
        };
        let kinds = ConditionKind::ALL;
        let mut conditions = Vec::new();
        for i in 0..n {
            let mut c = ConditionDefinition::new(kinds[i % 3]);
            c.name = format!("c{}", i);
            for j in 0..i {
                if next() % 2 == 0 {
                    c = c.depends_on(&format!("c{}", j), next() % 2 == 0);
                }
            }
            conditions.push(c);
        }
        if let Some(last) = conditions.last_mut() {
            last.is_terminal = true;
        }
        TemplateDefinition {
            id: TemplateDefinition::id_for("generated"),
            name: "generated".to_string(),
            conditions,
            fulfillment_operator: FulfillmentOperator::And,
        }
    }

    #[test]
    fn test_builtin_template_matrix() {
        let template = TemplateDefinition::escrow_access_secret_store();
        assert_eq!(template.dependency_matrix().unwrap(), vec![0b0000, 0b0001, 0b1101]);
        assert_eq!(template.fulfillment_indices(), vec![2]);
    }

    #[test]
    fn test_dependency_matrix_roundtrip_up_to_sixteen() {
        for n in 1..=MAX_CONDITIONS {
            for seed in 0..4 {
                let template = chain_of(n, seed + n as u64);
                let matrix = template.dependency_matrix().unwrap();
                let decoded = template.decode_dependencies(&matrix).unwrap();
                for (condition, (deps, flags)) in template.conditions.iter().zip(decoded) {
                    assert_eq!(condition.dependencies, deps);
                    assert_eq!(condition.dependency_timeout_flags, flags);
                }
            }
        }
    }

    #[test]
    fn test_timeout_bit_without_dependency_rejected() {
        assert!(decode_dependency_word(0b10, &["a"]).is_err());
    }

    #[test]
    fn test_validation_failures() {
        let mut template = TemplateDefinition::escrow_access_secret_store();
        template.conditions[1].dependency_timeout_flags.clear();
        assert!(matches!(template.dependency_matrix(), Err(SdkError::Validation(_))));

        let mut template = TemplateDefinition::escrow_access_secret_store();
        template.id = Bytes32::zero();
        assert!(template.validate().is_err());

        let mut template = TemplateDefinition::escrow_access_secret_store();
        template.conditions[2] = template.conditions[2].clone().depends_on("nothing", false);
        assert!(template.validate().is_err());

        assert!(chain_of(MAX_CONDITIONS + 1, 1).validate().is_err());
    }

    #[test]
    fn test_repeated_dependency_rejected() {
        let mut template = TemplateDefinition::escrow_access_secret_store();
        template.conditions[2] = template.conditions[2].clone().depends_on("lockReward", true);
        assert!(matches!(
            template.dependency_matrix(),
            Err(SdkError::Validation(msg)) if msg.contains("twice")
        ));
    }

    #[test]
    fn test_parameter_names_are_closed() {
        assert_eq!(ParameterName::parse("_amount").unwrap(), ParameterName::Amount);
        assert_eq!(ParameterName::parse("grantee").unwrap(), ParameterName::Grantee);
        assert!(matches!(ParameterName::parse("_did"), Err(SdkError::Validation(_))));
    }

    #[test]
    fn test_ddo_conditions_leave_order_time_values_null() {
        let chain = MemoryChain::new();
        let template = TemplateDefinition::escrow_access_secret_store().with_timeout("accessSecretStore", 10);
        let ctx = PublishContext {
            asset_id: Bytes32([1u8; 32]),
            price: 100,
            publisher: Address([2u8; 20]),
            escrow_address: escrow_address(&chain).unwrap(),
        };
        let conditions = template.ddo_conditions(&chain, &ctx).unwrap();
        assert_eq!(conditions.len(), 3);
        assert_eq!(conditions[1].timeout, 10);

        let access = &conditions[1];
        assert_eq!(access.parameters[0].value, Value::String(ctx.asset_id.to_hex()));
        assert!(access.parameters[1].value.is_null());

        let keys: HashSet<_> = conditions.iter().map(|c| c.condition_key).collect();
        assert_eq!(keys.len(), 3);
    }

    #[tokio::test]
    async fn test_register_is_idempotent_per_owner() {
        let chain: Arc<dyn ChainClient> = Arc::new(MemoryChain::new());
        let registry = TemplateRegistry::new(chain);
        let template = TemplateDefinition::escrow_access_secret_store();
        let owner = Account::random();

        assert!(matches!(
            registry.register(&template, &owner).await.unwrap(),
            Registration::Registered(_)
        ));
        assert_eq!(registry.owner(&template.id).await.unwrap(), owner.address());
        assert_eq!(registry.status(&template.id).await.unwrap(), TemplateStatus::Approved);
        assert!(matches!(
            registry.register(&template, &owner).await.unwrap(),
            Registration::AlreadyRegistered
        ));

        let err = registry.register(&template, &Account::random()).await.unwrap_err();
        assert!(matches!(err, SdkError::TemplateOwnership { .. }));
    }
}
