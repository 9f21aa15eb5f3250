//! Service agreements: hashing, signing and the client-side lifecycle.
//!
//! [`AgreementTerms`] turns a DDO access service into the ordered condition ids
//! and value hashes the agreement store expects, and computes the hash the
//! consumer signs. [`Agreement`] tracks the orchestration state around it.

use crate::abi::{solidity_sha3, AbiValue};
use crate::account::{Account, Signature};
use crate::chain::ChainClient;
use crate::conditions::{generate_id, ConditionKind, ConditionParams};
use crate::ddo::{AccessService, ConditionParameter, ServiceCondition};
use crate::did::Did;
use crate::error::{Result, SdkError};
use crate::primitives::{Address, Bytes32};
use crate::template::ParameterName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// `sha3(templateId, valueHashes, timelocks, timeouts, agreementId)`.
pub fn agreement_hash(
    template_id: &Bytes32,
    value_hashes: &[Bytes32],
    timelocks: &[u64],
    timeouts: &[u64],
    agreement_id: &Bytes32,
) -> Bytes32 {
    solidity_sha3(&[
        AbiValue::Bytes32(*template_id),
        AbiValue::Bytes32Array(value_hashes.to_vec()),
        AbiValue::Uint256Array(timelocks.iter().map(|t| u128::from(*t)).collect()),
        AbiValue::Uint256Array(timeouts.iter().map(|t| u128::from(*t)).collect()),
        AbiValue::Bytes32(*agreement_id),
    ])
}

/// One condition of an agreement with every parameter resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionTerms {
    pub name: String,
    pub kind: ConditionKind,
    pub params: ConditionParams,
    pub value_hash: Bytes32,
    pub condition_id: Bytes32,
    pub timelock: u64,
    pub timeout: u64,
    pub dependencies: Vec<String>,
    pub dependency_timeout_flags: Vec<bool>,
    pub is_terminal: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgreementTerms {
    pub agreement_id: Bytes32,
    pub did: Did,
    pub template_id: Bytes32,
    pub consumer: Address,
    pub conditions: Vec<ConditionTerms>,
}

impl AgreementTerms {
    /// Resolves the access service's conditions for `consumer`. Values left null at
    /// publish time are filled in here: the grantee and refund sender are the
    /// consumer, and the escrow's lock/release references are the computed ids of
    /// the lock and access conditions.
    pub fn from_access_service(
        agreement_id: Bytes32,
        did: Did,
        service: &AccessService,
        consumer: Address,
        chain: &dyn ChainClient,
    ) -> Result<Self> {
        if service.template_id.is_zero() {
            return Err(SdkError::Config(format!(
                "Service {} of {} has no template id",
                service.service_definition_id, did
            )));
        }
        if service.conditions.is_empty() {
            return Err(SdkError::Validation(format!(
                "Service {} of {} has no conditions",
                service.service_definition_id, did
            )));
        }

        let mut ordered: Vec<&ServiceCondition> = service.conditions.iter().collect();
        ordered.sort_by_key(|c| c.index);
        for (position, condition) in ordered.iter().enumerate() {
            if condition.index != position {
                return Err(SdkError::Validation(format!(
                    "Condition indices must run 0..{}, found {} at position {}",
                    ordered.len(),
                    condition.index,
                    position
                )));
            }
        }

        let mut resolved: HashMap<ConditionKind, Bytes32> = HashMap::new();
        let mut conditions = Vec::with_capacity(ordered.len());
        for condition in ordered {
            let kind = ConditionKind::parse(&condition.contract_name)
                .or_else(|_| ConditionKind::parse(&condition.name))?;
            if condition.dependencies.len() != condition.dependency_timeout_flags.len() {
                return Err(SdkError::Validation(format!(
                    "Condition '{}' has {} dependencies but {} timeout flags",
                    condition.name,
                    condition.dependencies.len(),
                    condition.dependency_timeout_flags.len()
                )));
            }
            if condition.parameters.len() != kind.parameter_types().len() {
                return Err(SdkError::Validation(format!(
                    "Condition '{}' has {} parameters, {} expects {}",
                    condition.name,
                    condition.parameters.len(),
                    kind,
                    kind.parameter_types().len()
                )));
            }

            for (position, (parameter, expected)) in condition
                .parameters
                .iter()
                .zip(ParameterName::for_kind(kind))
                .enumerate()
            {
                if ParameterName::parse(&parameter.name)? != *expected {
                    return Err(SdkError::Validation(format!(
                        "Condition '{}' parameter {} is {}, expected {}",
                        condition.name,
                        position,
                        parameter.name,
                        expected.as_str()
                    )));
                }
            }

            let values = condition
                .parameters
                .iter()
                .map(|p| order_value(p, consumer, &resolved))
                .collect::<Result<Vec<_>>>()?;
            let params = ConditionParams::from_values(kind, &values)?;
            let value_hash = params.hash_values();
            let condition_id = generate_id(&agreement_id, &chain.contract_address(kind.contract())?, &value_hash);
            resolved.insert(kind, condition_id);

            debug!(condition = %condition.name, %condition_id, %value_hash, "Resolved agreement condition");
            conditions.push(ConditionTerms {
                name: condition.name.clone(),
                kind,
                params,
                value_hash,
                condition_id,
                timelock: condition.timelock,
                timeout: condition.timeout,
                dependencies: condition.dependencies.clone(),
                dependency_timeout_flags: condition.dependency_timeout_flags.clone(),
                is_terminal: condition.is_terminal,
            });
        }

        Ok(Self {
            agreement_id,
            did,
            template_id: service.template_id,
            consumer,
            conditions,
        })
    }

    pub fn value_hashes(&self) -> Vec<Bytes32> {
        self.conditions.iter().map(|c| c.value_hash).collect()
    }

    pub fn condition_ids(&self) -> Vec<Bytes32> {
        self.conditions.iter().map(|c| c.condition_id).collect()
    }

    pub fn timelocks(&self) -> Vec<u64> {
        self.conditions.iter().map(|c| c.timelock).collect()
    }

    pub fn timeouts(&self) -> Vec<u64> {
        self.conditions.iter().map(|c| c.timeout).collect()
    }

    pub fn hash(&self) -> Bytes32 {
        agreement_hash(
            &self.template_id,
            &self.value_hashes(),
            &self.timelocks(),
            &self.timeouts(),
            &self.agreement_id,
        )
    }

    pub fn sign(&self, consumer: &Account, prefix: &str) -> Result<Signature> {
        if consumer.address() != self.consumer {
            return Err(SdkError::Signature(format!(
                "Agreement {} is for consumer {}, not {}",
                self.agreement_id,
                self.consumer,
                consumer.address()
            )));
        }
        consumer.sign_hash(prefix, &self.hash())
    }

    pub fn condition(&self, kind: ConditionKind) -> Option<&ConditionTerms> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    pub fn terminal_conditions(&self) -> impl Iterator<Item = &ConditionTerms> {
        self.conditions.iter().filter(|c| c.is_terminal)
    }

    /// `createAgreement` arguments in contract order.
    pub fn create_args(&self, signature: &Signature) -> Vec<AbiValue> {
        vec![
            AbiValue::Bytes32(self.template_id),
            AbiValue::Bytes32(self.agreement_id),
            AbiValue::Bytes32(self.did.id()),
            AbiValue::Bytes32Array(self.condition_ids()),
            AbiValue::Bytes32Array(self.value_hashes()),
            AbiValue::Uint256Array(self.timelocks().into_iter().map(u128::from).collect()),
            AbiValue::Uint256Array(self.timeouts().into_iter().map(u128::from).collect()),
            AbiValue::Address(self.consumer),
            AbiValue::Bytes(signature.as_bytes().to_vec()),
        ]
    }
}

fn order_value(
    parameter: &ConditionParameter,
    consumer: Address,
    resolved: &HashMap<ConditionKind, Bytes32>,
) -> Result<AbiValue> {
    let name = ParameterName::parse(&parameter.name)?;
    if parameter.abi_type != name.abi_type() {
        return Err(SdkError::Validation(format!(
            "Parameter {} should be {}, DDO says {}",
            parameter.name,
            name.abi_type(),
            parameter.abi_type
        )));
    }
    if !parameter.value.is_null() {
        return AbiValue::from_json(parameter.abi_type, &parameter.value);
    }

    let referenced = |kind: ConditionKind| {
        resolved.get(&kind).copied().map(AbiValue::Bytes32).ok_or_else(|| {
            SdkError::Validation(format!("{} refers to {}, which comes later or is missing", parameter.name, kind))
        })
    };
    match name {
        ParameterName::Grantee | ParameterName::Sender => Ok(AbiValue::Address(consumer)),
        ParameterName::LockCondition => referenced(ConditionKind::LockReward),
        ParameterName::ReleaseCondition => referenced(ConditionKind::AccessSecretStore),
        other => Err(SdkError::Validation(format!("Parameter {} has no value", other.as_str()))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgreementState {
    Created,
    Signed,
    Submitted,
    Initialized,
    ConditionsPending,
    Fulfilled,
    TimedOut,
}

impl AgreementState {
    pub fn is_final(&self) -> bool {
        matches!(self, AgreementState::Fulfilled | AgreementState::TimedOut)
    }

    fn can_move_to(&self, next: AgreementState) -> bool {
        use AgreementState::*;
        matches!(
            (self, next),
            (Created, Signed)
                | (Signed, Submitted)
                | (Submitted, Initialized)
                | (Initialized, ConditionsPending)
                | (ConditionsPending, Fulfilled)
                | (Initialized, TimedOut)
                | (ConditionsPending, TimedOut)
        )
    }
}

impl fmt::Display for AgreementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    pub from: AgreementState,
    pub to: AgreementState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Agreement {
    pub terms: AgreementTerms,
    pub service_definition_id: String,
    pub hash: Bytes32,
    pub signature: Option<Signature>,
    pub state: AgreementState,
    pub history: Vec<StateChange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agreement {
    pub fn new(terms: AgreementTerms, service_definition_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            hash: terms.hash(),
            terms,
            service_definition_id: service_definition_id.into(),
            signature: None,
            state: AgreementState::Created,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuilds an agreement that was already submitted, e.g. in another process,
    /// so it can be resumed.
    pub fn submitted(terms: AgreementTerms, service_definition_id: impl Into<String>, signature: Signature) -> Self {
        let mut agreement = Self::new(terms, service_definition_id);
        agreement.signature = Some(signature);
        agreement.state = AgreementState::Submitted;
        agreement
    }

    pub fn id(&self) -> Bytes32 {
        self.terms.agreement_id
    }

    pub fn did(&self) -> Did {
        self.terms.did
    }

    pub fn consumer(&self) -> Address {
        self.terms.consumer
    }

    pub fn transition(&mut self, next: AgreementState) -> Result<()> {
        if !self.state.can_move_to(next) {
            return Err(SdkError::Validation(format!(
                "Agreement {} cannot move from {} to {}",
                self.id(),
                self.state,
                next
            )));
        }
        let now = Utc::now();
        self.history.push(StateChange {
            from: self.state,
            to: next,
            at: now,
        });
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn sign(&mut self, consumer: &Account, prefix: &str) -> Result<Signature> {
        if self.state != AgreementState::Created {
            return Err(SdkError::Validation(format!(
                "Agreement {} is already {}",
                self.id(),
                self.state
            )));
        }
        let signature = self.terms.sign(consumer, prefix)?;
        self.signature = Some(signature);
        self.transition(AgreementState::Signed)?;
        Ok(signature)
    }

    pub fn signature(&self) -> Result<Signature> {
        self.signature
            .ok_or_else(|| SdkError::Validation(format!("Agreement {} is not signed", self.id())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::recover_personal;
    use crate::chain::memory::MemoryChain;
    use crate::config::DEFAULT_MESSAGE_PREFIX;
    use crate::template::{escrow_address, PublishContext, TemplateDefinition};

    fn access_service(chain: &MemoryChain, price: u128, publisher: Address) -> AccessService {
        let template = TemplateDefinition::escrow_access_secret_store();
        let ctx = PublishContext {
            asset_id: Bytes32([0xd1; 32]),
            price,
            publisher,
            escrow_address: escrow_address(chain).unwrap(),
        };
        AccessService {
            service_definition_id: "1".to_string(),
            service_endpoint: "http://brizo/consume".to_string(),
            purchase_endpoint: "http://brizo/initialize".to_string(),
            template_id: template.id,
            conditions: template.ddo_conditions(chain, &ctx).unwrap(),
        }
    }

    fn terms(chain: &MemoryChain, consumer: Address) -> AgreementTerms {
        let service = access_service(chain, 100, Address([0xbb; 20]));
        AgreementTerms::from_access_service(
            Bytes32([0xaa; 32]),
            Did::from_id(Bytes32([0xd1; 32])),
            &service,
            consumer,
            chain,
        )
        .unwrap()
    }

    #[test]
    fn test_hash_is_deterministic_and_signature_recovers() {
        let chain = MemoryChain::new();
        let consumer = Account::random();
        let a = terms(&chain, consumer.address());
        let b = terms(&chain, consumer.address());
        assert_eq!(a.hash(), b.hash());

        let signature = a.sign(&consumer, DEFAULT_MESSAGE_PREFIX).unwrap();
        let signer = recover_personal(DEFAULT_MESSAGE_PREFIX, a.hash().as_bytes(), &signature).unwrap();
        assert_eq!(signer, consumer.address());
        assert!(a.sign(&Account::random(), DEFAULT_MESSAGE_PREFIX).is_err());
    }

    #[test]
    fn test_order_time_values_filled() {
        let chain = MemoryChain::new();
        let consumer = Address([0xcc; 20]);
        let terms = terms(&chain, consumer);

        let lock = terms.condition(ConditionKind::LockReward).unwrap();
        let access = terms.condition(ConditionKind::AccessSecretStore).unwrap();
        let escrow = terms.condition(ConditionKind::EscrowReward).unwrap();
        assert!(matches!(access.params, ConditionParams::AccessSecretStore { grantee, .. } if grantee == consumer));
        match &escrow.params {
            ConditionParams::EscrowReward {
                amount,
                sender,
                lock_condition,
                release_condition,
                ..
            } => {
                assert_eq!(*amount, 100);
                assert_eq!(*sender, consumer);
                assert_eq!(*lock_condition, lock.condition_id);
                assert_eq!(*release_condition, access.condition_id);
            }
            other => panic!("unexpected params {:?}", other),
        }
        assert_eq!(terms.terminal_conditions().count(), 1);
    }

    #[test]
    fn test_hash_changes_with_inputs() {
        let base = agreement_hash(&Bytes32([1; 32]), &[Bytes32([2; 32])], &[0], &[0], &Bytes32([3; 32]));
        assert_ne!(
            base,
            agreement_hash(&Bytes32([1; 32]), &[Bytes32([2; 32])], &[0], &[1], &Bytes32([3; 32]))
        );
        assert_ne!(
            base,
            agreement_hash(&Bytes32([1; 32]), &[Bytes32([2; 32])], &[0], &[0], &Bytes32([4; 32]))
        );
    }

    #[test]
    fn test_missing_template_is_config_error() {
        let chain = MemoryChain::new();
        let mut service = access_service(&chain, 1, Address([1; 20]));
        service.template_id = Bytes32::zero();
        let err = AgreementTerms::from_access_service(Bytes32::random(), Did::generate(), &service, Address([2; 20]), &chain)
            .unwrap_err();
        assert!(matches!(err, SdkError::Config(_)));
    }

    #[test]
    fn test_count_mismatches_are_validation_errors() {
        let chain = MemoryChain::new();
        let mut service = access_service(&chain, 1, Address([1; 20]));
        service.conditions[0].parameters.pop();
        let err = AgreementTerms::from_access_service(Bytes32::random(), Did::generate(), &service, Address([2; 20]), &chain)
            .unwrap_err();
        assert!(matches!(err, SdkError::Validation(_)));

        let mut service = access_service(&chain, 1, Address([1; 20]));
        service.conditions[2].dependency_timeout_flags.pop();
        let err = AgreementTerms::from_access_service(Bytes32::random(), Did::generate(), &service, Address([2; 20]), &chain)
            .unwrap_err();
        assert!(matches!(err, SdkError::Validation(_)));
    }

    #[test]
    fn test_parameters_out_of_contract_order_are_rejected() {
        let chain = MemoryChain::new();
        let mut service = access_service(&chain, 1, Address([0xbb; 20]));
        // receiver and sender
        service.conditions[2].parameters.swap(1, 2);
        let err = AgreementTerms::from_access_service(Bytes32::random(), Did::generate(), &service, Address([0xcc; 20]), &chain)
            .unwrap_err();
        assert!(matches!(err, SdkError::Validation(msg) if msg.contains("_sender")));

        let mut service = access_service(&chain, 1, Address([0xbb; 20]));
        service.conditions[2].parameters.swap(3, 4);
        let err = AgreementTerms::from_access_service(Bytes32::random(), Did::generate(), &service, Address([0xcc; 20]), &chain)
            .unwrap_err();
        assert!(matches!(err, SdkError::Validation(_)));
    }

    #[test]
    fn test_state_transitions_are_guarded() {
        let chain = MemoryChain::new();
        let consumer = Account::random();
        let mut agreement = Agreement::new(terms(&chain, consumer.address()), "1");

        assert!(agreement.transition(AgreementState::Initialized).is_err());
        agreement.sign(&consumer, DEFAULT_MESSAGE_PREFIX).unwrap();
        assert!(agreement.sign(&consumer, DEFAULT_MESSAGE_PREFIX).is_err());
        agreement.transition(AgreementState::Submitted).unwrap();
        agreement.transition(AgreementState::Initialized).unwrap();
        agreement.transition(AgreementState::TimedOut).unwrap();
        assert!(agreement.state.is_final());
        assert!(agreement.transition(AgreementState::Fulfilled).is_err());

        let path: Vec<_> = agreement.history.iter().map(|c| c.to).collect();
        assert_eq!(
            path,
            vec![
                AgreementState::Signed,
                AgreementState::Submitted,
                AgreementState::Initialized,
                AgreementState::TimedOut
            ]
        );
    }
}
