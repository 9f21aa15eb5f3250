//! Drives a service agreement from signature to settlement.
//!
//! The consumer signs, the publisher submits, and both sides then fulfill their
//! own conditions in template order. Nothing here is rolled back: a failure
//! leaves the agreement wherever the chain has it, and [`AgreementOrchestrator::resume`]
//! picks it up again from the on-chain condition states.

use crate::abi::AbiValue;
use crate::account::{Account, Signature};
use crate::agreement::{Agreement, AgreementState, AgreementTerms, ConditionTerms};
use crate::chain::{ChainEvent, TransactionReceipt, AGREEMENT_STORE_MANAGER};
use crate::conditions::{Actor, ConditionKind, ConditionParams, ConditionState, Fulfillment, FULFILLED_EVENT};
use crate::ddo::Ddo;
use crate::error::{Result, SdkError};
use crate::events::EventFilter;
use crate::keeper::Keeper;
use crate::primitives::Bytes32;
use crate::template::TemplateStatus;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AgreementOrchestrator {
    keeper: Keeper,
}

impl AgreementOrchestrator {
    pub fn new(keeper: Keeper) -> Self {
        Self { keeper }
    }

    pub fn keeper(&self) -> &Keeper {
        &self.keeper
    }

    /// Builds the agreement for `consumer` from the DDO's access service.
    pub fn prepare(
        &self,
        agreement_id: Bytes32,
        ddo: &Ddo,
        service_definition_id: &str,
        consumer: &Account,
    ) -> Result<Agreement> {
        let service = ddo.access_service(service_definition_id)?;
        let terms = AgreementTerms::from_access_service(
            agreement_id,
            ddo.id,
            service,
            consumer.address(),
            self.keeper.chain().as_ref(),
        )?;
        debug!(agreement = %agreement_id, hash = %terms.hash(), "Prepared agreement");
        Ok(Agreement::new(terms, service_definition_id))
    }

    pub fn sign(&self, agreement: &mut Agreement, consumer: &Account) -> Result<Signature> {
        let signature = agreement.sign(consumer, self.keeper.message_prefix())?;
        info!(agreement = %agreement.id(), consumer = %consumer.address(), "Agreement signed");
        Ok(signature)
    }

    /// Publisher submits the consumer-signed agreement.
    pub async fn submit(&self, agreement: &mut Agreement, publisher: &Account) -> Result<TransactionReceipt> {
        if agreement.state != AgreementState::Signed {
            return Err(SdkError::Validation(format!(
                "Agreement {} must be signed before submission, it is {}",
                agreement.id(),
                agreement.state
            )));
        }
        let signature = agreement.signature()?;
        let template_id = agreement.terms.template_id;
        let status = self.keeper.templates().status(&template_id).await?;
        if status != TemplateStatus::Approved {
            warn!(agreement = %agreement.id(), template = %template_id, ?status, "Template not usable");
            return Err(SdkError::Validation(format!(
                "Template {} is {:?}, not Approved",
                template_id, status
            )));
        }
        let (receipt, _) = self
            .keeper
            .agreements()
            .create_agreement(&agreement.terms, &signature, publisher)
            .await?;
        agreement.transition(AgreementState::Submitted)?;
        Ok(receipt)
    }

    /// Waits for `AgreementInitialized` for this agreement. There is no deadline.
    pub async fn wait_initialized(&self, agreement: &mut Agreement) -> Result<ChainEvent> {
        if agreement.state != AgreementState::Submitted {
            return Err(SdkError::Validation(format!(
                "Agreement {} is {}, not Submitted",
                agreement.id(),
                agreement.state
            )));
        }
        let filter = EventFilter::new().with("agreementId", AbiValue::Bytes32(agreement.id()));
        let event = self
            .keeper
            .events()
            .once(AGREEMENT_STORE_MANAGER, "AgreementInitialized", filter)
            .await?;
        agreement.transition(AgreementState::Initialized)?;
        info!(agreement = %agreement.id(), block = event.block_number, "Agreement initialized");
        Ok(event)
    }

    /// Fulfills the conditions owned by `actor`, in template order. Conditions
    /// already fulfilled or aborted on-chain are skipped. Before each condition,
    /// dependencies owned by the other party are awaited.
    pub async fn fulfill_as(&self, agreement: &mut Agreement, actor: Actor, account: &Account) -> Result<Vec<Fulfillment>> {
        match agreement.state {
            AgreementState::Initialized => agreement.transition(AgreementState::ConditionsPending)?,
            AgreementState::ConditionsPending => {}
            other => {
                return Err(SdkError::Validation(format!(
                    "Agreement {} is {}, conditions cannot be fulfilled",
                    agreement.id(),
                    other
                )))
            }
        }

        let mut done = Vec::new();
        let owned: Vec<ConditionTerms> = agreement
            .terms
            .conditions
            .iter()
            .filter(|c| c.kind.actor() == actor)
            .cloned()
            .collect();

        for condition in owned {
            match self.condition_state(&condition).await? {
                ConditionState::Unfulfilled => {}
                state => {
                    debug!(agreement = %agreement.id(), condition = %condition.name, ?state, "Skipping condition");
                    continue;
                }
            }

            for dependency in &condition.dependencies {
                let Some(required) = agreement.terms.conditions.iter().find(|c| &c.name == dependency) else {
                    return Err(SdkError::Validation(format!(
                        "Condition '{}' depends on unknown '{}'",
                        condition.name, dependency
                    )));
                };
                if required.kind.actor() != actor {
                    self.await_condition(&agreement.terms, required).await?;
                }
            }

            // The condition may have expired while its dependencies settled.
            if self.condition_state(&condition).await? != ConditionState::Unfulfilled {
                warn!(agreement = %agreement.id(), condition = %condition.name, "Condition no longer fulfillable");
                continue;
            }
            done.push(self.fulfill_condition(&agreement.terms, &condition, account).await?);
        }
        Ok(done)
    }

    /// Consumer conditions first, then publisher conditions, then settlement.
    pub async fn execute(&self, agreement: &mut Agreement, consumer: &Account, publisher: &Account) -> Result<AgreementState> {
        self.fulfill_as(agreement, Actor::Consumer, consumer).await?;
        self.fulfill_as(agreement, Actor::Publisher, publisher).await?;
        self.settle(agreement).await
    }

    /// Sign, submit, wait for initialization and execute.
    pub async fn run(
        &self,
        agreement_id: Bytes32,
        ddo: &Ddo,
        service_definition_id: &str,
        consumer: &Account,
        publisher: &Account,
    ) -> Result<Agreement> {
        let mut agreement = self.prepare(agreement_id, ddo, service_definition_id, consumer)?;
        self.sign(&mut agreement, consumer)?;
        self.submit(&mut agreement, publisher).await?;
        self.wait_initialized(&mut agreement).await?;
        self.execute(&mut agreement, consumer, publisher).await?;
        Ok(agreement)
    }

    /// Picks up an agreement at whatever point the chain has it.
    pub async fn resume(&self, agreement: &mut Agreement, consumer: &Account, publisher: &Account) -> Result<AgreementState> {
        info!(agreement = %agreement.id(), state = %agreement.state, "Resuming agreement");
        match agreement.state {
            AgreementState::Created => {
                return Err(SdkError::Validation(format!(
                    "Agreement {} was never signed",
                    agreement.id()
                )))
            }
            AgreementState::Signed => {
                if !self.keeper.agreements().exists(&agreement.id()).await? {
                    self.submit(agreement, publisher).await?;
                } else {
                    agreement.transition(AgreementState::Submitted)?;
                }
                self.wait_initialized(agreement).await?;
            }
            AgreementState::Submitted => {
                if !self.keeper.agreements().exists(&agreement.id()).await? {
                    return Err(SdkError::NotFound(format!(
                        "Agreement {} is not on chain",
                        agreement.id()
                    )));
                }
                agreement.transition(AgreementState::Initialized)?;
            }
            AgreementState::Fulfilled | AgreementState::TimedOut => return Ok(agreement.state),
            AgreementState::Initialized | AgreementState::ConditionsPending => {}
        }
        self.execute(agreement, consumer, publisher).await
    }

    /// Waits for every terminal condition, then settles. For a process that only
    /// holds one side of the agreement.
    pub async fn wait_fulfilled(&self, agreement: &mut Agreement) -> Result<AgreementState> {
        let terminal: Vec<ConditionTerms> = agreement.terms.terminal_conditions().cloned().collect();
        for condition in &terminal {
            self.await_condition(&agreement.terms, condition).await?;
        }
        self.settle(agreement).await
    }

    /// Reads every condition state. Any aborted condition times the agreement out;
    /// otherwise it is fulfilled once all terminal conditions are and the consumer
    /// can access the asset.
    pub async fn settle(&self, agreement: &mut Agreement) -> Result<AgreementState> {
        if agreement.state.is_final() {
            return Ok(agreement.state);
        }
        if agreement.state == AgreementState::Initialized {
            agreement.transition(AgreementState::ConditionsPending)?;
        }

        let mut states = Vec::with_capacity(agreement.terms.conditions.len());
        for condition in &agreement.terms.conditions {
            states.push((condition, self.condition_state(condition).await?));
        }

        if let Some((aborted, _)) = states.iter().find(|(_, s)| *s == ConditionState::Aborted) {
            warn!(agreement = %agreement.id(), condition = %aborted.name, "Condition timed out");
            agreement.transition(AgreementState::TimedOut)?;
            return Ok(agreement.state);
        }

        let terminal_done = states
            .iter()
            .filter(|(c, _)| c.is_terminal)
            .all(|(_, s)| *s == ConditionState::Fulfilled);
        if terminal_done && self.confirm(agreement).await? {
            agreement.transition(AgreementState::Fulfilled)?;
            info!(agreement = %agreement.id(), "Agreement fulfilled");
        } else {
            debug!(agreement = %agreement.id(), "Agreement still pending");
        }
        Ok(agreement.state)
    }

    /// Reads the access permission rather than trusting delivered events.
    pub async fn confirm(&self, agreement: &Agreement) -> Result<bool> {
        let document_id = match agreement.terms.condition(ConditionKind::AccessSecretStore) {
            Some(ConditionTerms {
                params: ConditionParams::AccessSecretStore { document_id, .. },
                ..
            }) => *document_id,
            _ => agreement.did().id(),
        };
        self.keeper
            .condition(ConditionKind::AccessSecretStore)
            .check_permissions(&agreement.consumer(), &document_id)
            .await
    }

    pub async fn condition_states(&self, agreement: &Agreement) -> Result<Vec<(String, ConditionState)>> {
        let mut out = Vec::with_capacity(agreement.terms.conditions.len());
        for condition in &agreement.terms.conditions {
            out.push((condition.name.clone(), self.condition_state(condition).await?));
        }
        Ok(out)
    }

    async fn condition_state(&self, condition: &ConditionTerms) -> Result<ConditionState> {
        self.keeper.condition_store().state(&condition.condition_id).await
    }

    /// Resolves once the condition is no longer unfulfilled, waiting for its
    /// `Fulfilled` event if needed.
    async fn await_condition(&self, terms: &AgreementTerms, condition: &ConditionTerms) -> Result<ConditionState> {
        let state = self.condition_state(condition).await?;
        if state != ConditionState::Unfulfilled {
            return Ok(state);
        }
        debug!(agreement = %terms.agreement_id, condition = %condition.name, "Waiting for condition");
        let filter = EventFilter::new()
            .with("agreementId", AbiValue::Bytes32(terms.agreement_id))
            .with("conditionId", AbiValue::Bytes32(condition.condition_id));
        self.keeper
            .events()
            .once(condition.kind.contract(), FULFILLED_EVENT, filter)
            .await?;
        Ok(ConditionState::Fulfilled)
    }

    async fn fulfill_condition(&self, terms: &AgreementTerms, condition: &ConditionTerms, account: &Account) -> Result<Fulfillment> {
        let client = self.keeper.condition(condition.kind);
        if let ConditionParams::LockReward { amount, .. } = &condition.params {
            self.keeper.token().approve(&client.address()?, *amount, account).await?;
        }
        let fulfillment = client.fulfill(&terms.agreement_id, &condition.params, account).await?;
        if fulfillment.condition_id != condition.condition_id {
            return Err(SdkError::Validation(format!(
                "{} fulfilled {} but the agreement expects {}",
                condition.name, fulfillment.condition_id, condition.condition_id
            )));
        }
        info!(
            agreement = %terms.agreement_id,
            condition = %condition.name,
            tx = %fulfillment.receipt.transaction_hash,
            "Condition fulfilled"
        );
        Ok(fulfillment)
    }
}
