//! Application context for the on-chain side.
//!
//! A [`Keeper`] owns the chain handle and the event bridge and hands out
//! lightweight contract clients that share them.

use crate::abi::{AbiType, AbiValue};
use crate::account::{Account, Signature};
use crate::agreement::AgreementTerms;
use crate::chain::{ChainClient, ChainEvent, TransactionReceipt, AGREEMENT_STORE_MANAGER, DISPENSER, OCEAN_TOKEN};
use crate::conditions::{ConditionClient, ConditionKind, ConditionStore};
use crate::contract::ContractHandle;
use crate::did::{DidRegistry, DidResolver};
use crate::error::{Result, SdkError};
use crate::events::EventBridge;
use crate::primitives::{Address, Bytes32};
use crate::template::TemplateRegistry;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct Keeper {
    chain: Arc<dyn ChainClient>,
    events: EventBridge,
    message_prefix: String,
}

impl Keeper {
    pub fn new(chain: Arc<dyn ChainClient>, message_prefix: impl Into<String>) -> Self {
        Self {
            events: EventBridge::new(chain.clone()),
            chain,
            message_prefix: message_prefix.into(),
        }
    }

    pub fn chain(&self) -> &Arc<dyn ChainClient> {
        &self.chain
    }

    pub fn events(&self) -> &EventBridge {
        &self.events
    }

    pub fn message_prefix(&self) -> &str {
        &self.message_prefix
    }

    pub async fn block_number(&self) -> Result<u64> {
        self.chain.block_number().await
    }

    pub fn token(&self) -> Token {
        Token {
            contract: ContractHandle::new(OCEAN_TOKEN, self.chain.clone()),
        }
    }

    pub fn dispenser(&self) -> Dispenser {
        Dispenser {
            contract: ContractHandle::new(DISPENSER, self.chain.clone()),
        }
    }

    pub fn did_registry(&self) -> DidRegistry {
        DidRegistry::new(self.chain.clone(), self.events.clone())
    }

    pub fn did_resolver(&self) -> DidResolver {
        DidResolver::new(self.did_registry())
    }

    pub fn templates(&self) -> TemplateRegistry {
        TemplateRegistry::new(self.chain.clone())
    }

    pub fn agreements(&self) -> AgreementStore {
        AgreementStore {
            contract: ContractHandle::new(AGREEMENT_STORE_MANAGER, self.chain.clone()),
        }
    }

    pub fn condition_store(&self) -> ConditionStore {
        ConditionStore::new(self.chain.clone())
    }

    pub fn condition(&self, kind: ConditionKind) -> ConditionClient {
        ConditionClient::new(kind, self.chain.clone())
    }
}

/// The payment token.
#[derive(Clone)]
pub struct Token {
    contract: ContractHandle,
}

impl Token {
    pub async fn balance_of(&self, owner: &Address) -> Result<u128> {
        let value = self
            .contract
            .call_one("balanceOf", vec![AbiValue::Address(*owner)], AbiType::Uint256)
            .await?;
        value
            .as_uint()
            .ok_or_else(|| SdkError::Abi("balanceOf did not return an integer".to_string()))
    }

    pub async fn approve(&self, spender: &Address, amount: u128, owner: &Account) -> Result<TransactionReceipt> {
        info!(spender = %spender, amount, owner = %owner.address(), "Approving token allowance");
        let (receipt, _) = self
            .contract
            .send_expecting(
                "approve",
                vec![AbiValue::Address(*spender), AbiValue::Uint256(amount)],
                owner,
                "Approval",
            )
            .await?;
        Ok(receipt)
    }
}

/// Test-network token faucet.
#[derive(Clone)]
pub struct Dispenser {
    contract: ContractHandle,
}

impl Dispenser {
    pub async fn request_tokens(&self, amount: u128, requester: &Account) -> Result<TransactionReceipt> {
        let (receipt, _) = self
            .contract
            .send_expecting("requestTokens", vec![AbiValue::Uint256(amount)], requester, "RequestTokens")
            .await?;
        Ok(receipt)
    }
}

#[derive(Clone)]
pub struct AgreementStore {
    contract: ContractHandle,
}

impl AgreementStore {
    pub async fn exists(&self, agreement_id: &Bytes32) -> Result<bool> {
        let value = self
            .contract
            .call_one("agreementExists", vec![AbiValue::Bytes32(*agreement_id)], AbiType::Bool)
            .await?;
        value
            .as_bool()
            .ok_or_else(|| SdkError::Abi("agreementExists did not return a bool".to_string()))
    }

    /// Submits the agreement. `submitter` is the publisher; `signature` is the
    /// consumer's signature over the agreement hash.
    pub async fn create_agreement(
        &self,
        terms: &AgreementTerms,
        signature: &Signature,
        submitter: &Account,
    ) -> Result<(TransactionReceipt, ChainEvent)> {
        info!(
            agreement = %terms.agreement_id,
            did = %terms.did,
            consumer = %terms.consumer,
            submitter = %submitter.address(),
            "Creating agreement"
        );
        self.contract
            .send_expecting(
                "createAgreement",
                terms.create_args(signature),
                submitter,
                "AgreementInitialized",
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::memory::MemoryChain;
    use crate::config::DEFAULT_MESSAGE_PREFIX;

    #[tokio::test]
    async fn test_dispenser_and_allowance() {
        let chain = Arc::new(MemoryChain::new());
        let keeper = Keeper::new(chain.clone(), DEFAULT_MESSAGE_PREFIX);
        let account = Account::random();

        keeper.dispenser().request_tokens(50, &account).await.unwrap();
        assert_eq!(keeper.token().balance_of(&account.address()).await.unwrap(), 50);

        let spender = Address([3u8; 20]);
        let receipt = keeper.token().approve(&spender, 20, &account).await.unwrap();
        let approval = receipt.event("Approval").unwrap();
        assert_eq!(approval.value("spender"), Some(&AbiValue::Address(spender)));
    }

    #[tokio::test]
    async fn test_unknown_agreement_does_not_exist() {
        let keeper = Keeper::new(Arc::new(MemoryChain::new()), DEFAULT_MESSAGE_PREFIX);
        assert!(!keeper.agreements().exists(&Bytes32::random()).await.unwrap());
    }
}
