use crate::abi::{AbiType, AbiValue};
use crate::account::Account;
use crate::chain::{ChainClient, ChainEvent, ContractCall, TransactionReceipt};
use crate::error::{Result, SdkError};
use crate::primitives::Address;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Typed access to one named contract.
///
/// Sends always estimate gas first. Any failure to estimate, submit, or mine is
/// reported as [`SdkError::Transaction`] carrying the method, the arguments, and
/// the sender.
#[derive(Clone)]
pub struct ContractHandle {
    name: String,
    chain: Arc<dyn ChainClient>,
}

impl ContractHandle {
    pub fn new(name: impl Into<String>, chain: Arc<dyn ChainClient>) -> Self {
        Self {
            name: name.into(),
            chain,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Result<Address> {
        self.chain.contract_address(&self.name)
    }

    pub fn chain(&self) -> &Arc<dyn ChainClient> {
        &self.chain
    }

    pub async fn call(&self, method: &str, args: Vec<AbiValue>, outputs: &[AbiType]) -> Result<Vec<AbiValue>> {
        let call = ContractCall::new(self.name.clone(), method, args).returning(outputs);
        debug!(contract = %self.name, method, "Contract call");
        self.chain.call(&call).await
    }

    /// Calls a method returning a single value.
    pub async fn call_one(&self, method: &str, args: Vec<AbiValue>, output: AbiType) -> Result<AbiValue> {
        self.call(method, args, &[output])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SdkError::Abi(format!("{}.{} returned no value", self.name, method)))
    }

    pub async fn send(&self, method: &str, args: Vec<AbiValue>, from: &Account) -> Result<TransactionReceipt> {
        let call = ContractCall::new(self.name.clone(), method, args);
        let sender = from.address();
        let failed = |reason: String| SdkError::Transaction {
            contract: self.name.clone(),
            method: method.to_string(),
            from: sender.to_string(),
            args: call.describe_args(),
            reason,
        };

        let gas = self
            .chain
            .estimate_gas(&call, sender)
            .await
            .map_err(|e| failed(format!("gas estimation failed: {}", e)))?;

        info!(contract = %self.name, method, from = %sender, gas, "Sending transaction");
        let receipt = self
            .chain
            .send_transaction(&call, sender, gas)
            .await
            .map_err(|e| failed(e.to_string()))?;

        if !receipt.status {
            error!(contract = %self.name, method, tx = %receipt.transaction_hash, "Transaction reverted");
            return Err(failed(format!("reverted in transaction {}", receipt.transaction_hash)));
        }

        debug!(
            contract = %self.name,
            method,
            tx = %receipt.transaction_hash,
            block = receipt.block_number,
            events = receipt.events.len(),
            "Transaction mined"
        );
        Ok(receipt)
    }

    /// Sends and requires `event` from this contract in the receipt.
    pub async fn send_expecting(
        &self,
        method: &str,
        args: Vec<AbiValue>,
        from: &Account,
        event: &str,
    ) -> Result<(TransactionReceipt, ChainEvent)> {
        let receipt = self.send(method, args, from).await?;
        let found = receipt
            .events
            .iter()
            .find(|e| e.event == event && e.contract == self.name)
            .cloned();
        match found {
            Some(found) => Ok((receipt, found)),
            None => {
                error!(contract = %self.name, method, event, tx = %receipt.transaction_hash, "Expected event missing");
                Err(SdkError::Protocol {
                    contract: self.name.clone(),
                    method: method.to_string(),
                    expected_event: event.to_string(),
                    transaction_hash: receipt.transaction_hash.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use crate::primitives::Bytes32;

    fn receipt(status: bool, events: Vec<ChainEvent>) -> TransactionReceipt {
        TransactionReceipt {
            transaction_hash: Bytes32([9u8; 32]),
            block_number: 1,
            from: Address([1u8; 20]),
            status,
            gas_used: 21_000,
            events,
        }
    }

    fn mock_with_receipt(status: bool) -> MockChainClient {
        let mut mock = MockChainClient::new();
        mock.expect_estimate_gas().returning(|_, _| Ok(50_000));
        mock.expect_send_transaction()
            .withf(|_, _, gas| *gas == 50_000)
            .returning(move |_, _, _| Ok(receipt(status, Vec::new())));
        mock
    }

    #[tokio::test]
    async fn test_reverted_receipt_is_transaction_error() {
        let handle = ContractHandle::new("EscrowReward", Arc::new(mock_with_receipt(false)));
        let account = Account::random();
        let err = handle
            .send("fulfill", vec![AbiValue::Uint256(5)], &account)
            .await
            .unwrap_err();

        match err {
            SdkError::Transaction { contract, method, from, args, .. } => {
                assert_eq!(contract, "EscrowReward");
                assert_eq!(method, "fulfill");
                assert_eq!(from, account.address().to_string());
                assert!(args.contains('5'));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_event_is_protocol_error() {
        let handle = ContractHandle::new("LockRewardCondition", Arc::new(mock_with_receipt(true)));
        let err = handle
            .send_expecting("fulfill", vec![], &Account::random(), "Fulfilled")
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::Protocol { ref expected_event, .. } if expected_event == "Fulfilled"));
        assert!(err.is_on_chain());
    }

    #[tokio::test]
    async fn test_estimation_failure_skips_submission() {
        let mut mock = MockChainClient::new();
        mock.expect_estimate_gas()
            .returning(|_, _| Err(SdkError::Rpc("execution reverted".to_string())));
        mock.expect_send_transaction().never();

        let handle = ContractHandle::new("OceanToken", Arc::new(mock));
        let err = handle.send("approve", vec![], &Account::random()).await.unwrap_err();
        assert!(matches!(err, SdkError::Transaction { ref reason, .. } if reason.contains("gas estimation")));
    }
}
