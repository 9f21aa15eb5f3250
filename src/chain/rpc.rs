//! JSON-RPC transport.
//!
//! Transactions go through `eth_sendTransaction`, so the sender must be an account
//! the node manages. Receipts are polled until mined; the live event feed is a
//! background task polling `eth_getLogs` for every contract in the address book.

use super::{event_by_topic, event_spec, ChainClient, ChainEvent, ContractCall, EventQuery, TransactionReceipt};
use crate::abi::{self, AbiType, AbiValue};
use crate::config::KeeperConfig;
use crate::error::{Result, SdkError};
use crate::primitives::{strip_0x, Address, Bytes32};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const FEED_CAPACITY: usize = 1024;

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLog {
    address: Address,
    topics: Vec<Bytes32>,
    data: String,
    block_number: String,
    transaction_hash: Bytes32,
    log_index: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: Bytes32,
    block_number: String,
    from: Address,
    status: Option<String>,
    gas_used: String,
    #[serde(default)]
    logs: Vec<RawLog>,
}

struct RpcInner {
    http: Client,
    node_uri: String,
    addresses: BTreeMap<String, Address>,
    poll_interval: Duration,
    receipt_attempts: u32,
    request_id: AtomicU64,
    feed: Mutex<Option<broadcast::Sender<ChainEvent>>>,
}

#[derive(Clone)]
pub struct RpcChain {
    inner: Arc<RpcInner>,
}

impl RpcChain {
    pub fn new(config: &KeeperConfig) -> Result<Self> {
        if config.node_uri.is_empty() {
            return Err(SdkError::Config("Keeper node URI cannot be empty".to_string()));
        }
        Ok(Self {
            inner: Arc::new(RpcInner {
                http: Client::new(),
                node_uri: config.node_uri.clone(),
                addresses: config.contracts.clone(),
                poll_interval: config.poll_interval(),
                receipt_attempts: config.receipt_poll_attempts.unwrap_or(120),
                request_id: AtomicU64::new(1),
                feed: Mutex::new(None),
            }),
        })
    }

    pub fn node_uri(&self) -> &str {
        &self.inner.node_uri
    }
}

impl RpcInner {
    async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self.http.post(&self.node_uri).json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(SdkError::Service {
                service: "keeper".to_string(),
                status,
                body: text,
            });
        }

        let payload: RpcResponse = response.json().await?;
        if let Some(err) = payload.error {
            return Err(SdkError::Rpc(format!("{}: {} ({})", method, err.message, err.code)));
        }
        let result = payload.result.unwrap_or(Value::Null);
        Ok(serde_json::from_value(result)?)
    }

    fn address_of(&self, contract: &str) -> Result<Address> {
        self.addresses
            .get(contract)
            .copied()
            .ok_or_else(|| SdkError::Config(format!("No address configured for contract {}", contract)))
    }

    fn contract_at(&self, address: &Address) -> Option<&str> {
        self.addresses
            .iter()
            .find(|(_, a)| *a == address)
            .map(|(name, _)| name.as_str())
    }

    fn decode_log(&self, raw: &RawLog) -> Result<Option<ChainEvent>> {
        let Some(contract) = self.contract_at(&raw.address) else {
            return Ok(None);
        };
        let Some(topic) = raw.topics.first() else {
            return Ok(None);
        };
        let Some(spec) = event_by_topic(contract, topic) else {
            return Ok(None);
        };

        let data = hex::decode(strip_0x(&raw.data))?;
        let unindexed: Vec<AbiType> = spec
            .inputs
            .iter()
            .filter(|(_, _, indexed)| !indexed)
            .map(|(_, ty, _)| *ty)
            .collect();
        let mut unindexed_values = abi::decode(&unindexed, &data)?.into_iter();
        let mut topics = raw.topics.iter().skip(1);

        let mut return_values = BTreeMap::new();
        for (name, ty, indexed) in spec.inputs {
            let value = if *indexed {
                let word = topics
                    .next()
                    .ok_or_else(|| SdkError::Abi(format!("{} log is missing topic for {}", spec.name, name)))?;
                abi::decode_word(*ty, word.as_bytes())?
            } else {
                unindexed_values
                    .next()
                    .ok_or_else(|| SdkError::Abi(format!("{} log is missing data for {}", spec.name, name)))?
            };
            return_values.insert(name.to_string(), value);
        }

        Ok(Some(ChainEvent {
            contract: contract.to_string(),
            event: spec.name.to_string(),
            block_number: parse_quantity(&raw.block_number)?,
            transaction_hash: raw.transaction_hash,
            log_index: parse_quantity(&raw.log_index)?,
            return_values,
        }))
    }

    async fn get_logs(&self, filter: Value) -> Result<Vec<ChainEvent>> {
        let raw: Vec<RawLog> = self.request("eth_getLogs", json!([filter])).await?;
        let mut events = Vec::with_capacity(raw.len());
        for log in &raw {
            match self.decode_log(log) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => warn!(tx = %log.transaction_hash, "Skipping undecodable log: {}", e),
            }
        }
        Ok(events)
    }

    async fn block_number(&self) -> Result<u64> {
        let hex: String = self.request("eth_blockNumber", json!([])).await?;
        parse_quantity(&hex)
    }
}

/// One block behind the head at start-up, so the first window reaches back over
/// anything mined while subscribers were replaying history.
async fn seed_block(inner: &Weak<RpcInner>) -> Option<u64> {
    let chain = inner.upgrade()?;
    match chain.block_number().await {
        Ok(head) => {
            debug!(head, "Log poller starting");
            Some(head.saturating_sub(1))
        }
        Err(e) => {
            warn!("Log poller could not read the starting block: {}", e);
            None
        }
    }
}

/// Polls new blocks and broadcasts every decodable log until the chain handle is dropped.
async fn poll_logs(inner: Weak<RpcInner>, feed: broadcast::Sender<ChainEvent>) {
    let mut last_seen = seed_block(&inner).await;
    loop {
        let Some(chain) = inner.upgrade() else {
            debug!("RPC chain dropped, stopping log poller");
            return;
        };
        tokio::time::sleep(chain.poll_interval).await;

        let latest = match chain.block_number().await {
            Ok(n) => n,
            Err(e) => {
                warn!("Log poller could not read block number: {}", e);
                continue;
            }
        };
        let from = match last_seen {
            Some(seen) if latest <= seen => continue,
            Some(seen) => seen + 1,
            None => latest,
        };

        let addresses: Vec<String> = chain.addresses.values().map(|a| a.to_hex()).collect();
        let filter = json!({
            "address": addresses,
            "fromBlock": format!("0x{:x}", from),
            "toBlock": format!("0x{:x}", latest),
        });
        match chain.get_logs(filter).await {
            Ok(events) => {
                for event in events {
                    let _ = feed.send(event);
                }
                last_seen = Some(latest);
            }
            Err(e) => warn!(from, latest, "Log poller could not fetch logs: {}", e),
        }
    }
}

#[async_trait]
impl ChainClient for RpcChain {
    fn contract_address(&self, contract: &str) -> Result<Address> {
        self.inner.address_of(contract)
    }

    async fn block_number(&self) -> Result<u64> {
        self.inner.block_number().await
    }

    async fn call(&self, call: &ContractCall) -> Result<Vec<AbiValue>> {
        let to = self.inner.address_of(&call.contract)?;
        let data = abi::encode_call(&call.method, &call.args);
        let result: String = self
            .inner
            .request(
                "eth_call",
                json!([{ "to": to, "data": format!("0x{}", hex::encode(data)) }, "latest"]),
            )
            .await?;
        let bytes = hex::decode(strip_0x(&result))?;
        abi::decode(&call.outputs, &bytes)
    }

    async fn estimate_gas(&self, call: &ContractCall, from: Address) -> Result<u64> {
        let to = self.inner.address_of(&call.contract)?;
        let data = abi::encode_call(&call.method, &call.args);
        let gas: String = self
            .inner
            .request(
                "eth_estimateGas",
                json!([{ "from": from, "to": to, "data": format!("0x{}", hex::encode(data)) }]),
            )
            .await?;
        parse_quantity(&gas)
    }

    async fn send_transaction(&self, call: &ContractCall, from: Address, gas: u64) -> Result<TransactionReceipt> {
        let to = self.inner.address_of(&call.contract)?;
        let data = abi::encode_call(&call.method, &call.args);
        let tx_hash: Bytes32 = self
            .inner
            .request(
                "eth_sendTransaction",
                json!([{
                    "from": from,
                    "to": to,
                    "gas": format!("0x{:x}", gas),
                    "data": format!("0x{}", hex::encode(data)),
                }]),
            )
            .await?;
        debug!(%tx_hash, contract = %call.contract, method = %call.method, "Transaction broadcast");

        for _ in 0..self.inner.receipt_attempts {
            let raw: Option<RawReceipt> = self
                .inner
                .request("eth_getTransactionReceipt", json!([tx_hash]))
                .await?;
            if let Some(raw) = raw {
                let mut events = Vec::new();
                for log in &raw.logs {
                    if let Some(event) = self.inner.decode_log(log)? {
                        events.push(event);
                    }
                }
                return Ok(TransactionReceipt {
                    transaction_hash: raw.transaction_hash,
                    block_number: parse_quantity(&raw.block_number)?,
                    from: raw.from,
                    status: raw.status.as_deref().map_or(true, |s| parse_quantity(s).unwrap_or(0) == 1),
                    gas_used: parse_quantity(&raw.gas_used)?,
                    events,
                });
            }
            tokio::time::sleep(self.inner.poll_interval).await;
        }

        Err(SdkError::Rpc(format!(
            "transaction {} not mined after {} receipt polls",
            tx_hash, self.inner.receipt_attempts
        )))
    }

    async fn past_events(&self, query: &EventQuery) -> Result<Vec<ChainEvent>> {
        let address = self.inner.address_of(&query.contract)?;
        let spec = event_spec(&query.contract, &query.event).ok_or_else(|| {
            SdkError::Abi(format!("unknown event {}.{}", query.contract, query.event))
        })?;
        let to_block = query
            .to_block
            .map_or_else(|| "latest".to_string(), |b| format!("0x{:x}", b));
        let filter = json!({
            "address": address,
            "fromBlock": format!("0x{:x}", query.from_block),
            "toBlock": to_block,
            "topics": [spec.topic()],
        });
        let events = self.inner.get_logs(filter).await?;
        Ok(events.into_iter().filter(|e| query.matches(e)).collect())
    }

    fn live_events(&self) -> Result<broadcast::Receiver<ChainEvent>> {
        let mut feed = self.inner.feed.lock();
        if let Some(tx) = feed.as_ref() {
            return Ok(tx.subscribe());
        }
        let (tx, rx) = broadcast::channel(FEED_CAPACITY);
        tokio::spawn(poll_logs(Arc::downgrade(&self.inner), tx.clone()));
        info!(node = %self.inner.node_uri, "Started log poller");
        *feed = Some(tx);
        Ok(rx)
    }
}

fn parse_quantity(hex_str: &str) -> Result<u64> {
    u64::from_str_radix(strip_0x(hex_str), 16)
        .map_err(|e| SdkError::Rpc(format!("invalid quantity '{}': {}", hex_str, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{DISPENSER, OCEAN_TOKEN};
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> KeeperConfig {
        let mut config = KeeperConfig {
            node_uri: server.uri(),
            poll_interval_ms: Some(10),
            receipt_poll_attempts: Some(3),
            ..KeeperConfig::default()
        };
        config.contracts.insert(OCEAN_TOKEN.to_string(), Address([0x11; 20]));
        config.contracts.insert(DISPENSER.to_string(), Address([0x22; 20]));
        config
    }

    fn rpc_result(result: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": result}))
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x1a").unwrap(), 26);
        assert!(parse_quantity("0xzz").is_err());
    }

    #[tokio::test]
    async fn test_block_number() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_blockNumber"})))
            .respond_with(rpc_result(json!("0x10")))
            .mount(&server)
            .await;

        let chain = RpcChain::new(&config_for(&server)).unwrap();
        assert_eq!(chain.block_number().await.unwrap(), 16);
    }

    #[tokio::test]
    async fn test_call_decodes_outputs() {
        let server = MockServer::start().await;
        let encoded = abi::encode(&[AbiValue::Uint256(500)]);
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_call"})))
            .respond_with(rpc_result(json!(format!("0x{}", hex::encode(encoded)))))
            .mount(&server)
            .await;

        let chain = RpcChain::new(&config_for(&server)).unwrap();
        let call = ContractCall::new(OCEAN_TOKEN, "balanceOf", vec![AbiValue::Address(Address([1; 20]))])
            .returning(&[AbiType::Uint256]);
        assert_eq!(chain.call(&call).await.unwrap(), vec![AbiValue::Uint256(500)]);
    }

    #[tokio::test]
    async fn test_rpc_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": -32000, "message": "execution reverted"}
            })))
            .mount(&server)
            .await;

        let chain = RpcChain::new(&config_for(&server)).unwrap();
        let call = ContractCall::new(DISPENSER, "requestTokens", vec![AbiValue::Uint256(1)]);
        let err = chain.estimate_gas(&call, Address([1; 20])).await.unwrap_err();
        assert!(matches!(err, SdkError::Rpc(msg) if msg.contains("execution reverted")));
    }

    #[tokio::test]
    async fn test_send_transaction_decodes_receipt_logs() {
        let server = MockServer::start().await;
        let spec = event_spec(DISPENSER, "RequestTokens").unwrap();
        let requester = Address([0x33; 20]);
        let mut requester_topic = [0u8; 32];
        requester_topic[12..].copy_from_slice(requester.as_bytes());
        let tx_hash = Bytes32([0x44; 32]);

        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_sendTransaction"})))
            .respond_with(rpc_result(json!(tx_hash)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_getTransactionReceipt"})))
            .respond_with(rpc_result(json!({
                "transactionHash": tx_hash,
                "blockNumber": "0x5",
                "from": requester,
                "status": "0x1",
                "gasUsed": "0x5208",
                "logs": [{
                    "address": Address([0x22; 20]),
                    "topics": [spec.topic(), Bytes32(requester_topic)],
                    "data": format!("0x{}", hex::encode(abi::encode(&[AbiValue::Uint256(7)]))),
                    "blockNumber": "0x5",
                    "transactionHash": tx_hash,
                    "logIndex": "0x0"
                }]
            })))
            .mount(&server)
            .await;

        let chain = RpcChain::new(&config_for(&server)).unwrap();
        let call = ContractCall::new(DISPENSER, "requestTokens", vec![AbiValue::Uint256(7)]);
        let receipt = chain.send_transaction(&call, requester, 50_000).await.unwrap();

        assert!(receipt.status);
        assert_eq!(receipt.block_number, 5);
        let event = receipt.event("RequestTokens").unwrap();
        assert_eq!(event.value("requester"), Some(&AbiValue::Address(requester)));
        assert_eq!(event.value("amount"), Some(&AbiValue::Uint256(7)));
    }

    #[tokio::test]
    async fn test_log_poller_covers_blocks_mined_before_first_poll() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_blockNumber"})))
            .respond_with(rpc_result(json!("0xe")))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_blockNumber"})))
            .respond_with(rpc_result(json!("0x10")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_getLogs"})))
            .respond_with(rpc_result(json!([])))
            .mount(&server)
            .await;

        let chain = RpcChain::new(&config_for(&server)).unwrap();
        let _rx = chain.live_events().unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let requests = server.received_requests().await.unwrap();
        let from_blocks: Vec<u64> = requests
            .iter()
            .filter_map(|r| serde_json::from_slice::<Value>(&r.body).ok())
            .filter(|body| body["method"] == "eth_getLogs")
            .filter_map(|body| body["params"][0]["fromBlock"].as_str().map(str::to_string))
            .map(|from| parse_quantity(&from).unwrap())
            .collect();
        assert!(!from_blocks.is_empty());
        assert!(from_blocks[0] <= 0xf, "first window starts at {:#x}", from_blocks[0]);
    }

    #[tokio::test]
    async fn test_unmined_transaction_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_sendTransaction"})))
            .respond_with(rpc_result(json!(Bytes32([1; 32]))))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_getTransactionReceipt"})))
            .respond_with(rpc_result(Value::Null))
            .expect(3)
            .mount(&server)
            .await;

        let chain = RpcChain::new(&config_for(&server)).unwrap();
        let call = ContractCall::new(DISPENSER, "requestTokens", vec![AbiValue::Uint256(7)]);
        let err = chain.send_transaction(&call, Address([1; 20]), 50_000).await.unwrap_err();
        assert!(matches!(err, SdkError::Rpc(msg) if msg.contains("not mined")));
    }
}
