//! In-process development chain.
//!
//! `MemoryChain` executes the contract surface the SDK talks to: token balances,
//! DID attributes, template setup, agreement creation with signature and
//! condition-id checks, and the three escrow conditions with dependency,
//! timelock and timeout rules. Every transaction mines one block.

use super::{
    ChainClient, ChainEvent, ContractCall, EventQuery, TransactionReceipt, ACCESS_SECRET_STORE_CONDITION,
    AGREEMENT_STORE_MANAGER, ALL_CONTRACTS, CONDITION_STORE_MANAGER, DID_REGISTRY, DISPENSER, ESCROW_REWARD,
    LOCK_REWARD_CONDITION, OCEAN_TOKEN, TEMPLATE_STORE_MANAGER,
};
use crate::abi::{keccak256, solidity_sha3, AbiValue};
use crate::account::{recover_personal, Signature};
use crate::config::DEFAULT_MESSAGE_PREFIX;
use crate::error::{Result, SdkError};
use crate::primitives::{Address, Bytes32};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::broadcast;
use tracing::{debug, info};

const FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConditionState {
    Unfulfilled = 1,
    Fulfilled = 2,
    Aborted = 3,
}

#[derive(Debug, Clone)]
struct DidRecord {
    owner: Address,
    block_updated: u64,
}

#[derive(Debug, Clone)]
struct TemplateRecord {
    owner: Address,
    condition_types: Vec<Address>,
    dependencies: Vec<u128>,
}

#[derive(Debug, Clone)]
struct AgreementRecord {
    template_id: Bytes32,
    condition_ids: Vec<Bytes32>,
}

#[derive(Debug, Clone)]
struct ConditionRecord {
    agreement_id: Bytes32,
    index: usize,
    state: ConditionState,
    created: u64,
    timelock: u64,
    timeout: u64,
}

impl ConditionRecord {
    fn effective_state(&self, block: u64) -> ConditionState {
        if self.state == ConditionState::Unfulfilled
            && self.timeout > 0
            && block > self.created.saturating_add(self.timeout)
        {
            ConditionState::Aborted
        } else {
            self.state
        }
    }

    fn timelock_elapsed(&self, block: u64) -> bool {
        block >= self.created.saturating_add(self.timelock)
    }
}

#[derive(Debug, Clone, Default)]
struct ChainState {
    block: u64,
    tx_count: u64,
    balances: HashMap<Address, u128>,
    allowances: HashMap<(Address, Address), u128>,
    dids: HashMap<Bytes32, DidRecord>,
    templates: HashMap<Bytes32, TemplateRecord>,
    agreements: HashMap<Bytes32, AgreementRecord>,
    conditions: HashMap<Bytes32, ConditionRecord>,
    permissions: HashSet<(Address, Bytes32)>,
    log: Vec<ChainEvent>,
}

/// Reason a transaction reverted.
#[derive(Debug)]
struct Revert(String);

type Exec<T> = std::result::Result<T, Revert>;

fn revert<T>(reason: impl Into<String>) -> Exec<T> {
    Err(Revert(reason.into()))
}

struct Args<'a>(&'a [AbiValue]);

impl<'a> Args<'a> {
    fn get(&self, i: usize) -> Exec<&'a AbiValue> {
        self.0
            .get(i)
            .ok_or_else(|| Revert(format!("missing argument {}", i)))
    }

    fn bytes32(&self, i: usize) -> Exec<Bytes32> {
        match self.get(i)? {
            AbiValue::Bytes32(v) => Ok(*v),
            other => revert(format!("argument {} should be bytes32, got {}", i, other.abi_type())),
        }
    }

    fn address(&self, i: usize) -> Exec<Address> {
        match self.get(i)? {
            AbiValue::Address(v) => Ok(*v),
            other => revert(format!("argument {} should be address, got {}", i, other.abi_type())),
        }
    }

    fn uint(&self, i: usize) -> Exec<u128> {
        self.get(i)?
            .as_uint()
            .ok_or_else(|| Revert(format!("argument {} should be an integer", i)))
    }

    fn string(&self, i: usize) -> Exec<String> {
        match self.get(i)? {
            AbiValue::String(v) => Ok(v.clone()),
            other => revert(format!("argument {} should be string, got {}", i, other.abi_type())),
        }
    }

    fn bytes(&self, i: usize) -> Exec<Vec<u8>> {
        match self.get(i)? {
            AbiValue::Bytes(v) => Ok(v.clone()),
            other => revert(format!("argument {} should be bytes, got {}", i, other.abi_type())),
        }
    }

    fn bytes32_array(&self, i: usize) -> Exec<Vec<Bytes32>> {
        match self.get(i)? {
            AbiValue::Bytes32Array(v) => Ok(v.clone()),
            other => revert(format!("argument {} should be bytes32[], got {}", i, other.abi_type())),
        }
    }

    fn address_array(&self, i: usize) -> Exec<Vec<Address>> {
        match self.get(i)? {
            AbiValue::AddressArray(v) => Ok(v.clone()),
            other => revert(format!("argument {} should be address[], got {}", i, other.abi_type())),
        }
    }

    fn uint_array(&self, i: usize) -> Exec<Vec<u128>> {
        match self.get(i)? {
            AbiValue::Uint256Array(v) => Ok(v.clone()),
            other => revert(format!("argument {} should be uint256[], got {}", i, other.abi_type())),
        }
    }
}

/// Event emitted during execution, before it is assigned a position in the log.
struct PendingEvent {
    contract: &'static str,
    event: &'static str,
    values: Vec<(&'static str, AbiValue)>,
}

pub struct MemoryChain {
    state: Mutex<ChainState>,
    feed: Mutex<Option<broadcast::Sender<ChainEvent>>>,
    addresses: BTreeMap<String, Address>,
    message_prefix: String,
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::with_message_prefix(DEFAULT_MESSAGE_PREFIX)
    }

    pub fn with_message_prefix(prefix: &str) -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        let addresses = ALL_CONTRACTS
            .iter()
            .map(|name| (name.to_string(), Self::derive_address(name)))
            .collect();
        Self {
            state: Mutex::new(ChainState::default()),
            feed: Mutex::new(Some(tx)),
            addresses,
            message_prefix: prefix.to_string(),
        }
    }

    /// Deterministic deployment address: the last 20 bytes of keccak(name).
    pub fn derive_address(name: &str) -> Address {
        let hash = keccak256(name.as_bytes());
        let mut out = [0u8; 20];
        out.copy_from_slice(&hash[12..]);
        Address(out)
    }

    pub fn address_book(&self) -> BTreeMap<String, Address> {
        self.addresses.clone()
    }

    pub fn mint(&self, to: Address, amount: u128) {
        let mut state = self.state.lock();
        *state.balances.entry(to).or_default() += amount;
    }

    pub fn balance(&self, of: Address) -> u128 {
        self.state.lock().balances.get(&of).copied().unwrap_or(0)
    }

    pub fn current_block(&self) -> u64 {
        self.state.lock().block
    }

    pub fn mine_blocks(&self, n: u64) {
        let mut state = self.state.lock();
        state.block += n;
        debug!(block = state.block, "Mined {} empty blocks", n);
    }

    /// Closes the live event feed. Existing receivers see the channel close;
    /// later calls to `live_events` fail.
    pub fn disconnect(&self) {
        if self.feed.lock().take().is_some() {
            info!("Memory chain event transport disconnected");
        }
    }

    pub fn logs(&self) -> Vec<ChainEvent> {
        self.state.lock().log.clone()
    }

    fn address(&self, name: &str) -> Exec<Address> {
        self.addresses
            .get(name)
            .copied()
            .ok_or_else(|| Revert(format!("no contract named {}", name)))
    }

    fn read(&self, state: &ChainState, call: &ContractCall) -> Exec<Vec<AbiValue>> {
        let args = Args(&call.args);
        let value = match (call.contract.as_str(), call.method.as_str()) {
            (OCEAN_TOKEN, "balanceOf") => {
                AbiValue::Uint256(state.balances.get(&args.address(0)?).copied().unwrap_or(0))
            }
            (OCEAN_TOKEN, "allowance") => AbiValue::Uint256(
                state
                    .allowances
                    .get(&(args.address(0)?, args.address(1)?))
                    .copied()
                    .unwrap_or(0),
            ),
            (DID_REGISTRY, "getDIDOwner") => AbiValue::Address(
                state
                    .dids
                    .get(&args.bytes32(0)?)
                    .map(|d| d.owner)
                    .unwrap_or_default(),
            ),
            (DID_REGISTRY, "getBlockNumberUpdated") => AbiValue::Uint256(
                state
                    .dids
                    .get(&args.bytes32(0)?)
                    .map(|d| u128::from(d.block_updated))
                    .unwrap_or(0),
            ),
            (TEMPLATE_STORE_MANAGER, "getTemplateOwner") => AbiValue::Address(
                state
                    .templates
                    .get(&args.bytes32(0)?)
                    .map(|t| t.owner)
                    .unwrap_or_default(),
            ),
            (TEMPLATE_STORE_MANAGER, "getTemplateStatus") => {
                let registered = state.templates.contains_key(&args.bytes32(0)?);
                AbiValue::Uint8(if registered { 2 } else { 0 })
            }
            (AGREEMENT_STORE_MANAGER, "agreementExists") => {
                AbiValue::Bool(state.agreements.contains_key(&args.bytes32(0)?))
            }
            (CONDITION_STORE_MANAGER, "getConditionState") => {
                let code = state
                    .conditions
                    .get(&args.bytes32(0)?)
                    .map(|c| c.effective_state(state.block) as u8)
                    .unwrap_or(0);
                AbiValue::Uint8(code)
            }
            (ACCESS_SECRET_STORE_CONDITION, "checkPermissions") => AbiValue::Bool(
                state
                    .permissions
                    .contains(&(args.address(0)?, args.bytes32(1)?)),
            ),
            (contract, method) => return revert(format!("{}.{} is not a view", contract, method)),
        };
        Ok(vec![value])
    }

    fn execute(
        &self,
        state: &mut ChainState,
        call: &ContractCall,
        from: Address,
    ) -> Exec<Vec<PendingEvent>> {
        let args = Args(&call.args);
        let block = state.block;
        let mut events = Vec::new();

        match (call.contract.as_str(), call.method.as_str()) {
            (OCEAN_TOKEN, "approve") => {
                let spender = args.address(0)?;
                let value = args.uint(1)?;
                state.allowances.insert((from, spender), value);
                events.push(PendingEvent {
                    contract: OCEAN_TOKEN,
                    event: "Approval",
                    values: vec![
                        ("owner", AbiValue::Address(from)),
                        ("spender", AbiValue::Address(spender)),
                        ("value", AbiValue::Uint256(value)),
                    ],
                });
            }
            (DISPENSER, "requestTokens") => {
                let amount = args.uint(0)?;
                *state.balances.entry(from).or_default() += amount;
                events.push(PendingEvent {
                    contract: DISPENSER,
                    event: "RequestTokens",
                    values: vec![
                        ("requester", AbiValue::Address(from)),
                        ("amount", AbiValue::Uint256(amount)),
                    ],
                });
            }
            (DID_REGISTRY, "registerAttribute") => {
                let did = args.bytes32(0)?;
                let checksum = args.bytes32(1)?;
                let value = args.string(2)?;
                if let Some(existing) = state.dids.get(&did) {
                    if existing.owner != from {
                        return revert("Invalid DID owner, can not perform operation");
                    }
                }
                state.dids.insert(
                    did,
                    DidRecord {
                        owner: from,
                        block_updated: block,
                    },
                );
                events.push(PendingEvent {
                    contract: DID_REGISTRY,
                    event: "DIDAttributeRegistered",
                    values: vec![
                        ("did", AbiValue::Bytes32(did)),
                        ("owner", AbiValue::Address(from)),
                        ("checksum", AbiValue::Bytes32(checksum)),
                        ("value", AbiValue::String(value)),
                        ("lastUpdatedBy", AbiValue::Address(from)),
                        ("blockNumberUpdated", AbiValue::Uint256(u128::from(block))),
                    ],
                });
            }
            (TEMPLATE_STORE_MANAGER, "setupTemplate") => {
                let template_id = args.bytes32(0)?;
                let condition_types = args.address_array(1)?;
                let dependencies = args.uint_array(3)?;
                let owner = args.address(6)?;
                if state.templates.contains_key(&template_id) {
                    return revert("Template already exists");
                }
                if condition_types.is_empty() || condition_types.len() != dependencies.len() {
                    return revert("Invalid template: condition and dependency counts differ");
                }
                state.templates.insert(
                    template_id,
                    TemplateRecord {
                        owner,
                        condition_types,
                        dependencies,
                    },
                );
                events.push(PendingEvent {
                    contract: TEMPLATE_STORE_MANAGER,
                    event: "TemplateSetup",
                    values: vec![
                        ("templateId", AbiValue::Bytes32(template_id)),
                        ("provider", AbiValue::Address(owner)),
                    ],
                });
            }
            (AGREEMENT_STORE_MANAGER, "createAgreement") => {
                events.push(self.create_agreement(state, &args, from)?);
            }
            (LOCK_REWARD_CONDITION, "fulfill") => {
                let agreement_id = args.bytes32(0)?;
                let reward_address = args.address(1)?;
                let amount = args.uint(2)?;
                let value_hash = solidity_sha3(&[AbiValue::Address(reward_address), AbiValue::Uint256(amount)]);
                let contract = self.address(LOCK_REWARD_CONDITION)?;

                if let Some(condition_id) = Self::begin_fulfill(state, contract, agreement_id, value_hash)? {
                    let allowance = state.allowances.get(&(from, contract)).copied().unwrap_or(0);
                    if allowance < amount {
                        return revert(format!("Insufficient allowance: {} < {}", allowance, amount));
                    }
                    Self::transfer(state, from, reward_address, amount)?;
                    state.allowances.insert((from, contract), allowance - amount);
                    Self::complete(state, condition_id);
                    events.push(PendingEvent {
                        contract: LOCK_REWARD_CONDITION,
                        event: "Fulfilled",
                        values: vec![
                            ("agreementId", AbiValue::Bytes32(agreement_id)),
                            ("rewardAddress", AbiValue::Address(reward_address)),
                            ("conditionId", AbiValue::Bytes32(condition_id)),
                            ("amount", AbiValue::Uint256(amount)),
                        ],
                    });
                }
            }
            (ACCESS_SECRET_STORE_CONDITION, "fulfill") => {
                let agreement_id = args.bytes32(0)?;
                let document_id = args.bytes32(1)?;
                let grantee = args.address(2)?;
                let value_hash = solidity_sha3(&[AbiValue::Bytes32(document_id), AbiValue::Address(grantee)]);
                let contract = self.address(ACCESS_SECRET_STORE_CONDITION)?;

                let owner = state.dids.get(&document_id).map(|d| d.owner);
                if owner != Some(from) {
                    return revert("Only the DID owner can grant access");
                }
                if let Some(condition_id) = Self::begin_fulfill(state, contract, agreement_id, value_hash)? {
                    state.permissions.insert((grantee, document_id));
                    Self::complete(state, condition_id);
                    events.push(PendingEvent {
                        contract: ACCESS_SECRET_STORE_CONDITION,
                        event: "Fulfilled",
                        values: vec![
                            ("agreementId", AbiValue::Bytes32(agreement_id)),
                            ("documentId", AbiValue::Bytes32(document_id)),
                            ("grantee", AbiValue::Address(grantee)),
                            ("conditionId", AbiValue::Bytes32(condition_id)),
                        ],
                    });
                }
            }
            (ESCROW_REWARD, "fulfill") => {
                let agreement_id = args.bytes32(0)?;
                let amount = args.uint(1)?;
                let receiver = args.address(2)?;
                let sender = args.address(3)?;
                let lock_condition = args.bytes32(4)?;
                let release_condition = args.bytes32(5)?;
                let value_hash = solidity_sha3(&[
                    AbiValue::Uint256(amount),
                    AbiValue::Address(receiver),
                    AbiValue::Address(sender),
                    AbiValue::Bytes32(lock_condition),
                    AbiValue::Bytes32(release_condition),
                ]);
                let contract = self.address(ESCROW_REWARD)?;

                let state_of = |state: &ChainState, id: &Bytes32| {
                    state.conditions.get(id).map(|c| c.effective_state(block))
                };
                if state_of(&*state, &lock_condition) != Some(ConditionState::Fulfilled) {
                    return revert("Lock condition needs to be Fulfilled");
                }
                let payee = match state_of(&*state, &release_condition) {
                    Some(ConditionState::Fulfilled) => receiver,
                    Some(ConditionState::Aborted) => sender,
                    _ => return revert("Release condition needs to be Fulfilled or Aborted"),
                };

                if let Some(condition_id) = Self::begin_fulfill(state, contract, agreement_id, value_hash)? {
                    Self::transfer(state, contract, payee, amount)?;
                    Self::complete(state, condition_id);
                    events.push(PendingEvent {
                        contract: ESCROW_REWARD,
                        event: "Fulfilled",
                        values: vec![
                            ("agreementId", AbiValue::Bytes32(agreement_id)),
                            ("receiver", AbiValue::Address(payee)),
                            ("conditionId", AbiValue::Bytes32(condition_id)),
                            ("amount", AbiValue::Uint256(amount)),
                        ],
                    });
                }
            }
            (contract, method) => return revert(format!("{}.{} is not a transaction", contract, method)),
        }

        Ok(events)
    }

    fn create_agreement(&self, state: &mut ChainState, args: &Args<'_>, from: Address) -> Exec<PendingEvent> {
        let template_id = args.bytes32(0)?;
        let agreement_id = args.bytes32(1)?;
        let did = args.bytes32(2)?;
        let condition_ids = args.bytes32_array(3)?;
        let value_hashes = args.bytes32_array(4)?;
        let timelocks = args.uint_array(5)?;
        let timeouts = args.uint_array(6)?;
        let consumer = args.address(7)?;
        let signature = args.bytes(8)?;

        let template = state
            .templates
            .get(&template_id)
            .ok_or_else(|| Revert("Template not found".to_string()))?;
        if state.agreements.contains_key(&agreement_id) {
            return revert("Id already exists");
        }
        let n = template.condition_types.len();
        if [condition_ids.len(), value_hashes.len(), timelocks.len(), timeouts.len()]
            .iter()
            .any(|len| *len != n)
        {
            return revert(format!("Arguments must have {} entries", n));
        }
        match state.dids.get(&did) {
            Some(record) if record.owner == from => {}
            Some(_) => return revert("Only the DID owner can create agreements"),
            None => return revert("DID not registered"),
        }

        for (i, condition_id) in condition_ids.iter().enumerate() {
            let expected = solidity_sha3(&[
                AbiValue::Bytes32(agreement_id),
                AbiValue::Address(template.condition_types[i]),
                AbiValue::Bytes32(value_hashes[i]),
            ]);
            if expected != *condition_id {
                return revert(format!("Condition id {} does not match its value hash", i));
            }
        }

        let agreement_hash = solidity_sha3(&[
            AbiValue::Bytes32(template_id),
            AbiValue::Bytes32Array(value_hashes),
            AbiValue::Uint256Array(timelocks.clone()),
            AbiValue::Uint256Array(timeouts.clone()),
            AbiValue::Bytes32(agreement_id),
        ]);
        let signature = Signature::from_slice(&signature).map_err(|e| Revert(e.to_string()))?;
        let signer = recover_personal(&self.message_prefix, agreement_hash.as_bytes(), &signature)
            .map_err(|e| Revert(e.to_string()))?;
        if signer != consumer {
            return revert("Invalid consumer signature");
        }

        let created = state.block;
        for (index, condition_id) in condition_ids.iter().enumerate() {
            if state.conditions.contains_key(condition_id) {
                return revert("Condition id already exists");
            }
            state.conditions.insert(
                *condition_id,
                ConditionRecord {
                    agreement_id,
                    index,
                    state: ConditionState::Unfulfilled,
                    created,
                    timelock: u64::try_from(timelocks[index]).unwrap_or(u64::MAX),
                    timeout: u64::try_from(timeouts[index]).unwrap_or(u64::MAX),
                },
            );
        }
        state.agreements.insert(
            agreement_id,
            AgreementRecord {
                template_id,
                condition_ids,
            },
        );

        Ok(PendingEvent {
            contract: AGREEMENT_STORE_MANAGER,
            event: "AgreementInitialized",
            values: vec![
                ("agreementId", AbiValue::Bytes32(agreement_id)),
                ("templateId", AbiValue::Bytes32(template_id)),
                ("did", AbiValue::Bytes32(did)),
                ("consumer", AbiValue::Address(consumer)),
                ("creator", AbiValue::Address(from)),
            ],
        })
    }

    /// Locates the condition and checks it may be fulfilled now. Returns `None` when
    /// the condition has timed out, in which case it is marked aborted and no event fires.
    fn begin_fulfill(
        state: &mut ChainState,
        contract: Address,
        agreement_id: Bytes32,
        value_hash: Bytes32,
    ) -> Exec<Option<Bytes32>> {
        let condition_id = solidity_sha3(&[
            AbiValue::Bytes32(agreement_id),
            AbiValue::Address(contract),
            AbiValue::Bytes32(value_hash),
        ]);
        let block = state.block;
        let condition = state
            .conditions
            .get(&condition_id)
            .cloned()
            .ok_or_else(|| Revert(format!("Condition {} does not exist", condition_id)))?;

        if condition.state != ConditionState::Unfulfilled {
            return revert(format!("Condition is {:?}", condition.state));
        }
        if condition.effective_state(block) == ConditionState::Aborted {
            if let Some(record) = state.conditions.get_mut(&condition_id) {
                record.state = ConditionState::Aborted;
            }
            return Ok(None);
        }
        if !condition.timelock_elapsed(block) {
            return revert("Timelock has not elapsed");
        }

        let agreement = state
            .agreements
            .get(&condition.agreement_id)
            .ok_or_else(|| Revert("Agreement not found".to_string()))?;
        let template = state
            .templates
            .get(&agreement.template_id)
            .ok_or_else(|| Revert("Template not found".to_string()))?;
        let dependency_value = template.dependencies.get(condition.index).copied().unwrap_or(0);

        for (slot, dependency_id) in agreement.condition_ids.iter().enumerate() {
            let bits = (dependency_value >> (2 * slot)) & 0b11;
            if bits & 0b01 == 0 {
                continue;
            }
            let dependency_state = state
                .conditions
                .get(dependency_id)
                .map(|c| c.effective_state(block));
            let satisfied = match dependency_state {
                Some(ConditionState::Fulfilled) => true,
                Some(ConditionState::Aborted) => bits & 0b10 != 0,
                _ => false,
            };
            if !satisfied {
                return revert(format!("Dependency {} is not satisfied", slot));
            }
        }

        Ok(Some(condition_id))
    }

    fn complete(state: &mut ChainState, condition_id: Bytes32) {
        if let Some(record) = state.conditions.get_mut(&condition_id) {
            record.state = ConditionState::Fulfilled;
        }
    }

    fn transfer(state: &mut ChainState, from: Address, to: Address, amount: u128) -> Exec<()> {
        let balance = state.balances.get(&from).copied().unwrap_or(0);
        if balance < amount {
            return revert(format!("Insufficient balance: {} < {}", balance, amount));
        }
        state.balances.insert(from, balance - amount);
        *state.balances.entry(to).or_default() += amount;
        Ok(())
    }

    fn check_known(&self, call: &ContractCall) -> Result<()> {
        if self.addresses.contains_key(&call.contract) {
            Ok(())
        } else {
            Err(SdkError::Rpc(format!("no contract named {}", call.contract)))
        }
    }
}

#[async_trait]
impl ChainClient for MemoryChain {
    fn contract_address(&self, contract: &str) -> Result<Address> {
        self.addresses
            .get(contract)
            .copied()
            .ok_or_else(|| SdkError::Config(format!("No address configured for contract {}", contract)))
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self.state.lock().block)
    }

    async fn call(&self, call: &ContractCall) -> Result<Vec<AbiValue>> {
        self.check_known(call)?;
        let state = self.state.lock();
        self.read(&state, call)
            .map_err(|Revert(reason)| SdkError::Rpc(format!("call reverted: {}", reason)))
    }

    async fn estimate_gas(&self, call: &ContractCall, from: Address) -> Result<u64> {
        self.check_known(call)?;
        let mut dry_run = self.state.lock().clone();
        dry_run.block += 1;
        self.execute(&mut dry_run, call, from)
            .map_err(|Revert(reason)| SdkError::Rpc(format!("execution reverted: {}", reason)))?;
        Ok(21_000 + 10_000 * call.args.len() as u64)
    }

    async fn send_transaction(&self, call: &ContractCall, from: Address, gas: u64) -> Result<TransactionReceipt> {
        self.check_known(call)?;
        let (receipt, emitted) = {
            let mut state = self.state.lock();
            state.block += 1;
            state.tx_count += 1;

            let mut seed = state.tx_count.to_be_bytes().to_vec();
            seed.extend_from_slice(from.as_bytes());
            let transaction_hash = Bytes32(keccak256(&seed));
            let block_number = state.block;

            let mut working = state.clone();
            let (status, events) = match self.execute(&mut working, call, from) {
                Ok(pending) => {
                    let events: Vec<ChainEvent> = pending
                        .into_iter()
                        .enumerate()
                        .map(|(i, p)| ChainEvent {
                            contract: p.contract.to_string(),
                            event: p.event.to_string(),
                            block_number,
                            transaction_hash,
                            log_index: i as u64,
                            return_values: p.values.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
                        })
                        .collect();
                    working.log.extend(events.iter().cloned());
                    *state = working;
                    (true, events)
                }
                Err(Revert(reason)) => {
                    debug!(contract = %call.contract, method = %call.method, %reason, "Transaction reverted");
                    (false, Vec::new())
                }
            };

            let receipt = TransactionReceipt {
                transaction_hash,
                block_number,
                from,
                status,
                gas_used: gas.min(21_000 + 10_000 * call.args.len() as u64),
                events: events.clone(),
            };
            (receipt, events)
        };

        if let Some(feed) = self.feed.lock().as_ref() {
            for event in emitted {
                // no receivers is fine
                let _ = feed.send(event);
            }
        }

        Ok(receipt)
    }

    async fn past_events(&self, query: &EventQuery) -> Result<Vec<ChainEvent>> {
        let state = self.state.lock();
        Ok(state.log.iter().filter(|e| query.matches(e)).cloned().collect())
    }

    fn live_events(&self) -> Result<broadcast::Receiver<ChainEvent>> {
        self.feed
            .lock()
            .as_ref()
            .map(|tx| tx.subscribe())
            .ok_or_else(|| SdkError::Rpc("event transport disconnected".to_string()))
    }
}
