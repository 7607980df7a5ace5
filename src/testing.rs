//! Test doubles: an in-memory ledger node and a scripted fee market.
//!
//! [`MockLedger`] keeps per-sender nonces and a pending pool keyed by `(sender, nonce)`,
//! mines immediately unless told to withhold, enforces a 10% replacement bump, and runs
//! a small escrow contract so facade tests see real state transitions and events.

use alloy::dyn_abi::DynSolValue;
use alloy::primitives::{Address, B256, Bytes, TxHash, U256, address, keccak256};
use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::FeeConfig;
use crate::contract::{ContractDescriptor, ContractDescriptorRegistry, ContractHandle, DescriptorSource};
use crate::error::NodeError;
use crate::escrow::EscrowOrchestrator;
use crate::fees::{FeeEstimator, FeeMarket, FeeMarketError};
use crate::node::{CallRequest, LedgerNode, LogStream};
use crate::nonce::NonceSequencer;
use crate::retry::{RetryPolicy, TransactionRetryOrchestrator};
use crate::types::{EventLog, PendingCall, Receipt};

pub use crate::escrow::escrow_interface;

const ESCROW_BYTECODE: &str = "0x6080604052348015600f57600080fd5b50";

const ACTIVE: u8 = 1;
const RELEASED: u8 = 2;
const TERMINATED: u8 = 3;

pub fn admin() -> Address {
    address!("00000000000000000000000000000000000000a1")
}

pub fn contractor() -> Address {
    address!("00000000000000000000000000000000000000c0")
}

/// `abi/Escrow.json` plus a creation bytecode.
pub fn escrow_artifact() -> serde_json::Value {
    let abi: serde_json::Value =
        serde_json::from_str(include_str!("../abi/Escrow.json")).expect("escrow abi is valid json");
    serde_json::json!({ "abi": abi, "bytecode": ESCROW_BYTECODE })
}

pub fn escrow_descriptor() -> Arc<ContractDescriptor> {
    Arc::new(ContractDescriptor::from_json("escrow", escrow_artifact()).expect("escrow descriptor"))
}

pub fn escrow_handle(ledger: &Arc<MockLedger>, address: Address) -> ContractHandle {
    ContractHandle::bound(escrow_descriptor(), ledger.clone(), address)
}

/// Escrow creation for `contractor()` sent by `admin()`.
pub fn deployment_call(ledger: &Arc<MockLedger>, value: U256) -> PendingCall {
    ContractHandle::unbound(escrow_descriptor(), ledger.clone())
        .deployment(vec![DynSolValue::Address(contractor())], admin(), value)
        .expect("escrow deployment")
}

pub fn funds_released_log(contract: Address, recipient: Address, amount: U256, block: u64) -> EventLog {
    EventLog {
        address: contract,
        topics: vec![keccak256("FundsReleased(address,uint256)"), recipient.into_word()],
        data: Bytes::copy_from_slice(&amount.to_be_bytes::<32>()),
        block_number: Some(block),
        transaction_hash: None,
    }
}

/// Millisecond-scale policy: 3 attempts, 10ms apart, 50ms receipt wait.
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        retry_delay: Duration::from_millis(10),
        backoff_multiplier: 1.0,
        attempt_timeout: Duration::from_millis(50),
        overall_timeout: None,
        poll_interval: Duration::from_millis(5),
        max_delay: Duration::from_secs(1),
    }
}

pub fn retry_stack(ledger: &Arc<MockLedger>) -> (Arc<TransactionRetryOrchestrator>, Arc<NonceSequencer>) {
    retry_stack_with(ledger, fast_policy())
}

pub fn retry_stack_with(
    ledger: &Arc<MockLedger>,
    policy: RetryPolicy,
) -> (Arc<TransactionRetryOrchestrator>, Arc<NonceSequencer>) {
    let node: Arc<dyn LedgerNode> = ledger.clone();
    let nonces = Arc::new(NonceSequencer::new(Arc::clone(&node)));
    let fees = Arc::new(FeeEstimator::new(Arc::clone(&node), None, &FeeConfig::default()));
    let retry = Arc::new(TransactionRetryOrchestrator::new(node, fees, Arc::clone(&nonces), policy));
    (retry, nonces)
}

/// Facade over `ledger` with the escrow type registered inline and [`fast_policy`].
pub fn orchestrator(ledger: &Arc<MockLedger>) -> EscrowOrchestrator {
    let node: Arc<dyn LedgerNode> = ledger.clone();
    let registry = ContractDescriptorRegistry::new();
    registry
        .register("escrow", DescriptorSource::Inline(escrow_artifact()), escrow_interface())
        .expect("register escrow");
    let fees = FeeEstimator::new(Arc::clone(&node), None, &FeeConfig::default());
    EscrowOrchestrator::new(node, Arc::new(registry), fees, fast_policy(), admin())
}

/// Fee market that always answers the same way.
pub struct ScriptedFeeMarket {
    answer: Option<u128>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedFeeMarket {
    pub fn answering(price: u128) -> Arc<Self> {
        Arc::new(Self {
            answer: Some(price),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn timing_out(after: Duration) -> Arc<Self> {
        Arc::new(Self {
            answer: None,
            delay: after,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeeMarket for ScriptedFeeMarket {
    async fn suggested_gas_price(&self) -> Result<u128, FeeMarketError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.answer {
            Some(price) => Ok(price),
            None => {
                tokio::time::sleep(self.delay).await;
                Err(FeeMarketError::Timeout(self.delay))
            }
        }
    }
}

struct Escrow {
    contractor: Address,
    budget: U256,
    status: u8,
}

struct Pooled {
    hash: TxHash,
    request: CallRequest,
}

type Subscriber = (Address, B256, mpsc::UnboundedSender<Result<EventLog, NodeError>>);

#[derive(Default)]
struct LedgerState {
    gas_estimate: u64,
    gas_price: u128,
    /// Next nonce the chain will accept per sender.
    nonces: HashMap<Address, u64>,
    pool: BTreeMap<(Address, u64), Pooled>,
    receipts: HashMap<TxHash, Receipt>,
    codes: HashMap<Address, Bytes>,
    balances: HashMap<Address, U256>,
    escrows: HashMap<Address, Escrow>,
    logs: Vec<EventLog>,
    subscribers: Vec<Subscriber>,
    block_number: u64,
    calls: Vec<&'static str>,
    sent: Vec<CallRequest>,
    withhold: usize,
    send_failure: Option<String>,
    reverting_recipients: HashSet<Address>,
    deploy_without_code: bool,
    hashes_issued: u64,
}

impl LedgerState {
    fn next_nonce(&self, sender: Address) -> u64 {
        self.nonces.get(&sender).copied().unwrap_or(0)
    }

    /// Executable count: pooled transactions behind a nonce gap are not counted.
    fn pending_count(&self, sender: Address) -> u64 {
        let mut count = self.next_nonce(sender);
        while self.pool.contains_key(&(sender, count)) {
            count += 1;
        }
        count
    }

    /// Mine pooled transactions of `sender` while their nonces are contiguous.
    fn mine_ready(&mut self, sender: Address) -> usize {
        let mut mined = 0;
        loop {
            let next = self.next_nonce(sender);
            let Some(pooled) = self.pool.remove(&(sender, next)) else {
                return mined;
            };
            self.mine(pooled);
            mined += 1;
        }
    }

    fn mine(&mut self, Pooled { hash, request }: Pooled) {
        let from = request.from.unwrap_or_default();
        let nonce = request.nonce.unwrap_or_default();
        self.nonces.insert(from, nonce + 1);
        self.block_number += 1;
        let block = self.block_number;

        let mut contract_address = None;
        let mut logs = Vec::new();
        let success = match request.to {
            None => {
                let created = from.create(nonce);
                let code = if self.deploy_without_code {
                    Bytes::new()
                } else {
                    request.input.clone()
                };
                self.codes.insert(created, code);
                *self.balances.entry(created).or_default() += request.value;
                if request.input.len() >= 32 {
                    let contractor = Address::from_slice(&request.input[request.input.len() - 20..]);
                    self.escrows.insert(
                        created,
                        Escrow {
                            contractor,
                            budget: request.value,
                            status: ACTIVE,
                        },
                    );
                }
                contract_address = Some(created);
                true
            }
            Some(to) if self.reverting_recipients.contains(&to) => false,
            Some(to) => match self.execute(from, to, &request.input) {
                Ok(emitted) => {
                    *self.balances.entry(to).or_default() += request.value;
                    logs = emitted
                        .into_iter()
                        .map(|(topics, data)| EventLog {
                            address: to,
                            topics,
                            data,
                            block_number: Some(block),
                            transaction_hash: Some(hash),
                        })
                        .collect();
                    true
                }
                Err(_) => false,
            },
        };

        self.receipts.insert(
            hash,
            Receipt {
                transaction_hash: hash,
                success,
                contract_address,
                block_number: Some(block),
                gas_used: 21_000,
                effective_gas_price: request.gas_price.unwrap_or_default(),
                logs: logs.clone(),
            },
        );
        for log in logs {
            self.publish(log);
        }
    }

    fn escrow_method(&self, to: Address, input: &[u8]) -> Option<&'static str> {
        let selector = input.get(..4)?;
        if !self.escrows.contains_key(&to) {
            return None;
        }
        ["release()", "withdraw()", "terminate()"]
            .into_iter()
            .find(|signature| &keccak256(signature)[..4] == selector)
    }

    fn revert_reason(&self, to: Address, input: &[u8]) -> Option<String> {
        if input.len() < 4 {
            return None;
        }
        match (self.escrow_method(to, input), self.escrows.get(&to)) {
            (Some(_), Some(escrow)) if escrow.status != ACTIVE => Some("Not in active status".to_string()),
            (Some(_), Some(_)) => None,
            _ => Some("function selector was not recognized".to_string()),
        }
    }

    /// Run a call against `to`, returning emitted `(topics, data)` pairs.
    fn execute(&mut self, from: Address, to: Address, input: &[u8]) -> Result<Vec<(Vec<B256>, Bytes)>, String> {
        if input.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(reason) = self.revert_reason(to, input) {
            return Err(reason);
        }
        let method = self.escrow_method(to, input).unwrap_or_default();
        let held = self.balances.insert(to, U256::ZERO).unwrap_or_default();
        let Some(escrow) = self.escrows.get_mut(&to) else {
            return Err("not an escrow".to_string());
        };
        let amount = Bytes::copy_from_slice(&held.to_be_bytes::<32>());
        let emitted = match method {
            "release()" => {
                escrow.status = RELEASED;
                *self.balances.entry(escrow.contractor).or_default() += held;
                (
                    vec![keccak256("FundsReleased(address,uint256)"), escrow.contractor.into_word()],
                    amount,
                )
            }
            "withdraw()" => {
                *self.balances.entry(from).or_default() += held;
                (vec![keccak256("FundsWithdrawn(address,uint256)"), from.into_word()], amount)
            }
            _ => {
                escrow.status = TERMINATED;
                *self.balances.entry(from).or_default() += held;
                (vec![keccak256("ContractTerminated(address)"), from.into_word()], Bytes::new())
            }
        };
        Ok(vec![emitted])
    }

    fn publish(&mut self, log: EventLog) {
        self.logs.push(log.clone());
        self.subscribers.retain(|(address, topic0, tx)| {
            if *address == log.address && log.topics.first() == Some(topic0) {
                tx.unbounded_send(Ok(log.clone())).is_ok()
            } else {
                !tx.is_closed()
            }
        });
    }
}

/// In-memory [`LedgerNode`].
pub struct MockLedger {
    state: Mutex<LedgerState>,
}

impl MockLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LedgerState {
                gas_estimate: 100_000,
                gas_price: 1_000_000_000,
                ..Default::default()
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().expect("ledger state poisoned")
    }

    fn record(&self, call: &'static str) -> MutexGuard<'_, LedgerState> {
        let mut state = self.state();
        state.calls.push(call);
        state
    }

    pub fn set_gas_estimate(&self, gas: u64) {
        self.state().gas_estimate = gas;
    }

    pub fn set_gas_price(&self, price: u128) {
        self.state().gas_price = price;
    }

    pub fn set_account_nonce(&self, sender: Address, nonce: u64) {
        self.state().nonces.insert(sender, nonce);
    }

    pub fn set_code(&self, address: Address, code: Bytes) {
        self.state().codes.insert(address, code);
    }

    pub fn code_at(&self, address: Address) -> Bytes {
        self.state().codes.get(&address).cloned().unwrap_or_default()
    }

    pub fn balance_of(&self, address: Address) -> U256 {
        self.state().balances.get(&address).copied().unwrap_or_default()
    }

    /// Keep the next `count` accepted transactions in the pool instead of mining them.
    pub fn withhold_next(&self, count: usize) {
        self.state().withhold = count;
    }

    /// Mine everything minable in the pool. Returns the number of transactions mined.
    pub fn mine_pending(&self) -> usize {
        let mut state = self.state();
        state.withhold = 0;
        let senders: HashSet<Address> = state.pool.keys().map(|(from, _)| *from).collect();
        senders.into_iter().map(|sender| state.mine_ready(sender)).sum()
    }

    /// Refuse every submission with `reason`.
    pub fn reject_all_sends(&self, reason: &str) {
        self.state().send_failure = Some(reason.to_string());
    }

    /// Mine transactions sent to `recipient` as reverted.
    pub fn revert_transfers_to(&self, recipient: Address) {
        self.state().reverting_recipients.insert(recipient);
    }

    pub fn deploy_without_code(&self, enabled: bool) {
        self.state().deploy_without_code = enabled;
    }

    pub fn emit_log(&self, log: EventLog) {
        let mut state = self.state();
        if let Some(block) = log.block_number {
            state.block_number = state.block_number.max(block);
        }
        state.publish(log);
    }

    /// Every submission the node received, accepted or not.
    pub fn sent(&self) -> Vec<CallRequest> {
        self.state().sent.clone()
    }

    pub fn count_calls(&self, name: &str) -> usize {
        self.state().calls.iter().filter(|c| **c == name).count()
    }

    pub fn total_calls(&self) -> usize {
        self.state().calls.len()
    }
}

#[async_trait]
impl LedgerNode for MockLedger {
    fn endpoint(&self) -> String {
        "memory://ledger".to_string()
    }

    async fn estimate_gas(&self, request: &CallRequest) -> Result<u64, NodeError> {
        let state = self.record("estimate_gas");
        if let Some(to) = request.to {
            if state.escrows.contains_key(&to) {
                if let Some(reason) = state.revert_reason(to, &request.input) {
                    return Err(NodeError::Rejected {
                        reason: format!("execution reverted: {reason}"),
                    });
                }
            }
        }
        Ok(state.gas_estimate)
    }

    async fn gas_price(&self) -> Result<u128, NodeError> {
        Ok(self.record("gas_price").gas_price)
    }

    async fn pending_transaction_count(&self, address: Address) -> Result<u64, NodeError> {
        Ok(self.record("pending_transaction_count").pending_count(address))
    }

    async fn send_transaction(&self, request: &CallRequest) -> Result<TxHash, NodeError> {
        let mut state = self.record("send_transaction");
        state.sent.push(request.clone());
        if let Some(reason) = &state.send_failure {
            return Err(NodeError::Rejected { reason: reason.clone() });
        }

        let from = request.from.unwrap_or_default();
        let expected = state.next_nonce(from);
        let nonce = request.nonce.unwrap_or_else(|| state.pending_count(from));
        if nonce < expected {
            return Err(NodeError::Rejected {
                reason: format!("nonce too low: next nonce {expected}, tx nonce {nonce}"),
            });
        }
        if let Some(existing) = state.pool.get(&(from, nonce)) {
            let old = existing.request.gas_price.unwrap_or_default();
            let new = request.gas_price.unwrap_or_default();
            if new <= old || new.saturating_mul(100) < old.saturating_mul(110) {
                return Err(NodeError::Rejected {
                    reason: "replacement transaction underpriced".to_string(),
                });
            }
        }

        state.hashes_issued += 1;
        let hash = keccak256(state.hashes_issued.to_be_bytes());
        let request = CallRequest {
            nonce: Some(nonce),
            ..request.clone()
        };
        state.pool.insert((from, nonce), Pooled { hash, request });
        if state.withhold > 0 {
            state.withhold -= 1;
        } else {
            state.mine_ready(from);
        }
        Ok(hash)
    }

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<Receipt>, NodeError> {
        Ok(self.record("transaction_receipt").receipts.get(&hash).cloned())
    }

    async fn balance(&self, address: Address) -> Result<U256, NodeError> {
        Ok(self
            .record("balance")
            .balances
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn code(&self, address: Address) -> Result<Bytes, NodeError> {
        Ok(self.record("code").codes.get(&address).cloned().unwrap_or_default())
    }

    async fn call(&self, request: &CallRequest) -> Result<Bytes, NodeError> {
        let state = self.record("call");
        let reverted = || NodeError::Rejected {
            reason: "execution reverted".to_string(),
        };
        let escrow = request
            .to
            .and_then(|to| state.escrows.get(&to))
            .ok_or_else(reverted)?;
        let selector = request.input.get(..4).ok_or_else(reverted)?;
        let word = if selector == &keccak256("contractor()")[..4] {
            escrow.contractor.into_word()
        } else if selector == &keccak256("budget()")[..4] {
            B256::from(escrow.budget.to_be_bytes::<32>())
        } else if selector == &keccak256("getStatus()")[..4] {
            B256::from(U256::from(escrow.status).to_be_bytes::<32>())
        } else {
            return Err(reverted());
        };
        Ok(Bytes::copy_from_slice(word.as_slice()))
    }

    async fn subscribe_logs(
        &self,
        address: Address,
        topic0: B256,
        from_block: Option<u64>,
    ) -> Result<LogStream, NodeError> {
        let mut state = self.record("subscribe_logs");
        let backfill: Vec<Result<EventLog, NodeError>> = match from_block {
            Some(from) => state
                .logs
                .iter()
                .filter(|log| {
                    log.address == address
                        && log.topics.first() == Some(&topic0)
                        && log.block_number.is_some_and(|b| b >= from)
                })
                .cloned()
                .map(Ok)
                .collect(),
            None => Vec::new(),
        };
        let (tx, rx) = mpsc::unbounded();
        state.subscribers.push((address, topic0, tx));
        Ok(futures::stream::iter(backfill).chain(rx).boxed())
    }
}
