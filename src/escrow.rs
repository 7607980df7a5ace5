//! Escrow operations exposed to the application layer.
//!
//! [`EscrowOrchestrator`] wires the registry, factory, validator, fee estimator, nonce
//! sequencer, retry orchestrator, batch executor and event subscriber together and
//! offers the escrow lifecycle on top: deploy, release, withdraw, terminate, plus the
//! read-only status, balance and details queries.

use alloy::dyn_abi::DynSolValue;
use alloy::primitives::{Address, TxHash, U256};
use alloy::signers::local::PrivateKeySigner;
use serde::Serialize;
use std::sync::Arc;

use crate::batch::{BatchExecutor, BatchPlan};
use crate::config::EscrowConfig;
use crate::contract::{ContractDescriptorRegistry, ContractFactory, ContractHandle, RequiredInterface};
use crate::error::EscrowError;
use crate::events::{DecodedEvent, EventSubscriber, SubscriptionId};
use crate::fees::{FeeEstimator, FeeMarket, HttpFeeMarket};
use crate::node::{AlloyNode, LedgerNode};
use crate::nonce::NonceSequencer;
use crate::retry::{CallContext, NonceAssignment, RetryPolicy, TransactionRetryOrchestrator};
use crate::types::{Amount, PendingCall, Receipt, TransactionOutcome, parse_address};
use crate::validator::ContractStateValidator;

/// Registry type name of the escrow contract.
pub const ESCROW_TYPE: &str = "escrow";

/// State-changing escrow methods. Each one emits a completion event when it succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscrowMethod {
    Release,
    Withdraw,
    Terminate,
}

impl EscrowMethod {
    pub const ALL: [EscrowMethod; 3] = [EscrowMethod::Release, EscrowMethod::Withdraw, EscrowMethod::Terminate];

    pub fn name(self) -> &'static str {
        match self {
            EscrowMethod::Release => "release",
            EscrowMethod::Withdraw => "withdraw",
            EscrowMethod::Terminate => "terminate",
        }
    }

    pub fn completion_event(self) -> &'static str {
        match self {
            EscrowMethod::Release => "FundsReleased",
            EscrowMethod::Withdraw => "FundsWithdrawn",
            EscrowMethod::Terminate => "ContractTerminated",
        }
    }
}

/// Methods and events an escrow descriptor must declare.
pub fn escrow_interface() -> RequiredInterface {
    RequiredInterface::new(
        EscrowMethod::ALL.map(EscrowMethod::name),
        EscrowMethod::ALL.map(EscrowMethod::completion_event),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Active,
    Released,
    Terminated,
    Unknown(u8),
}

impl From<u8> for EscrowStatus {
    fn from(code: u8) -> Self {
        match code {
            1 => EscrowStatus::Active,
            2 => EscrowStatus::Released,
            3 => EscrowStatus::Terminated,
            other => EscrowStatus::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EscrowDetails {
    pub address: Address,
    pub contractor: Address,
    pub budget: Amount,
    pub status: EscrowStatus,
    pub balance: Amount,
}

/// Called with each completion event observed after a confirmed escrow call.
pub type EventObserver = Arc<dyn Fn(DecodedEvent) + Send + Sync>;

fn log_completion(event: DecodedEvent) {
    tracing::info!(
        contract = %event.contract,
        event = %event.event,
        block_number = ?event.block_number,
        tx_hash = ?event.transaction_hash,
        amount = ?event.field("amount"),
        recipient = ?event.field("recipient"),
        "escrow event observed"
    );
}

pub struct EscrowOrchestrator {
    node: Arc<dyn LedgerNode>,
    factory: ContractFactory,
    validator: ContractStateValidator,
    retry: Arc<TransactionRetryOrchestrator>,
    nonces: Arc<NonceSequencer>,
    batches: BatchExecutor,
    events: Arc<EventSubscriber>,
    admin: Address,
    observer: EventObserver,
}

impl EscrowOrchestrator {
    pub fn new(
        node: Arc<dyn LedgerNode>,
        registry: Arc<ContractDescriptorRegistry>,
        fees: FeeEstimator,
        policy: RetryPolicy,
        admin: Address,
    ) -> Self {
        let nonces = Arc::new(NonceSequencer::new(Arc::clone(&node)));
        let retry = Arc::new(TransactionRetryOrchestrator::new(
            Arc::clone(&node),
            Arc::new(fees),
            Arc::clone(&nonces),
            policy,
        ));
        Self {
            factory: ContractFactory::new(registry, Arc::clone(&node), Arc::clone(&retry)),
            validator: ContractStateValidator::new(),
            batches: BatchExecutor::new(Arc::clone(&retry), Arc::clone(&nonces)),
            events: Arc::new(EventSubscriber::new()),
            observer: Arc::new(log_completion),
            node,
            retry,
            nonces,
            admin,
        }
    }

    /// Build the production stack from configuration.
    ///
    /// The signing account is `node.admin_address` when set, otherwise the address of
    /// `ETHEREUM_ADMIN_PRIVATE_KEY`. Without a key the node signs for the admin account.
    pub fn connect(config: &EscrowConfig) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let signer = match std::env::var("ETHEREUM_ADMIN_PRIVATE_KEY") {
            Ok(key) => Some(key.trim().parse::<PrivateKeySigner>()?),
            Err(_) => None,
        };
        let admin = match (&config.node.admin_address, &signer) {
            (Some(address), signer) => {
                let admin = parse_address(address)?;
                if let Some(signer) = signer.as_ref().filter(|s| s.address() != admin) {
                    tracing::warn!(%admin, signer = %signer.address(), "admin address differs from signing key");
                }
                admin
            }
            (None, Some(signer)) => signer.address(),
            (None, None) => {
                return Err("no admin account: set ETHEREUM_ADMIN_ADDRESS or ETHEREUM_ADMIN_PRIVATE_KEY".into());
            }
        };

        let node: Arc<dyn LedgerNode> = Arc::new(AlloyNode::try_new(&config.node, signer, config.events.poll_interval())?);
        let market = HttpFeeMarket::from_config(&config.fees)?.map(|m| Arc::new(m) as Arc<dyn FeeMarket>);
        let fees = FeeEstimator::new(Arc::clone(&node), market, &config.fees);
        let registry = ContractDescriptorRegistry::from_config(&config.contracts)?;
        tracing::info!(
            endpoint = %node.endpoint(),
            %admin,
            contract_types = config.contracts.0.len(),
            "escrow orchestrator connected"
        );
        Ok(Self::new(node, Arc::new(registry), fees, RetryPolicy::from(&config.retry), admin))
    }

    /// Replace the default completion-event observer, which logs each event.
    pub fn with_event_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(DecodedEvent) + Send + Sync + 'static,
    {
        self.observer = Arc::new(observer);
        self
    }

    pub fn admin(&self) -> Address {
        self.admin
    }

    pub fn events(&self) -> &Arc<EventSubscriber> {
        &self.events
    }

    pub fn factory(&self) -> &ContractFactory {
        &self.factory
    }

    /// Deploy an escrow for `contractor` funded with `budget` (display units).
    #[tracing::instrument(skip_all, fields(contractor = %contractor, budget = %budget))]
    pub async fn deploy_contract(&self, contractor: &str, budget: &str, ctx: &CallContext) -> Result<Address, EscrowError> {
        let contractor = parse_address(contractor)?;
        let budget = Amount::from_ether(budget)?;
        let handle = self
            .factory
            .deploy(
                ESCROW_TYPE,
                self.admin,
                vec![DynSolValue::Address(contractor)],
                budget.wei(),
                ctx,
            )
            .await?;
        let address = handle.bound_address()?;
        tracing::info!(%address, %contractor, %budget, "escrow deployed");
        Ok(address)
    }

    #[tracing::instrument(skip_all, fields(address = %address))]
    pub async fn release_funds(&self, address: &str, ctx: &CallContext) -> Result<Receipt, EscrowError> {
        self.run_method(address, EscrowMethod::Release, ctx).await
    }

    #[tracing::instrument(skip_all, fields(address = %address))]
    pub async fn withdraw_funds(&self, address: &str, ctx: &CallContext) -> Result<Receipt, EscrowError> {
        self.run_method(address, EscrowMethod::Withdraw, ctx).await
    }

    #[tracing::instrument(skip_all, fields(address = %address))]
    pub async fn terminate_contract(&self, address: &str, ctx: &CallContext) -> Result<Receipt, EscrowError> {
        self.run_method(address, EscrowMethod::Terminate, ctx).await
    }

    /// Receipt for `hash`. [`EscrowError::TransactionNotFound`] while none exists yet.
    pub async fn check_transaction_status(&self, hash: &str) -> Result<Receipt, EscrowError> {
        let hash: TxHash = hash
            .trim()
            .parse()
            .map_err(|_| EscrowError::invalid("hash", "expected 0x followed by 64 hex digits"))?;
        self.node
            .transaction_receipt(hash)
            .await?
            .ok_or(EscrowError::TransactionNotFound(hash))
    }

    pub async fn get_balance(&self, address: &str) -> Result<Amount, EscrowError> {
        let address = parse_address(address)?;
        Ok(Amount(self.node.balance(address).await?))
    }

    /// Contractor, budget, status and current balance of an escrow.
    pub async fn contract_details(&self, address: &str) -> Result<EscrowDetails, EscrowError> {
        let address = parse_address(address)?;
        let handle = self.factory.at(ESCROW_TYPE, address).await?;
        let contractor = match first_output(&handle, "contractor").await? {
            DynSolValue::Address(contractor) => contractor,
            other => return Err(unexpected_output("contractor", &other)),
        };
        let budget = match first_output(&handle, "budget").await? {
            DynSolValue::Uint(budget, _) => Amount(budget),
            other => return Err(unexpected_output("budget", &other)),
        };
        let status = match first_output(&handle, "getStatus").await? {
            DynSolValue::Uint(code, _) => EscrowStatus::from(u8::try_from(code).unwrap_or(u8::MAX)),
            other => return Err(unexpected_output("getStatus", &other)),
        };
        let balance = Amount(self.node.balance(address).await?);
        Ok(EscrowDetails {
            address,
            contractor,
            budget,
            status,
            balance,
        })
    }

    /// New empty plan sent by the admin account.
    pub fn plan(&self) -> BatchPlan {
        BatchPlan::new(self.admin)
    }

    pub async fn submit_batch(&self, plan: &BatchPlan, ctx: &CallContext) -> Result<Vec<TransactionOutcome>, EscrowError> {
        self.batches.execute(plan, ctx).await
    }

    /// Creation call for a new escrow, for use inside a batch plan.
    pub async fn escrow_deployment(&self, contractor: &str) -> Result<PendingCall, EscrowError> {
        let contractor = parse_address(contractor)?;
        self.factory
            .deployment(ESCROW_TYPE, self.admin, vec![DynSolValue::Address(contractor)], U256::ZERO)
            .await
    }

    /// Drop the cached nonce of `sender` after transactions sent outside this process.
    pub async fn reset_nonce(&self, sender: &str) -> Result<(), EscrowError> {
        let sender = parse_address(sender)?;
        let _turn = self.nonces.lock_sender(sender).await;
        self.nonces.reset(sender).await;
        Ok(())
    }

    async fn run_method(&self, address: &str, method: EscrowMethod, ctx: &CallContext) -> Result<Receipt, EscrowError> {
        let address = parse_address(address)?;
        let handle = self.factory.at(ESCROW_TYPE, address).await?;
        self.validator.validate(&handle, &[method.name()]).await?;

        let call = handle.call(method.name(), Vec::new(), self.admin)?;
        let receipt = self
            .retry
            .execute(&call, NonceAssignment::Sequencer, ctx)
            .await?
            .into_receipt()?;
        tracing::info!(
            %address,
            method = method.name(),
            tx_hash = %receipt.transaction_hash,
            "escrow call confirmed"
        );
        self.observe_completion(&handle, method, receipt.block_number).await;
        Ok(receipt)
    }

    async fn observe_completion(
        &self,
        handle: &ContractHandle,
        method: EscrowMethod,
        from_block: Option<u64>,
    ) -> Option<SubscriptionId> {
        let observer = Arc::clone(&self.observer);
        match self
            .events
            .subscribe_once(handle, method.completion_event(), from_block, move |event| observer(event))
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(
                    event = method.completion_event(),
                    error = %e,
                    "could not observe completion event"
                );
                None
            }
        }
    }
}

async fn first_output(handle: &ContractHandle, method: &str) -> Result<DynSolValue, EscrowError> {
    handle
        .read(method, &[])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| EscrowError::invalid(method, "call returned no values"))
}

fn unexpected_output(method: &str, value: &DynSolValue) -> EscrowError {
    EscrowError::invalid(method, format!("unexpected return value {value:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MissingContract;
    use crate::testing::{MockLedger, admin, contractor, orchestrator};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const CONTRACTOR: &str = "0x00000000000000000000000000000000000000c0";

    async fn deployed(ledger: &Arc<MockLedger>, escrow: &EscrowOrchestrator, budget: &str) -> Address {
        let address = escrow
            .deploy_contract(CONTRACTOR, budget, &CallContext::new())
            .await
            .unwrap();
        assert!(!ledger.code_at(address).is_empty());
        address
    }

    #[test]
    fn test_escrow_interface_is_closed_set() {
        let interface = escrow_interface();
        assert_eq!(interface.methods, vec!["release", "withdraw", "terminate"]);
        assert_eq!(interface.events, vec!["FundsReleased", "FundsWithdrawn", "ContractTerminated"]);
        assert_eq!(EscrowStatus::from(2), EscrowStatus::Released);
        assert_eq!(EscrowStatus::from(9), EscrowStatus::Unknown(9));
    }

    #[tokio::test]
    async fn test_deploy_funds_contract_with_budget() {
        let ledger = MockLedger::new();
        let escrow = orchestrator(&ledger);
        let address = deployed(&ledger, &escrow, "2.5").await;
        assert_eq!(address, admin().create(0));
        let balance = escrow.get_balance(&address.to_string()).await.unwrap();
        assert_eq!(balance.to_ether_string(), "2.5");
    }

    #[tokio::test]
    async fn test_deploy_rejects_bad_input_before_any_send() {
        let ledger = MockLedger::new();
        let escrow = orchestrator(&ledger);
        assert!(matches!(
            escrow.deploy_contract("0xnot-an-address", "1", &CallContext::new()).await,
            Err(EscrowError::InvalidAddress(_))
        ));
        assert!(matches!(
            escrow.deploy_contract(CONTRACTOR, "-1", &CallContext::new()).await,
            Err(EscrowError::ValidationFailed { .. })
        ));
        assert!(ledger.sent().is_empty());
    }

    #[tokio::test]
    async fn test_deploy_failure_is_wrapped() {
        let ledger = MockLedger::new();
        ledger.reject_all_sends("insufficient funds for gas * price + value");
        let escrow = orchestrator(&ledger);
        match escrow.deploy_contract(CONTRACTOR, "1", &CallContext::new()).await {
            Err(EscrowError::DeploymentFailed { cause }) => {
                assert!(matches!(*cause, EscrowError::TransactionFailed { attempts: 3, .. }))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_release_confirms_and_observes_event() {
        let ledger = MockLedger::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let escrow = orchestrator(&ledger).with_event_observer(move |event| {
            let _ = tx.send(event);
        });
        let address = deployed(&ledger, &escrow, "1").await;

        let receipt = escrow
            .release_funds(&address.to_string(), &CallContext::new())
            .await
            .unwrap();
        assert!(receipt.success);
        assert_eq!(ledger.balance_of(address), U256::ZERO);

        let event = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event, "FundsReleased");
        assert_eq!(event.field("recipient"), Some(&DynSolValue::Address(contractor())));
        assert_eq!(
            event.field("amount"),
            Some(&DynSolValue::Uint(U256::from(10).pow(U256::from(18)), 256))
        );
        assert_eq!(event.transaction_hash, Some(receipt.transaction_hash));
    }

    #[tokio::test]
    async fn test_release_without_code_is_contract_not_found() {
        let ledger = MockLedger::new();
        let escrow = orchestrator(&ledger);
        let result = escrow.release_funds(CONTRACTOR, &CallContext::new()).await;
        assert!(matches!(
            result,
            Err(EscrowError::ContractNotFound {
                reason: MissingContract::NoCode,
                ..
            })
        ));
        assert!(ledger.sent().is_empty());
    }

    #[tokio::test]
    async fn test_second_release_fails_without_retrying() {
        let ledger = MockLedger::new();
        let escrow = orchestrator(&ledger);
        let address = deployed(&ledger, &escrow, "1").await.to_string();
        escrow.release_funds(&address, &CallContext::new()).await.unwrap();

        match escrow.release_funds(&address, &CallContext::new()).await {
            Err(EscrowError::TransactionFailed {
                method,
                last_error,
                attempts,
            }) => {
                assert_eq!(method, "release");
                assert_eq!(attempts, 1);
                assert!(last_error.contains("Not in active status"), "{last_error}");
            }
            other => panic!("unexpected {other:?}"),
        }
        // deploy and first release only
        assert_eq!(ledger.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_releases_do_not_strand_each_other() {
        let ledger = MockLedger::new();
        let escrow = orchestrator(&ledger);
        let done = deployed(&ledger, &escrow, "1").await.to_string();
        let open = deployed(&ledger, &escrow, "2").await.to_string();
        escrow.release_funds(&done, &CallContext::new()).await.unwrap();

        let (ctx_done, ctx_open) = (CallContext::new(), CallContext::new());
        let (again, fresh) = tokio::join!(
            escrow.release_funds(&done, &ctx_done),
            escrow.release_funds(&open, &ctx_open),
        );
        assert!(
            matches!(again, Err(EscrowError::TransactionFailed { ref last_error, .. }) if last_error.contains("Not in active status"))
        );
        assert!(fresh.unwrap().success);
        let nonces: Vec<_> = ledger.sent().iter().map(|r| r.nonce.unwrap()).collect();
        assert_eq!(nonces, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_terminate_then_details() {
        let ledger = MockLedger::new();
        let escrow = orchestrator(&ledger);
        let address = deployed(&ledger, &escrow, "3").await;

        let details = escrow.contract_details(&address.to_string()).await.unwrap();
        assert_eq!(details.contractor, contractor());
        assert_eq!(details.status, EscrowStatus::Active);
        assert_eq!(details.budget.to_ether_string(), "3");

        escrow
            .terminate_contract(&address.to_string(), &CallContext::new())
            .await
            .unwrap();
        let details = escrow.contract_details(&address.to_string()).await.unwrap();
        assert_eq!(details.status, EscrowStatus::Terminated);
        assert_eq!(details.balance, Amount(U256::ZERO));
    }

    #[tokio::test]
    async fn test_withdraw_uses_next_nonce() {
        let ledger = MockLedger::new();
        let escrow = orchestrator(&ledger);
        let address = deployed(&ledger, &escrow, "1").await;
        escrow
            .withdraw_funds(&address.to_string(), &CallContext::new())
            .await
            .unwrap();
        let nonces: Vec<_> = ledger.sent().iter().map(|r| r.nonce.unwrap()).collect();
        assert_eq!(nonces, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_check_transaction_status() {
        let ledger = MockLedger::new();
        let escrow = orchestrator(&ledger);
        let unknown = format!("0x{}", "ab".repeat(32));
        assert!(matches!(
            escrow.check_transaction_status(&unknown).await,
            Err(EscrowError::TransactionNotFound(_))
        ));
        assert!(matches!(
            escrow.check_transaction_status("0x1234").await,
            Err(EscrowError::ValidationFailed { .. })
        ));

        let address = deployed(&ledger, &escrow, "1").await;
        let receipt = escrow
            .release_funds(&address.to_string(), &CallContext::new())
            .await
            .unwrap();
        let status = escrow
            .check_transaction_status(&receipt.transaction_hash.to_string())
            .await
            .unwrap();
        assert_eq!(status, receipt);
    }

    #[tokio::test]
    async fn test_get_balance_invalid_address() {
        let ledger = MockLedger::new();
        let escrow = orchestrator(&ledger);
        assert!(matches!(
            escrow.get_balance("0x12").await,
            Err(EscrowError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_batch_deploys_and_funds() {
        let ledger = MockLedger::new();
        let escrow = orchestrator(&ledger);
        let mut plan = escrow.plan();
        let deploy = plan.push(escrow.escrow_deployment(CONTRACTOR).await.unwrap()).unwrap();
        plan.fund_deployment(deploy, U256::from(5_000)).unwrap();

        let outcomes = escrow.submit_batch(&plan, &CallContext::new()).await.unwrap();
        let created = outcomes[0].receipt().unwrap().contract_address.unwrap();
        assert_eq!(created, plan.predicted_address(0));
        assert_eq!(escrow.get_balance(&created.to_string()).await.unwrap(), Amount(U256::from(5_000)));
    }
}
