//! Ordered groups of calls from one sender.
//!
//! A plan runs step by step with consecutive nonces and stops at the first step that is
//! not confirmed. Confirmed steps stay on the ledger; there is no rollback.

use alloy::primitives::{Address, U256};
use std::sync::Arc;

use crate::error::EscrowError;
use crate::nonce::NonceSequencer;
use crate::retry::{CallContext, NonceAssignment, TransactionRetryOrchestrator};
use crate::types::{PendingCall, TransactionOutcome};

#[derive(Debug, Clone)]
pub enum BatchStep {
    Call(PendingCall),
    /// Send `value` to the contract created by an earlier step of the same plan.
    FundDeployment { deployment_step: usize, value: U256 },
}

#[derive(Debug, Clone)]
pub struct BatchPlan {
    sender: Address,
    steps: Vec<BatchStep>,
}

impl BatchPlan {
    pub fn new(sender: Address) -> Self {
        Self {
            sender,
            steps: Vec::new(),
        }
    }

    pub fn sender(&self) -> Address {
        self.sender
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[BatchStep] {
        &self.steps
    }

    /// Address a contract creation sent by this plan's sender with `nonce` will get.
    pub fn predicted_address(&self, nonce: u64) -> Address {
        self.sender.create(nonce)
    }

    /// Append a call. Its sender must match the plan's. Returns the step index.
    pub fn push(&mut self, call: PendingCall) -> Result<usize, EscrowError> {
        if call.sender != self.sender {
            return Err(EscrowError::invalid(
                "sender",
                format!("plan sender is {}, call `{}` is sent by {}", self.sender, call.method, call.sender),
            ));
        }
        self.steps.push(BatchStep::Call(call));
        Ok(self.steps.len() - 1)
    }

    /// Append a value transfer to the contract created at `deployment_step`.
    pub fn fund_deployment(&mut self, deployment_step: usize, value: U256) -> Result<usize, EscrowError> {
        match self.steps.get(deployment_step) {
            Some(BatchStep::Call(call)) if call.to.is_none() => {
                self.steps.push(BatchStep::FundDeployment { deployment_step, value });
                Ok(self.steps.len() - 1)
            }
            _ => Err(EscrowError::invalid(
                "deployment_step",
                format!("step {deployment_step} is not an earlier contract creation"),
            )),
        }
    }
}

pub struct BatchExecutor {
    retry: Arc<TransactionRetryOrchestrator>,
    nonces: Arc<NonceSequencer>,
}

impl BatchExecutor {
    pub fn new(retry: Arc<TransactionRetryOrchestrator>, nonces: Arc<NonceSequencer>) -> Self {
        Self { retry, nonces }
    }

    /// Run `plan` in order. Every outcome is confirmed on success.
    ///
    /// The sender's turn is held for the whole plan, so single calls from the same
    /// sender queue behind it and the plan's nonces stay consecutive.
    #[tracing::instrument(skip_all, fields(sender = %plan.sender, steps = plan.len()))]
    pub async fn execute(&self, plan: &BatchPlan, ctx: &CallContext) -> Result<Vec<TransactionOutcome>, EscrowError> {
        let _turn = self.nonces.lock_sender(plan.sender).await;
        let mut completed: Vec<TransactionOutcome> = Vec::with_capacity(plan.len());

        for (index, step) in plan.steps.iter().enumerate() {
            let call = match step {
                BatchStep::Call(call) => call.clone(),
                BatchStep::FundDeployment { deployment_step, value } => {
                    let created = completed
                        .get(*deployment_step)
                        .and_then(TransactionOutcome::receipt)
                        .and_then(|receipt| receipt.contract_address);
                    match created {
                        Some(address) => PendingCall::transfer(plan.sender, address, *value),
                        None => {
                            let failure = TransactionOutcome::Rejected {
                                reason: format!("step {deployment_step} created no contract"),
                            };
                            return Err(self.stop(plan, completed, index, failure).await);
                        }
                    }
                }
            };

            let nonce = match self.nonces.next(plan.sender).await {
                Ok(nonce) => nonce,
                Err(e) => {
                    let failure = TransactionOutcome::Rejected { reason: e.to_string() };
                    return Err(self.stop(plan, completed, index, failure).await);
                }
            };
            tracing::debug!(step = index, method = %call.method, nonce, "running batch step");

            let outcome = match self.retry.execute(&call, NonceAssignment::Pinned(nonce), ctx).await {
                Ok(attempted) => attempted.outcome,
                Err(EscrowError::Cancelled) => TransactionOutcome::Rejected {
                    reason: EscrowError::Cancelled.to_string(),
                },
                Err(e) => return Err(e),
            };
            if !outcome.is_confirmed() {
                return Err(self.stop(plan, completed, index, outcome).await);
            }
            completed.push(outcome);
        }

        tracing::info!(sender = %plan.sender, steps = completed.len(), "batch completed");
        Ok(completed)
    }

    async fn stop(
        &self,
        plan: &BatchPlan,
        completed: Vec<TransactionOutcome>,
        failed_at: usize,
        failure: TransactionOutcome,
    ) -> EscrowError {
        // Later steps never used their nonces; let the node decide the next one.
        self.nonces.reset(plan.sender).await;
        tracing::error!(
            sender = %plan.sender,
            failed_at,
            confirmed = completed.len(),
            failure = %failure,
            "batch stopped"
        );
        EscrowError::BatchPartiallyFailed {
            completed,
            failed_at,
            failure,
        }
    }
}
