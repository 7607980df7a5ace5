//! Bounded retries for one state-changing call.
//!
//! Every attempt re-quotes fees, submits, and waits a bounded time for a receipt. All
//! attempts of a call share one nonce: a retry is a fee-bumped replacement of the
//! previous broadcast, so at most one of them can be included. Before each retry the
//! receipts of earlier broadcasts are checked again and a late success is reported as
//! such instead of submitting anew.
//!
//! A nonce only changes when the ledger shows the old one consumed by something other
//! than a success of this call (a reverted attempt or a foreign transaction), and only
//! when the nonce was taken from the [`NonceSequencer`]. Pinned nonces (batches) never
//! change; a consumed pinned nonce ends the call.
//!
//! Sequencer nonces are reserved only once a fee quote is in hand, and the reservation
//! and the first broadcast on it happen inside the sender's turn. A nonce the node
//! refuses goes straight back to the sequencer, so a failing call never leaves a gap
//! that would strand concurrent calls from the same sender.

use alloy::primitives::{Address, TxHash};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::{EscrowError, NodeError, parse_expected_nonce};
use crate::fees::FeeEstimator;
use crate::node::{CallRequest, LedgerNode};
use crate::nonce::NonceSequencer;
use crate::types::{FeeQuote, PendingCall, Receipt, TransactionOutcome};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    /// Receipt wait per attempt.
    pub attempt_timeout: Duration,
    /// Ceiling across the whole loop.
    pub overall_timeout: Option<Duration>,
    pub poll_interval: Duration,
    /// Upper bound for a single backoff pause.
    pub max_delay: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: Duration::from_secs(config.retry_delay_seconds),
            backoff_multiplier: config.backoff_multiplier,
            attempt_timeout: Duration::from_secs(config.attempt_timeout_seconds),
            overall_timeout: config.overall_timeout_seconds.map(Duration::from_secs),
            poll_interval: Duration::from_millis(config.receipt_poll_interval_ms),
            max_delay: Duration::from_secs(config.max_retry_delay_seconds),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Pause before attempt `attempt` (1-based retries), never above `max_delay`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(self.retry_delay.as_secs_f64() * factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Caller-side controls for one call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }
}

/// Where the nonce for a call comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceAssignment {
    /// Taken from the sequencer on first submission.
    Sequencer,
    /// Fixed by the caller for the call's lifetime.
    Pinned(u64),
}

/// Final state of a call run through the orchestrator.
#[derive(Debug, Clone)]
pub struct Attempted {
    pub method: String,
    pub outcome: TransactionOutcome,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Every hash broadcast for this call, in submission order.
    pub submitted: Vec<TxHash>,
}

impl Attempted {
    pub fn into_receipt(self) -> Result<Receipt, EscrowError> {
        match self.outcome {
            TransactionOutcome::Confirmed { receipt } => Ok(receipt),
            outcome => Err(EscrowError::TransactionFailed {
                method: self.method,
                last_error: self.last_error.unwrap_or_else(|| outcome.to_string()),
                attempts: self.attempts,
            }),
        }
    }
}

fn signed_request(call: &PendingCall, nonce: u64, quote: &FeeQuote) -> CallRequest {
    CallRequest {
        nonce: Some(nonce),
        gas_limit: Some(quote.gas_limit),
        gas_price: Some(quote.gas_price),
        ..call.request()
    }
}

enum ReceiptWait {
    Receipt(Receipt),
    TimedOut,
    Interrupted,
}

/// Progress of one call across attempts.
#[derive(Default)]
struct CallState {
    nonce: Option<u64>,
    previous_price: Option<u128>,
    /// Broadcasts sharing the current nonce.
    in_flight: Vec<TxHash>,
    submitted: Vec<TxHash>,
    attempts: u32,
    last_error: Option<String>,
    last_timed_out: bool,
}

impl CallState {
    fn fail(&mut self, error: impl Into<String>, timed_out: bool) {
        self.last_error = Some(error.into());
        self.last_timed_out = timed_out;
    }
}

pub struct TransactionRetryOrchestrator {
    node: Arc<dyn LedgerNode>,
    fees: Arc<FeeEstimator>,
    nonces: Arc<NonceSequencer>,
    policy: RetryPolicy,
}

impl TransactionRetryOrchestrator {
    pub fn new(
        node: Arc<dyn LedgerNode>,
        fees: Arc<FeeEstimator>,
        nonces: Arc<NonceSequencer>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            node,
            fees,
            nonces,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `call` until it is confirmed, rejected for good, or the budget is spent.
    ///
    /// Returns `Err` only when the call was cancelled before any attempt started.
    #[tracing::instrument(skip_all, fields(method = %call.method, sender = %call.sender))]
    pub async fn execute(
        &self,
        call: &PendingCall,
        assignment: NonceAssignment,
        ctx: &CallContext,
    ) -> Result<Attempted, EscrowError> {
        let deadline = self.effective_deadline(ctx);
        let pinned = matches!(assignment, NonceAssignment::Pinned(_));
        let max_attempts = self.policy.max_retries.max(1);
        let mut state = CallState {
            nonce: match assignment {
                NonceAssignment::Pinned(nonce) => Some(nonce),
                NonceAssignment::Sequencer => None,
            },
            ..Default::default()
        };

        for attempt in 0..max_attempts {
            if attempt > 0 {
                if !self.pause(self.policy.delay_before(attempt), deadline, &ctx.cancel).await {
                    break;
                }
                if let Some(receipt) = self.reconcile(&state.in_flight).await {
                    if receipt.success {
                        return Ok(self.confirmed(call, receipt, state));
                    }
                    if let Some(done) = self.nonce_consumed(call, &mut state, pinned, &receipt) {
                        return Ok(done);
                    }
                }
            }
            if ctx.cancel.is_cancelled() || deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            state.attempts = attempt + 1;

            let quote = match self.fees.estimate(call, state.previous_price).await {
                Ok(quote) => quote,
                Err(e) => {
                    state.fail(e.to_string(), false);
                    self.log_failure(call, attempt, max_attempts, &e.to_string());
                    if e.is_retryable() {
                        continue;
                    }
                    // A revert during estimation repeats on every attempt.
                    tracing::warn!(method = %call.method, error = %e, "call cannot succeed, not retrying");
                    break;
                }
            };
            state.previous_price = Some(quote.gas_price);

            let (nonce, hash) = match state.nonce {
                Some(nonce) => match self.node.send_transaction(&signed_request(call, nonce, &quote)).await {
                    Ok(hash) => (nonce, hash),
                    Err(e) => {
                        state.fail(e.to_string(), false);
                        self.log_failure(call, attempt, max_attempts, &e.to_string());
                        if e.is_nonce_too_low() {
                            if let Some(receipt) = self.reconcile(&state.in_flight).await {
                                if receipt.success {
                                    return Ok(self.confirmed(call, receipt, state));
                                }
                            }
                            if pinned {
                                return Ok(self.finish(call, state, TransactionOutcome::Rejected {
                                    reason: format!("pinned nonce {nonce} already used: {e}"),
                                }));
                            }
                            let _turn = self.nonces.lock_sender(call.sender).await;
                            self.resync_nonce(call.sender, &e).await;
                            state.nonce = None;
                            state.in_flight.clear();
                        }
                        continue;
                    }
                },
                None => match self.send_on_fresh_nonce(call, &quote).await {
                    Ok((nonce, hash)) => {
                        state.nonce = Some(nonce);
                        (nonce, hash)
                    }
                    Err(e) => {
                        state.fail(e.to_string(), false);
                        self.log_failure(call, attempt, max_attempts, &e.to_string());
                        continue;
                    }
                },
            };
            state.in_flight.push(hash);
            state.submitted.push(hash);
            tracing::info!(
                attempt = attempt + 1,
                nonce,
                gas_limit = quote.gas_limit,
                gas_price = quote.gas_price,
                tx_hash = %hash,
                "transaction submitted"
            );

            match self.wait_for_receipt(&state.in_flight, deadline, &ctx.cancel).await {
                ReceiptWait::Receipt(receipt) if receipt.success => {
                    return Ok(self.confirmed(call, receipt, state));
                }
                ReceiptWait::Receipt(receipt) => {
                    self.log_failure(call, attempt, max_attempts, "transaction reverted");
                    if let Some(done) = self.nonce_consumed(call, &mut state, pinned, &receipt) {
                        return Ok(done);
                    }
                }
                ReceiptWait::TimedOut => {
                    let message = format!("no receipt for {hash} within {:?}", self.policy.attempt_timeout);
                    self.log_failure(call, attempt, max_attempts, &message);
                    state.fail(message, true);
                    if !pinned {
                        if let Some(expected) = self.gap_below(call, nonce).await {
                            state.fail(format!("nonce {nonce} is stuck behind a gap, node expects {expected}"), false);
                            break;
                        }
                    }
                }
                ReceiptWait::Interrupted => {
                    state.fail(format!("cancelled while waiting for receipt of {hash}"), true);
                    break;
                }
            }
        }

        if state.attempts == 0 {
            tracing::info!(method = %call.method, "call cancelled before first attempt");
            return Err(EscrowError::Cancelled);
        }

        // A broadcast may have landed while we were deciding to give up.
        if let Some(receipt) = self.reconcile(&state.in_flight).await {
            if receipt.success {
                return Ok(self.confirmed(call, receipt, state));
            }
            state.fail(format!("transaction {} reverted", receipt.transaction_hash), false);
        }

        if !pinned && state.nonce.is_some() {
            let _turn = self.nonces.lock_sender(call.sender).await;
            self.nonces.reset(call.sender).await;
        }

        let outcome = if state.last_timed_out {
            TransactionOutcome::TimedOut
        } else {
            TransactionOutcome::Rejected {
                reason: state.last_error.clone().unwrap_or_else(|| "unknown failure".to_string()),
            }
        };
        tracing::error!(
            method = %call.method,
            attempts = state.attempts,
            in_flight = state.in_flight.len(),
            last_error = state.last_error.as_deref().unwrap_or_default(),
            "transaction retries exhausted"
        );
        Ok(self.finish(call, state, outcome))
    }

    fn effective_deadline(&self, ctx: &CallContext) -> Option<Instant> {
        let ceiling = self.policy.overall_timeout.map(|t| Instant::now() + t);
        match (ctx.deadline, ceiling) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Sleep before a retry. `false` when cancelled or the deadline would pass first.
    async fn pause(&self, delay: Duration, deadline: Option<Instant>, cancel: &CancellationToken) -> bool {
        let wake = Instant::now() + delay;
        if deadline.is_some_and(|d| d <= wake) {
            return false;
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep_until(wake) => true,
        }
    }

    /// First receipt found for any earlier broadcast.
    async fn reconcile(&self, hashes: &[TxHash]) -> Option<Receipt> {
        for hash in hashes.iter().rev() {
            match self.node.transaction_receipt(*hash).await {
                Ok(Some(receipt)) => {
                    tracing::info!(tx_hash = %hash, success = receipt.success, "receipt found");
                    return Some(receipt);
                }
                Ok(None) => {}
                Err(e) => tracing::debug!(tx_hash = %hash, error = %e, "receipt lookup failed"),
            }
        }
        None
    }

    async fn wait_for_receipt(
        &self,
        hashes: &[TxHash],
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> ReceiptWait {
        let attempt_deadline = Instant::now() + self.policy.attempt_timeout;
        let until = deadline.map_or(attempt_deadline, |d| d.min(attempt_deadline));
        loop {
            if let Some(receipt) = self.reconcile(hashes).await {
                return ReceiptWait::Receipt(receipt);
            }
            let now = Instant::now();
            if now >= until {
                return ReceiptWait::TimedOut;
            }
            let nap = self.policy.poll_interval.min(until - now);
            tokio::select! {
                _ = cancel.cancelled() => return ReceiptWait::Interrupted,
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    /// A reverted receipt used up the current nonce.
    ///
    /// Pinned nonces cannot move, so the call ends as rejected. Sequencer nonces are
    /// dropped and the next attempt takes a fresh one.
    fn nonce_consumed(
        &self,
        call: &PendingCall,
        state: &mut CallState,
        pinned: bool,
        receipt: &Receipt,
    ) -> Option<Attempted> {
        let reason = format!("transaction {} reverted", receipt.transaction_hash);
        state.fail(reason.clone(), false);
        state.in_flight.clear();
        if pinned {
            return Some(self.finish(call, std::mem::take(state), TransactionOutcome::Rejected { reason }));
        }
        state.nonce = None;
        None
    }

    /// Reserve the sender's next nonce and broadcast on it within the sender's turn.
    ///
    /// A refused nonce never escapes: it is handed back, or the counter is re-anchored
    /// when the node says the slot is taken or might hold the transaction after all.
    async fn send_on_fresh_nonce(&self, call: &PendingCall, quote: &FeeQuote) -> Result<(u64, TxHash), EscrowError> {
        let _turn = self.nonces.lock_sender(call.sender).await;
        let nonce = self.nonces.next(call.sender).await?;
        match self.node.send_transaction(&signed_request(call, nonce, quote)).await {
            Ok(hash) => Ok((nonce, hash)),
            Err(e) => {
                if e.is_nonce_too_low() {
                    self.resync_nonce(call.sender, &e).await;
                } else if matches!(e, NodeError::Rejected { .. }) && !e.is_underpriced() {
                    self.nonces.release(call.sender, nonce).await;
                } else {
                    // Occupied in the pool, or a transport failure after the node took it.
                    self.nonces.reset(call.sender).await;
                }
                Err(e.into())
            }
        }
    }

    /// Caller must hold the sender's turn.
    async fn resync_nonce(&self, sender: Address, error: &NodeError) {
        match parse_expected_nonce(error.detail()) {
            Some(next) => self.nonces.set_next(sender, next).await,
            None => self.nonces.reset(sender).await,
        }
    }

    /// The node's executable count when it sits below `nonce`.
    ///
    /// A transaction behind such a gap cannot be mined however it is re-priced.
    async fn gap_below(&self, call: &PendingCall, nonce: u64) -> Option<u64> {
        match self.node.pending_transaction_count(call.sender).await {
            Ok(expected) if expected < nonce => {
                tracing::error!(
                    method = %call.method,
                    sender = %call.sender,
                    nonce,
                    expected,
                    "transaction is queued behind a nonce gap"
                );
                Some(expected)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(sender = %call.sender, error = %e, "pending count lookup failed");
                None
            }
        }
    }

    fn log_failure(&self, call: &PendingCall, attempt: u32, max_attempts: u32, error: &str) {
        if attempt + 1 < max_attempts {
            tracing::warn!(
                method = %call.method,
                attempt = attempt + 1,
                max_attempts,
                error,
                "transaction attempt failed, will retry"
            );
        } else {
            tracing::warn!(
                method = %call.method,
                attempt = attempt + 1,
                max_attempts,
                error,
                "final transaction attempt failed"
            );
        }
    }

    fn confirmed(&self, call: &PendingCall, receipt: Receipt, state: CallState) -> Attempted {
        tracing::info!(
            method = %call.method,
            tx_hash = %receipt.transaction_hash,
            attempts = state.attempts,
            gas_used = receipt.gas_used,
            block_number = receipt.block_number,
            "transaction confirmed"
        );
        self.finish(call, state, TransactionOutcome::Confirmed { receipt })
    }

    fn finish(&self, call: &PendingCall, state: CallState, outcome: TransactionOutcome) -> Attempted {
        Attempted {
            method: call.method.clone(),
            outcome,
            attempts: state.attempts,
            last_error: state.last_error,
            submitted: state.submitted,
        }
    }
}
