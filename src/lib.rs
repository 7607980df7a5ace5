//! Escrow contract orchestration against an EVM ledger node.
//!
//! The [`EscrowOrchestrator`] facade deploys escrow contracts, releases, withdraws or
//! terminates them through a bounded retry loop, runs ordered batches with
//! consecutive nonces, and delivers contract events to subscribers. Everything that
//! touches the ledger goes through the [`node::LedgerNode`] trait.

pub mod batch;
pub mod config;
pub mod contract;
pub mod error;
pub mod escrow;
pub mod events;
pub mod fees;
pub mod node;
pub mod nonce;
pub mod retry;
pub mod sig_down;
pub mod telemetry;
pub mod types;
pub mod validator;

#[cfg(test)]
mod testing;

pub use config::EscrowConfig;
pub use error::{EscrowError, NodeError};
pub use escrow::{EscrowDetails, EscrowOrchestrator, EscrowStatus};
pub use retry::{CallContext, RetryPolicy};
pub use types::{Amount, Receipt, TransactionOutcome};
