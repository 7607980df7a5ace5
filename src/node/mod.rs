//! The ledger node boundary.
//!
//! Every network interaction of the orchestrator goes through [`LedgerNode`]. The
//! production implementation is [`AlloyNode`]; tests drive the same code paths against
//! an in-memory ledger.

mod rpc;

use alloy::primitives::{Address, B256, Bytes, TxHash, U256};
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::NodeError;
use crate::types::{EventLog, Receipt};

pub use rpc::AlloyNode;

/// A call or transaction as sent to the node.
///
/// Unset fee and nonce fields are left for the node to decide.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallRequest {
    pub from: Option<Address>,
    /// `None` creates a contract from `input`.
    pub to: Option<Address>,
    pub input: Bytes,
    pub value: U256,
    pub gas_limit: Option<u64>,
    pub gas_price: Option<u128>,
    pub nonce: Option<u64>,
}

pub type LogStream = BoxStream<'static, Result<EventLog, NodeError>>;

#[async_trait]
pub trait LedgerNode: Send + Sync {
    /// Human-readable endpoint, for logs.
    fn endpoint(&self) -> String;

    /// Simulated-execution gas estimate.
    async fn estimate_gas(&self, request: &CallRequest) -> Result<u64, NodeError>;

    async fn gas_price(&self) -> Result<u128, NodeError>;

    /// Transaction count including the node's pending pool.
    async fn pending_transaction_count(&self, address: Address) -> Result<u64, NodeError>;

    /// Broadcast a transaction and return its hash without waiting for inclusion.
    async fn send_transaction(&self, request: &CallRequest) -> Result<TxHash, NodeError>;

    /// `Ok(None)` when the node knows no receipt for `hash` yet.
    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<Receipt>, NodeError>;

    async fn balance(&self, address: Address) -> Result<U256, NodeError>;

    async fn code(&self, address: Address) -> Result<Bytes, NodeError>;

    /// Read-only call against the latest state.
    async fn call(&self, request: &CallRequest) -> Result<Bytes, NodeError>;

    /// Logs emitted by `address` with first topic `topic0`, starting at `from_block`
    /// (or the current head when `None`), in the order the node reports them.
    async fn subscribe_logs(
        &self,
        address: Address,
        topic0: B256,
        from_block: Option<u64>,
    ) -> Result<LogStream, NodeError>;
}
