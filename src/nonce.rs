//! Per-sender transaction sequence numbers.
//!
//! # Thread Safety
//!
//! The cache is shared across clones through `Arc<DashMap>`. Each sender's counter sits
//! behind its own `Mutex`, so concurrent callers for one sender serialize on that lock
//! and never see the same value, while different senders proceed independently.

use alloy::primitives::Address;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::EscrowError;
use crate::node::LedgerNode;

/// Marks a sender whose next nonce must be fetched from the node.
const UNSET: u64 = u64::MAX;

#[derive(Clone)]
pub struct NonceSequencer {
    node: Arc<dyn LedgerNode>,
    /// Next nonce to hand out per sender.
    nonces: Arc<DashMap<Address, Arc<Mutex<u64>>>>,
    /// Held by a batch for the length of its plan.
    sender_locks: Arc<DashMap<Address, Arc<Mutex<()>>>>,
}

impl NonceSequencer {
    pub fn new(node: Arc<dyn LedgerNode>) -> Self {
        Self {
            node,
            nonces: Arc::new(DashMap::new()),
            sender_locks: Arc::new(DashMap::new()),
        }
    }

    fn counter(&self, address: Address) -> Arc<Mutex<u64>> {
        // Clone the Arc out so the map shard is not held across an await.
        let entry = self
            .nonces
            .entry(address)
            .or_insert_with(|| Arc::new(Mutex::new(UNSET)));
        Arc::clone(entry.value())
    }

    /// Issue the next nonce for `address`.
    ///
    /// The first call for a sender asks the node for its pending-inclusive transaction
    /// count; later calls increment the cached value without a network round trip.
    pub async fn next(&self, address: Address) -> Result<u64, EscrowError> {
        let counter = self.counter(address);
        let mut next = counter.lock().await;
        let issued = if *next == UNSET {
            tracing::info!(%address, "initializing nonce for new address");
            let fetched = self.node.pending_transaction_count(address).await?;
            tracing::info!(%address, nonce = fetched, "nonce fetched from node");
            fetched
        } else {
            *next
        };
        *next = issued + 1;
        tracing::debug!(%address, allocated_nonce = issued, "nonce allocated");
        Ok(issued)
    }

    /// Forget the cached value so the next call re-queries the node.
    ///
    /// Used after a failure leaves the sender's on-chain state uncertain, or after an
    /// external transaction from the same account.
    pub async fn reset(&self, address: Address) {
        if let Some(counter) = self.nonces.get(&address).map(|c| Arc::clone(c.value())) {
            *counter.lock().await = UNSET;
            tracing::debug!(%address, "reset nonce cache, will requery on next use");
        }
    }

    /// Set the next nonce directly, typically from a node hint like
    /// `nonce too low: next nonce N`.
    pub async fn set_next(&self, address: Address, nonce: u64) {
        let counter = self.counter(address);
        *counter.lock().await = nonce;
        tracing::info!(%address, nonce, "nonce cache set from node hint");
    }

    /// Hand `nonce` back when it is still the latest one issued for `address`.
    ///
    /// Only sound while holding the sender's turn, so nothing was issued after it.
    pub async fn release(&self, address: Address, nonce: u64) {
        let counter = self.counter(address);
        let mut next = counter.lock().await;
        if nonce.checked_add(1) == Some(*next) {
            *next = nonce;
            tracing::debug!(%address, nonce, "unused nonce returned");
        }
    }

    /// Exclusive turn for `address`.
    ///
    /// A batch holds this guard for its whole plan so its nonces stay consecutive.
    /// Single calls take it around reserving a nonce and broadcasting on it, and around
    /// every reset or resync of the counter, so they queue behind a running batch from
    /// the same sender and never move its counter mid-plan.
    pub async fn lock_sender(&self, address: Address) -> OwnedMutexGuard<()> {
        let lock = {
            let entry = self
                .sender_locks
                .entry(address)
                .or_insert_with(|| Arc::new(Mutex::new(())));
            Arc::clone(entry.value())
        };
        tracing::debug!(%address, "acquiring sender lock");
        lock.lock_owned().await
    }
}
