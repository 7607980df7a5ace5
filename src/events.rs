//! Push-style listeners on contract events.
//!
//! Each subscription runs as its own task reading the node's log stream. Decode and
//! transport errors are logged and the listener keeps going; a stream that ends is not
//! reopened, the caller subscribes again.

use alloy::dyn_abi::{DynSolValue, EventExt};
use alloy::json_abi::Event;
use alloy::primitives::{Address, LogData, TxHash};
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

use crate::contract::ContractHandle;
use crate::error::{EscrowError, MissingContract};
use crate::types::EventLog;

/// An observed event with its fields decoded against the descriptor, in declaration
/// order.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub contract: Address,
    pub event: String,
    pub fields: Vec<(String, DynSolValue)>,
    pub block_number: Option<u64>,
    pub transaction_hash: Option<TxHash>,
}

impl DecodedEvent {
    pub fn field(&self, name: &str) -> Option<&DynSolValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type Callback = Arc<dyn Fn(DecodedEvent) + Send + Sync>;

#[derive(Debug, Default)]
pub struct EventSubscriber {
    next_id: AtomicU64,
    active: Arc<DashMap<SubscriptionId, CancellationToken>>,
}

impl EventSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoke `callback` for every `event_name` emitted by `handle`'s contract, starting
    /// at `from_block` or the current head.
    pub async fn subscribe<F>(
        &self,
        handle: &ContractHandle,
        event_name: &str,
        from_block: Option<u64>,
        callback: F,
    ) -> Result<SubscriptionId, EscrowError>
    where
        F: Fn(DecodedEvent) + Send + Sync + 'static,
    {
        self.start(handle, event_name, from_block, Arc::new(callback), false)
            .await
    }

    /// Like [`EventSubscriber::subscribe`], removed after the first delivered event.
    pub async fn subscribe_once<F>(
        &self,
        handle: &ContractHandle,
        event_name: &str,
        from_block: Option<u64>,
        callback: F,
    ) -> Result<SubscriptionId, EscrowError>
    where
        F: Fn(DecodedEvent) + Send + Sync + 'static,
    {
        self.start(handle, event_name, from_block, Arc::new(callback), true)
            .await
    }

    /// Stop a subscription. `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.active.remove(&id) {
            Some((_, token)) => {
                token.cancel();
                tracing::debug!(subscription = %id, "unsubscribed");
                true
            }
            None => false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: SubscriptionId) -> bool {
        self.active.contains_key(&id)
    }

    async fn start(
        &self,
        handle: &ContractHandle,
        event_name: &str,
        from_block: Option<u64>,
        callback: Callback,
        once: bool,
    ) -> Result<SubscriptionId, EscrowError> {
        let contract = handle.bound_address()?;
        let event = handle
            .descriptor()
            .event(event_name)
            .cloned()
            .ok_or_else(|| EscrowError::ContractNotFound {
                address: contract,
                reason: MissingContract::MissingEvent(event_name.to_string()),
            })?;
        let mut stream = handle
            .node()
            .subscribe_logs(contract, event.selector(), from_block)
            .await?;

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let token = CancellationToken::new();
        self.active.insert(id, token.clone());
        tracing::info!(subscription = %id, %contract, event = %event.name, ?from_block, once, "subscribed to event");

        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = stream.next() => match next {
                        Some(Ok(log)) => match decode_event(&event, &log) {
                            Ok(decoded) => {
                                tracing::debug!(subscription = %id, event = %event.name, block_number = ?decoded.block_number, "event observed");
                                callback(decoded);
                                if once {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(subscription = %id, event = %event.name, error = %e, "failed to decode event");
                            }
                        },
                        Some(Err(e)) => {
                            tracing::warn!(subscription = %id, event = %event.name, error = %e, "event stream error");
                        }
                        None => {
                            tracing::warn!(subscription = %id, event = %event.name, "event stream closed, subscribe again to resume");
                            break;
                        }
                    },
                }
            }
            active.remove(&id);
        });
        Ok(id)
    }
}

/// Decode `log` against `event`, merging indexed topics and body values back into the
/// declared parameter order.
pub fn decode_event(event: &Event, log: &EventLog) -> Result<DecodedEvent, EscrowError> {
    let data = LogData::new_unchecked(log.topics.clone(), log.data.clone());
    let decoded = event
        .decode_log(&data)
        .map_err(|e| EscrowError::invalid(&event.name, e.to_string()))?;

    let mut indexed = decoded.indexed.into_iter();
    let mut body = decoded.body.into_iter();
    let mut fields = Vec::with_capacity(event.inputs.len());
    for (position, input) in event.inputs.iter().enumerate() {
        let value = if input.indexed { indexed.next() } else { body.next() };
        let value = value.ok_or_else(|| EscrowError::invalid(&event.name, "log has fewer values than declared"))?;
        let name = if input.name.is_empty() {
            position.to_string()
        } else {
            input.name.clone()
        };
        fields.push((name, value));
    }

    Ok(DecodedEvent {
        contract: log.address,
        event: event.name.clone(),
        fields,
        block_number: log.block_number,
        transaction_hash: log.transaction_hash,
    })
}
