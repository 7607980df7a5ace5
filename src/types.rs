//! Value types shared across the orchestrator.

use alloy::dyn_abi::DynSolValue;
use alloy::primitives::utils::{format_ether, parse_ether};
use alloy::primitives::{Address, B256, Bytes, TxHash, U256};
use serde::Serialize;

use crate::contract::ContractHandle;
use crate::error::EscrowError;
use crate::node::CallRequest;

/// Parse a ledger address: `0x` followed by 40 hex digits.
///
/// All-lowercase and all-uppercase forms are accepted as-is; mixed case must carry a
/// valid EIP-55 checksum.
pub fn parse_address(input: &str) -> Result<Address, EscrowError> {
    let invalid = || EscrowError::InvalidAddress(input.to_string());
    let hex_part = input.strip_prefix("0x").ok_or_else(invalid)?;
    if hex_part.len() != 40 || !hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    let has_lower = hex_part.bytes().any(|b| b.is_ascii_lowercase());
    let has_upper = hex_part.bytes().any(|b| b.is_ascii_uppercase());
    if has_lower && has_upper {
        Address::parse_checksummed(input, None).map_err(|_| invalid())
    } else {
        input.parse::<Address>().map_err(|_| invalid())
    }
}

/// An amount in the ledger's smallest unit (wei), displayed in ether.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
#[serde(into = "String")]
pub struct Amount(pub U256);

impl Amount {
    /// Parse a display-unit amount such as `"2.5"`.
    pub fn from_ether(input: &str) -> Result<Self, EscrowError> {
        let trimmed = input.trim();
        if trimmed.starts_with('-') {
            return Err(EscrowError::invalid("budget", "must not be negative"));
        }
        parse_ether(trimmed)
            .map(Amount)
            .map_err(|e| EscrowError::invalid("budget", e.to_string()))
    }

    pub fn wei(&self) -> U256 {
        self.0
    }

    /// Display-unit rendering with trailing zeros removed (`2.5`, `0`, `1`).
    pub fn to_ether_string(&self) -> String {
        let formatted = format_ether(self.0);
        match formatted.split_once('.') {
            Some((whole, frac)) => {
                let frac = frac.trim_end_matches('0');
                if frac.is_empty() {
                    whole.to_string()
                } else {
                    format!("{whole}.{frac}")
                }
            }
            None => formatted,
        }
    }
}

impl From<Amount> for String {
    fn from(amount: Amount) -> Self {
        amount.to_ether_string()
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ETH", self.to_ether_string())
    }
}

/// Gas limit and gas price for one submission attempt, both in base units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeQuote {
    pub gas_limit: u64,
    pub gas_price: u128,
}

/// A log entry as reported by the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: Option<u64>,
    pub transaction_hash: Option<TxHash>,
}

/// The node's record of an included transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub transaction_hash: TxHash,
    pub success: bool,
    pub contract_address: Option<Address>,
    pub block_number: Option<u64>,
    pub gas_used: u64,
    pub effective_gas_price: u128,
    pub logs: Vec<EventLog>,
}

/// How a state-changing call ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransactionOutcome {
    Confirmed { receipt: Receipt },
    Rejected { reason: String },
    /// No receipt was observed in time. The transaction may still land later.
    TimedOut,
}

impl TransactionOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, TransactionOutcome::Confirmed { .. })
    }

    pub fn receipt(&self) -> Option<&Receipt> {
        match self {
            TransactionOutcome::Confirmed { receipt } => Some(receipt),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransactionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionOutcome::Confirmed { receipt } => {
                write!(f, "confirmed in {}", receipt.transaction_hash)
            }
            TransactionOutcome::Rejected { reason } => write!(f, "rejected: {reason}"),
            TransactionOutcome::TimedOut => write!(f, "timed out waiting for receipt"),
        }
    }
}

/// One logical state-changing call, consumed by the retry orchestrator.
#[derive(Debug, Clone)]
pub struct PendingCall {
    /// Handle the call targets; `None` for deployments and plain transfers.
    pub handle: Option<ContractHandle>,
    /// Destination; `None` creates a contract.
    pub to: Option<Address>,
    pub method: String,
    pub args: Vec<DynSolValue>,
    pub input: Bytes,
    pub sender: Address,
    pub value: U256,
    pub gas_limit: Option<u64>,
    pub gas_price: Option<u128>,
}

impl PendingCall {
    /// A plain value transfer with no calldata.
    pub fn transfer(sender: Address, to: Address, value: U256) -> Self {
        Self {
            handle: None,
            to: Some(to),
            method: "transfer".to_string(),
            args: Vec::new(),
            input: Bytes::new(),
            sender,
            value,
            gas_limit: None,
            gas_price: None,
        }
    }

    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = Some(gas_limit);
        self
    }

    pub fn with_gas_price(mut self, gas_price: u128) -> Self {
        self.gas_price = Some(gas_price);
        self
    }

    /// Request used for simulation and submission, without fee or nonce fields.
    pub fn request(&self) -> CallRequest {
        CallRequest {
            from: Some(self.sender),
            to: self.to,
            input: self.input.clone(),
            value: self.value,
            gas_limit: None,
            gas_price: None,
            nonce: None,
        }
    }
}
