//! Error types surfaced by the orchestrator.
//!
//! [`EscrowError`] is what the calling layer sees. [`NodeError`] classifies failures
//! reported by the ledger node so the retry loop can tell transport trouble apart from
//! a call the node refused.

use alloy::hex;
use alloy::primitives::{Address, TxHash};

use crate::types::TransactionOutcome;

/// Why a [`EscrowError::ContractNotFound`] was raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissingContract {
    /// `eth_getCode` returned empty bytecode for the address.
    NoCode,
    /// The bound descriptor does not declare the method the caller intends to use.
    MissingMethod(String),
    /// The bound descriptor does not declare the event the caller wants to observe.
    MissingEvent(String),
}

impl std::fmt::Display for MissingContract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MissingContract::NoCode => write!(f, "no code deployed"),
            MissingContract::MissingMethod(method) => write!(f, "method `{method}` not present"),
            MissingContract::MissingEvent(event) => write!(f, "event `{event}` not present"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EscrowError {
    #[error("invalid address `{0}`")]
    InvalidAddress(String),
    #[error("contract type `{0}` is already registered with a different source")]
    UnknownType(String),
    #[error("no descriptor registered for contract type `{0}`")]
    DescriptorNotFound(String),
    #[error("failed to load descriptor for `{contract_type}`: {reason}")]
    DescriptorLoadError {
        contract_type: String,
        reason: String,
    },
    #[error("contract not found at {address}: {reason}")]
    ContractNotFound {
        address: Address,
        reason: MissingContract,
    },
    #[error("validation failed for `{parameter}`: {reason}")]
    ValidationFailed { parameter: String, reason: String },
    #[error("deployment failed: {cause}")]
    DeploymentFailed { cause: Box<EscrowError> },
    #[error("transaction `{method}` failed after {attempts} attempt(s): {last_error}")]
    TransactionFailed {
        method: String,
        last_error: String,
        attempts: u32,
    },
    #[error("batch stopped at step {failed_at} after {} confirmed call(s): {failure}", .completed.len())]
    BatchPartiallyFailed {
        completed: Vec<TransactionOutcome>,
        failed_at: usize,
        failure: TransactionOutcome,
    },
    #[error("no receipt for transaction {0}")]
    TransactionNotFound(TxHash),
    #[error("operation cancelled before submission")]
    Cancelled,
    #[error(transparent)]
    Node(#[from] NodeError),
}

impl EscrowError {
    /// Whether the retry loop may try again after this error.
    ///
    /// Only transport-level node failures qualify; everything else is either a caller
    /// mistake or a configuration problem.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EscrowError::Node(e) if e.is_retryable())
    }

    pub(crate) fn load(contract_type: &str, reason: impl std::fmt::Display) -> Self {
        EscrowError::DescriptorLoadError {
            contract_type: contract_type.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn invalid(parameter: &str, reason: impl Into<String>) -> Self {
        EscrowError::ValidationFailed {
            parameter: parameter.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failure reported while talking to the ledger node.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NodeError {
    /// Connection refused/reset, DNS failure or request timeout.
    #[error("{context}: connection error")]
    Transport { context: String, detail: String },
    #[error("{0}")]
    ResourceExhaustion(String),
    /// The node understood the request and refused it (revert, underpriced, nonce...).
    #[error("{reason}")]
    Rejected { reason: String },
    #[error("{0}")]
    Malformed(String),
}

impl NodeError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NodeError::Transport { .. } | NodeError::ResourceExhaustion(_)
        )
    }

    /// The node's own text for this failure, used for nonce/replacement matching.
    pub fn detail(&self) -> &str {
        match self {
            NodeError::Transport { detail, .. } => detail,
            NodeError::ResourceExhaustion(m) | NodeError::Malformed(m) => m,
            NodeError::Rejected { reason } => reason,
        }
    }

    pub fn is_nonce_too_low(&self) -> bool {
        let detail = self.detail();
        detail.contains("nonce too low") || detail.contains("already been used")
    }

    pub fn is_underpriced(&self) -> bool {
        let detail = self.detail();
        detail.contains("underpriced") || detail.contains("already known")
    }
}

/// Classify a node/transport error by inspecting its debug rendering.
///
/// Revert payloads are decoded first so the caller sees `Error(string)` text instead of
/// hex. Connection-level failures map to [`NodeError::Transport`], descriptor exhaustion
/// to [`NodeError::ResourceExhaustion`]; anything else is a rejection by the node.
pub fn categorize_node_error(e: impl std::fmt::Debug, context: &str) -> NodeError {
    let err_str = format!("{e:?}");

    if let Some(revert_reason) = extract_revert_reason(&err_str) {
        tracing::debug!(context, %revert_reason, "node reported revert");
        return NodeError::Rejected {
            reason: format!("execution reverted: {revert_reason}"),
        };
    }

    if err_str.contains("Connection refused")
        || err_str.contains("Connection reset")
        || err_str.contains("No route to host")
        || err_str.contains("timeout")
        || err_str.contains("Timeout")
        || err_str.contains("dns error")
    {
        tracing::debug!(context, error = %err_str, "node connection error");
        NodeError::Transport {
            context: context.to_string(),
            detail: err_str,
        }
    } else if err_str.contains("Too many open files") || err_str.contains("EMFILE") {
        NodeError::ResourceExhaustion(format!("{context}: connection pool exhausted"))
    } else {
        NodeError::Rejected {
            reason: rpc_message(&err_str).unwrap_or(err_str),
        }
    }
}

/// Pull the `message: "..."` field out of a JSON-RPC error payload.
fn rpc_message(err_str: &str) -> Option<String> {
    [("message: \"", "\""), (r#"message: \""#, r#"\""#)]
        .into_iter()
        .find_map(|(pattern, quote)| {
            let start = err_str.find(pattern)? + pattern.len();
            let end = err_str[start..].find(quote)?;
            Some(err_str[start..start + end].to_string())
        })
}

/// Parse the nonce the node expects from messages such as
/// `nonce too low: next nonce 1210, tx nonce 1209`.
pub fn parse_expected_nonce(msg: &str) -> Option<u64> {
    msg.find("next nonce ")
        .map(|i| &msg[i + 11..])
        .and_then(|s| s.split(|c: char| !c.is_ascii_digit()).next())
        .and_then(|n| n.parse().ok())
}

/// Decode ABI revert data.
///
/// Handles `Error(string)` (0x08c379a0) and `Panic(uint256)` (0x4e487b71); other
/// selectors are rendered as `UnknownError(0x........)`.
pub fn decode_revert_reason(data: &str) -> Option<String> {
    let bytes = hex::decode(data.strip_prefix("0x").unwrap_or(data)).ok()?;
    if bytes.len() < 4 {
        return None;
    }

    if bytes[..4] == [0x08, 0xc3, 0x79, 0xa0] && bytes.len() >= 68 {
        let len = bytes[36..68]
            .iter()
            .fold(0usize, |acc, &b| acc.saturating_mul(256).saturating_add(b as usize));
        if len <= 1024 && bytes.len() >= 68 + len {
            return String::from_utf8(bytes[68..68 + len].to_vec()).ok();
        }
    }

    if bytes[..4] == [0x4e, 0x48, 0x7b, 0x71] && bytes.len() >= 36 {
        return Some(format!("Panic(0x{:02x})", bytes[35]));
    }

    Some(format!("UnknownError(0x{})", hex::encode(&bytes[..4])))
}

/// Find `data: Some(RawValue("0x..."))` in an error rendering and decode it.
fn extract_revert_reason(err_str: &str) -> Option<String> {
    for (pattern, quote) in [
        ("data: Some(RawValue(\"", "\""),
        (r#"data: Some(RawValue(\""#, r#"\""#),
    ] {
        if let Some(idx) = err_str.find(pattern) {
            let start = idx + pattern.len();
            if let Some(end) = err_str[start..].find(quote) {
                if let Some(decoded) = decode_revert_reason(&err_str[start..start + end]) {
                    return Some(decoded);
                }
            }
        }
    }
    None
}
