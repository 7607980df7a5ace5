//! Pre-flight checks for handles and caller-supplied parameters.
//!
//! A handle is validated once per address per process. The cache is never invalidated,
//! so code removed from an address after its first successful validation goes unnoticed
//! until restart.

use alloy::primitives::{Address, U256};
use dashmap::DashSet;

use crate::contract::ContractHandle;
use crate::error::{EscrowError, MissingContract};
use crate::types::parse_address;

/// Expected shape of one named parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Address,
    /// Non-negative integer, given as a JSON number or a decimal string.
    Uint,
    Bool,
}

#[derive(Debug, Default)]
pub struct ContractStateValidator {
    validated: DashSet<Address>,
}

impl ContractStateValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Confirm `handle` points at deployed code and its descriptor declares `methods`.
    ///
    /// The code lookup happens only the first time an address passes both checks. The
    /// method check is static and runs on every call, after the code check.
    pub async fn validate(&self, handle: &ContractHandle, methods: &[&str]) -> Result<(), EscrowError> {
        let address = handle.bound_address()?;
        let code = if self.validated.contains(&address) {
            tracing::debug!(%address, "contract already validated");
            None
        } else {
            let code = handle.node().code(address).await?;
            if code.is_empty() {
                tracing::warn!(%address, "no code at contract address");
                return Err(EscrowError::ContractNotFound {
                    address,
                    reason: MissingContract::NoCode,
                });
            }
            Some(code)
        };

        if let Some(missing) = methods.iter().find(|m| !handle.descriptor().has_method(m)) {
            return Err(EscrowError::ContractNotFound {
                address,
                reason: MissingContract::MissingMethod(missing.to_string()),
            });
        }
        let Some(code) = code else {
            return Ok(());
        };
        self.validated.insert(address);
        tracing::info!(%address, code_size = code.len(), "contract validated");
        Ok(())
    }

    pub fn is_validated(&self, address: &Address) -> bool {
        self.validated.contains(address)
    }
}

/// Check `params` against `schema`, failing on the first offending entry in schema
/// order. Performs no I/O.
pub fn validate_parameters(
    params: &serde_json::Map<String, serde_json::Value>,
    schema: &[(&str, ParamKind)],
) -> Result<(), EscrowError> {
    for (name, kind) in schema {
        let value = params
            .get(*name)
            .ok_or_else(|| EscrowError::invalid(name, "missing required parameter"))?;
        match kind {
            ParamKind::Address => {
                let text = value
                    .as_str()
                    .ok_or_else(|| EscrowError::invalid(name, "expected an address string"))?;
                parse_address(text).map_err(|_| EscrowError::invalid(name, "invalid address format"))?;
            }
            ParamKind::Uint => {
                let valid = match value {
                    serde_json::Value::Number(n) => n.is_u64(),
                    serde_json::Value::String(s) => {
                        !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) && s.parse::<U256>().is_ok()
                    }
                    _ => false,
                };
                if !valid {
                    return Err(EscrowError::invalid(name, "expected a non-negative integer"));
                }
            }
            ParamKind::Bool => {
                if !value.is_boolean() {
                    return Err(EscrowError::invalid(name, "expected a boolean"));
                }
            }
        }
    }
    Ok(())
}
