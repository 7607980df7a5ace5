use alloy::dyn_abi::DynSolValue;
use alloy::primitives::{Address, U256};
use std::sync::Arc;

use super::ContractDescriptor;
use crate::error::EscrowError;
use crate::node::{CallRequest, LedgerNode};
use crate::types::PendingCall;

/// A contract descriptor bound to a node and, once known, a deployed address.
///
/// The address is fixed at construction. Pointing at another address means building
/// another handle.
#[derive(Clone)]
pub struct ContractHandle {
    descriptor: Arc<ContractDescriptor>,
    node: Arc<dyn LedgerNode>,
    address: Option<Address>,
}

impl std::fmt::Debug for ContractHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractHandle")
            .field("type", &self.descriptor.type_name())
            .field("endpoint", &self.node.endpoint())
            .field("address", &self.address)
            .finish()
    }
}

impl ContractHandle {
    pub(crate) fn unbound(descriptor: Arc<ContractDescriptor>, node: Arc<dyn LedgerNode>) -> Self {
        Self {
            descriptor,
            node,
            address: None,
        }
    }

    pub(crate) fn bound(descriptor: Arc<ContractDescriptor>, node: Arc<dyn LedgerNode>, address: Address) -> Self {
        Self {
            descriptor,
            node,
            address: Some(address),
        }
    }

    pub fn descriptor(&self) -> &Arc<ContractDescriptor> {
        &self.descriptor
    }

    pub fn node(&self) -> &Arc<dyn LedgerNode> {
        &self.node
    }

    pub fn address(&self) -> Option<Address> {
        self.address
    }

    pub fn bound_address(&self) -> Result<Address, EscrowError> {
        self.address.ok_or_else(|| {
            EscrowError::invalid("address", format!("{} handle is not bound to a deployed contract", self.descriptor.type_name()))
        })
    }

    /// Build a state-changing call of `method` sent by `sender`.
    pub fn call(&self, method: &str, args: Vec<DynSolValue>, sender: Address) -> Result<PendingCall, EscrowError> {
        let to = self.bound_address()?;
        let input = self.descriptor.encode_call(method, &args)?;
        Ok(PendingCall {
            handle: Some(self.clone()),
            to: Some(to),
            method: method.to_string(),
            args,
            input,
            sender,
            value: U256::ZERO,
            gas_limit: None,
            gas_price: None,
        })
    }

    /// Contract creation call for this handle's descriptor.
    pub(crate) fn deployment(&self, args: Vec<DynSolValue>, sender: Address, value: U256) -> Result<PendingCall, EscrowError> {
        let input = self.descriptor.encode_deployment(&args)?;
        Ok(PendingCall {
            handle: Some(self.clone()),
            to: None,
            method: "constructor".to_string(),
            args,
            input,
            sender,
            value,
            gas_limit: None,
            gas_price: None,
        })
    }

    /// Read-only call, decoded against the descriptor.
    pub async fn read(&self, method: &str, args: &[DynSolValue]) -> Result<Vec<DynSolValue>, EscrowError> {
        let to = self.bound_address()?;
        let request = CallRequest {
            to: Some(to),
            input: self.descriptor.encode_call(method, args)?,
            ..Default::default()
        };
        let output = self.node.call(&request).await?;
        self.descriptor.decode_output(method, &output)
    }
}
