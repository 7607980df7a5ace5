use alloy::dyn_abi::DynSolValue;
use alloy::primitives::{Address, U256};
use std::sync::Arc;

use super::{ContractDescriptorRegistry, ContractHandle};
use crate::error::{EscrowError, MissingContract};
use crate::node::LedgerNode;
use crate::retry::{CallContext, NonceAssignment, TransactionRetryOrchestrator};
use crate::types::PendingCall;

/// Builds handles for registered contract types, either by deploying new instances or
/// by binding existing addresses.
pub struct ContractFactory {
    registry: Arc<ContractDescriptorRegistry>,
    node: Arc<dyn LedgerNode>,
    retry: Arc<TransactionRetryOrchestrator>,
}

impl ContractFactory {
    pub fn new(
        registry: Arc<ContractDescriptorRegistry>,
        node: Arc<dyn LedgerNode>,
        retry: Arc<TransactionRetryOrchestrator>,
    ) -> Self {
        Self { registry, node, retry }
    }

    pub fn registry(&self) -> &Arc<ContractDescriptorRegistry> {
        &self.registry
    }

    /// Bind `address` to the `contract_type` descriptor. No network call is made; the
    /// handle must be validated before its first state-changing use.
    pub async fn at(&self, contract_type: &str, address: Address) -> Result<ContractHandle, EscrowError> {
        let descriptor = self.registry.resolve(contract_type).await?;
        Ok(ContractHandle::bound(descriptor, Arc::clone(&self.node), address))
    }

    /// Creation call for `contract_type`, ready for a batch or the retry orchestrator.
    pub async fn deployment(
        &self,
        contract_type: &str,
        sender: Address,
        constructor_args: Vec<DynSolValue>,
        value: U256,
    ) -> Result<PendingCall, EscrowError> {
        let descriptor = self.registry.resolve(contract_type).await?;
        ContractHandle::unbound(descriptor, Arc::clone(&self.node)).deployment(constructor_args, sender, value)
    }

    /// Deploy a new `contract_type` instance and bind its address.
    ///
    /// Every failure is reported as [`EscrowError::DeploymentFailed`] wrapping the cause.
    #[tracing::instrument(skip(self, constructor_args, ctx), fields(%sender, %value))]
    pub async fn deploy(
        &self,
        contract_type: &str,
        sender: Address,
        constructor_args: Vec<DynSolValue>,
        value: U256,
        ctx: &CallContext,
    ) -> Result<ContractHandle, EscrowError> {
        self.try_deploy(contract_type, sender, constructor_args, value, ctx)
            .await
            .map_err(|cause| {
                tracing::error!(contract_type, error = %cause, "deployment failed");
                EscrowError::DeploymentFailed { cause: Box::new(cause) }
            })
    }

    async fn try_deploy(
        &self,
        contract_type: &str,
        sender: Address,
        constructor_args: Vec<DynSolValue>,
        value: U256,
        ctx: &CallContext,
    ) -> Result<ContractHandle, EscrowError> {
        let descriptor = self.registry.resolve(contract_type).await?;
        let call = ContractHandle::unbound(Arc::clone(&descriptor), Arc::clone(&self.node))
            .deployment(constructor_args, sender, value)?;
        let receipt = self
            .retry
            .execute(&call, NonceAssignment::Sequencer, ctx)
            .await?
            .into_receipt()?;

        let address = receipt.contract_address.ok_or_else(|| {
            EscrowError::invalid(
                "receipt",
                format!("{} has no contract address", receipt.transaction_hash),
            )
        })?;
        let code = self.node.code(address).await?;
        if code.is_empty() {
            return Err(EscrowError::ContractNotFound {
                address,
                reason: MissingContract::NoCode,
            });
        }
        tracing::info!(
            contract_type,
            %address,
            tx_hash = %receipt.transaction_hash,
            "contract deployed"
        );
        Ok(ContractHandle::bound(descriptor, Arc::clone(&self.node), address))
    }
}
