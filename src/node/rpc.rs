use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, B256, Bytes, TxHash, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::client::RpcClient;
use alloy::rpc::types::{Filter, Log, TransactionReceipt, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use futures::StreamExt;
use std::future::IntoFuture;
use std::time::Duration;
use tracing::Instrument;

use super::{CallRequest, LedgerNode, LogStream};
use crate::config::NodeConfig;
use crate::error::{NodeError, categorize_node_error};
use crate::types::{EventLog, Receipt};

/// [`LedgerNode`] backed by an alloy HTTP provider.
///
/// With a local signer the provider signs and sends raw transactions; without one,
/// `eth_sendTransaction` is used and the node's own account management signs.
pub struct AlloyNode {
    provider: DynProvider,
    endpoint: url::Url,
    log_poll_interval: Duration,
}

impl AlloyNode {
    pub fn try_new(
        config: &NodeConfig,
        signer: Option<PrivateKeySigner>,
        log_poll_interval: Duration,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let endpoint: url::Url = config.rpc_url.parse()?;

        tracing::debug!(
            rpc_timeout_secs = config.rpc_request_timeout_seconds,
            connection_timeout_secs = config.connection_timeout_seconds,
            pool_max_idle = config.pool_max_idle_per_host,
            pool_idle_timeout_secs = config.pool_idle_timeout_seconds,
            "configuring node HTTP client"
        );

        let http_client = alloy::transports::http::reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .timeout(config.rpc_timeout())
            .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_seconds))
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()
            .map_err(|e| format!("failed to build HTTP client for {endpoint}: {e}"))?;
        let transport = alloy::transports::http::Http::with_client(http_client, endpoint.clone());

        let mut client = RpcClient::new(transport, false);
        if let Some(poll_ms) = config.poll_interval_ms {
            tracing::info!(poll_interval_ms = poll_ms, "overriding receipt poll interval");
            client = client.with_poll_interval(Duration::from_millis(poll_ms));
        }

        let provider = match signer {
            Some(signer) => {
                tracing::info!(signer = %signer.address(), "using local signer");
                ProviderBuilder::new()
                    .wallet(EthereumWallet::from(signer))
                    .connect_client(client)
                    .erased()
            }
            None => ProviderBuilder::new().connect_client(client).erased(),
        };

        tracing::info!(rpc = %endpoint, "initialized ledger node provider");
        Ok(Self {
            provider,
            endpoint,
            log_poll_interval,
        })
    }
}

fn to_transaction_request(request: &CallRequest) -> TransactionRequest {
    let mut tx = TransactionRequest::default().with_value(request.value);
    tx = match request.to {
        Some(to) => tx.with_to(to).with_input(request.input.clone()),
        None => tx.with_deploy_code(request.input.clone()),
    };
    if let Some(from) = request.from {
        tx = tx.with_from(from);
    }
    if let Some(gas_limit) = request.gas_limit {
        tx = tx.with_gas_limit(gas_limit);
    }
    if let Some(gas_price) = request.gas_price {
        tx = tx.with_gas_price(gas_price);
    }
    if let Some(nonce) = request.nonce {
        tx = tx.with_nonce(nonce);
    }
    tx
}

fn map_log(log: &Log) -> EventLog {
    EventLog {
        address: log.address(),
        topics: log.topics().to_vec(),
        data: log.data().data.clone(),
        block_number: log.block_number,
        transaction_hash: log.transaction_hash,
    }
}

fn map_receipt(receipt: &TransactionReceipt) -> Receipt {
    Receipt {
        transaction_hash: receipt.transaction_hash,
        success: receipt.status(),
        contract_address: receipt.contract_address,
        block_number: receipt.block_number,
        gas_used: receipt.gas_used,
        effective_gas_price: receipt.effective_gas_price,
        logs: receipt.inner.logs().iter().map(map_log).collect(),
    }
}

#[async_trait]
impl LedgerNode for AlloyNode {
    fn endpoint(&self) -> String {
        self.endpoint.to_string()
    }

    async fn estimate_gas(&self, request: &CallRequest) -> Result<u64, NodeError> {
        self.provider
            .estimate_gas(to_transaction_request(request))
            .into_future()
            .instrument(tracing::info_span!("estimate_gas"))
            .await
            .map_err(|e| categorize_node_error(e, "estimate_gas"))
    }

    async fn gas_price(&self) -> Result<u128, NodeError> {
        self.provider
            .get_gas_price()
            .instrument(tracing::info_span!("get_gas_price"))
            .await
            .map_err(|e| categorize_node_error(e, "get_gas_price"))
    }

    async fn pending_transaction_count(&self, address: Address) -> Result<u64, NodeError> {
        match self.provider.get_transaction_count(address).pending().await {
            Ok(count) => Ok(count),
            Err(e) => {
                tracing::warn!(
                    %address,
                    error = ?e,
                    "pending block tag not supported by RPC, falling back to latest"
                );
                self.provider
                    .get_transaction_count(address)
                    .latest()
                    .await
                    .map_err(|e| categorize_node_error(e, "get_transaction_count"))
            }
        }
    }

    async fn send_transaction(&self, request: &CallRequest) -> Result<TxHash, NodeError> {
        let pending = self
            .provider
            .send_transaction(to_transaction_request(request))
            .instrument(tracing::info_span!("send_transaction"))
            .await
            .map_err(|e| categorize_node_error(e, "send_transaction"))?;
        Ok(*pending.tx_hash())
    }

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<Receipt>, NodeError> {
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| categorize_node_error(e, "get_transaction_receipt"))?;
        Ok(receipt.as_ref().map(map_receipt))
    }

    async fn balance(&self, address: Address) -> Result<U256, NodeError> {
        self.provider
            .get_balance(address)
            .await
            .map_err(|e| categorize_node_error(e, "get_balance"))
    }

    async fn code(&self, address: Address) -> Result<Bytes, NodeError> {
        self.provider
            .get_code_at(address)
            .await
            .map_err(|e| categorize_node_error(e, "get_code"))
    }

    async fn call(&self, request: &CallRequest) -> Result<Bytes, NodeError> {
        self.provider
            .call(to_transaction_request(request))
            .await
            .map_err(|e| categorize_node_error(e, "eth_call"))
    }

    async fn subscribe_logs(
        &self,
        address: Address,
        topic0: B256,
        from_block: Option<u64>,
    ) -> Result<LogStream, NodeError> {
        let filter = Filter::new().address(address).event_signature(topic0);

        let head = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| categorize_node_error(e, "get_block_number"))?;

        // Install the live filter before backfilling so nothing mined in between is lost.
        let poller = self
            .provider
            .watch_logs(&filter)
            .await
            .map_err(|e| categorize_node_error(e, "eth_newFilter"))?
            .with_poll_interval(self.log_poll_interval);

        let backfill = match from_block {
            Some(from) if from <= head => self
                .provider
                .get_logs(&filter.clone().from_block(from).to_block(head))
                .await
                .map_err(|e| categorize_node_error(e, "eth_getLogs"))?,
            _ => Vec::new(),
        };
        tracing::debug!(%address, %topic0, head, backfilled = backfill.len(), "log subscription established");

        let backfill = futures::stream::iter(backfill.iter().map(map_log).map(Ok).collect::<Vec<_>>());
        let live = poller
            .into_stream()
            .flat_map(futures::stream::iter)
            .filter(move |log| futures::future::ready(log.block_number.is_none_or(|b| b > head)))
            .map(|log| Ok(map_log(&log)));

        Ok(backfill.chain(live).boxed())
    }
}
