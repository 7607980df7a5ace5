//! Gas limit and gas price selection.
//!
//! The gas limit is the node's simulated estimate with a safety buffer. The gas price
//! comes from an external fee market when one is configured and answers in time;
//! otherwise the node's own price is used. A retry never quotes below the previous
//! attempt.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::FeeConfig;
use crate::error::EscrowError;
use crate::node::LedgerNode;
use crate::types::{FeeQuote, PendingCall};

const WEI_PER_GWEI: f64 = 1_000_000_000.0;

#[derive(Debug, thiserror::Error)]
pub enum FeeMarketError {
    #[error("fee market request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("fee market answered HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("fee market response has no usable `{0}` field")]
    Field(String),
    #[error("fee market did not answer within {0:?}")]
    Timeout(Duration),
}

/// Source of a suggested gas price in wei.
#[async_trait]
pub trait FeeMarket: Send + Sync {
    async fn suggested_gas_price(&self) -> Result<u128, FeeMarketError>;
}

/// Fee market reached over HTTP GET, answering JSON like
/// `{"fast": 250, "average": 120}` where values are gwei times `divisor`.
pub struct HttpFeeMarket {
    client: reqwest::Client,
    url: url::Url,
    field: String,
    divisor: u64,
    timeout: Duration,
}

impl HttpFeeMarket {
    pub fn new(url: url::Url, field: impl Into<String>, divisor: u64, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url,
            field: field.into(),
            divisor: divisor.max(1),
            timeout,
        })
    }

    pub fn from_config(config: &FeeConfig) -> Result<Option<Self>, Box<dyn std::error::Error + Send + Sync>> {
        let Some(url) = &config.fee_market_url else {
            return Ok(None);
        };
        let market = Self::new(
            url.parse()?,
            config.fee_market_field.clone(),
            config.fee_market_divisor,
            config.fee_market_timeout(),
        )?;
        Ok(Some(market))
    }
}

#[async_trait]
impl FeeMarket for HttpFeeMarket {
    async fn suggested_gas_price(&self) -> Result<u128, FeeMarketError> {
        let request = async {
            let response = self.client.get(self.url.clone()).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(FeeMarketError::Status(status));
            }
            let body: serde_json::Value = response.json().await?;
            parse_fee_quote(&body, &self.field, self.divisor)
        };
        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| FeeMarketError::Timeout(self.timeout))?
    }
}

/// Read `field` from a fee-market body and convert gwei×`divisor` to wei.
pub fn parse_fee_quote(body: &serde_json::Value, field: &str, divisor: u64) -> Result<u128, FeeMarketError> {
    let raw = match body.get(field) {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match raw {
        Some(value) if value.is_finite() && value > 0.0 => {
            let gwei = value / divisor.max(1) as f64;
            Ok((gwei * WEI_PER_GWEI).round() as u128)
        }
        _ => Err(FeeMarketError::Field(field.to_string())),
    }
}

pub struct FeeEstimator {
    node: Arc<dyn LedgerNode>,
    market: Option<Arc<dyn FeeMarket>>,
    gas_buffer: f64,
    bump_percent: u64,
}

impl FeeEstimator {
    pub fn new(node: Arc<dyn LedgerNode>, market: Option<Arc<dyn FeeMarket>>, config: &FeeConfig) -> Self {
        Self {
            node,
            market,
            gas_buffer: config.gas_buffer.max(1.0),
            bump_percent: config.replacement_bump_percent,
        }
    }

    /// Fresh quote for one attempt.
    ///
    /// `previous_price` is the price used by the preceding attempt of the same call; the
    /// returned price is strictly above it.
    pub async fn estimate(&self, call: &PendingCall, previous_price: Option<u128>) -> Result<FeeQuote, EscrowError> {
        let gas_limit = match call.gas_limit {
            Some(limit) => limit,
            None => self.gas_limit(call).await?,
        };
        let quoted = match call.gas_price {
            Some(price) => price,
            None => self.gas_price().await?,
        };
        let gas_price = match previous_price {
            Some(previous) => {
                let floor = self.replacement_floor(previous);
                if quoted < floor {
                    tracing::debug!(quoted, floor, previous, "raising gas price to replacement floor");
                }
                quoted.max(floor)
            }
            None => quoted,
        };
        Ok(FeeQuote { gas_limit, gas_price })
    }

    /// Node estimate multiplied by the buffer, rounded up.
    pub async fn gas_limit(&self, call: &PendingCall) -> Result<u64, EscrowError> {
        let estimated_gas = self.node.estimate_gas(&call.request()).await?;
        let buffered_gas = (estimated_gas as f64 * self.gas_buffer).ceil() as u64;
        tracing::debug!(
            method = %call.method,
            estimated_gas,
            gas_buffer = self.gas_buffer,
            buffered_gas,
            "gas estimation completed"
        );
        Ok(buffered_gas)
    }

    /// Fee-market price, falling back to the node's price on any market failure.
    pub async fn gas_price(&self) -> Result<u128, EscrowError> {
        if let Some(market) = &self.market {
            match market.suggested_gas_price().await {
                Ok(price) => {
                    tracing::debug!(gas_price = price, source = "fee_market", "gas price quoted");
                    return Ok(price);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "fee market unavailable, falling back to node gas price");
                }
            }
        }
        let price = self.node.gas_price().await?;
        tracing::debug!(gas_price = price, source = "node", "gas price quoted");
        Ok(price)
    }

    /// Lowest price a follow-up attempt may use after `previous`.
    pub fn replacement_floor(&self, previous: u128) -> u128 {
        let bump = (previous.saturating_mul(self.bump_percent as u128) / 100).max(1);
        previous.saturating_add(bump)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockLedger, ScriptedFeeMarket, admin};
    use alloy::primitives::{U256, address};
    use serde_json::json;

    fn transfer() -> PendingCall {
        PendingCall::transfer(admin(), address!("00000000000000000000000000000000000000cc"), U256::from(1))
    }

    fn estimator(ledger: &Arc<MockLedger>, market: Option<Arc<dyn FeeMarket>>) -> FeeEstimator {
        FeeEstimator::new(ledger.clone(), market, &FeeConfig::default())
    }

    #[test]
    fn test_parse_fee_quote() {
        // ethgasstation reports gwei * 10
        assert_eq!(parse_fee_quote(&json!({"fast": 250}), "fast", 10).unwrap(), 25_000_000_000);
        assert_eq!(parse_fee_quote(&json!({"fast": "45"}), "fast", 10).unwrap(), 4_500_000_000);
        assert_eq!(parse_fee_quote(&json!({"fast": 3}), "fast", 1).unwrap(), 3_000_000_000);
        assert!(matches!(
            parse_fee_quote(&json!({"average": 10}), "fast", 10),
            Err(FeeMarketError::Field(_))
        ));
        assert!(parse_fee_quote(&json!({"fast": -1}), "fast", 10).is_err());
        assert!(parse_fee_quote(&json!({"fast": null}), "fast", 10).is_err());
    }

    #[tokio::test]
    async fn test_gas_limit_applies_buffer_rounding_up() {
        let ledger = MockLedger::new();
        ledger.set_gas_estimate(21_001);
        let fees = estimator(&ledger, None);
        // 21001 * 1.2 = 25201.2
        assert_eq!(fees.gas_limit(&transfer()).await.unwrap(), 25_202);
    }

    #[tokio::test]
    async fn test_market_quote_preferred() {
        let ledger = MockLedger::new();
        ledger.set_gas_price(7);
        let market = ScriptedFeeMarket::answering(30_000_000_000);
        let fees = estimator(&ledger, Some(market.clone()));
        let quote = fees.estimate(&transfer(), None).await.unwrap();
        assert_eq!(quote.gas_price, 30_000_000_000);
        assert_eq!(ledger.count_calls("gas_price"), 0);
    }

    #[tokio::test]
    async fn test_market_timeout_falls_back_to_node() {
        let ledger = MockLedger::new();
        ledger.set_gas_price(11_000_000_000);
        let market = ScriptedFeeMarket::timing_out(Duration::from_millis(5));
        let fees = estimator(&ledger, Some(market.clone()));
        let quote = fees.estimate(&transfer(), None).await.unwrap();
        assert_eq!(quote.gas_price, 11_000_000_000);
        assert_eq!(market.calls(), 1);
        assert_eq!(ledger.count_calls("gas_price"), 1);
    }

    #[tokio::test]
    async fn test_http_market_unreachable_falls_back() {
        let ledger = MockLedger::new();
        ledger.set_gas_price(5);
        // nothing listens on port 9 of the loopback interface
        let market = HttpFeeMarket::new(
            "http://127.0.0.1:9/gas".parse().unwrap(),
            "fast",
            10,
            Duration::from_millis(200),
        )
        .unwrap();
        let fees = estimator(&ledger, Some(Arc::new(market)));
        assert_eq!(fees.gas_price().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_retry_price_never_below_previous() {
        let ledger = MockLedger::new();
        ledger.set_gas_price(100);
        let fees = estimator(&ledger, None);
        let first = fees.estimate(&transfer(), None).await.unwrap();

        // market moved down between attempts
        ledger.set_gas_price(50);
        let second = fees.estimate(&transfer(), Some(first.gas_price)).await.unwrap();
        assert_eq!(second.gas_price, 110);

        // market moved up: take the higher quote
        ledger.set_gas_price(500);
        let third = fees.estimate(&transfer(), Some(second.gas_price)).await.unwrap();
        assert_eq!(third.gas_price, 500);
    }

    #[test]
    fn test_replacement_floor_is_strictly_higher() {
        let ledger = MockLedger::new();
        let fees = estimator(&ledger, None);
        assert_eq!(fees.replacement_floor(0), 1);
        assert_eq!(fees.replacement_floor(5), 6);
        assert_eq!(fees.replacement_floor(1_000), 1_100);
    }

    #[tokio::test]
    async fn test_explicit_overrides_skip_estimation() {
        let ledger = MockLedger::new();
        let fees = estimator(&ledger, None);
        let call = transfer().with_gas_limit(50_000).with_gas_price(9);
        let quote = fees.estimate(&call, None).await.unwrap();
        assert_eq!(quote, FeeQuote { gas_limit: 50_000, gas_price: 9 });
        assert_eq!(ledger.count_calls("estimate_gas"), 0);
        assert_eq!(ledger.count_calls("gas_price"), 0);
    }
}
