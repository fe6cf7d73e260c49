//! Generic JSON gateway client.
//!
//! Talks to a broker gateway exposing:
//! - `POST /orders` with `{symbol, side, quantity, type: "market"}`
//! - `GET /positions`
//! - `GET /balance` returning `{"balance": "..."}`
//! - `GET /candles?symbol=..&limit=..`

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Broker, BrokerPosition, MarketData};
use crate::models::{Candle, OrderResponse, OrderSide};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Gateway connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestBrokerConfig {
    pub base_url: String,
    /// Sent as a bearer token when set
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    /// Tradable symbols; empty means the gateway decides
    pub symbols: Vec<String>,
}

impl Default for RestBrokerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            api_key: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            symbols: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize)]
struct OrderRequest<'a> {
    symbol: &'a str,
    side: OrderSide,
    quantity: Decimal,
    #[serde(rename = "type")]
    order_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: Decimal,
}

/// Broker and market data over a JSON gateway.
pub struct RestBroker {
    client: Client,
    config: RestBrokerConfig,
}

impl RestBroker {
    pub fn new(config: RestBrokerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl Broker for RestBroker {
    fn name(&self) -> &str {
        "rest"
    }

    fn supports_symbol(&self, symbol: &str) -> bool {
        self.config.symbols.is_empty() || self.config.symbols.iter().any(|s| s == symbol)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderResponse> {
        let url = self.url("/orders");
        let body = OrderRequest {
            symbol,
            side,
            quantity,
            order_type: "market",
        };

        debug!(url = %url, symbol = %symbol, side = %side, quantity = %quantity, "Placing market order");

        let response = self
            .authorized(self.client.post(&url).json(&body))
            .send()
            .await
            .context("Failed to send order")?;

        let status = response.status();
        let text = response.text().await.context("Failed to read order response")?;

        // Gateways report rejections in the body, often with a 4xx
        match serde_json::from_str::<OrderResponse>(&text) {
            Ok(order) => {
                if !status.is_success() {
                    warn!(status = %status, "Order endpoint returned error status");
                }
                Ok(order)
            }
            Err(_) if !status.is_success() => Ok(OrderResponse {
                status: Some("error".to_string()),
                error: Some(format!("{} - {}", status, text)),
                ..Default::default()
            }),
            Err(e) => Err(e).context("Failed to parse order response"),
        }
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        let url = self.url("/positions");

        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .context("Failed to fetch positions")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Positions request failed: {} - {}", status, body);
        }

        response
            .json()
            .await
            .context("Failed to parse positions response")
    }

    async fn get_account_balance(&self) -> Result<Decimal> {
        let url = self.url("/balance");

        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .context("Failed to fetch balance")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Balance request failed: {} - {}", status, body);
        }

        let balance: BalanceResponse = response
            .json()
            .await
            .context("Failed to parse balance response")?;
        Ok(balance.balance)
    }
}

#[async_trait]
impl MarketData for RestBroker {
    async fn get_candles(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>> {
        let url = format!("{}?symbol={}&limit={}", self.url("/candles"), symbol, limit);

        debug!(url = %url, "Fetching candles");

        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .context("Failed to fetch candles")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Candles request failed: {} - {}", status, body);
        }

        let mut candles: Vec<Candle> = response
            .json()
            .await
            .context("Failed to parse candles response")?;
        candles.sort_by_key(|c| c.timestamp);
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_join() {
        let broker = RestBroker::new(RestBrokerConfig {
            base_url: "http://gateway:9000/".to_string(),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(broker.url("/orders"), "http://gateway:9000/orders");
        assert!(broker.supports_symbol("ANY-USD"));
    }

    #[test]
    fn test_order_request_shape() {
        let body = OrderRequest {
            symbol: "BTC-USD",
            side: OrderSide::Sell,
            quantity: Decimal::new(15, 1),
            order_type: "market",
        };
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["side"], "sell");
        assert_eq!(json["type"], "market");
        assert_eq!(json["quantity"], "1.5");
    }
}
