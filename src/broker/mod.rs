//! Broker and market data seams consumed by the execution gate and bot.

mod paper;
mod rest;

pub use paper::{PaperBroker, PaperBrokerConfig, PaperFeed};
pub use rest::{RestBroker, RestBrokerConfig};

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{Candle, OrderResponse, OrderSide};

/// Net holding reported by a broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    /// Signed base quantity (negative = short)
    pub quantity: Decimal,
    #[serde(default)]
    pub avg_price: Decimal,
}

/// Order routing.
///
/// Transport failures come back as `Err`. A broker that answered but
/// refused the order returns `Ok` with an error status or message, and the
/// execution gate decides.
#[async_trait]
pub trait Broker: Send + Sync {
    fn name(&self) -> &str;

    fn supports_symbol(&self, symbol: &str) -> bool;

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderResponse>;

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>>;

    /// Quote-currency cash balance.
    async fn get_account_balance(&self) -> Result<Decimal>;
}

/// Candle source.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Most recent `limit` candles, oldest first.
    async fn get_candles(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>>;
}
