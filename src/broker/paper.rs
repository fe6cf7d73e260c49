//! In-process paper broker with simulated slippage and fees.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{Broker, BrokerPosition, MarketData};
use crate::models::{Candle, OrderResponse, OrderSide};

/// Paper broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperBrokerConfig {
    /// Starting cash balance
    pub initial_balance: Decimal,
    /// Adverse fill slippage applied to every order (0.001 = 0.1%)
    pub slippage_pct: Decimal,
    /// Fee per fill as a fraction of notional
    pub fee_pct: Decimal,
    /// Tradable symbols; empty means any symbol with a price
    pub symbols: Vec<String>,
}

impl Default for PaperBrokerConfig {
    fn default() -> Self {
        Self {
            initial_balance: dec!(10000),
            slippage_pct: dec!(0.0005), // 0.05%
            fee_pct: dec!(0.007),       // 0.7% per side
            symbols: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct PaperState {
    cash: Decimal,
    prices: HashMap<String, Decimal>,
    holdings: HashMap<String, BrokerPosition>,
    fees_paid: Decimal,
}

/// Simulated broker filling market orders at the last set price.
pub struct PaperBroker {
    config: PaperBrokerConfig,
    /// Slippage override, used to simulate bad fills
    slippage: std::sync::RwLock<Decimal>,
    state: RwLock<PaperState>,
}

impl PaperBroker {
    pub fn new(config: PaperBrokerConfig) -> Self {
        let state = PaperState {
            cash: config.initial_balance,
            ..Default::default()
        };
        Self {
            slippage: std::sync::RwLock::new(config.slippage_pct),
            config,
            state: RwLock::new(state),
        }
    }

    /// Set the mark price used for the next fills of `symbol`.
    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.state.write().await.prices.insert(symbol.to_string(), price);
    }

    pub async fn price(&self, symbol: &str) -> Option<Decimal> {
        self.state.read().await.prices.get(symbol).copied()
    }

    /// Change the simulated adverse slippage.
    pub fn set_slippage(&self, slippage: Decimal) {
        if let Ok(mut s) = self.slippage.write() {
            *s = slippage;
        }
    }

    pub async fn fees_paid(&self) -> Decimal {
        self.state.read().await.fees_paid
    }

    /// Cash plus holdings marked at the last price.
    pub async fn equity(&self) -> Decimal {
        let state = self.state.read().await;
        let marked: Decimal = state
            .holdings
            .values()
            .map(|h| h.quantity * state.prices.get(&h.symbol).copied().unwrap_or(h.avg_price))
            .sum();
        state.cash + marked
    }

    fn current_slippage(&self) -> Decimal {
        self.slippage
            .read()
            .map(|s| *s)
            .unwrap_or(self.config.slippage_pct)
    }
}

#[async_trait]
impl Broker for PaperBroker {
    fn name(&self) -> &str {
        "paper"
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
        let slippage = self.current_slippage();
        let mut state = self.state.write().await;

        let mark = state
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow!("No price for {}", symbol))?;

        if quantity <= Decimal::ZERO {
            return Ok(OrderResponse {
                status: Some("rejected".to_string()),
                error: Some(format!("invalid quantity {}", quantity)),
                ..Default::default()
            });
        }

        let price = match side {
            OrderSide::Buy => mark * (Decimal::ONE + slippage),
            OrderSide::Sell => mark * (Decimal::ONE - slippage),
        };
        let notional = price * quantity;
        let fee = notional * self.config.fee_pct;

        let cash_delta = match side {
            OrderSide::Buy => -(notional + fee),
            OrderSide::Sell => notional - fee,
        };
        if side == OrderSide::Buy && state.cash + cash_delta < Decimal::ZERO {
            return Ok(OrderResponse {
                status: Some("rejected".to_string()),
                error: Some("insufficient funds".to_string()),
                ..Default::default()
            });
        }

        state.cash += cash_delta;
        state.fees_paid += fee;

        let signed_qty = match side {
            OrderSide::Buy => quantity,
            OrderSide::Sell => -quantity,
        };
        let holding = state
            .holdings
            .entry(symbol.to_string())
            .or_insert_with(|| BrokerPosition {
                symbol: symbol.to_string(),
                quantity: Decimal::ZERO,
                avg_price: Decimal::ZERO,
            });
        let new_qty = holding.quantity + signed_qty;
        let same_direction = holding.quantity.is_zero()
            || holding.quantity.is_sign_negative() == signed_qty.is_sign_negative();
        if same_direction {
            holding.avg_price =
                (holding.avg_price * holding.quantity.abs() + price * quantity) / new_qty.abs();
        } else if !new_qty.is_zero()
            && new_qty.is_sign_negative() != holding.quantity.is_sign_negative()
        {
            // Flipped through flat: the remainder was opened at this fill
            holding.avg_price = price;
        }
        holding.quantity = new_qty;
        if holding.quantity.is_zero() {
            state.holdings.remove(symbol);
        }

        let order_id = Uuid::new_v4().to_string();
        debug!(
            order_id = %order_id,
            symbol = %symbol,
            side = %side,
            quantity = %quantity,
            price = %price,
            fee = %fee,
            "Paper fill"
        );

        Ok(OrderResponse {
            status: Some("filled".to_string()),
            order_id: Some(order_id),
            symbol: Some(symbol.to_string()),
            filled_volume: Some(quantity),
            average_filled_price: Some(price),
            timestamp: Some(Utc::now().to_rfc3339()),
            ..Default::default()
        })
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        Ok(self.state.read().await.holdings.values().cloned().collect())
    }

    async fn get_account_balance(&self) -> Result<Decimal> {
        Ok(self.state.read().await.cash)
    }
}

/// Market data source that marks a paper broker to each fetched close.
///
/// Lets a dry run trade real candles against simulated fills.
pub struct PaperFeed {
    source: Arc<dyn MarketData>,
    broker: Arc<PaperBroker>,
}

impl PaperFeed {
    pub fn new(source: Arc<dyn MarketData>, broker: Arc<PaperBroker>) -> Self {
        Self { source, broker }
    }
}

#[async_trait]
impl MarketData for PaperFeed {
    async fn get_candles(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>> {
        let candles = self.source.get_candles(symbol, limit).await?;
        if let Some(last) = candles.last() {
            self.broker.set_price(symbol, last.close).await;
        }
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> PaperBroker {
        PaperBroker::new(PaperBrokerConfig {
            initial_balance: dec!(1000),
            slippage_pct: dec!(0.001),
            fee_pct: dec!(0.01),
            symbols: vec!["BTC-USD".to_string()],
        })
    }

    #[tokio::test]
    async fn test_fill_applies_slippage_and_fee() {
        let broker = broker();
        broker.set_price("BTC-USD", dec!(100)).await;

        let resp = broker
            .place_market_order("BTC-USD", OrderSide::Buy, dec!(2))
            .await
            .unwrap();

        assert_eq!(resp.normalized_status().as_deref(), Some("filled"));
        assert_eq!(resp.average_filled_price, Some(dec!(100.1)));
        // 200.2 notional + 2.002 fee
        assert_eq!(broker.get_account_balance().await.unwrap(), dec!(797.798));

        let positions = broker.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, dec!(2));
    }

    #[tokio::test]
    async fn test_round_trip_flattens_holding() {
        let broker = broker();
        broker.set_price("BTC-USD", dec!(100)).await;

        broker.place_market_order("BTC-USD", OrderSide::Buy, dec!(1)).await.unwrap();
        broker.place_market_order("BTC-USD", OrderSide::Sell, dec!(1)).await.unwrap();

        assert!(broker.get_positions().await.unwrap().is_empty());
        assert!(broker.fees_paid().await > Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_rejections() {
        let broker = broker();
        assert!(!broker.supports_symbol("DOGE-USD"));

        // Unknown price is a transport-level failure
        assert!(broker
            .place_market_order("BTC-USD", OrderSide::Buy, dec!(1))
            .await
            .is_err());

        broker.set_price("BTC-USD", dec!(100)).await;
        let resp = broker
            .place_market_order("BTC-USD", OrderSide::Buy, dec!(50))
            .await
            .unwrap();
        assert_eq!(resp.error_message(), Some("insufficient funds"));
        assert!(resp.order_ref().is_none());
    }

    #[test]
    fn test_equity_marks_holdings_to_last_price() {
        let broker = broker();
        tokio_test::block_on(async {
            broker.set_price("BTC-USD", dec!(100)).await;
            broker.place_market_order("BTC-USD", OrderSide::Buy, dec!(1)).await.unwrap();
            broker.set_price("BTC-USD", dec!(120)).await;

            // 1000 - 100.1 - 1.001 cash, plus 1 BTC at 120
            assert_eq!(broker.equity().await, dec!(1018.899));
        });
    }

    struct StaticCandles(Vec<Candle>);

    #[async_trait]
    impl MarketData for StaticCandles {
        async fn get_candles(&self, _symbol: &str, _limit: usize) -> Result<Vec<Candle>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_paper_feed_marks_last_close() {
        let paper = Arc::new(broker());
        let candles = vec![
            Candle::new(Utc::now(), dec!(99), dec!(101), dec!(98), dec!(100), dec!(5)),
            Candle::new(Utc::now(), dec!(100), dec!(103), dec!(99), dec!(102), dec!(5)),
        ];
        let feed = PaperFeed::new(Arc::new(StaticCandles(candles)), paper.clone());

        let fetched = feed.get_candles("BTC-USD", 2).await.unwrap();

        assert_eq!(fetched.len(), 2);
        assert_eq!(paper.price("BTC-USD").await, Some(dec!(102)));
    }
}
