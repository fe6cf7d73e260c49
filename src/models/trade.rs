//! Trade record model for confirmed fills written to the ledger.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::OrderSide;

/// Whether a fill opened or reduced a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeKind {
    Entry,
    Exit,
}

impl TradeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeKind::Entry => "entry",
            TradeKind::Exit => "exit",
        }
    }
}

/// Confirmed fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Unique trade identifier
    pub id: String,

    pub user_id: String,

    pub symbol: String,

    pub side: OrderSide,

    pub kind: TradeKind,

    /// Base-asset quantity filled
    pub quantity: Decimal,

    /// Confirmed fill price
    pub price: Decimal,

    /// Estimated fee paid in quote currency
    #[serde(default)]
    pub fee: Decimal,

    /// Broker order / transaction id
    pub order_id: String,

    /// Realized PnL for exits, zero for entries
    #[serde(default)]
    pub realized_pnl: Decimal,

    /// Free-form reason (e.g. "stop_loss", "tp_exit_2.0pct")
    #[serde(default)]
    pub reason: String,

    pub timestamp: DateTime<Utc>,
}

impl TradeRecord {
    /// Quote-currency value of the fill.
    pub fn notional(&self) -> Decimal {
        self.quantity * self.price
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_notional() {
        let trade = TradeRecord {
            id: "t1".to_string(),
            user_id: "alice".to_string(),
            symbol: "ETH-USD".to_string(),
            side: OrderSide::Buy,
            kind: TradeKind::Entry,
            quantity: dec!(0.5),
            price: dec!(2000),
            fee: dec!(6),
            order_id: "o1".to_string(),
            realized_pnl: Decimal::ZERO,
            reason: String::new(),
            timestamp: Utc::now(),
        };

        assert_eq!(trade.notional(), dec!(1000));
        assert_eq!(TradeKind::Exit.as_str(), "exit");
    }
}
