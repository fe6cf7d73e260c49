//! Position model for an open, confirmed fill.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::OrderSide;

/// Remaining fraction below which a position counts as closed.
pub const CLOSED_THRESHOLD: Decimal = dec!(0.01);

/// Open position created from a confirmed entry fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Owner of the position
    pub user_id: String,

    pub symbol: String,

    /// Entry side (`Buy` = long)
    pub side: OrderSide,

    /// Confirmed fill price
    pub entry_price: Decimal,

    /// Base-asset quantity filled at entry
    pub quantity: Decimal,

    /// Price at which the whole remainder is force-closed
    pub stop_loss: Decimal,

    /// Price at which the whole remainder is closed in profit
    pub take_profit: Decimal,

    /// One flag per stepped profit level, set once that level has fired
    pub ladder_hits: Vec<bool>,

    /// Fraction of the original quantity still open (1.0 at entry)
    pub remaining_size: Decimal,

    /// Broker order id of the entry
    pub entry_order_id: String,

    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Create a new position with zeroed ladder progress.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: String,
        symbol: String,
        side: OrderSide,
        entry_price: Decimal,
        quantity: Decimal,
        stop_loss: Decimal,
        take_profit: Decimal,
        ladder_levels: usize,
        entry_order_id: String,
    ) -> Self {
        Self {
            user_id,
            symbol,
            side,
            entry_price,
            quantity,
            stop_loss,
            take_profit,
            ladder_hits: vec![false; ladder_levels],
            remaining_size: Decimal::ONE,
            entry_order_id,
            opened_at: Utc::now(),
        }
    }

    /// Gross return at `price`, signed by side (positive = in profit).
    pub fn gross_return(&self, price: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        match self.side {
            OrderSide::Buy => (price - self.entry_price) / self.entry_price,
            OrderSide::Sell => (self.entry_price - price) / self.entry_price,
        }
    }

    pub fn gross_return_f64(&self, price: Decimal) -> f64 {
        self.gross_return(price).to_f64().unwrap_or(0.0)
    }

    /// Quantity still held.
    pub fn remaining_quantity(&self) -> Decimal {
        self.quantity * self.remaining_size
    }

    /// Quantity to trade for an exit of `fraction` of the original size.
    ///
    /// Never exceeds what is still held.
    pub fn exit_quantity(&self, fraction: Decimal) -> Decimal {
        self.quantity * fraction.min(self.remaining_size)
    }

    /// Apply an exit of `fraction` of the original size. Returns the
    /// fraction actually removed.
    pub fn reduce(&mut self, fraction: Decimal) -> Decimal {
        let removed = fraction.min(self.remaining_size).max(Decimal::ZERO);
        self.remaining_size -= removed;
        removed
    }

    /// PnL of closing `quantity` at `price`.
    pub fn pnl_for(&self, quantity: Decimal, price: Decimal) -> Decimal {
        match self.side {
            OrderSide::Buy => (price - self.entry_price) * quantity,
            OrderSide::Sell => (self.entry_price - price) * quantity,
        }
    }

    pub fn stop_hit(&self, price: Decimal) -> bool {
        match self.side {
            OrderSide::Buy => price <= self.stop_loss,
            OrderSide::Sell => price >= self.stop_loss,
        }
    }

    pub fn take_profit_hit(&self, price: Decimal) -> bool {
        match self.side {
            OrderSide::Buy => price >= self.take_profit,
            OrderSide::Sell => price <= self.take_profit,
        }
    }

    /// Check if this position is closed (remaining fraction below 1%).
    pub fn is_closed(&self) -> bool {
        self.remaining_size < CLOSED_THRESHOLD
    }

    /// Value of the open remainder at the entry price.
    pub fn notional(&self) -> Decimal {
        self.remaining_quantity() * self.entry_price
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_position() -> Position {
        Position::new(
            "alice".to_string(),
            "BTC-USD".to_string(),
            OrderSide::Buy,
            dec!(100),
            dec!(2),
            dec!(97),
            dec!(106),
            4,
            "ord-1".to_string(),
        )
    }

    #[test]
    fn test_remaining_size_is_monotonic() {
        let mut pos = long_position();
        let mut last = pos.remaining_size;

        for fraction in [dec!(0.10), dec!(0.15), dec!(0.25), dec!(0.50), dec!(0.50)] {
            pos.reduce(fraction);
            assert!(pos.remaining_size <= last);
            assert!(pos.remaining_size >= Decimal::ZERO);
            last = pos.remaining_size;
        }

        assert!(pos.is_closed());
    }

    #[test]
    fn test_exit_quantity_capped_by_remaining() {
        let mut pos = long_position();
        pos.reduce(dec!(0.8));

        assert_eq!(pos.exit_quantity(dec!(0.5)), dec!(0.4));
        assert_eq!(pos.remaining_quantity(), dec!(0.4));
    }

    #[test]
    fn test_returns_and_levels_by_side() {
        let long = long_position();
        assert_eq!(long.gross_return(dec!(103)), dec!(0.03));
        assert!(long.stop_hit(dec!(96.5)));
        assert!(long.take_profit_hit(dec!(106)));
        assert_eq!(long.pnl_for(dec!(1), dec!(110)), dec!(10));

        let mut short = long_position();
        short.side = OrderSide::Sell;
        short.stop_loss = dec!(103);
        short.take_profit = dec!(94);
        assert_eq!(short.gross_return(dec!(97)), dec!(0.03));
        assert!(short.stop_hit(dec!(103.5)));
        assert!(!short.take_profit_hit(dec!(95)));
        assert_eq!(short.pnl_for(dec!(2), dec!(90)), dec!(20));
    }
}
