//! Order confirmation: status, id, symbol and fill price checks.

use rust_decimal::Decimal;

use super::error::{ExecutionError, Result};
use crate::models::OrderResponse;

/// Statuses accepted as a live or completed order.
pub const ACCEPTED_STATUSES: [&str; 4] = ["open", "closed", "filled", "pending"];

/// Statuses that are always a rejection, even with an order id.
const ERROR_STATUSES: [&str; 6] = ["error", "rejected", "failed", "canceled", "cancelled", "expired"];

/// A broker response that passed every confirmation check.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmedFill {
    pub order_id: String,
    pub status: String,
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Run the confirmation checks in order and extract the fill.
///
/// `requested_qty` is used when the broker does not report a filled volume.
pub fn confirm_order(
    response: &OrderResponse,
    symbol: &str,
    requested_qty: Decimal,
) -> Result<ConfirmedFill> {
    let status = response.normalized_status();

    if let Some(err) = response.error_message() {
        return Err(ExecutionError::rejected(err));
    }
    if let Some(s) = status.as_deref().filter(|s| ERROR_STATUSES.contains(s)) {
        return Err(ExecutionError::rejected(format!("broker status {}", s)));
    }

    let order_id = response
        .order_ref()
        .ok_or(ExecutionError::InvalidTxid)?
        .to_string();

    let status = match status {
        Some(s) if ACCEPTED_STATUSES.contains(&s.as_str()) => s,
        Some(s) => return Err(ExecutionError::rejected(format!("unexpected status {}", s))),
        None => return Err(ExecutionError::rejected("missing status")),
    };

    if let Some(actual) = response.symbol.as_deref() {
        if normalize_symbol(actual) != normalize_symbol(symbol) {
            return Err(ExecutionError::BrokerMismatch {
                expected: symbol.to_string(),
                actual: actual.to_string(),
            });
        }
    }

    let price = fill_price(response)?;

    let quantity = response
        .filled_volume
        .filter(|v| *v > Decimal::ZERO)
        .or_else(|| {
            let total: Decimal = response.fills.iter().map(|f| f.quantity).sum();
            (total > Decimal::ZERO).then_some(total)
        })
        .unwrap_or(requested_qty);

    Ok(ConfirmedFill {
        order_id,
        status,
        price,
        quantity,
    })
}

/// Actual fill price, checking response shapes in priority order:
/// `average_filled_price`, `filled_price`, volume-weighted `fills`, `price`.
pub fn fill_price(response: &OrderResponse) -> Result<Decimal> {
    let candidate = response
        .average_filled_price
        .or(response.filled_price)
        .or_else(|| fills_vwap(response))
        .or(response.price);

    match candidate {
        Some(p) if p > Decimal::ZERO => Ok(p),
        Some(p) => Err(ExecutionError::invalid_price(format!("non-positive price {}", p))),
        None => Err(ExecutionError::invalid_price("no price in response")),
    }
}

fn fills_vwap(response: &OrderResponse) -> Option<Decimal> {
    let qty: Decimal = response.fills.iter().map(|f| f.quantity).sum();
    if qty <= Decimal::ZERO {
        return None;
    }
    let notional: Decimal = response.fills.iter().map(|f| f.price * f.quantity).sum();
    Some(notional / qty)
}

/// Upper-cased symbol with separators removed ("btc/usd" == "BTC-USD").
fn normalize_symbol(symbol: &str) -> String {
    symbol
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Fill;
    use rust_decimal_macros::dec;

    fn filled(price: Decimal) -> OrderResponse {
        OrderResponse {
            status: Some("filled".to_string()),
            order_id: Some("o-1".to_string()),
            filled_price: Some(price),
            ..Default::default()
        }
    }

    #[test]
    fn test_confirm_happy_path() {
        let fill = confirm_order(&filled(dec!(100)), "BTC-USD", dec!(0.5)).unwrap();
        assert_eq!(fill.order_id, "o-1");
        assert_eq!(fill.price, dec!(100));
        assert_eq!(fill.quantity, dec!(0.5));
    }

    #[test]
    fn test_rejections_in_order() {
        let mut resp = filled(dec!(100));
        resp.error = Some("EOrder:Insufficient funds".to_string());
        assert!(matches!(
            confirm_order(&resp, "BTC-USD", dec!(1)),
            Err(ExecutionError::OrderRejected { .. })
        ));

        let mut resp = filled(dec!(100));
        resp.order_id = None;
        assert!(matches!(
            confirm_order(&resp, "BTC-USD", dec!(1)),
            Err(ExecutionError::InvalidTxid)
        ));

        let mut resp = filled(dec!(100));
        resp.status = Some("partially_settled".to_string());
        assert!(matches!(
            confirm_order(&resp, "BTC-USD", dec!(1)),
            Err(ExecutionError::OrderRejected { .. })
        ));

        let mut resp = filled(dec!(100));
        resp.symbol = Some("ETH-USD".to_string());
        assert!(matches!(
            confirm_order(&resp, "BTC-USD", dec!(1)),
            Err(ExecutionError::BrokerMismatch { .. })
        ));

        let resp = filled(dec!(0));
        assert!(matches!(
            confirm_order(&resp, "BTC-USD", dec!(1)),
            Err(ExecutionError::InvalidFillPrice { .. })
        ));
    }

    #[test]
    fn test_accepts_whitelisted_statuses() {
        for status in ACCEPTED_STATUSES {
            let mut resp = filled(dec!(10));
            resp.status = Some(status.to_uppercase());
            resp.symbol = Some("btc/usd".to_string());
            assert!(confirm_order(&resp, "BTC-USD", dec!(1)).is_ok());
        }
    }

    #[test]
    fn test_fill_price_priority() {
        let resp = OrderResponse {
            average_filled_price: Some(dec!(101)),
            filled_price: Some(dec!(102)),
            price: Some(dec!(103)),
            ..Default::default()
        };
        assert_eq!(fill_price(&resp).unwrap(), dec!(101));

        let resp = OrderResponse {
            fills: vec![
                Fill { price: dec!(100), quantity: dec!(1) },
                Fill { price: dec!(103), quantity: dec!(2) },
            ],
            price: Some(dec!(99)),
            ..Default::default()
        };
        assert_eq!(fill_price(&resp).unwrap(), dec!(102));

        let resp = OrderResponse {
            price: Some(dec!(99)),
            ..Default::default()
        };
        assert_eq!(fill_price(&resp).unwrap(), dec!(99));
        assert!(fill_price(&OrderResponse::default()).is_err());
    }
}
