//! Order side and the loosely-shaped order response returned by brokers.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    /// The side that closes a position opened with `self`.
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "buy" | "long" => Some(OrderSide::Buy),
            "sell" | "short" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A partial fill reported inside an order response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub price: Decimal,
    #[serde(default, alias = "size", alias = "qty")]
    pub quantity: Decimal,
}

/// Order placement response.
///
/// Brokers disagree on field names, so every field is optional and the
/// execution gate decides what is usable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    /// Kraken-style transaction id list
    #[serde(default)]
    pub txid: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub filled_volume: Option<Decimal>,
    #[serde(default)]
    pub average_filled_price: Option<Decimal>,
    #[serde(default)]
    pub filled_price: Option<Decimal>,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub fills: Vec<Fill>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl OrderResponse {
    /// First non-empty identifier among `order_id`, `id` and `txid[0]`.
    pub fn order_ref(&self) -> Option<&str> {
        [self.order_id.as_deref(), self.id.as_deref()]
            .into_iter()
            .flatten()
            .chain(self.txid.iter().map(String::as_str))
            .map(str::trim)
            .find(|s| !s.is_empty())
    }

    /// Lower-cased status, if any.
    pub fn normalized_status(&self) -> Option<String> {
        self.status
            .as_deref()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
    }

    /// Error message, if the broker reported one.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_ref_priority() {
        let resp = OrderResponse {
            order_id: Some("  ".to_string()),
            id: None,
            txid: vec!["OQCLML-BW3P3-BUCMWZ".to_string()],
            ..Default::default()
        };
        assert_eq!(resp.order_ref(), Some("OQCLML-BW3P3-BUCMWZ"));

        let resp = OrderResponse {
            order_id: Some("abc".to_string()),
            id: Some("def".to_string()),
            ..Default::default()
        };
        assert_eq!(resp.order_ref(), Some("abc"));
        assert_eq!(OrderResponse::default().order_ref(), None);
    }

    #[test]
    fn test_deserialize_loose_shapes() {
        let json = r#"{"status":"FILLED","id":"42","filled_price":"101.5","fills":[{"price":"101.5","size":"2"}]}"#;
        let resp: OrderResponse = serde_json::from_str(json).unwrap();

        assert_eq!(resp.normalized_status().as_deref(), Some("filled"));
        assert_eq!(resp.order_ref(), Some("42"));
        assert_eq!(resp.fills.len(), 1);
        assert!(resp.error_message().is_none());
    }

    #[test]
    fn test_side_helpers() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::parse("LONG"), Some(OrderSide::Buy));
        assert_eq!(OrderSide::parse("flat"), None);
    }
}
