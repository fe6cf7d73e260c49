//! Error types for the execution gate.

use rust_decimal::Decimal;
use thiserror::Error;

/// Why an order attempt was aborted.
///
/// Every variant is fail-closed: when one is returned, nothing was written
/// to the ledger and no position was opened or changed.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Kill switch active: {reason}")]
    KillSwitchActive { reason: String },

    #[error("Symbol {symbol} not supported by broker {broker}")]
    UnsupportedSymbol { symbol: String, broker: String },

    #[error("Broker request failed: {0}")]
    Broker(#[source] anyhow::Error),

    #[error("Order rejected: {message}")]
    OrderRejected { message: String },

    #[error("Broker returned no order id or txid")]
    InvalidTxid,

    #[error("Invalid fill price: {message}")]
    InvalidFillPrice { message: String },

    #[error("Broker response for {actual} does not match requested {expected}")]
    BrokerMismatch { expected: String, actual: String },

    #[error("Immediate loss: slippage {slippage} exceeds {max_slippage} (expected {expected}, filled {actual})")]
    ImmediateLoss {
        expected: Decimal,
        actual: Decimal,
        slippage: Decimal,
        max_slippage: Decimal,
    },

    #[error("No open position for {user_id} {symbol}")]
    PositionNotFound { user_id: String, symbol: String },

    #[error("Exit fraction {0} must be in (0, 1]")]
    InvalidExitFraction(Decimal),

    #[error("Ledger error: {0}")]
    Ledger(#[source] anyhow::Error),
}

impl ExecutionError {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::OrderRejected {
            message: message.into(),
        }
    }

    pub fn invalid_price(message: impl Into<String>) -> Self {
        Self::InvalidFillPrice {
            message: message.into(),
        }
    }

    /// Short machine-readable label, used in logs and stats.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::KillSwitchActive { .. } => "kill_switch",
            Self::UnsupportedSymbol { .. } => "unsupported_symbol",
            Self::Broker(_) => "broker",
            Self::OrderRejected { .. } => "order_rejected",
            Self::InvalidTxid => "invalid_txid",
            Self::InvalidFillPrice { .. } => "invalid_fill_price",
            Self::BrokerMismatch { .. } => "broker_mismatch",
            Self::ImmediateLoss { .. } => "immediate_loss",
            Self::PositionNotFound { .. } => "position_not_found",
            Self::InvalidExitFraction(_) => "invalid_exit_fraction",
            Self::Ledger(_) => "ledger",
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecutionError>;
