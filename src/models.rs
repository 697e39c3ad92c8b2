//! Shared market data and order types.
//!
//! Internal timestamps are i64 milliseconds since the Unix epoch (`Millis`),
//! matching the store's `trade_time` column.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub type Millis = i64;

pub const MILLIS_PER_SEC: Millis = 1_000;
pub const MILLIS_PER_MIN: Millis = 60 * MILLIS_PER_SEC;
pub const MILLIS_PER_HOUR: Millis = 60 * MILLIS_PER_MIN;
pub const MILLIS_PER_DAY: Millis = 24 * MILLIS_PER_HOUR;

/// Aggressor side of a trade print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    /// Parse the wire/store spelling. Case-insensitive on the first letter
    /// because some venues shout ("BUY").
    pub fn from_wire(s: &str) -> Option<Side> {
        match s {
            "buy" | "BUY" | "Buy" | "b" | "B" => Some(Side::Buy),
            "sell" | "SELL" | "Sell" | "s" | "S" => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single trade print. Immutable once emitted by a source.
///
/// Every source emits trades non-decreasing in `time`; within equal `time`
/// the store's `trade_id` breaks ties for replay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub time: Millis,
    pub price: f64,
    pub size: f64,
    pub side: Side,
}

impl Trade {
    pub fn notional(&self) -> f64 {
        self.price * self.size
    }
}

/// One fill of a submitted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFill {
    pub size: f64,
    pub avg_price: f64,
    pub order_id: String,
}

/// Outcome of an order submission. Partial fills and per-order errors are
/// both carried; neither aborts the other.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderOutcome {
    pub fills: Vec<OrderFill>,
    pub errors: Vec<String>,
}

impl OrderOutcome {
    pub fn filled_size(&self) -> f64 {
        self.fills.iter().map(|f| f.size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.fills.is_empty() && self.errors.is_empty()
    }
}

/// Why an order was turned away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    InsufficientFunds,
    InsufficientPosition,
    InvalidSize,
    Venue(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::InsufficientFunds => write!(f, "insufficient funds"),
            RejectReason::InsufficientPosition => write!(f, "insufficient position"),
            RejectReason::InvalidSize => write!(f, "invalid size"),
            RejectReason::Venue(msg) => write!(f, "venue rejected order: {}", msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_wire_roundtrip() {
        assert_eq!(Side::from_wire("buy"), Some(Side::Buy));
        assert_eq!(Side::from_wire("SELL"), Some(Side::Sell));
        assert_eq!(Side::from_wire("hold"), None);
        assert_eq!(Side::from_wire(Side::Buy.as_str()), Some(Side::Buy));
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn test_trade_notional() {
        let trade = Trade {
            time: 1_700_000_000_000,
            price: 2.5,
            size: 4.0,
            side: Side::Buy,
        };
        assert_eq!(trade.notional(), 10.0);
    }

    #[test]
    fn test_order_outcome_filled_size() {
        let outcome = OrderOutcome {
            fills: vec![
                OrderFill {
                    size: 3.0,
                    avg_price: 1.0,
                    order_id: "a".to_string(),
                },
                OrderFill {
                    size: 2.0,
                    avg_price: 1.1,
                    order_id: "b".to_string(),
                },
            ],
            errors: vec!["partial venue outage".to_string()],
        };
        assert_eq!(outcome.filled_size(), 5.0);
        assert!(!outcome.is_empty());
        assert!(OrderOutcome::default().is_empty());
    }

    #[test]
    fn test_trade_serde() {
        let json = r#"{"time":1700000000000,"price":0.5,"size":10.0,"side":"sell"}"#;
        let trade: Trade = serde_json::from_str(json).unwrap();
        assert_eq!(trade.side, Side::Sell);
        assert_eq!(trade.time, 1_700_000_000_000);
    }
}
