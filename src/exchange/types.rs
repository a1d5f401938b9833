//! Order and balance types shared by brokers.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which book an order goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Market {
    Spot,
    /// Linear perpetual swap on the same pair
    Futures,
}

impl Market {
    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Spot => "spot",
            Market::Futures => "futures",
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
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
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Market order in base-asset units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketOrder {
    pub market: Market,
    pub side: OrderSide,
    pub quantity: Decimal,
}

impl MarketOrder {
    pub fn spot(side: OrderSide, quantity: Decimal) -> Self {
        Self {
            market: Market::Spot,
            side,
            quantity,
        }
    }

    pub fn futures(side: OrderSide, quantity: Decimal) -> Self {
        Self {
            market: Market::Futures,
            side,
            quantity,
        }
    }
}

/// Execution result of a market order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub price: Decimal,
    pub quantity: Decimal,
    /// Fee in quote currency
    pub fee: Decimal,
}

/// Free spot balances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Balances {
    pub quote: Decimal,
    pub base: Decimal,
}

impl Balances {
    /// Total value in quote currency at `price`.
    pub fn value_at(&self, price: Decimal) -> Decimal {
        self.quote + self.base * price
    }
}
