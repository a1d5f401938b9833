//! Paper broker for simulated trading.

use super::broker::Broker;
use super::feed::PriceFeed;
use super::types::*;
use anyhow::{bail, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Simulated account for one pair.
#[derive(Debug, Clone, Default)]
pub struct PaperAccount {
    pub quote: Decimal,
    pub base: Decimal,
    /// Net perpetual position in base units (negative = short)
    pub futures_position: Decimal,
    pub futures_entry_price: Decimal,
    /// Realized futures P&L, already credited to `quote`
    pub futures_realized_pnl: Decimal,
    pub total_fees: Decimal,
    pub last_price: Option<Decimal>,
    pub order_count: u64,
}

/// Broker that fills market orders at the last fed price.
pub struct PaperBroker {
    feed: Arc<dyn PriceFeed>,
    account: Arc<RwLock<PaperAccount>>,
    order_id_counter: AtomicU64,
    spot_fee_rate: Decimal,
    futures_fee_rate: Decimal,
}

impl PaperBroker {
    pub fn new(
        feed: Arc<dyn PriceFeed>,
        initial_quote: Decimal,
        initial_base: Decimal,
        spot_fee_rate: Decimal,
        futures_fee_rate: Decimal,
    ) -> Self {
        let account = PaperAccount {
            quote: initial_quote,
            base: initial_base,
            ..Default::default()
        };

        Self {
            feed,
            account: Arc::new(RwLock::new(account)),
            order_id_counter: AtomicU64::new(1),
            spot_fee_rate,
            futures_fee_rate,
        }
    }

    /// Snapshot of the simulated account.
    pub async fn account(&self) -> PaperAccount {
        self.account.read().await.clone()
    }

    fn next_order_id(&self) -> u64 {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn fill_spot(&self, account: &mut PaperAccount, side: OrderSide, quantity: Decimal, price: Decimal) -> Result<Fill> {
        let notional = quantity * price;
        let fee = notional * self.spot_fee_rate;

        match side {
            OrderSide::Buy => {
                let cost = notional + fee;
                if cost > account.quote {
                    bail!(
                        "Insufficient quote balance: need {}, have {}",
                        cost,
                        account.quote
                    );
                }
                account.quote -= cost;
                account.base += quantity;
            }
            OrderSide::Sell => {
                if quantity > account.base {
                    bail!(
                        "Insufficient base balance: need {}, have {}",
                        quantity,
                        account.base
                    );
                }
                account.base -= quantity;
                account.quote += notional - fee;
            }
        }

        account.total_fees += fee;
        Ok(Fill {
            price,
            quantity,
            fee,
        })
    }

    fn fill_futures(&self, account: &mut PaperAccount, side: OrderSide, quantity: Decimal, price: Decimal) -> Fill {
        let fee = quantity * price * self.futures_fee_rate;
        let signed = match side {
            OrderSide::Buy => quantity,
            OrderSide::Sell => -quantity,
        };
        let position = account.futures_position;

        if position.is_zero() || position.is_sign_negative() == signed.is_sign_negative() {
            // Opening or adding: weighted average entry
            let new_position = position + signed;
            account.futures_entry_price = (position.abs() * account.futures_entry_price
                + quantity * price)
                / new_position.abs();
            account.futures_position = new_position;
        } else {
            let closed = quantity.min(position.abs());
            // Short gains when price is below entry, long the reverse
            let pnl = if position.is_sign_negative() {
                closed * (account.futures_entry_price - price)
            } else {
                closed * (price - account.futures_entry_price)
            };
            account.futures_realized_pnl += pnl;
            account.quote += pnl;
            account.futures_position = position + signed;

            if account.futures_position.is_zero() {
                account.futures_entry_price = Decimal::ZERO;
            } else if quantity > closed {
                // Flipped through zero
                account.futures_entry_price = price;
            }
        }

        account.quote -= fee;
        account.total_fees += fee;
        Fill {
            price,
            quantity,
            fee,
        }
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn current_price(&self) -> Result<Option<Decimal>> {
        let price = self
            .feed
            .latest_price()
            .await?
            .filter(|p| *p > Decimal::ZERO);

        if let Some(p) = price {
            self.account.write().await.last_price = Some(p);
        }
        Ok(price)
    }

    async fn balances(&self) -> Result<Balances> {
        let account = self.account.read().await;
        Ok(Balances {
            quote: account.quote,
            base: account.base,
        })
    }

    async fn execute(&self, order: &MarketOrder) -> Result<Fill> {
        if order.quantity <= Decimal::ZERO {
            bail!("Order quantity must be positive, got {}", order.quantity);
        }

        let mut account = self.account.write().await;
        let Some(price) = account.last_price else {
            bail!("No price available to fill {} {} order", order.market, order.side);
        };

        let fill = match order.market {
            Market::Spot => self.fill_spot(&mut account, order.side, order.quantity, price)?,
            Market::Futures => self.fill_futures(&mut account, order.side, order.quantity, price),
        };
        account.order_count += 1;
        let order_id = self.next_order_id();

        info!(
            order_id,
            market = %order.market,
            side = %order.side,
            quantity = %fill.quantity,
            price = %fill.price,
            fee = %fill.fee,
            "Paper order executed"
        );
        debug!(
            quote = %account.quote,
            base = %account.base,
            futures = %account.futures_position,
            "Paper account"
        );

        Ok(fill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ScriptedFeed;
    use rust_decimal_macros::dec;

    fn broker_with(prices: &[Decimal], quote: Decimal, base: Decimal) -> PaperBroker {
        let feed = Arc::new(ScriptedFeed::new(prices.iter().copied()));
        PaperBroker::new(feed, quote, base, dec!(0.001), dec!(0.0004))
    }

    #[tokio::test]
    async fn test_spot_buy_and_sell() {
        let broker = broker_with(&[dec!(2000)], dec!(1000), Decimal::ZERO);
        assert_eq!(broker.current_price().await.unwrap(), Some(dec!(2000)));

        let fill = broker
            .execute(&MarketOrder::spot(OrderSide::Buy, dec!(0.25)))
            .await
            .unwrap();
        // 0.25 × 2000 × 0.001
        assert_eq!(fill.fee, dec!(0.5));

        let balances = broker.balances().await.unwrap();
        assert_eq!(balances.quote, dec!(499.5));
        assert_eq!(balances.base, dec!(0.25));

        broker
            .execute(&MarketOrder::spot(OrderSide::Sell, dec!(0.2)))
            .await
            .unwrap();
        let balances = broker.balances().await.unwrap();
        // 499.5 + 400 − 0.4
        assert_eq!(balances.quote, dec!(899.1));
        assert_eq!(broker.account().await.order_count, 2);
    }

    #[tokio::test]
    async fn test_rejects_orders_beyond_balance() {
        let broker = broker_with(&[dec!(2000)], dec!(100), dec!(0.01));
        broker.current_price().await.unwrap();

        assert!(broker
            .execute(&MarketOrder::spot(OrderSide::Buy, dec!(1)))
            .await
            .is_err());
        assert!(broker
            .execute(&MarketOrder::spot(OrderSide::Sell, dec!(0.02)))
            .await
            .is_err());
        assert!(broker
            .execute(&MarketOrder::spot(OrderSide::Buy, Decimal::ZERO))
            .await
            .is_err());

        let account = broker.account().await;
        assert_eq!(account.quote, dec!(100));
        assert_eq!(account.order_count, 0);
    }

    #[tokio::test]
    async fn test_no_fill_without_price() {
        let broker = broker_with(&[Decimal::ZERO], dec!(1000), Decimal::ZERO);

        // A zero quote is treated as no quote
        assert_eq!(broker.current_price().await.unwrap(), None);
        assert!(broker
            .execute(&MarketOrder::futures(OrderSide::Sell, dec!(0.1)))
            .await
            .is_err());
        // Feed exhausted
        assert_eq!(broker.current_price().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_futures_short_round_trip() {
        let broker = broker_with(&[dec!(2000), dec!(1900)], dec!(1000), Decimal::ZERO);

        broker.current_price().await.unwrap();
        let open = broker
            .execute(&MarketOrder::futures(OrderSide::Sell, dec!(0.5)))
            .await
            .unwrap();
        // 0.5 × 2000 × 0.0004
        assert_eq!(open.fee, dec!(0.4));

        let account = broker.account().await;
        assert_eq!(account.futures_position, dec!(-0.5));
        assert_eq!(account.futures_entry_price, dec!(2000));

        broker.current_price().await.unwrap();
        broker
            .execute(&MarketOrder::futures(OrderSide::Buy, dec!(0.5)))
            .await
            .unwrap();

        let account = broker.account().await;
        assert_eq!(account.futures_position, Decimal::ZERO);
        // 0.5 × (2000 − 1900)
        assert_eq!(account.futures_realized_pnl, dec!(50));
        // 1000 − 0.4 + 50 − 0.38
        assert_eq!(account.quote, dec!(1049.22));
        assert_eq!(account.total_fees, dec!(0.78));
    }

    #[tokio::test]
    async fn test_futures_adds_average_entry() {
        let broker = broker_with(&[dec!(2000), dec!(1800)], dec!(1000), Decimal::ZERO);

        broker.current_price().await.unwrap();
        broker
            .execute(&MarketOrder::futures(OrderSide::Sell, dec!(1)))
            .await
            .unwrap();
        broker.current_price().await.unwrap();
        broker
            .execute(&MarketOrder::futures(OrderSide::Sell, dec!(1)))
            .await
            .unwrap();

        let account = broker.account().await;
        assert_eq!(account.futures_position, dec!(-2));
        assert_eq!(account.futures_entry_price, dec!(1900));
    }
}
