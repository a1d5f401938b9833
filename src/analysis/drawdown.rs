//! Equity drawdown tracking for status reports.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::VecDeque;
use tracing::warn;

/// A single equity observation.
#[derive(Debug, Clone)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
}

/// Tracks peak equity and drawdown from it.
pub struct DrawdownTracker {
    /// Drawdown (e.g., 0.10 for 10%) that counts as a breach
    max_drawdown: Decimal,
    peak_equity: Decimal,
    current_drawdown: Decimal,
    /// Worst drawdown seen since the tracker started
    session_mdd: Decimal,
    /// Rolling window of observations
    history: VecDeque<EquityPoint>,
    max_history: usize,
}

impl DrawdownTracker {
    pub fn new(max_drawdown: Decimal, initial_equity: Decimal, at: DateTime<Utc>) -> Self {
        let mut history = VecDeque::new();
        history.push_back(EquityPoint {
            timestamp: at,
            equity: initial_equity,
        });

        Self {
            max_drawdown,
            peak_equity: initial_equity,
            current_drawdown: Decimal::ZERO,
            session_mdd: Decimal::ZERO,
            history,
            max_history: 1000,
        }
    }

    /// Record an equity value.
    ///
    /// Returns true if drawdown is at or beyond the configured maximum.
    pub fn update(&mut self, equity: Decimal, at: DateTime<Utc>) -> bool {
        if equity > self.peak_equity {
            self.peak_equity = equity;
            self.current_drawdown = Decimal::ZERO;
        } else if self.peak_equity > Decimal::ZERO {
            self.current_drawdown = (self.peak_equity - equity) / self.peak_equity;

            if self.current_drawdown > self.session_mdd {
                self.session_mdd = self.current_drawdown;
                warn!(
                    mdd = %self.session_mdd,
                    peak = %self.peak_equity,
                    current = %equity,
                    "New maximum drawdown recorded"
                );
            }
        }

        self.history.push_back(EquityPoint {
            timestamp: at,
            equity,
        });
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }

        self.current_drawdown >= self.max_drawdown
    }

    pub fn current_drawdown(&self) -> Decimal {
        self.current_drawdown
    }

    pub fn session_mdd(&self) -> Decimal {
        self.session_mdd
    }

    pub fn peak_equity(&self) -> Decimal {
        self.peak_equity
    }

    pub fn statistics(&self) -> DrawdownStats {
        let current_equity = self.history.back().map(|p| p.equity).unwrap_or_default();
        let min_equity = self
            .history
            .iter()
            .map(|p| p.equity)
            .min()
            .unwrap_or_default();

        DrawdownStats {
            peak_equity: self.peak_equity,
            current_equity,
            min_equity,
            current_drawdown: self.current_drawdown,
            session_mdd: self.session_mdd,
            observations: self.history.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DrawdownStats {
    pub peak_equity: Decimal,
    pub current_equity: Decimal,
    pub min_equity: Decimal,
    pub current_drawdown: Decimal,
    pub session_mdd: Decimal,
    pub observations: usize,
}
