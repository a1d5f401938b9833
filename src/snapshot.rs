//! Flat, serializable record of the strategy state.
//!
//! Every `State` field maps to one column-like field; timestamps are RFC 3339
//! strings and the status is its string tag, so the record can be stored
//! anywhere a flat map fits.

use crate::strategy::{HedgeLeg, OpenHedge, State, StrategyStatus, UnknownStatus};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("invalid timestamp for {field}: {source}")]
    Timestamp {
        field: &'static str,
        #[source]
        source: chrono::ParseError,
    },

    #[error(transparent)]
    Status(#[from] UnknownStatus),

    #[error("{tier}: active flag {active} does not match entry time presence")]
    EntryMismatch { tier: &'static str, active: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub deposit: Decimal,
    pub upper: Decimal,
    pub lower: Decimal,
    pub buffer: Decimal,
    pub initial_eth: Decimal,
    pub current_eth: Decimal,
    pub current_usd: Decimal,

    pub h1_level: Decimal,
    pub h1_size: Decimal,
    pub h1_active: bool,
    pub h1_entry_price: Decimal,
    pub h1_entry_time: Option<String>,

    pub h2_level: Decimal,
    pub h2_size: Decimal,
    pub h2_active: bool,
    pub h2_entry_price: Decimal,
    pub h2_entry_time: Option<String>,

    pub h3_level: Decimal,
    pub h3_size: Decimal,
    pub h3_active: bool,
    pub h3_entry_price: Decimal,
    pub h3_entry_time: Option<String>,

    pub total_spot_volume: Decimal,
    pub total_futures_volume: Decimal,
    pub status: String,
}

struct LegColumns {
    level: Decimal,
    size: Decimal,
    active: bool,
    entry_price: Decimal,
    entry_time: Option<String>,
}

impl From<&HedgeLeg> for LegColumns {
    fn from(leg: &HedgeLeg) -> Self {
        Self {
            level: leg.level,
            size: leg.size,
            active: leg.is_active(),
            entry_price: leg.entry_price(),
            entry_time: leg.entry_time().map(|t| t.to_rfc3339()),
        }
    }
}

impl LegColumns {
    fn into_leg(self, tier: &'static str, time_field: &'static str) -> Result<HedgeLeg, SnapshotError> {
        let position = match (self.active, self.entry_time) {
            (true, Some(ts)) => Some(OpenHedge {
                entry_price: self.entry_price,
                entry_time: parse_time(time_field, &ts)?,
            }),
            (false, None) => None,
            (active, _) => return Err(SnapshotError::EntryMismatch { tier, active }),
        };

        Ok(HedgeLeg {
            level: self.level,
            size: self.size,
            position,
        })
    }
}

fn parse_time(field: &'static str, value: &str) -> Result<DateTime<Utc>, SnapshotError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| SnapshotError::Timestamp { field, source })
}

/// Flatten a state into its external record.
pub fn to_snapshot(state: &State) -> StateSnapshot {
    let [h1, h2, h3] = state.legs.each_ref().map(LegColumns::from);

    StateSnapshot {
        entry_price: state.entry_price,
        current_price: state.current_price,
        deposit: state.deposit,
        upper: state.upper,
        lower: state.lower,
        buffer: state.buffer,
        initial_eth: state.initial_eth,
        current_eth: state.current_eth,
        current_usd: state.current_usd,

        h1_level: h1.level,
        h1_size: h1.size,
        h1_active: h1.active,
        h1_entry_price: h1.entry_price,
        h1_entry_time: h1.entry_time,

        h2_level: h2.level,
        h2_size: h2.size,
        h2_active: h2.active,
        h2_entry_price: h2.entry_price,
        h2_entry_time: h2.entry_time,

        h3_level: h3.level,
        h3_size: h3.size,
        h3_active: h3.active,
        h3_entry_price: h3.entry_price,
        h3_entry_time: h3.entry_time,

        total_spot_volume: state.total_spot_volume,
        total_futures_volume: state.total_futures_volume,
        status: state.status.as_str().to_string(),
    }
}

/// Rebuild a state from its external record.
pub fn from_snapshot(record: &StateSnapshot) -> Result<State, SnapshotError> {
    let h1 = LegColumns {
        level: record.h1_level,
        size: record.h1_size,
        active: record.h1_active,
        entry_price: record.h1_entry_price,
        entry_time: record.h1_entry_time.clone(),
    }
    .into_leg("h1", "h1_entry_time")?;
    let h2 = LegColumns {
        level: record.h2_level,
        size: record.h2_size,
        active: record.h2_active,
        entry_price: record.h2_entry_price,
        entry_time: record.h2_entry_time.clone(),
    }
    .into_leg("h2", "h2_entry_time")?;
    let h3 = LegColumns {
        level: record.h3_level,
        size: record.h3_size,
        active: record.h3_active,
        entry_price: record.h3_entry_price,
        entry_time: record.h3_entry_time.clone(),
    }
    .into_leg("h3", "h3_entry_time")?;

    Ok(State {
        entry_price: record.entry_price,
        current_price: record.current_price,
        deposit: record.deposit,
        upper: record.upper,
        lower: record.lower,
        buffer: record.buffer,
        initial_eth: record.initial_eth,
        current_eth: record.current_eth,
        current_usd: record.current_usd,
        legs: [h1, h2, h3],
        total_spot_volume: record.total_spot_volume,
        total_futures_volume: record.total_futures_volume,
        status: record.status.parse::<StrategyStatus>()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyConfig;
    use crate::strategy::{HedgeTier, StrategyEngine};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn hedged_state() -> State {
        let engine = StrategyEngine::new(StrategyConfig::default());
        let mut state = engine.initialize(dec!(3607.85), dec!(1000)).unwrap();
        engine.recompute_hedge_sizes(&mut state).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 5, 2, 9, 30, 15).unwrap();
        engine.evaluate(&mut state, dec!(3480), at).unwrap();
        state
    }

    #[test]
    fn test_round_trip_preserves_state() {
        let state = hedged_state();
        assert!(state.is_active(HedgeTier::H1));

        let record = to_snapshot(&state);
        assert_eq!(record.status, "rebalancing");
        assert!(record.h1_active);
        assert_eq!(record.h1_entry_time.as_deref(), Some("2024-05-02T09:30:15+00:00"));
        assert_eq!(record.h3_entry_time, None);

        let restored = from_snapshot(&record).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn test_round_trip_through_json() {
        let state = hedged_state();
        let json = serde_json::to_string(&to_snapshot(&state)).unwrap();
        let record: StateSnapshot = serde_json::from_str(&json).unwrap();

        assert_eq!(from_snapshot(&record).unwrap(), state);
    }

    #[test]
    fn test_rejects_unknown_status() {
        let mut record = to_snapshot(&hedged_state());
        record.status = "paused".to_string();

        assert!(matches!(from_snapshot(&record), Err(SnapshotError::Status(_))));
    }

    #[test]
    fn test_rejects_active_leg_without_entry_time() {
        let mut record = to_snapshot(&hedged_state());
        record.h1_entry_time = None;

        assert!(matches!(
            from_snapshot(&record),
            Err(SnapshotError::EntryMismatch { tier: "h1", active: true })
        ));
    }

    #[test]
    fn test_rejects_malformed_timestamp() {
        let mut record = to_snapshot(&hedged_state());
        record.h1_entry_time = Some("yesterday".to_string());

        assert!(matches!(
            from_snapshot(&record),
            Err(SnapshotError::Timestamp { field: "h1_entry_time", .. })
        ));
    }
}
