//! Price series for offline replays.
//!
//! One sample per line, either a bare price or `timestamp,price`. Blank
//! lines and `#` comments are skipped, as is a header on the first line.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricePoint {
    pub timestamp: Option<DateTime<Utc>>,
    pub price: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct PriceSeries {
    points: Vec<PricePoint>,
}

impl PriceSeries {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read price file: {}", path.display()))?;

        Self::from_content(&content)
    }

    pub fn from_content(content: &str) -> Result<Self> {
        let mut points = Vec::new();
        let mut first_row = true;

        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let is_header = first_row && !line.starts_with(|c: char| c.is_ascii_digit());
            first_row = false;
            if is_header {
                continue;
            }

            let point = parse_line(line)
                .with_context(|| format!("Failed to parse line {}: {}", line_num + 1, line))?;
            points.push(point);
        }

        if points.is_empty() {
            anyhow::bail!("Price file contains no samples");
        }

        Ok(Self { points })
    }

    pub fn points(&self) -> &[PricePoint] {
        &self.points
    }

    pub fn prices(&self) -> impl Iterator<Item = Decimal> + '_ {
        self.points.iter().map(|p| p.price)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

fn parse_line(line: &str) -> Result<PricePoint> {
    let (timestamp, price) = match line.split_once(',') {
        Some((ts, price)) => (Some(parse_timestamp(ts.trim())?), price),
        None => (None, line),
    };

    let price: Decimal = price
        .trim()
        .parse()
        .with_context(|| format!("Invalid price: {}", price))?;
    anyhow::ensure!(price > Decimal::ZERO, "Price must be positive, got {}", price);

    Ok(PricePoint { timestamp, price })
}

/// RFC 3339, or a Unix epoch in seconds or milliseconds.
fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(epoch) = value.parse::<i64>() {
        let parsed = if epoch.abs() >= 100_000_000_000 {
            DateTime::from_timestamp_millis(epoch)
        } else {
            DateTime::from_timestamp(epoch, 0)
        };
        return parsed.with_context(|| format!("Timestamp out of range: {}", value));
    }

    value
        .parse::<DateTime<Utc>>()
        .with_context(|| format!("Invalid timestamp: {}", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn test_bare_prices() {
        let series = PriceSeries::from_content("3607.85\n\n3550\n# dip\n3300.5\n").unwrap();

        assert_eq!(series.len(), 3);
        assert_eq!(
            series.prices().collect::<Vec<_>>(),
            vec![dec!(3607.85), dec!(3550), dec!(3300.5)]
        );
        assert!(series.points().iter().all(|p| p.timestamp.is_none()));
    }

    #[test]
    fn test_timestamped_prices_with_header() {
        let csv = "timestamp,price\n2024-01-01T00:00:00Z,2300.25\n1704067210,2299\n1704067220000,2298.5\n";
        let series = PriceSeries::from_content(csv).unwrap();

        let points = series.points();
        assert_eq!(points.len(), 3);
        assert_eq!(
            points[0].timestamp,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(
            points[1].timestamp,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 10).unwrap())
        );
        assert_eq!(
            points[2].timestamp,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 20).unwrap())
        );
        assert_eq!(points[2].price, dec!(2298.5));
    }

    #[test]
    fn test_rejects_bad_rows() {
        assert!(PriceSeries::from_content("").is_err());
        assert!(PriceSeries::from_content("price\n").is_err());
        assert!(PriceSeries::from_content("100\nabc\n").is_err());
        assert!(PriceSeries::from_content("100\n-5\n").is_err());
        assert!(PriceSeries::from_content("yesterday,100\n").is_err());
    }
}
