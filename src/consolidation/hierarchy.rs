//! Location → period → totals nesting.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::numeric::{parse_numeric, Numeric, Sum};
use crate::shard::Row;

/// Bucket for rows whose date cannot be read.
pub const UNKNOWN_PERIOD: &str = "sin_periodo";

/// Bucket for rows without a location value.
pub const UNKNOWN_LOCATION: &str = "sin_ubicacion";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeriodTotals {
    pub totals: BTreeMap<String, Value>,
    pub record_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchicalReport {
    pub location_field: String,
    /// location → `YYYY-MM` (or [`UNKNOWN_PERIOD`]) → totals.
    pub locations: BTreeMap<String, BTreeMap<String, PeriodTotals>>,
}

impl HierarchicalReport {
    pub fn period(&self, location: &str, period: &str) -> Option<&PeriodTotals> {
        self.locations.get(location)?.get(period)
    }
}

/// Normalise a date-like value to `YYYY-MM`. Accepts `DD/MM/YYYY`,
/// `YYYY-MM-DD` (optionally followed by a time) and `YYYY-MM`.
pub fn period_of(value: &Value) -> Option<String> {
    let Value::String(raw) = value else {
        return None;
    };
    let raw = raw.trim();
    let date_part = raw
        .split(|c: char| c == 'T' || c.is_whitespace())
        .next()
        .unwrap_or(raw);

    let parsed = NaiveDate::parse_from_str(date_part, "%d/%m/%Y")
        .or_else(|_| NaiveDate::parse_from_str(date_part, "%Y-%m-%d"))
        .ok()
        .or_else(|| {
            (date_part.len() == 7)
                .then(|| NaiveDate::parse_from_str(&format!("{date_part}-01"), "%Y-%m-%d").ok())
                .flatten()
        })?;
    Some(parsed.format("%Y-%m").to_string())
}

fn year_month(row: &Row) -> Option<String> {
    let year = row.get("anio").and_then(parse_numeric)?;
    let month = row.get("mes").and_then(parse_numeric)?;
    let (Numeric::Int(y), Numeric::Int(m)) = (year, month) else {
        return None;
    };
    let date = NaiveDate::from_ymd_opt(i32::try_from(y).ok()?, u32::try_from(m).ok()?, 1)?;
    Some(date.format("%Y-%m").to_string())
}

fn row_period(row: &Row, period_fields: &[String]) -> String {
    period_fields
        .iter()
        .filter_map(|field| row.get(field))
        .find_map(period_of)
        .or_else(|| year_month(row))
        .unwrap_or_else(|| UNKNOWN_PERIOD.to_string())
}

/// Nest `rows` by `location_field`, then by the first readable period among
/// `period_fields` (or `anio` + `mes`), summing `numeric_fields`.
pub fn consolidate_hierarchical(
    rows: &[Row],
    location_field: &str,
    period_fields: &[String],
    numeric_fields: &[String],
) -> HierarchicalReport {
    let mut sums: BTreeMap<String, BTreeMap<String, (Vec<Sum>, u64)>> = BTreeMap::new();
    let mut unknown_periods = 0usize;

    for row in rows {
        let location = match row.get(location_field) {
            None | Some(Value::Null) => UNKNOWN_LOCATION.to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };
        let period = row_period(row, period_fields);
        if period == UNKNOWN_PERIOD {
            unknown_periods += 1;
        }

        let (totals, count) = sums
            .entry(location)
            .or_default()
            .entry(period)
            .or_insert_with(|| (vec![Sum::default(); numeric_fields.len()], 0));
        for (field, sum) in numeric_fields.iter().zip(totals.iter_mut()) {
            if let Some(n) = row.get(field).and_then(parse_numeric) {
                sum.add(n);
            }
        }
        *count += 1;
    }

    if unknown_periods > 0 {
        log::debug!("{unknown_periods} row(s) without a readable period in {UNKNOWN_PERIOD}");
    }

    let locations = sums
        .into_iter()
        .map(|(location, periods)| {
            let periods = periods
                .into_iter()
                .map(|(period, (totals, record_count))| {
                    let totals = numeric_fields
                        .iter()
                        .cloned()
                        .zip(totals.into_iter().map(Sum::to_value))
                        .collect();
                    (
                        period,
                        PeriodTotals {
                            totals,
                            record_count,
                        },
                    )
                })
                .collect();
            (location, periods)
        })
        .collect();

    HierarchicalReport {
        location_field: location_field.to_string(),
        locations,
    }
}
