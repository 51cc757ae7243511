//! Merging per-shard row sets and folding them into grouped totals.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::mem;

use super::hierarchy::{consolidate_hierarchical, HierarchicalReport};
use super::numeric::{detect_numeric_fields, field_names, parse_numeric, NumericSampling, Sum};
use super::ConsolidationPlan;
use crate::classify::{classify_field, FieldType};
use crate::config::EngineConfig;
use crate::shard::{Row, ShardRows};

/// Field added to every merged row naming its origin shard.
pub const SHARD_FIELD: &str = "_shard";

const KEY_SEPARATOR: &str = "|";

/// One output group: grouping values from the first row seen for the key
/// (as text when rows mix JSON types for it), then one summed value per
/// numeric field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedRow {
    pub values: Row,
    /// Input rows folded into this group.
    pub record_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationOutcome {
    /// Grouped rows, or the input rows unchanged when `consolidated` is false.
    pub rows: Vec<ConsolidatedRow>,
    pub consolidated: bool,
    pub grouping_fields: Vec<String>,
    pub numeric_fields: Vec<String>,
    pub input_rows: usize,
    /// Numeric cells that could not be parsed and contributed nothing.
    pub skipped_values: usize,
}

impl ConsolidationOutcome {
    fn passthrough(rows: &[Row]) -> Self {
        Self {
            rows: rows
                .iter()
                .map(|row| ConsolidatedRow {
                    values: row.clone(),
                    record_count: 1,
                })
                .collect(),
            consolidated: false,
            grouping_fields: Vec::new(),
            numeric_fields: Vec::new(),
            input_rows: rows.len(),
            skipped_values: 0,
        }
    }
}

/// Trim, collapse inner whitespace and upper-case a shard identity value so
/// `" buenos  aires"` and `"Buenos Aires"` group together.
pub fn normalize_identity_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase()
}

/// Concatenate shard results in shard order, tagging each row with
/// [`SHARD_FIELD`] and normalising `identity_fields`. Input rows are copied.
pub fn merge_shard_rows(results: &[ShardRows], identity_fields: &[String]) -> Vec<Row> {
    let mut merged = Vec::with_capacity(results.iter().map(|r| r.rows.len()).sum());
    for result in results {
        for row in &result.rows {
            let mut row = row.clone();
            for field in identity_fields {
                if let Some(Value::String(s)) = row.get_mut(field) {
                    *s = normalize_identity_value(s);
                }
            }
            row.insert(
                SHARD_FIELD.to_string(),
                Value::String(result.shard.to_string()),
            );
            merged.push(row);
        }
    }
    merged
}

fn key_part(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

struct Group {
    values: Row,
    sums: Vec<Sum>,
    record_count: u64,
}

pub struct Consolidator {
    sampling: NumericSampling,
}

impl Default for Consolidator {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl Consolidator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            sampling: NumericSampling {
                sample_size: config.numeric_sample_size,
                min_samples: config.numeric_min_samples,
                ratio: config.numeric_ratio,
            },
        }
    }

    /// Consolidate using the plan's fields when they occur in `rows`,
    /// otherwise fields inferred from the rows. Returns the rows unchanged
    /// when nothing can be grouped or summed.
    pub fn consolidate(&self, rows: &[Row], plan: Option<&ConsolidationPlan>) -> ConsolidationOutcome {
        let (grouping, numeric) = self.resolve_fields(rows, plan);
        if grouping.is_empty() && numeric.is_empty() {
            log::debug!("no consolidation fields for {} row(s), returning raw rows", rows.len());
            return ConsolidationOutcome::passthrough(rows);
        }
        self.consolidate_with(rows, &grouping, &numeric)
    }

    /// Fold `rows` by the pipe-joined values of `grouping`, summing `numeric`.
    /// Groups keep first-seen order.
    pub fn consolidate_with(&self, rows: &[Row], grouping: &[String], numeric: &[String]) -> ConsolidationOutcome {
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<Group> = Vec::new();
        let mut skipped_values = 0usize;

        for row in rows {
            let key = grouping
                .iter()
                .map(|field| key_part(row.get(field)))
                .collect::<Vec<_>>()
                .join(KEY_SEPARATOR);

            let slot = *index.entry(key).or_insert_with(|| {
                let mut values = Row::new();
                for field in grouping {
                    values.insert(field.clone(), row.get(field).cloned().unwrap_or(Value::Null));
                }
                groups.push(Group {
                    values,
                    sums: vec![Sum::default(); numeric.len()],
                    record_count: 0,
                });
                groups.len() - 1
            });
            let group = &mut groups[slot];

            // `5` and `"5"` share a key; a group that sees both keeps the text form.
            let null = Value::Null;
            for field in grouping {
                let incoming = row.get(field).unwrap_or(&null);
                if let Some(current) = group.values.get_mut(field) {
                    if mem::discriminant(current) != mem::discriminant(incoming) {
                        *current = Value::String(key_part(Some(incoming)));
                    }
                }
            }

            for (field, sum) in numeric.iter().zip(group.sums.iter_mut()) {
                match row.get(field) {
                    None | Some(Value::Null) => {}
                    Some(value) => match parse_numeric(value) {
                        Some(n) => sum.add(n),
                        None => {
                            skipped_values += 1;
                            log::debug!("skipping non-numeric value {value} in field {field}");
                        }
                    },
                }
            }
            group.record_count += 1;
        }

        if skipped_values > 0 {
            log::warn!("consolidation skipped {skipped_values} unparseable numeric value(s)");
        }

        let rows_out = groups
            .into_iter()
            .map(|group| {
                let mut values = group.values;
                for (field, sum) in numeric.iter().zip(group.sums) {
                    values.insert(field.clone(), sum.to_value());
                }
                ConsolidatedRow {
                    values,
                    record_count: group.record_count,
                }
            })
            .collect::<Vec<_>>();

        log::debug!(
            "consolidated {} row(s) into {} group(s) on [{}]",
            rows.len(),
            rows_out.len(),
            grouping.join(", ")
        );

        ConsolidationOutcome {
            rows: rows_out,
            consolidated: true,
            grouping_fields: grouping.to_vec(),
            numeric_fields: numeric.to_vec(),
            input_rows: rows.len(),
            skipped_values,
        }
    }

    /// Location → `YYYY-MM` → totals over `rows`. `None` when no location
    /// field can be found.
    pub fn consolidate_hierarchical(
        &self,
        rows: &[Row],
        plan: Option<&ConsolidationPlan>,
    ) -> Option<HierarchicalReport> {
        let present = field_names(rows);
        let location = plan
            .and_then(|p| p.location_fields.iter().find(|f| present.contains(f)).cloned())
            .or_else(|| {
                present
                    .iter()
                    .find(|f| classify_field(f) == FieldType::Location)
                    .cloned()
            })?;

        let mut period_fields: Vec<String> = plan
            .map(|p| {
                p.time_fields
                    .iter()
                    .filter(|f| present.contains(f))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for field in &present {
            if classify_field(field) == FieldType::Time && !period_fields.contains(field) {
                period_fields.push(field.clone());
            }
        }

        let (_, numeric) = self.resolve_fields(rows, plan);
        let numeric: Vec<String> = numeric
            .into_iter()
            .filter(|f| *f != location && !period_fields.contains(f))
            .collect();

        Some(consolidate_hierarchical(rows, &location, &period_fields, &numeric))
    }

    fn resolve_fields(&self, rows: &[Row], plan: Option<&ConsolidationPlan>) -> (Vec<String>, Vec<String>) {
        let present = field_names(rows);

        if let Some(plan) = plan.filter(|p| p.is_consolidable) {
            let keep = |fields: &[String]| -> Vec<String> {
                fields.iter().filter(|f| present.contains(f)).cloned().collect()
            };
            let grouping = keep(&plan.grouping_fields);
            let numeric = keep(&plan.numeric_fields);
            if !grouping.is_empty() || !numeric.is_empty() {
                return (grouping, numeric);
            }
            log::debug!("plan fields absent from result rows, inferring from data");
        }

        let grouping: Vec<String> = present
            .iter()
            .filter(|f| f.as_str() != SHARD_FIELD && classify_field(f).is_grouping())
            .cloned()
            .collect();
        let numeric = detect_numeric_fields(rows, &grouping, &self.sampling);
        (grouping, numeric)
    }
}
