//! Cross-shard consolidation: static plans, row merging and grouped sums.

pub mod hierarchy;
pub mod merge;
pub mod numeric;

pub use hierarchy::{
    consolidate_hierarchical, period_of, HierarchicalReport, PeriodTotals, UNKNOWN_LOCATION,
    UNKNOWN_PERIOD,
};
pub use merge::{
    merge_shard_rows, normalize_identity_value, ConsolidatedRow, ConsolidationOutcome,
    Consolidator, SHARD_FIELD,
};
pub use numeric::{detect_numeric_fields, parse_numeric, NumericSampling};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::classify::{classify_field, FieldType};
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::pagination::validate_sql;
use crate::sql::{
    group_by_entries, normalize_field_name, split_top_level_fields, ClauseExtractor,
    PatternExtractor, RECORD_COUNT_FIELD, TOTAL_SUFFIX,
};
use crate::volume::{VolumeDecision, VolumeStrategy};

/// Bumped whenever analysis rules change; cached plans from another version
/// are stale.
pub const ANALYZER_VERSION: u32 = 1;

const RAW_CONFIDENCE: f64 = 0.6;
const PRE_AGGREGATED_CONFIDENCE: f64 = 0.8;
const PARTIAL_COUNT_CONFIDENCE: f64 = 0.7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationPlan {
    pub grouping_fields: Vec<String>,
    pub numeric_fields: Vec<String>,
    pub location_fields: Vec<String>,
    pub time_fields: Vec<String>,
    pub field_type_map: BTreeMap<String, FieldType>,
    pub is_consolidable: bool,
    pub is_pre_aggregated: bool,
    /// Set once real shard counts are known; pre-aggregated plans never get one.
    pub volume_strategy: Option<VolumeStrategy>,
    pub estimated_or_actual_row_count: Option<u64>,
    pub confidence: f64,
    pub explanation: String,
}

impl ConsolidationPlan {
    fn not_consolidable(explanation: impl Into<String>) -> Self {
        Self {
            grouping_fields: Vec::new(),
            numeric_fields: Vec::new(),
            location_fields: Vec::new(),
            time_fields: Vec::new(),
            field_type_map: BTreeMap::new(),
            is_consolidable: false,
            is_pre_aggregated: false,
            volume_strategy: None,
            estimated_or_actual_row_count: None,
            confidence: 0.0,
            explanation: explanation.into(),
        }
    }

    /// Refine a static plan with real per-shard counts.
    pub fn with_volume(mut self, decision: &VolumeDecision) -> Self {
        self.volume_strategy = Some(decision.strategy);
        self.estimated_or_actual_row_count = Some(decision.total_rows);
        self.confidence = if decision.failed_shards.is_empty() {
            1.0
        } else {
            PARTIAL_COUNT_CONFIDENCE
        };
        self.explanation = format!(
            "{}; volume {}: {}",
            self.explanation, decision.strategy, decision.explanation
        );
        self
    }

    /// Field names to sum in rows produced by the forced-aggregation rewrite.
    pub fn forced_numeric_fields(&self) -> Vec<String> {
        self.numeric_fields
            .iter()
            .map(|f| format!("{f}{TOTAL_SUFFIX}"))
            .chain(std::iter::once(RECORD_COUNT_FIELD.to_string()))
            .collect()
    }
}

/// Builds [`ConsolidationPlan`]s from SQL text alone.
pub struct ConsolidationAnalyzer {
    extractor: Box<dyn ClauseExtractor>,
    max_sql_length: usize,
}

impl Default for ConsolidationAnalyzer {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl ConsolidationAnalyzer {
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_extractor(config, Box::new(PatternExtractor::new()))
    }

    pub fn with_extractor(config: &EngineConfig, extractor: Box<dyn ClauseExtractor>) -> Self {
        Self {
            extractor,
            max_sql_length: config.max_sql_length,
        }
    }

    pub fn analyze(&self, sql: &str) -> EngineResult<ConsolidationPlan> {
        validate_sql(sql, self.max_sql_length)?;

        let Some(select) = self.extractor.select_clause(sql) else {
            return Ok(ConsolidationPlan::not_consolidable(
                "No SELECT/FROM pair found; not consolidable",
            ));
        };

        let mut select_names: Vec<String> = Vec::new();
        for item in split_top_level_fields(&select) {
            let name = normalize_field_name(&item);
            if !name.is_empty() && !select_names.contains(&name) {
                select_names.push(name);
            }
        }

        let pre_aggregated =
            self.extractor.group_by_clause(sql).is_some() && self.extractor.has_aggregate_call(sql);

        let mut field_type_map = BTreeMap::new();
        for name in &select_names {
            field_type_map.insert(name.clone(), classify_field(name));
        }

        let (grouping_fields, numeric_fields, confidence) = if pre_aggregated {
            let mut grouping: Vec<String> = Vec::new();
            for entry in group_by_entries(self.extractor.as_ref(), sql) {
                if !grouping.contains(&entry.name) {
                    field_type_map
                        .entry(entry.name.clone())
                        .or_insert_with(|| classify_field(&entry.name));
                    grouping.push(entry.name);
                }
            }
            let numeric: Vec<String> = select_names
                .iter()
                .filter(|n| !grouping.contains(n))
                .filter(|n| field_type_map.get(*n) == Some(&FieldType::NumericSummable))
                .cloned()
                .collect();
            (grouping, numeric, PRE_AGGREGATED_CONFIDENCE)
        } else {
            let grouping: Vec<String> = select_names
                .iter()
                .filter(|n| field_type_map.get(*n).is_some_and(|t| t.is_grouping()))
                .cloned()
                .collect();
            let numeric: Vec<String> = select_names
                .iter()
                .filter(|n| field_type_map.get(*n) == Some(&FieldType::NumericSummable))
                .cloned()
                .collect();
            (grouping, numeric, RAW_CONFIDENCE)
        };

        let of_type = |wanted: FieldType| -> Vec<String> {
            grouping_fields
                .iter()
                .filter(|n| field_type_map.get(*n) == Some(&wanted))
                .cloned()
                .collect()
        };
        let location_fields = of_type(FieldType::Location);
        let time_fields = of_type(FieldType::Time);

        let is_consolidable = !grouping_fields.is_empty() || !numeric_fields.is_empty();
        let ignored = select_names.len().saturating_sub(grouping_fields.len() + numeric_fields.len());
        let explanation = if is_consolidable {
            format!(
                "{} query; grouping on [{}], summing [{}], {ignored} field(s) ignored as detail",
                if pre_aggregated { "Pre-aggregated" } else { "Raw" },
                grouping_fields.join(", "),
                numeric_fields.join(", ")
            )
        } else {
            "No grouping or numeric fields recognised; not consolidable".to_string()
        };

        log::debug!(
            "consolidation plan consolidable={is_consolidable} pre_aggregated={pre_aggregated} grouping={grouping_fields:?} numeric={numeric_fields:?}"
        );

        Ok(ConsolidationPlan {
            grouping_fields,
            numeric_fields,
            location_fields,
            time_fields,
            field_type_map,
            is_consolidable,
            is_pre_aggregated: pre_aggregated,
            volume_strategy: None,
            estimated_or_actual_row_count: None,
            confidence: if is_consolidable { confidence } else { 0.0 },
            explanation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn analyze(sql: &str) -> ConsolidationPlan {
        ConsolidationAnalyzer::default().analyze(sql).unwrap()
    }

    #[test]
    fn raw_query_groups_by_dimension_fields() {
        let plan = analyze(
            "SELECT i.id, p.nombre AS provincia, i.fecha_infraccion, i.id_estado, \
             i.monto AS monto_total, i.observaciones FROM infracciones i JOIN provincias p ON p.id = i.id_provincia",
        );
        assert!(plan.is_consolidable);
        assert!(!plan.is_pre_aggregated);
        assert_eq!(
            plan.grouping_fields,
            vec!["provincia", "fecha_infraccion", "id_estado"]
        );
        assert_eq!(plan.numeric_fields, vec!["monto_total"]);
        assert_eq!(plan.location_fields, vec!["provincia"]);
        assert_eq!(plan.time_fields, vec!["fecha_infraccion"]);
        assert_eq!(plan.field_type_map["observaciones"], FieldType::Detail);
        assert_eq!(plan.confidence, RAW_CONFIDENCE);
        assert_eq!(plan.volume_strategy, None);
    }

    #[test]
    fn pre_aggregated_query_uses_group_by() {
        let plan = analyze(
            "SELECT provincia, mes, SUM(total) AS total FROM reportes GROUP BY provincia, mes",
        );
        assert!(plan.is_pre_aggregated);
        assert_eq!(plan.grouping_fields, vec!["provincia", "mes"]);
        assert_eq!(plan.numeric_fields, vec!["total"]);
        assert_eq!(plan.confidence, PRE_AGGREGATED_CONFIDENCE);
    }

    #[test]
    fn grouping_and_numeric_are_disjoint() {
        let plan = analyze(
            "SELECT cantidad_tipo, COUNT(*) AS total FROM t GROUP BY cantidad_tipo",
        );
        assert_eq!(plan.grouping_fields, vec!["cantidad_tipo"]);
        assert_eq!(plan.numeric_fields, vec!["total"]);
        for field in &plan.grouping_fields {
            assert!(!plan.numeric_fields.contains(field));
        }
    }

    #[test]
    fn detail_only_query_is_not_consolidable() {
        let plan = analyze("SELECT nombre, apellido FROM personas");
        assert!(!plan.is_consolidable);
        assert_eq!(plan.confidence, 0.0);
    }

    #[test]
    fn missing_select_is_not_consolidable() {
        assert!(!analyze("VACUUM").is_consolidable);
    }

    #[test]
    fn empty_sql_is_invalid() {
        let err = ConsolidationAnalyzer::default().analyze(" ").unwrap_err();
        assert!(err.is_invalid_input());
    }

    #[test]
    fn real_counts_raise_confidence() {
        let plan = analyze("SELECT provincia, monto FROM t");
        let decision = crate::volume::VolumeDecider::default()
            .decide(&[crate::volume::ShardCount::counted("a", 120)]);
        let plan = plan.with_volume(&decision);
        assert_eq!(plan.volume_strategy, Some(VolumeStrategy::RawInMemory));
        assert_eq!(plan.estimated_or_actual_row_count, Some(120));
        assert_eq!(plan.confidence, 1.0);
        assert_eq!(
            plan.forced_numeric_fields(),
            vec!["monto_total".to_string(), "cantidad_registros".to_string()]
        );
    }
}
