//! Pagination strategy selection.
//!
//! One pure decision per query, in order:
//!
//! 1. Pre-aggregated (GROUP BY + aggregate call): `CompositeKeyset` on the
//!    grouping key when at least two GROUP BY fields resolve, otherwise
//!    `NoPagination`.
//! 2. Detect a row identifier (`<alias>.id [AS name]`) in the SELECT list.
//! 3. Detect well-known cursor candidates in SELECT order, keeping the first
//!    candidate per classified field type.
//! 4. Row identifier + >= 3 candidates: `KeysetWithId` on the first three.
//! 5. No row identifier + >= 3 candidates: `CompositeKeyset` on up to four,
//!    ordered TEXT < DATE/TIMESTAMP < INTEGER < BOOLEAN then by detection.
//! 6. Any candidate: `FallbackLimitOnly`.
//! 7. Otherwise: `Offset`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

use crate::classify::{classify_field, FieldType};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::sql::{
    group_by_entries, normalize_field_name, split_alias, split_top_level_fields,
    ClauseExtractor, PatternExtractor,
};

/// Maximum cursor fields for keyset strategies derived from detection.
const KEYSET_WITH_ID_FIELDS: usize = 3;
const COMPOSITE_KEYSET_FIELDS: usize = 4;
const MIN_CANDIDATES: usize = 3;

/// Prefix for bind-variable names used when resuming a page.
pub const CURSOR_PARAM_PREFIX: &str = "last_";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaginationStrategy {
    KeysetWithId,
    CompositeKeyset,
    FallbackLimitOnly,
    Offset,
    NoPagination,
}

impl fmt::Display for PaginationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PaginationStrategy::KeysetWithId => "KEYSET_WITH_ID",
            PaginationStrategy::CompositeKeyset => "COMPOSITE_KEYSET",
            PaginationStrategy::FallbackLimitOnly => "FALLBACK_LIMIT_ONLY",
            PaginationStrategy::Offset => "OFFSET",
            PaginationStrategy::NoPagination => "NO_PAGINATION",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeysetDataType {
    Text,
    Date,
    Timestamp,
    Integer,
    Boolean,
}

impl KeysetDataType {
    /// Sort rank for composite keysets; DATE and TIMESTAMP share a rank.
    pub fn sort_rank(&self) -> u8 {
        match self {
            KeysetDataType::Text => 0,
            KeysetDataType::Date | KeysetDataType::Timestamp => 1,
            KeysetDataType::Integer => 2,
            KeysetDataType::Boolean => 3,
        }
    }

    /// Best guess from a canonical field name.
    pub fn infer(name: &str) -> Self {
        let name = name.to_lowercase();
        if matches!(name.as_str(), "anio" | "mes" | "dia" | "semana") {
            return KeysetDataType::Integer;
        }
        if name.starts_with("es_") || name.starts_with("tiene_") || name.starts_with("is_") {
            return KeysetDataType::Boolean;
        }
        match classify_field(&name) {
            FieldType::Time if name.contains("hora") || name.contains("timestamp") => {
                KeysetDataType::Timestamp
            }
            FieldType::Time => KeysetDataType::Date,
            FieldType::NumericSummable => KeysetDataType::Integer,
            _ if name == "id" || name.starts_with("id_") || name.ends_with("_id") => {
                KeysetDataType::Integer
            }
            _ => KeysetDataType::Text,
        }
    }
}

/// A candidate cursor or grouping field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysetField {
    /// Qualified source expression, e.g. `i.fecha_infraccion`.
    pub sql_expression: String,
    /// Bind-variable name used when resuming pagination.
    pub parameter_name: String,
    pub data_type: KeysetDataType,
    /// Detection order; lower is selected first.
    pub priority: u32,
}

impl KeysetField {
    pub fn new(sql_expression: &str, name: &str, data_type: KeysetDataType, priority: u32) -> Self {
        Self {
            sql_expression: sql_expression.to_string(),
            parameter_name: format!("{CURSOR_PARAM_PREFIX}{name}"),
            data_type,
            priority,
        }
    }
}

/// The row identifier exposed by the SELECT list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowIdentifier {
    pub sql_expression: String,
    /// Result column name (the alias, or `id`).
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginationPlan {
    pub strategy: PaginationStrategy,
    pub has_row_identifier: bool,
    pub row_identifier: Option<RowIdentifier>,
    pub selected_fields: Vec<KeysetField>,
    pub rationale: String,
}

impl PaginationPlan {
    fn new(
        strategy: PaginationStrategy,
        row_identifier: Option<RowIdentifier>,
        selected_fields: Vec<KeysetField>,
        rationale: String,
    ) -> Self {
        Self {
            strategy,
            has_row_identifier: row_identifier.is_some(),
            row_identifier,
            selected_fields,
            rationale,
        }
    }

    /// Bind-parameter names in cursor order.
    pub fn parameter_names(&self) -> Vec<&str> {
        self.selected_fields
            .iter()
            .map(|f| f.parameter_name.as_str())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Candidate catalogue
// ---------------------------------------------------------------------------

/// Well-known cursor-worthy fields, in catalogue priority order.
struct Candidate {
    names: &'static [&'static str],
    data_type: KeysetDataType,
}

const CANDIDATES: &[Candidate] = &[
    Candidate {
        names: &["serie_equipo", "nro_serie", "numero_serie"],
        data_type: KeysetDataType::Text,
    },
    Candidate {
        names: &["id_tipo_infraccion", "tipo_infraccion_id"],
        data_type: KeysetDataType::Integer,
    },
    Candidate {
        names: &["fecha_infraccion", "fecha_hora_infraccion", "fecha_hora"],
        data_type: KeysetDataType::Timestamp,
    },
    Candidate {
        names: &["fecha"],
        data_type: KeysetDataType::Date,
    },
    Candidate {
        names: &["id_estado", "estado_id"],
        data_type: KeysetDataType::Integer,
    },
    Candidate {
        names: &["id_punto_control", "punto_control_id"],
        data_type: KeysetDataType::Integer,
    },
    Candidate {
        names: &["tiene_raw", "raw_blob", "es_raw"],
        data_type: KeysetDataType::Boolean,
    },
];

fn candidate_for(name: &str) -> Option<&'static Candidate> {
    CANDIDATES.iter().find(|c| c.names.contains(&name))
}

fn row_identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)^\s*([A-Za-z_]\w*)\s*\.\s*(?:id\b|"id")(?:\s+(?:AS\s+)?"?([A-Za-z_]\w*)"?)?\s*$"#,
        )
        .expect("valid row identifier regex")
    })
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// Chooses a pagination strategy from the shape of a SELECT statement.
pub struct PaginationSelector {
    extractor: Box<dyn ClauseExtractor>,
    max_sql_length: usize,
}

impl Default for PaginationSelector {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl PaginationSelector {
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_extractor(config, Box::new(PatternExtractor::new()))
    }

    pub fn with_extractor(config: &EngineConfig, extractor: Box<dyn ClauseExtractor>) -> Self {
        Self {
            extractor,
            max_sql_length: config.max_sql_length,
        }
    }

    /// Analyse `sql` and return a plan. Only invalid input is an error; every
    /// other query gets a plan, degrading to `Offset`.
    pub fn analyze(&self, sql: &str) -> EngineResult<PaginationPlan> {
        validate_sql(sql, self.max_sql_length)?;

        let plan = self.select_strategy(sql);
        log::debug!(
            "pagination strategy={} fields=[{}] rationale=\"{}\"",
            plan.strategy,
            plan.selected_fields
                .iter()
                .map(|f| f.sql_expression.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            plan.rationale
        );
        Ok(plan)
    }

    fn select_strategy(&self, sql: &str) -> PaginationPlan {
        let Some(select) = self.extractor.select_clause(sql) else {
            return PaginationPlan::new(
                PaginationStrategy::Offset,
                None,
                Vec::new(),
                "No SELECT/FROM pair found; falling back to OFFSET".to_string(),
            );
        };

        if self.extractor.group_by_clause(sql).is_some() && self.extractor.has_aggregate_call(sql)
        {
            return self.pre_aggregated_plan(sql);
        }

        let items = split_top_level_fields(&select);
        let row_identifier = detect_row_identifier(&items);
        let candidates = detect_candidates(&items);

        match (row_identifier.is_some(), candidates.len()) {
            (true, n) if n >= MIN_CANDIDATES => {
                let mut selected = candidates;
                selected.sort_by_key(|f| f.priority);
                selected.truncate(KEYSET_WITH_ID_FIELDS);
                let id_expression = row_identifier
                    .as_ref()
                    .map(|id| id.sql_expression.as_str())
                    .unwrap_or_default();
                let rationale = format!(
                    "Row identifier {id_expression} plus {n} cursor candidates; keyset on the {KEYSET_WITH_ID_FIELDS} highest-priority candidates"
                );
                PaginationPlan::new(
                    PaginationStrategy::KeysetWithId,
                    row_identifier,
                    selected,
                    rationale,
                )
            }
            (false, n) if n >= MIN_CANDIDATES => {
                let mut selected = candidates;
                selected.sort_by_key(|f| (f.data_type.sort_rank(), f.priority));
                selected.truncate(COMPOSITE_KEYSET_FIELDS);
                let rationale = format!(
                    "No row identifier; composite keyset on {} of {n} candidates ordered by type",
                    selected.len()
                );
                PaginationPlan::new(
                    PaginationStrategy::CompositeKeyset,
                    None,
                    selected,
                    rationale,
                )
            }
            (_, n) if n >= 1 => {
                let rationale = format!(
                    "Only {n} cursor candidate(s); paging by LIMIT with best-effort ordering, duplicates or gaps across pages are possible"
                );
                PaginationPlan::new(
                    PaginationStrategy::FallbackLimitOnly,
                    row_identifier,
                    candidates,
                    rationale,
                )
            }
            _ => PaginationPlan::new(
                PaginationStrategy::Offset,
                row_identifier,
                Vec::new(),
                "No cursor candidates found; falling back to OFFSET".to_string(),
            ),
        }
    }

    fn pre_aggregated_plan(&self, sql: &str) -> PaginationPlan {
        let entries: Vec<_> = group_by_entries(self.extractor.as_ref(), sql)
            .into_iter()
            .filter(|entry| entry.resolved)
            .collect();
        if entries.len() < 2 {
            return PaginationPlan::new(
                PaginationStrategy::NoPagination,
                None,
                Vec::new(),
                format!(
                    "Pre-aggregated query with {} resolvable GROUP BY field(s); result is small and not reliably pageable",
                    entries.len()
                ),
            );
        }

        let fields: Vec<KeysetField> = entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| {
                KeysetField::new(
                    &entry.expression,
                    &entry.name,
                    KeysetDataType::infer(&entry.name),
                    idx as u32 + 1,
                )
            })
            .collect();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();

        PaginationPlan::new(
            PaginationStrategy::CompositeKeyset,
            None,
            fields,
            format!(
                "Pre-aggregated query; rows are unique per grouping key [{}]",
                names.join(", ")
            ),
        )
    }
}

/// Reject empty, oversized or NUL-containing SQL.
pub(crate) fn validate_sql(sql: &str, max_len: usize) -> EngineResult<()> {
    if sql.trim().is_empty() {
        return Err(EngineError::invalid_input("SQL is empty"));
    }
    if sql.len() > max_len {
        return Err(EngineError::InvalidInput {
            reason: format!("SQL length {} exceeds the limit of {max_len}", sql.len()),
        });
    }
    if sql.contains('\0') {
        return Err(EngineError::invalid_input("SQL contains a NUL character"));
    }
    Ok(())
}

fn detect_row_identifier(items: &[String]) -> Option<RowIdentifier> {
    items.iter().find_map(|item| {
        let caps = row_identifier_re().captures(item)?;
        let alias = caps
            .get(2)
            .map(|m| m.as_str().to_lowercase())
            .unwrap_or_else(|| "id".to_string());
        Some(RowIdentifier {
            sql_expression: format!("{}.id", &caps[1]),
            alias,
        })
    })
}

/// Candidates in SELECT order, at most one per classified field type.
fn detect_candidates(items: &[String]) -> Vec<KeysetField> {
    let mut seen_types: HashSet<FieldType> = HashSet::new();
    let mut found = Vec::new();

    for item in items {
        let name = normalize_field_name(item);
        let Some(candidate) = candidate_for(&name) else {
            continue;
        };
        if !seen_types.insert(classify_field(&name)) {
            log::debug!("cursor candidate {name} dropped: type already covered");
            continue;
        }
        let priority = found.len() as u32 + 1;
        found.push(KeysetField::new(
            split_alias(item).0,
            &name,
            candidate.data_type,
            priority,
        ));
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn analyze(sql: &str) -> PaginationPlan {
        PaginationSelector::default().analyze(sql).unwrap()
    }

    fn expressions(plan: &PaginationPlan) -> Vec<&str> {
        plan.selected_fields
            .iter()
            .map(|f| f.sql_expression.as_str())
            .collect()
    }

    #[test]
    fn keyset_with_id_in_detection_order() {
        let plan = analyze(
            "SELECT i.id, i.fecha_infraccion, i.id_estado, e.serie_equipo \
             FROM infracciones i JOIN equipos e ON e.id = i.id_equipo",
        );
        assert_eq!(plan.strategy, PaginationStrategy::KeysetWithId);
        assert!(plan.has_row_identifier);
        assert_eq!(plan.row_identifier.as_ref().unwrap().alias, "id");
        assert_eq!(
            expressions(&plan),
            vec!["i.fecha_infraccion", "i.id_estado", "e.serie_equipo"]
        );
        assert_eq!(
            plan.parameter_names(),
            vec!["last_fecha_infraccion", "last_id_estado", "last_serie_equipo"]
        );
        let priorities: Vec<u32> = plan.selected_fields.iter().map(|f| f.priority).collect();
        assert_eq!(priorities, vec![1, 2, 3]);
    }

    #[test]
    fn row_identifier_alias_is_captured() {
        let plan = analyze(
            "SELECT i.id AS id_infraccion, i.fecha_infraccion, i.id_estado, e.serie_equipo FROM infracciones i",
        );
        assert_eq!(plan.row_identifier.unwrap().alias, "id_infraccion");
    }

    #[test]
    fn composite_keyset_orders_by_type_then_detection() {
        let plan = analyze(
            "SELECT i.tiene_raw, i.id_estado, i.fecha_infraccion, e.serie_equipo, i.observaciones \
             FROM infracciones i JOIN equipos e ON e.id = i.id_equipo",
        );
        assert_eq!(plan.strategy, PaginationStrategy::CompositeKeyset);
        assert!(!plan.has_row_identifier);
        assert_eq!(
            expressions(&plan),
            vec!["e.serie_equipo", "i.fecha_infraccion", "i.id_estado", "i.tiene_raw"]
        );
    }

    #[test]
    fn same_rank_candidates_keep_detection_order() {
        // id_punto_control (identifier) and id_estado (categorization) are both INTEGER.
        let plan = analyze(
            "SELECT c.id_punto_control, c.id_estado, c.fecha FROM controles c",
        );
        assert_eq!(plan.strategy, PaginationStrategy::CompositeKeyset);
        assert_eq!(
            expressions(&plan),
            vec!["c.fecha", "c.id_punto_control", "c.id_estado"]
        );
    }

    #[test]
    fn one_date_field_is_kept() {
        let plan = analyze("SELECT i.fecha_infraccion, i.fecha, i.id_estado FROM infracciones i");
        // fecha collapses into the already detected time field
        assert_eq!(plan.strategy, PaginationStrategy::FallbackLimitOnly);
        assert_eq!(expressions(&plan), vec!["i.fecha_infraccion", "i.id_estado"]);
    }

    #[test]
    fn offset_when_nothing_is_found() {
        let plan = analyze("SELECT nombre, apellido FROM personas");
        assert_eq!(plan.strategy, PaginationStrategy::Offset);
        assert!(plan.selected_fields.is_empty());
    }

    #[test]
    fn offset_without_select_from_pair() {
        for sql in ["SELECT 1", "UPDATE t SET a = 1", "garbage ((( text", "FROM t SELECT"] {
            let plan = analyze(sql);
            assert_eq!(plan.strategy, PaginationStrategy::Offset, "sql: {sql}");
            assert!(plan.selected_fields.is_empty(), "sql: {sql}");
        }
    }

    #[test]
    fn pre_aggregated_composite_keyset() {
        let plan = analyze(
            "SELECT provincia, mes, SUM(total) AS total FROM reportes GROUP BY provincia, mes",
        );
        assert_eq!(plan.strategy, PaginationStrategy::CompositeKeyset);
        assert_eq!(expressions(&plan), vec!["provincia", "mes"]);
        assert_eq!(plan.selected_fields[1].data_type, KeysetDataType::Integer);
    }

    #[test]
    fn pre_aggregated_single_field_is_not_paginated() {
        let plan = analyze("SELECT provincia, COUNT(*) FROM reportes GROUP BY provincia");
        assert_eq!(plan.strategy, PaginationStrategy::NoPagination);
        assert!(plan.selected_fields.is_empty());
    }

    #[test]
    fn out_of_range_positions_are_not_cursor_fields() {
        let plan = analyze("SELECT provincia, SUM(total) AS total FROM reportes GROUP BY 1, 7");
        assert_eq!(plan.strategy, PaginationStrategy::NoPagination);
        assert!(plan.selected_fields.is_empty());

        let plan = analyze(
            "SELECT provincia, mes, SUM(total) AS total FROM reportes GROUP BY 1, 2, 7",
        );
        assert_eq!(plan.strategy, PaginationStrategy::CompositeKeyset);
        assert_eq!(expressions(&plan), vec!["provincia", "mes"]);
    }

    #[test]
    fn group_by_without_aggregate_is_not_pre_aggregated() {
        let plan = analyze(
            "SELECT i.fecha_infraccion, i.id_estado, e.serie_equipo FROM infracciones i \
             GROUP BY i.fecha_infraccion, i.id_estado, e.serie_equipo",
        );
        assert_eq!(plan.strategy, PaginationStrategy::CompositeKeyset);
        assert_eq!(plan.selected_fields[0].sql_expression, "e.serie_equipo");
    }

    #[test]
    fn invalid_input_is_rejected() {
        let selector = PaginationSelector::default();
        assert!(selector.analyze("").unwrap_err().is_invalid_input());
        assert!(selector.analyze("   \n").unwrap_err().is_invalid_input());
        assert!(selector
            .analyze("SELECT a FROM t\0")
            .unwrap_err()
            .is_invalid_input());

        let small = PaginationSelector::new(&EngineConfig {
            max_sql_length: 16,
            ..EngineConfig::default()
        });
        assert!(small
            .analyze("SELECT a, b, c FROM some_table")
            .unwrap_err()
            .is_invalid_input());
    }

    #[test]
    fn infers_keyset_types() {
        assert_eq!(KeysetDataType::infer("fecha_hora"), KeysetDataType::Timestamp);
        assert_eq!(KeysetDataType::infer("fecha"), KeysetDataType::Date);
        assert_eq!(KeysetDataType::infer("provincia"), KeysetDataType::Text);
        assert_eq!(KeysetDataType::infer("id_estado"), KeysetDataType::Integer);
        assert_eq!(KeysetDataType::infer("tiene_raw"), KeysetDataType::Boolean);
    }
}
