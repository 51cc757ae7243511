//! Query rewrites used by volume escalation.
//!
//! | Purpose            | Shard SQL                                                      |
//! |--------------------|----------------------------------------------------------------|
//! | Volume probe       | `SELECT COUNT(*) FROM (<original without ORDER BY>) AS sub`    |
//! | Forced aggregation | `SELECT g.., SUM(n) AS n_total.., COUNT(*) AS cantidad_registros FROM .. GROUP BY g..` |

use std::collections::HashMap;

use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use super::clauses::{
    extract_select_clause, row_source, strip_order_by_text, trim_statement, RowSource,
};
use super::normalize::{normalize_field_name, split_alias};
use super::scan::split_top_level;

/// Per-group record counter column added by forced aggregation.
pub const RECORD_COUNT_FIELD: &str = "cantidad_registros";

/// Suffix appended to every summed field by forced aggregation.
pub const TOTAL_SUFFIX: &str = "_total";

/// Wrap `sql` in a `COUNT(*)` over a derived table, dropping ORDER BY.
pub fn count_query(sql: &str) -> String {
    let inner = strip_order_by(sql);
    format!("SELECT COUNT(*) FROM ({inner}) AS sub")
}

/// Remove ORDER BY from a statement. Uses the SQL parser when the statement
/// parses as a single query; otherwise falls back to a depth-0 text cut.
pub fn strip_order_by(sql: &str) -> String {
    match strip_with_parser(sql) {
        Some(stripped) => stripped,
        None => {
            log::debug!("ORDER BY strip falling back to text scan");
            strip_order_by_text(sql)
        }
    }
}

fn strip_with_parser(sql: &str) -> Option<String> {
    let dialect = GenericDialect {};
    let mut statements = Parser::parse_sql(&dialect, trim_statement(sql)).ok()?;
    if statements.len() != 1 {
        return None;
    }
    match statements.pop()? {
        Statement::Query(mut query) => {
            query.order_by = None;
            Some(format!("{}", Statement::Query(query)))
        }
        _ => None,
    }
}

/// Rewrite a raw query into a grouped one: the SELECT list becomes the
/// grouping fields, `SUM(field) AS field_total` for every numeric field and
/// a trailing `COUNT(*) AS cantidad_registros`; ORDER BY / LIMIT are dropped
/// and a GROUP BY over the grouping fields is appended.
///
/// Field names are mapped back to their SELECT expressions when the SELECT
/// list defines them. A leading WITH list is kept. Returns `None` when there
/// is nothing to group on or the statement has no rewritable row source
/// (set operations, or an existing GROUP BY / HAVING).
pub fn force_aggregation_query(
    sql: &str,
    grouping: &[String],
    numeric: &[String],
) -> Option<String> {
    if grouping.is_empty() {
        return None;
    }
    let RowSource { prefix, source } = row_source(sql)?;

    let expressions: HashMap<String, String> = extract_select_clause(sql)
        .map(|clause| {
            split_top_level(&clause)
                .into_iter()
                .map(|item| {
                    let name = normalize_field_name(&item);
                    (name, split_alias(&item).0.to_string())
                })
                .collect()
        })
        .unwrap_or_default();

    let mut projection = Vec::with_capacity(grouping.len() + numeric.len() + 1);
    let mut group_by = Vec::with_capacity(grouping.len());

    for field in grouping {
        match expressions.get(field) {
            Some(expr) if expr != field => {
                projection.push(format!("{expr} AS {field}"));
                group_by.push(expr.clone());
            }
            _ => {
                projection.push(field.clone());
                group_by.push(field.clone());
            }
        }
    }
    for field in numeric {
        let expr = expressions.get(field).unwrap_or(field);
        projection.push(format!("SUM({expr}) AS {field}{TOTAL_SUFFIX}"));
    }
    projection.push(format!("COUNT(*) AS {RECORD_COUNT_FIELD}"));

    let select = format!(
        "SELECT {} {} GROUP BY {}",
        projection.join(", "),
        source,
        group_by.join(", ")
    );
    if prefix.is_empty() {
        Some(select)
    } else {
        Some(format!("{prefix} {select}"))
    }
}
