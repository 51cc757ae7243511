//! Best-effort extraction of the SELECT, WHERE and GROUP BY clauses.
//!
//! Nothing here fails: when a clause cannot be located the result is `None`
//! or an empty list, which callers read as "insufficient information".

use regex::Regex;
use std::sync::OnceLock;

use super::normalize::{normalize_field_name, split_alias};
use super::scan::{depth_map, find_first_of, find_keyword, split_top_level, NOT_CODE};

/// Keywords that end the main query body.
const SET_OPERATORS: &[&str] = &["UNION", "INTERSECT", "EXCEPT"];

const WHERE_TERMINATORS: &[&str] = &[
    "GROUP BY", "HAVING", "WINDOW", "ORDER BY", "LIMIT", "OFFSET", "FETCH",
];

const GROUP_BY_TERMINATORS: &[&str] = &["HAVING", "WINDOW", "ORDER BY", "LIMIT", "OFFSET", "FETCH"];

/// Clauses that trail the row source and are dropped by rewrites.
pub(crate) const TAIL_CLAUSES: &[&str] = &["ORDER BY", "LIMIT", "OFFSET", "FETCH"];

fn aggregate_call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(count|sum|avg|min|max)\s*\(").expect("valid aggregate regex")
    })
}

/// Narrow seam between callers and the clause matcher, so the pattern based
/// implementation can be swapped for a real tokenizer.
pub trait ClauseExtractor: Send + Sync {
    fn select_clause(&self, sql: &str) -> Option<String>;
    fn where_clause(&self, sql: &str) -> Option<String>;
    fn group_by_clause(&self, sql: &str) -> Option<String>;
    /// Whether the SELECT list calls COUNT/SUM/AVG/MIN/MAX.
    fn has_aggregate_call(&self, sql: &str) -> bool;
}

/// A GROUP BY entry with its positional reference resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupByEntry {
    /// Source expression to group on (alias removed).
    pub expression: String,
    /// Canonical field name.
    pub name: String,
    /// False for out-of-range positional references.
    pub resolved: bool,
}

/// Offsets of the main query body inside a trimmed statement.
struct Layout {
    /// Offset of the main SELECT keyword; anything before it is a WITH prefix.
    keyword_start: usize,
    select_start: usize,
    select_end: usize,
    from_start: usize,
    body_end: usize,
}

/// Depth-aware keyword matcher over raw SQL text.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatternExtractor;

impl PatternExtractor {
    pub fn new() -> Self {
        Self
    }

    fn layout(sql: &str, map: &[i32]) -> Option<Layout> {
        let (keyword_start, select_end) = find_keyword(sql, map, "SELECT", 0, sql.len())?;
        let (from_start, _) = find_keyword(sql, map, "FROM", select_end, sql.len())?;
        let body_end =
            find_first_of(sql, map, SET_OPERATORS, from_start, sql.len()).unwrap_or(sql.len());
        Some(Layout {
            keyword_start,
            select_start: select_end,
            select_end: from_start,
            from_start,
            body_end,
        })
    }

    fn clause_after(
        sql: &str,
        keyword: &str,
        terminators: &[&str],
    ) -> Option<String> {
        let sql = trim_statement(sql);
        let map = depth_map(sql);
        let layout = Self::layout(sql, &map)?;
        let (_, start) = find_keyword(sql, &map, keyword, layout.from_start, layout.body_end)?;
        let end = find_first_of(sql, &map, terminators, start, layout.body_end)
            .unwrap_or(layout.body_end);
        let clause = sql[start..end].trim();
        (!clause.is_empty()).then(|| clause.to_string())
    }
}

impl ClauseExtractor for PatternExtractor {
    fn select_clause(&self, sql: &str) -> Option<String> {
        let sql = trim_statement(sql);
        let map = depth_map(sql);
        let layout = Self::layout(sql, &map)?;
        let mut clause = sql[layout.select_start..layout.select_end].trim();

        for modifier in ["DISTINCT", "ALL"] {
            let head = clause.get(..modifier.len());
            let boundary = clause.as_bytes().get(modifier.len());
            if head.map(|h| h.eq_ignore_ascii_case(modifier)).unwrap_or(false)
                && boundary.map(|b| b.is_ascii_whitespace()).unwrap_or(false)
            {
                clause = clause[modifier.len()..].trim_start();
            }
        }

        (!clause.is_empty()).then(|| clause.to_string())
    }

    fn where_clause(&self, sql: &str) -> Option<String> {
        Self::clause_after(sql, "WHERE", WHERE_TERMINATORS)
    }

    fn group_by_clause(&self, sql: &str) -> Option<String> {
        Self::clause_after(sql, "GROUP BY", GROUP_BY_TERMINATORS)
    }

    fn has_aggregate_call(&self, sql: &str) -> bool {
        let Some(select) = self.select_clause(sql) else {
            return false;
        };
        let map = depth_map(&select);
        aggregate_call_re()
            .find_iter(&select)
            .any(|m| map[m.start()] != NOT_CODE)
    }
}

/// Pieces of a plain SELECT that a projection rewrite keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RowSource<'a> {
    /// Text before the main SELECT keyword, e.g. a `WITH ... AS (...)` list.
    pub prefix: &'a str,
    /// From the FROM keyword up to (not including) ORDER BY / LIMIT / OFFSET / FETCH.
    pub source: &'a str,
}

/// The row source of a plain, ungrouped SELECT. `None` for set operations,
/// statements that already carry a depth-0 GROUP BY or HAVING, or when no
/// SELECT/FROM pair exists.
pub(crate) fn row_source(sql: &str) -> Option<RowSource<'_>> {
    let sql = trim_statement(sql);
    let map = depth_map(sql);
    let layout = PatternExtractor::layout(sql, &map)?;
    if layout.body_end != sql.len() {
        return None;
    }
    if find_first_of(sql, &map, &["GROUP BY", "HAVING"], layout.from_start, layout.body_end)
        .is_some()
    {
        return None;
    }
    let end = find_first_of(sql, &map, TAIL_CLAUSES, layout.from_start, layout.body_end)
        .unwrap_or(layout.body_end);
    Some(RowSource {
        prefix: sql[..layout.keyword_start].trim(),
        source: sql[layout.from_start..end].trim_end(),
    })
}

/// Whether the main query body has a depth-0 GROUP BY or HAVING.
pub fn has_grouping_clause(sql: &str) -> bool {
    let sql = trim_statement(sql);
    let map = depth_map(sql);
    let Some(layout) = PatternExtractor::layout(sql, &map) else {
        return false;
    };
    find_first_of(sql, &map, &["GROUP BY", "HAVING"], layout.from_start, layout.body_end).is_some()
}

/// Remove a depth-0 ORDER BY, keeping LIMIT / OFFSET / FETCH.
pub(crate) fn strip_order_by_text(sql: &str) -> String {
    let sql = trim_statement(sql);
    let map = depth_map(sql);
    let Some((start, end)) = find_keyword(sql, &map, "ORDER BY", 0, sql.len()) else {
        return sql.to_string();
    };
    let resume = find_first_of(sql, &map, &["LIMIT", "OFFSET", "FETCH"], end, sql.len())
        .unwrap_or(sql.len());
    let head = sql[..start].trim_end();
    let tail = sql[resume..].trim();
    if tail.is_empty() {
        head.to_string()
    } else {
        format!("{head} {tail}")
    }
}

/// Strip surrounding whitespace and trailing semicolons.
pub(crate) fn trim_statement(sql: &str) -> &str {
    sql.trim().trim_end_matches(';').trim_end()
}

fn default_extractor() -> &'static PatternExtractor {
    static EXTRACTOR: PatternExtractor = PatternExtractor;
    &EXTRACTOR
}

pub fn extract_select_clause(sql: &str) -> Option<String> {
    default_extractor().select_clause(sql)
}

pub fn extract_where_clause(sql: &str) -> Option<String> {
    default_extractor().where_clause(sql)
}

/// Split a SELECT list on commas at parenthesis depth 0, outside literals.
pub fn split_top_level_fields(select_clause: &str) -> Vec<String> {
    split_top_level(select_clause)
}

/// Normalised GROUP BY field names, with positional references resolved
/// against the SELECT list.
pub fn extract_group_by_fields(sql: &str) -> Vec<String> {
    group_by_entries(default_extractor(), sql)
        .into_iter()
        .map(|entry| entry.name)
        .collect()
}

/// GROUP BY entries with positional references (`GROUP BY 1, 2`) replaced by
/// the matching SELECT item. Out-of-range positions become `columna_N`.
pub fn group_by_entries(extractor: &dyn ClauseExtractor, sql: &str) -> Vec<GroupByEntry> {
    let Some(clause) = extractor.group_by_clause(sql) else {
        return Vec::new();
    };
    let select_items = extractor
        .select_clause(sql)
        .map(|s| split_top_level(&s))
        .unwrap_or_default();

    split_top_level(&clause)
        .into_iter()
        .map(|raw| {
            if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
                let position: usize = raw.parse().unwrap_or(0);
                match position.checked_sub(1).and_then(|idx| select_items.get(idx)) {
                    Some(item) => GroupByEntry {
                        expression: split_alias(item).0.to_string(),
                        name: normalize_field_name(item),
                        resolved: true,
                    },
                    None => {
                        log::debug!("GROUP BY position {position} is out of range");
                        GroupByEntry {
                            expression: raw.clone(),
                            name: format!("columna_{position}"),
                            resolved: false,
                        }
                    }
                }
            } else {
                GroupByEntry {
                    name: normalize_field_name(&raw),
                    expression: raw,
                    resolved: true,
                }
            }
        })
        .collect()
}
