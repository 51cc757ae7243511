//! SQL clause analysis: the handful of clause boundaries and field names the
//! pagination and consolidation decisions need, without building an AST.

pub mod clauses;
pub mod normalize;
pub mod rewrite;
mod scan;

pub use clauses::{
    extract_group_by_fields, extract_select_clause, extract_where_clause, group_by_entries,
    has_grouping_clause, split_top_level_fields, ClauseExtractor, GroupByEntry, PatternExtractor,
};
pub use normalize::{normalize_expression, normalize_field_name, split_alias};
pub use rewrite::{
    count_query, force_aggregation_query, strip_order_by, RECORD_COUNT_FIELD, TOTAL_SUFFIX,
};
