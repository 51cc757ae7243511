//! Pagination strategy selection and cross-shard consolidation for stored
//! SELECT queries.
//!
//! The pure entry points ([`analyze_pagination`], [`analyze_consolidation`],
//! [`decide_volume_strategy`], [`consolidate`]) need no runtime.
//! [`ShardQueryEngine`] ties them to a [`ShardExecutor`] for end-to-end runs.

pub mod cache;
pub mod cancel;
pub mod classify;
pub mod config;
pub mod consolidation;
pub mod engine;
pub mod error;
pub mod pagination;
pub mod shard;
pub mod sql;
pub mod volume;

pub use cache::{cache_key, content_hash, is_stale, InMemoryPlanStore, PlanCache, PlanStore};
pub use cancel::{cancellation_pair, CancellationHandle, CancellationToken};
pub use classify::{classify_field, FieldType};
pub use config::EngineConfig;
pub use consolidation::{
    consolidate_hierarchical, merge_shard_rows, ConsolidatedRow, ConsolidationAnalyzer,
    ConsolidationOutcome, ConsolidationPlan, Consolidator, HierarchicalReport, ANALYZER_VERSION,
};
pub use engine::{ConsolidatedReport, ShardQueryEngine};
pub use error::{EngineError, EngineResult};
pub use pagination::{
    KeysetDataType, KeysetField, PaginationPlan, PaginationSelector, PaginationStrategy,
    RowIdentifier,
};
pub use shard::{FanOutResult, Row, ShardExecutor, ShardFailure, ShardFanOut, ShardId, ShardRows};
pub use volume::{
    probe_volume, CountOutcome, ShardCount, VolumeDecider, VolumeDecision, VolumeStrategy,
};

/// Pick a pagination strategy for `sql` with default settings.
pub fn analyze_pagination(sql: &str) -> EngineResult<PaginationPlan> {
    PaginationSelector::default().analyze(sql)
}

/// Build a static consolidation plan for `sql` with default settings.
pub fn analyze_consolidation(sql: &str) -> EngineResult<ConsolidationPlan> {
    ConsolidationAnalyzer::default().analyze(sql)
}

/// Execution strategy for the summed per-shard counts, default thresholds.
pub fn decide_volume_strategy(counts: &[ShardCount]) -> VolumeStrategy {
    VolumeDecider::default().decide(counts).strategy
}

/// Consolidate merged shard rows with `plan`, or with inferred fields when
/// there is none. Unconsolidable input comes back unchanged.
pub fn consolidate(rows: &[Row], plan: Option<&ConsolidationPlan>) -> ConsolidationOutcome {
    Consolidator::default().consolidate(rows, plan)
}
