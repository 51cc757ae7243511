//! End-to-end consolidated execution of one stored query across all shards.
//!
//! plan cache → volume probe (queries without GROUP BY) → optional forced aggregation →
//! fan-out → merge → consolidation.

use std::sync::Arc;

use crate::cache::{InMemoryPlanStore, PlanCache, PlanStore};
use crate::cancel::CancellationToken;
use crate::config::EngineConfig;
use crate::consolidation::{
    merge_shard_rows, ConsolidationOutcome, ConsolidationPlan, Consolidator,
};
use crate::error::EngineResult;
use crate::pagination::{PaginationPlan, PaginationSelector};
use crate::shard::{ShardExecutor, ShardFailure, ShardFanOut, ShardId};
use crate::sql::{force_aggregation_query, has_grouping_clause};
use crate::volume::{probe_volume, VolumeDecider, VolumeDecision, VolumeStrategy};

#[derive(Debug, Clone)]
pub struct ConsolidatedReport {
    /// SQL actually sent to the shards.
    pub executed_sql: String,
    pub plan: ConsolidationPlan,
    pub volume: Option<VolumeDecision>,
    pub forced_aggregation: bool,
    pub outcome: ConsolidationOutcome,
    pub failed_shards: Vec<ShardFailure>,
}

impl ConsolidatedReport {
    pub fn is_partial(&self) -> bool {
        !self.failed_shards.is_empty()
    }
}

pub struct ShardQueryEngine {
    config: EngineConfig,
    fan_out: ShardFanOut,
    plans: PlanCache,
    pagination: PaginationSelector,
    decider: VolumeDecider,
    consolidator: Consolidator,
}

impl ShardQueryEngine {
    pub fn new(
        executor: Arc<dyn ShardExecutor>,
        shards: Vec<ShardId>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        Self::with_plan_store(executor, shards, config, Arc::new(InMemoryPlanStore::new()))
    }

    pub fn with_plan_store(
        executor: Arc<dyn ShardExecutor>,
        shards: Vec<ShardId>,
        config: EngineConfig,
        store: Arc<dyn PlanStore>,
    ) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            fan_out: ShardFanOut::new(executor, shards, &config),
            plans: PlanCache::new(store, &config),
            pagination: PaginationSelector::new(&config),
            decider: VolumeDecider::new(&config),
            consolidator: Consolidator::new(&config),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pagination_plan(&self, sql: &str) -> EngineResult<PaginationPlan> {
        self.pagination.analyze(sql)
    }

    pub async fn run_consolidated(&self, sql: &str) -> EngineResult<ConsolidatedReport> {
        self.run_consolidated_with_cancel(sql, &CancellationToken::never())
            .await
    }

    pub async fn run_consolidated_with_cancel(
        &self,
        sql: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<ConsolidatedReport> {
        let mut plan = self.plans.plan_for(sql)?;

        // Only ungrouped queries are escalated; a GROUP BY without aggregates
        // is neither pre-aggregated nor rewritable.
        let mut volume = None;
        if plan.is_consolidable && !plan.is_pre_aggregated && !has_grouping_clause(sql) {
            let decision = probe_volume(&self.fan_out, &self.decider, sql, cancel).await?;
            plan = plan.with_volume(&decision);
            volume = Some(decision);
        }

        let forced_sql = match &volume {
            Some(decision) if decision.strategy == VolumeStrategy::ForceAggregation => {
                let rewritten =
                    force_aggregation_query(sql, &plan.grouping_fields, &plan.numeric_fields);
                if rewritten.is_none() {
                    log::warn!(
                        "forced aggregation not possible for this query, running it raw ({} rows)",
                        decision.total_rows
                    );
                }
                rewritten
            }
            _ => None,
        };
        let forced_aggregation = forced_sql.is_some();
        let executed_sql = forced_sql.unwrap_or_else(|| sql.to_string());

        let result = self.fan_out.query(&executed_sql, &[], cancel).await?;
        let rows = merge_shard_rows(&result.succeeded, &self.config.shard_identity_fields);

        let outcome = if forced_aggregation {
            self.consolidator.consolidate_with(
                &rows,
                &plan.grouping_fields,
                &plan.forced_numeric_fields(),
            )
        } else {
            self.consolidator.consolidate(&rows, Some(&plan))
        };

        log::info!(
            "op_id={} consolidated {} row(s) from {} shard(s) into {} row(s), {} shard(s) failed",
            result.op_id,
            outcome.input_rows,
            result.succeeded.len(),
            outcome.rows.len(),
            result.failed.len()
        );

        Ok(ConsolidatedReport {
            executed_sql,
            plan,
            volume,
            forced_aggregation,
            outcome,
            failed_shards: result.failed,
        })
    }
}
