//! Parallel per-shard execution.
//!
//! `ShardFanOut` issues one task per shard, bounded by a semaphore, with an
//! independent timeout per call. A failing or slow shard is recorded as a
//! [`ShardFailure`] and never aborts its siblings. Results are collected in
//! shard-list order regardless of completion order.

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::sql::count_query;
use crate::volume::{CountOutcome, ShardCount};

/// One result row: column name to JSON value, in column order.
pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Executes SQL against a single shard.
#[async_trait]
pub trait ShardExecutor: Send + Sync {
    async fn execute(&self, shard: &ShardId, sql: &str, params: &[Value]) -> EngineResult<Vec<Row>>;

    /// Row count of `sql` on `shard`, via `SELECT COUNT(*) FROM (...) AS sub`.
    async fn count(&self, shard: &ShardId, sql: &str) -> EngineResult<u64> {
        let rows = self.execute(shard, &count_query(sql), &[]).await?;
        rows.first()
            .and_then(|row| row.values().next())
            .and_then(value_as_count)
            .ok_or_else(|| EngineError::shard(shard.as_str(), "COUNT(*) returned no numeric value"))
    }
}

fn value_as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShardRows {
    pub shard: ShardId,
    pub rows: Vec<Row>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShardFailure {
    pub shard: ShardId,
    pub error: EngineError,
}

/// Outcome of one fan-out, split by shard success.
#[derive(Debug, Clone)]
pub struct FanOutResult {
    pub op_id: Uuid,
    pub succeeded: Vec<ShardRows>,
    pub failed: Vec<ShardFailure>,
}

impl FanOutResult {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total_rows(&self) -> usize {
        self.succeeded.iter().map(|s| s.rows.len()).sum()
    }
}

pub struct ShardFanOut {
    executor: Arc<dyn ShardExecutor>,
    shards: Vec<ShardId>,
    timeout: Duration,
    max_concurrent: usize,
}

impl ShardFanOut {
    pub fn new(executor: Arc<dyn ShardExecutor>, shards: Vec<ShardId>, config: &EngineConfig) -> Self {
        Self {
            executor,
            shards,
            timeout: config.shard_timeout(),
            max_concurrent: config.max_concurrent_shards.max(1),
        }
    }

    pub fn shards(&self) -> &[ShardId] {
        &self.shards
    }

    /// Run `sql` with `params` on every shard.
    pub async fn query(
        &self,
        sql: &str,
        params: &[Value],
        cancel: &CancellationToken,
    ) -> EngineResult<FanOutResult> {
        let sql = sql.to_string();
        let params = params.to_vec();
        let (op_id, outcomes) = self
            .run("query", cancel, move |executor, shard| {
                let sql = sql.clone();
                let params = params.clone();
                async move { executor.execute(&shard, &sql, &params).await }
            })
            .await?;

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for (shard, elapsed_ms, outcome) in outcomes {
            match outcome {
                Ok(rows) => succeeded.push(ShardRows {
                    shard,
                    rows,
                    elapsed_ms,
                }),
                Err(error) => failed.push(ShardFailure { shard, error }),
            }
        }
        Ok(FanOutResult {
            op_id,
            succeeded,
            failed,
        })
    }

    /// COUNT(*) of `sql` on every shard; failures become `CountOutcome::Failed`.
    pub async fn count(&self, sql: &str, cancel: &CancellationToken) -> EngineResult<Vec<ShardCount>> {
        let sql = sql.to_string();
        let (_, outcomes) = self
            .run("count", cancel, move |executor, shard| {
                let sql = sql.clone();
                async move { executor.count(&shard, &sql).await }
            })
            .await?;

        Ok(outcomes
            .into_iter()
            .map(|(shard, _, outcome)| ShardCount {
                shard,
                outcome: match outcome {
                    Ok(n) => CountOutcome::Counted(n),
                    Err(e) => CountOutcome::Failed(e.to_string()),
                },
            })
            .collect())
    }

    async fn run<T, F, Fut>(
        &self,
        op: &'static str,
        cancel: &CancellationToken,
        call: F,
    ) -> EngineResult<(Uuid, Vec<(ShardId, u64, EngineResult<T>)>)>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn ShardExecutor>, ShardId) -> Fut,
        Fut: Future<Output = EngineResult<T>> + Send + 'static,
    {
        cancel.check()?;
        let op_id = Uuid::new_v4();
        let started = Instant::now();
        log::debug!(
            "op_id={op_id} op={op} fan-out to {} shard(s), max_concurrent={}",
            self.shards.len(),
            self.max_concurrent
        );

        let permits = Arc::new(Semaphore::new(self.max_concurrent));
        let mut handles = Vec::with_capacity(self.shards.len());

        for shard in &self.shards {
            let call_future = call(Arc::clone(&self.executor), shard.clone());
            let permits = Arc::clone(&permits);
            let cancel = cancel.clone();
            let timeout = self.timeout;
            let shard = shard.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.map_err(EngineError::runtime)?;
                cancel.check()?;

                let shard_start = Instant::now();
                let outcome = match tokio::time::timeout(timeout, call_future).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(EngineError::Timeout {
                        shard: shard.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                };
                let elapsed_ms = shard_start.elapsed().as_millis() as u64;

                match &outcome {
                    Ok(_) => log::debug!("op_id={op_id} shard={shard} {op} ok in {elapsed_ms}ms"),
                    Err(e) => log::warn!("op_id={op_id} shard={shard} {op} failed after {elapsed_ms}ms: {e}"),
                }
                Ok::<_, EngineError>((elapsed_ms, outcome))
            }));
        }

        let joined = join_all(handles).await;
        let mut outcomes = Vec::with_capacity(joined.len());
        for (shard, joined) in self.shards.iter().zip(joined) {
            let (elapsed_ms, outcome) = match joined {
                Ok(Ok(done)) => done,
                Ok(Err(e)) => (0, Err(e)),
                Err(join_error) => (
                    0,
                    Err(EngineError::runtime(format!("shard task failed: {join_error}"))),
                ),
            };
            outcomes.push((shard.clone(), elapsed_ms, outcome));
        }

        if cancel.is_cancelled() {
            log::info!("op_id={op_id} op={op} cancelled, discarding shard results");
            return Err(EngineError::Cancelled);
        }

        let failed = outcomes.iter().filter(|(_, _, o)| o.is_err()).count();
        log::debug!(
            "op_id={op_id} op={op} done in {}ms: {} ok, {failed} failed",
            started.elapsed().as_millis(),
            outcomes.len() - failed
        );
        Ok((op_id, outcomes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancellation_pair;
    use serde_json::json;

    struct Fixed;

    #[async_trait]
    impl ShardExecutor for Fixed {
        async fn execute(&self, shard: &ShardId, sql: &str, _params: &[Value]) -> EngineResult<Vec<Row>> {
            if shard.as_str() == "down" {
                return Err(EngineError::shard(shard.as_str(), "connection refused"));
            }
            if sql.starts_with("SELECT COUNT(*)") {
                let mut row = Row::new();
                row.insert("count".to_string(), json!(42));
                return Ok(vec![row]);
            }
            let mut row = Row::new();
            row.insert("origen".to_string(), json!(shard.as_str()));
            Ok(vec![row])
        }
    }

    fn fan_out(shards: &[&str]) -> ShardFanOut {
        ShardFanOut::new(
            Arc::new(Fixed),
            shards.iter().map(|s| ShardId::from(*s)).collect(),
            &EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn failures_are_isolated() {
        let result = fan_out(&["a", "down", "b"])
            .query("SELECT 1 FROM t", &[], &CancellationToken::never())
            .await
            .unwrap();
        let ok: Vec<&str> = result.succeeded.iter().map(|s| s.shard.as_str()).collect();
        assert_eq!(ok, vec!["a", "b"]);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].error.shard_name(), Some("down"));
        assert!(!result.is_complete());
    }

    #[tokio::test]
    async fn default_count_reads_first_column() {
        let counts = fan_out(&["a", "down"])
            .count("SELECT x FROM t ORDER BY x", &CancellationToken::never())
            .await
            .unwrap();
        assert_eq!(counts[0].outcome, CountOutcome::Counted(42));
        assert!(matches!(counts[1].outcome, CountOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let (token, handle) = cancellation_pair();
        handle.cancel();
        let err = fan_out(&["a"]).query("SELECT 1 FROM t", &[], &token).await.unwrap_err();
        assert_eq!(err, EngineError::Cancelled);
    }

    #[test]
    fn count_values_accept_numeric_text() {
        assert_eq!(value_as_count(&json!("17")), Some(17));
        assert_eq!(value_as_count(&json!(3.0)), Some(3));
        assert_eq!(value_as_count(&json!(null)), None);
    }
}
