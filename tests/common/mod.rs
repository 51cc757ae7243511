#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use trex_shard::{EngineError, EngineResult, Row, ShardExecutor, ShardId};

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap_or_default()
}

pub fn rows(values: &[Value]) -> Vec<Row> {
    values.iter().cloned().map(row).collect()
}

pub fn names(fields: &[&str]) -> Vec<String> {
    fields.iter().map(|f| f.to_string()).collect()
}

/// Canned behaviour of one in-memory shard.
#[derive(Clone, Default)]
pub struct MemoryShard {
    pub rows: Vec<Row>,
    /// Reported COUNT(*) when set, otherwise `rows.len()`.
    pub count: Option<u64>,
    /// Returned for the forced-aggregation rewrite.
    pub grouped_rows: Vec<Row>,
    pub failure: Option<String>,
    pub delay: Option<Duration>,
}

impl MemoryShard {
    pub fn with_rows(rows: Vec<Row>) -> Self {
        Self {
            rows,
            ..Self::default()
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn slow(rows: Vec<Row>, delay: Duration) -> Self {
        Self {
            rows,
            delay: Some(delay),
            ..Self::default()
        }
    }
}

/// `ShardExecutor` double serving canned rows and recording every call.
#[derive(Default)]
pub struct MemoryExecutor {
    shards: HashMap<String, MemoryShard>,
    calls: Mutex<Vec<(String, String)>>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shard(mut self, name: &str, shard: MemoryShard) -> Self {
        self.shards.insert(name.to_string(), shard);
        self
    }

    pub fn into_parts(self) -> (Arc<MemoryExecutor>, Vec<ShardId>) {
        let mut ids: Vec<ShardId> = self.shards.keys().map(|k| ShardId::new(k.as_str())).collect();
        ids.sort();
        (Arc::new(self), ids)
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ShardExecutor for MemoryExecutor {
    async fn execute(&self, shard: &ShardId, sql: &str, _params: &[Value]) -> EngineResult<Vec<Row>> {
        self.calls
            .lock()
            .unwrap()
            .push((shard.to_string(), sql.to_string()));

        let canned = self
            .shards
            .get(shard.as_str())
            .ok_or_else(|| EngineError::shard(shard.as_str(), "unknown shard"))?;

        if let Some(delay) = canned.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &canned.failure {
            return Err(EngineError::shard(shard.as_str(), message));
        }

        if sql.starts_with("SELECT COUNT(*) FROM (") {
            let n = canned.count.unwrap_or(canned.rows.len() as u64);
            return Ok(vec![row(serde_json::json!({ "count": n }))]);
        }
        if sql.contains("AS cantidad_registros") {
            return Ok(canned.grouped_rows.clone());
        }
        Ok(canned.rows.clone())
    }
}
