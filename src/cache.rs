//! Consolidation plan cache keyed by SQL content hash and analyzer version.
//!
//! Lookups take a read lock only; a miss analyses outside any lock and then
//! writes, so two callers racing on the same new query may both analyse it.

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

use crate::config::EngineConfig;
use crate::consolidation::{ConsolidationAnalyzer, ConsolidationPlan, ANALYZER_VERSION};
use crate::error::EngineResult;
use crate::sql::clauses::trim_statement;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedPlan {
    pub content_hash: String,
    pub analyzer_version: u32,
    pub plan: ConsolidationPlan,
}

/// Get/put persistence for cached plans.
pub trait PlanStore: Send + Sync {
    fn get(&self, key: &str) -> Option<CachedPlan>;
    fn put(&self, key: &str, entry: CachedPlan);
}

#[derive(Debug, Default)]
pub struct InMemoryPlanStore {
    entries: RwLock<HashMap<String, CachedPlan>>,
}

impl InMemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PlanStore for InMemoryPlanStore {
    fn get(&self, key: &str) -> Option<CachedPlan> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn put(&self, key: &str, entry: CachedPlan) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), entry);
    }
}

/// Hex SipHash-1-3 of the statement with surrounding whitespace and
/// trailing semicolons removed.
pub fn content_hash(sql: &str) -> String {
    let mut hasher = SipHasher13::new();
    trim_statement(sql).hash(&mut hasher);
    hex::encode(hasher.finish().to_be_bytes())
}

pub fn cache_key(content_hash: &str, analyzer_version: u32) -> String {
    format!("{content_hash}:v{analyzer_version}")
}

/// A stored plan is stale when the SQL text or the analyzer changed.
pub fn is_stale(
    stored_hash: &str,
    current_hash: &str,
    stored_version: u32,
    current_version: u32,
) -> bool {
    stored_hash != current_hash || stored_version != current_version
}

pub struct PlanCache {
    store: Arc<dyn PlanStore>,
    analyzer: ConsolidationAnalyzer,
}

impl PlanCache {
    pub fn new(store: Arc<dyn PlanStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            analyzer: ConsolidationAnalyzer::new(config),
        }
    }

    /// Plan for `sql`, keyed by its content hash.
    pub fn plan_for(&self, sql: &str) -> EngineResult<ConsolidationPlan> {
        let hash = content_hash(sql);
        let key = cache_key(&hash, ANALYZER_VERSION);
        self.lookup_or_analyze(&key, &hash, sql)
    }

    /// Plan for a stored query identified by `code`. The entry is replaced
    /// when the SQL behind the code changes.
    pub fn plan_for_query(&self, code: &str, sql: &str) -> EngineResult<ConsolidationPlan> {
        let hash = content_hash(sql);
        self.lookup_or_analyze(code, &hash, sql)
    }

    fn lookup_or_analyze(&self, key: &str, hash: &str, sql: &str) -> EngineResult<ConsolidationPlan> {
        if let Some(cached) = self.store.get(key) {
            if !is_stale(&cached.content_hash, hash, cached.analyzer_version, ANALYZER_VERSION) {
                log::debug!("plan cache hit key={key}");
                return Ok(cached.plan);
            }
            log::debug!("plan cache stale key={key}, re-analysing");
        } else {
            log::debug!("plan cache miss key={key}");
        }

        let plan = self.analyzer.analyze(sql)?;
        self.store.put(
            key,
            CachedPlan {
                content_hash: hash.to_string(),
                analyzer_version: ANALYZER_VERSION,
                plan: plan.clone(),
            },
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_ignores_trailing_noise() {
        assert_eq!(content_hash("SELECT a FROM t;"), content_hash("  SELECT a FROM t  "));
        assert_ne!(content_hash("SELECT a FROM t"), content_hash("SELECT b FROM t"));
        assert_eq!(content_hash("x").len(), 16);
    }

    #[test]
    fn staleness_is_hash_or_version_change() {
        assert!(!is_stale("h", "h", 1, 1));
        assert!(is_stale("h", "g", 1, 1));
        assert!(is_stale("h", "h", 1, 2));
    }

    #[test]
    fn repeated_lookups_hit_the_store() {
        let store = Arc::new(InMemoryPlanStore::new());
        let cache = PlanCache::new(store.clone(), &EngineConfig::default());
        let first = cache.plan_for("SELECT provincia, monto FROM t").unwrap();
        let second = cache.plan_for("SELECT provincia, monto FROM t;").unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn changed_sql_replaces_query_entry() {
        let store = Arc::new(InMemoryPlanStore::new());
        let cache = PlanCache::new(store.clone(), &EngineConfig::default());
        cache.plan_for_query("Q1", "SELECT provincia, monto FROM t").unwrap();
        let plan = cache.plan_for_query("Q1", "SELECT municipio, monto FROM t").unwrap();
        assert_eq!(plan.grouping_fields, vec!["municipio"]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("Q1").unwrap().content_hash, content_hash("SELECT municipio, monto FROM t"));
    }

    #[test]
    fn invalid_sql_is_not_cached() {
        let store = Arc::new(InMemoryPlanStore::new());
        let cache = PlanCache::new(store.clone(), &EngineConfig::default());
        assert!(cache.plan_for("").is_err());
        assert!(store.is_empty());
    }
}
