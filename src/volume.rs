//! Volume escalation: pick in-memory, streamed or forced-aggregation
//! execution from real per-shard row counts.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cancel::CancellationToken;
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::shard::{ShardFanOut, ShardId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeStrategy {
    RawInMemory,
    /// Caller must process rows in bounded chunks.
    RawStreaming,
    /// Caller must run the grouped rewrite instead of the raw query.
    ForceAggregation,
}

impl fmt::Display for VolumeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VolumeStrategy::RawInMemory => "RAW_IN_MEMORY",
            VolumeStrategy::RawStreaming => "RAW_STREAMING",
            VolumeStrategy::ForceAggregation => "FORCE_AGGREGATION",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CountOutcome {
    Counted(u64),
    Failed(String),
}

/// COUNT(*) result of one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardCount {
    pub shard: ShardId,
    pub outcome: CountOutcome,
}

impl ShardCount {
    pub fn counted(shard: impl Into<String>, rows: u64) -> Self {
        Self {
            shard: ShardId::new(shard),
            outcome: CountOutcome::Counted(rows),
        }
    }

    pub fn failed(shard: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            shard: ShardId::new(shard),
            outcome: CountOutcome::Failed(message.into()),
        }
    }

    /// Rows this shard contributes to the total; failures contribute zero.
    pub fn rows(&self) -> u64 {
        match self.outcome {
            CountOutcome::Counted(n) => n,
            CountOutcome::Failed(_) => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeDecision {
    pub strategy: VolumeStrategy,
    pub total_rows: u64,
    pub failed_shards: Vec<String>,
    /// 1.0 when every shard answered, lower when some counts are missing.
    pub confidence: f64,
    pub explanation: String,
}

#[derive(Debug, Clone, Copy)]
pub struct VolumeDecider {
    low_threshold: u64,
    high_threshold: u64,
}

impl Default for VolumeDecider {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl VolumeDecider {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            low_threshold: config.low_volume_threshold,
            high_threshold: config.high_volume_threshold,
        }
    }

    pub fn decide(&self, counts: &[ShardCount]) -> VolumeDecision {
        let total_rows = counts
            .iter()
            .fold(0u64, |acc, count| acc.saturating_add(count.rows()));
        let failed_shards: Vec<String> = counts
            .iter()
            .filter(|c| matches!(c.outcome, CountOutcome::Failed(_)))
            .map(|c| c.shard.to_string())
            .collect();

        let by_volume = if total_rows < self.low_threshold {
            VolumeStrategy::RawInMemory
        } else if total_rows < self.high_threshold {
            VolumeStrategy::RawStreaming
        } else {
            VolumeStrategy::ForceAggregation
        };

        let (strategy, mut explanation) =
            if by_volume == VolumeStrategy::RawInMemory && !failed_shards.is_empty() {
                (
                    VolumeStrategy::RawStreaming,
                    format!(
                        "{total_rows} rows counted but COUNT(*) failed on [{}]; streaming instead of assuming low volume",
                        failed_shards.join(", ")
                    ),
                )
            } else {
                (
                    by_volume,
                    format!(
                        "{total_rows} rows across {} shard(s) (thresholds {}/{})",
                        counts.len(),
                        self.low_threshold,
                        self.high_threshold
                    ),
                )
            };
        if by_volume != VolumeStrategy::RawInMemory && !failed_shards.is_empty() {
            explanation.push_str(&format!(
                "; failed shard(s) counted as zero: [{}]",
                failed_shards.join(", ")
            ));
        }

        let confidence = if counts.is_empty() {
            0.0
        } else if failed_shards.is_empty() {
            1.0
        } else {
            (counts.len() - failed_shards.len()) as f64 / counts.len() as f64
        };

        log::info!(
            "volume strategy={strategy} total_rows={total_rows} failed_shards={}",
            failed_shards.len()
        );

        VolumeDecision {
            strategy,
            total_rows,
            failed_shards,
            confidence,
            explanation,
        }
    }
}

/// Count `sql` on every shard in parallel and decide the execution strategy.
pub async fn probe_volume(
    fan_out: &ShardFanOut,
    decider: &VolumeDecider,
    sql: &str,
    cancel: &CancellationToken,
) -> EngineResult<VolumeDecision> {
    let counts = fan_out.count(sql, cancel).await?;
    Ok(decider.decide(&counts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_low_threshold_stays_in_memory() {
        let counts = [
            ShardCount::counted("a", 3_000),
            ShardCount::counted("b", 4_000),
            ShardCount::counted("c", 2_500),
        ];
        let decision = VolumeDecider::default().decide(&counts);
        assert_eq!(decision.strategy, VolumeStrategy::RawInMemory);
        assert_eq!(decision.total_rows, 9_500);
        assert_eq!(decision.confidence, 1.0);
    }

    #[test]
    fn thresholds_are_exclusive_upper_bounds() {
        let decider = VolumeDecider::default();
        assert_eq!(
            decider.decide(&[ShardCount::counted("a", 10_000)]).strategy,
            VolumeStrategy::RawStreaming
        );
        assert_eq!(
            decider.decide(&[ShardCount::counted("a", 99_999)]).strategy,
            VolumeStrategy::RawStreaming
        );
        assert_eq!(
            decider.decide(&[ShardCount::counted("a", 100_000)]).strategy,
            VolumeStrategy::ForceAggregation
        );
    }

    #[test]
    fn high_volume_forces_aggregation() {
        let counts = [
            ShardCount::counted("a", 40_000),
            ShardCount::counted("b", 40_000),
            ShardCount::counted("c", 30_000),
        ];
        let decision = VolumeDecider::default().decide(&counts);
        assert_eq!(decision.strategy, VolumeStrategy::ForceAggregation);
        assert_eq!(decision.total_rows, 110_000);
    }

    #[test]
    fn failed_count_escalates_to_streaming() {
        let counts = [
            ShardCount::counted("a", 100),
            ShardCount::failed("b", "timeout"),
        ];
        let decision = VolumeDecider::default().decide(&counts);
        assert_eq!(decision.strategy, VolumeStrategy::RawStreaming);
        assert_eq!(decision.total_rows, 100);
        assert_eq!(decision.failed_shards, vec!["b".to_string()]);
        assert_eq!(decision.confidence, 0.5);
        assert!(decision.explanation.contains("b"));
    }

    #[test]
    fn failure_does_not_lower_high_volume() {
        let counts = [
            ShardCount::counted("a", 150_000),
            ShardCount::failed("b", "down"),
        ];
        let decision = VolumeDecider::default().decide(&counts);
        assert_eq!(decision.strategy, VolumeStrategy::ForceAggregation);
        assert!(decision.explanation.contains("counted as zero"));
    }

    #[test]
    fn no_shards_is_in_memory_with_zero_confidence() {
        let decision = VolumeDecider::default().decide(&[]);
        assert_eq!(decision.strategy, VolumeStrategy::RawInMemory);
        assert_eq!(decision.confidence, 0.0);
    }
}
