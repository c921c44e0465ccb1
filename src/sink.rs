//! Outbound sinks for contribution and reward records: the coordinator's
//! boundary to whatever external ledger or accounting system consumes its
//! output. Grounded on the same `async_trait` sink pattern as
//! `checkpoint.rs`, generalized to the two record kinds `SPEC_FULL.md` §2.1
//! calls out as external collaborators.

use async_trait::async_trait;

use crate::contribution::ContributionRecord;
use crate::error::Result;
use crate::reward::RewardDistribution;

#[async_trait]
pub trait ContributionSink: Send + Sync {
    async fn submit_contributions(&self, round: u64, records: &[ContributionRecord]) -> Result<()>;
    async fn submit_rewards(&self, round: u64, distribution: &RewardDistribution) -> Result<()>;
}

/// Sink that only logs via `tracing`, used when no external ledger is
/// configured.
pub struct LoggingContributionSink;

#[async_trait]
impl ContributionSink for LoggingContributionSink {
    async fn submit_contributions(&self, round: u64, records: &[ContributionRecord]) -> Result<()> {
        for record in records {
            tracing::info!(
                round,
                worker = %record.worker,
                final_score = record.final_score,
                is_outlier = record.is_outlier,
                "contribution recorded"
            );
        }
        Ok(())
    }

    async fn submit_rewards(&self, round: u64, distribution: &RewardDistribution) -> Result<()> {
        for (worker, amount) in &distribution.payouts {
            tracing::info!(round, %worker, amount, "reward distributed");
        }
        Ok(())
    }
}
