//! Block height → epoch time conversion and the per-cycle timing context.

use govsync_types::Timestamp;
use tracing::warn;

use crate::client::ChainClient;
use crate::error::ChainError;

/// A cached `(height, time)` pair for the current chain tip.
///
/// Callers fetch this once via [`BlockTimeEstimator::current_tip`] and reuse
/// it across a batch of conversions, so a batch of N proposals issues O(1)
/// header lookups rather than O(N).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTip {
    pub height: u64,
    pub time: Timestamp,
}

/// Superblock cadence context for one refresh cycle.
///
/// The superblock fields are `None` when the governance info could not be
/// read; payment windows then classify as closed rather than guessing.
#[derive(Debug, Clone, Copy)]
pub struct SuperblockTiming {
    pub tip: ChainTip,
    pub next_superblock_height: Option<u64>,
    pub last_superblock_time: Option<Timestamp>,
    pub next_superblock_time: Option<Timestamp>,
    pub next_voting_deadline: Option<Timestamp>,
    /// Whether the tip is already inside the pre-superblock window in which
    /// new votes no longer count.
    pub voting_deadline_passed: bool,
}

/// Converts block heights to epoch timestamps.
///
/// Heights at or below the tip resolve to the real header time; heights
/// above it are extrapolated linearly at the nominal block interval and must
/// be treated as estimates that firm up as the chain advances.
pub struct BlockTimeEstimator<'a> {
    client: &'a dyn ChainClient,
    block_interval_secs: u64,
}

impl<'a> BlockTimeEstimator<'a> {
    pub fn new(client: &'a dyn ChainClient, block_interval_secs: u64) -> Self {
        Self {
            client,
            block_interval_secs,
        }
    }

    /// Fetch the current chain tip. Failure here means the data source is
    /// unusable for the whole cycle, so errors escalate to
    /// [`ChainError::Unavailable`].
    pub fn current_tip(&self) -> Result<ChainTip, ChainError> {
        let height = self.client.block_count().map_err(ChainError::fatal)?;
        let hash = self.client.block_hash(height).map_err(ChainError::fatal)?;
        let header = self.client.block_header(&hash).map_err(ChainError::fatal)?;
        Ok(ChainTip {
            height,
            time: header.time,
        })
    }

    /// Actual or estimated epoch time of the block at `height`.
    pub fn time_of_block(&self, height: u64, tip: &ChainTip) -> Result<Timestamp, ChainError> {
        if height == tip.height {
            return Ok(tip.time);
        }
        if height < tip.height {
            let hash = self.client.block_hash(height)?;
            let header = self.client.block_header(&hash)?;
            return Ok(header.time);
        }
        let delta = (height - tip.height).saturating_mul(self.block_interval_secs);
        Ok(tip.time.plus_secs(delta))
    }

    /// Compute the superblock timing context for one refresh cycle.
    ///
    /// The tip fetch is fatal; failure to read the superblock schedule only
    /// degrades the context (proposals classify as closed).
    pub fn superblock_timing(
        &self,
        superblock_interval: u64,
        voting_deadline_blocks: u64,
    ) -> Result<SuperblockTiming, ChainError> {
        let tip = self.current_tip()?;

        let next_sb = match self.client.next_superblock() {
            Ok(height) => height,
            Err(e) => {
                warn!(error = %e, "cannot read superblock schedule; voting windows degrade to closed");
                return Ok(SuperblockTiming {
                    tip,
                    next_superblock_height: None,
                    last_superblock_time: None,
                    next_superblock_time: None,
                    next_voting_deadline: None,
                    voting_deadline_passed: true,
                });
            }
        };

        let last_sb = next_sb.saturating_sub(superblock_interval);
        let last_superblock_time = self.time_of_block(last_sb, &tip)?;
        let next_superblock_time = self.time_of_block(next_sb, &tip)?;

        let deadline_block = next_sb.saturating_sub(voting_deadline_blocks);
        let voting_deadline_passed = deadline_block <= tip.height && tip.height < next_sb;
        let next_voting_deadline = next_superblock_time
            .minus_secs(voting_deadline_blocks.saturating_mul(self.block_interval_secs));

        Ok(SuperblockTiming {
            tip,
            next_superblock_height: Some(next_sb),
            last_superblock_time: Some(last_superblock_time),
            next_superblock_time: Some(next_superblock_time),
            next_voting_deadline: Some(next_voting_deadline),
            voting_deadline_passed,
        })
    }
}
