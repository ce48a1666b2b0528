//! Stable identifiers for ledger invariants (testing and counterexamples).

use crate::lifecycle::EpochRecord;
use crate::types::{EpochId, PoolId};
use crate::{LedgerError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvariantId {
    /// An epoch's `claimed + swept` exceeded its `allocated` budget.
    EpochValueConserved,

    /// An account spent more votes in an epoch/capacity than its
    /// end-of-epoch power covered.
    VotesBackedByPower,

    /// The global stream disagreed with the sum of personal and delegate
    /// aggregate streams.
    GlobalMatchesParts,

    /// A pool's lifetime vote total drifted from the sum of its per-epoch
    /// records.
    PoolLifetimeConsistent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvariantViolation {
    pub id: InvariantId,
    pub details: String,
}

impl InvariantViolation {
    pub fn new(id: InvariantId, details: impl Into<String>) -> Self {
        Self {
            id,
            details: details.into(),
        }
    }
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.id, self.details)
    }
}

impl std::error::Error for InvariantViolation {}

impl From<InvariantViolation> for LedgerError {
    fn from(v: InvariantViolation) -> Self {
        LedgerError::InvalidInput(format!("invariant violated: {v}"))
    }
}

/// Value conservation for a single epoch record.
pub fn check_epoch_conservation(e: EpochId, rec: &EpochRecord) -> Result<()> {
    let outflow = rec.claimed().saturating_add(rec.swept());
    if outflow > rec.allocated() {
        return Err(InvariantViolation::new(
            InvariantId::EpochValueConserved,
            format!(
                "epoch {}: claimed {} + swept {} > allocated {}",
                e.0,
                rec.claimed(),
                rec.swept(),
                rec.allocated()
            ),
        )
        .into());
    }
    Ok(())
}

/// Spent votes must be covered by end-of-epoch power.
pub fn check_votes_backed(e: EpochId, spent: u64, power: u64) -> Result<()> {
    if spent > power {
        return Err(InvariantViolation::new(
            InvariantId::VotesBackedByPower,
            format!("epoch {}: spent {spent} > power {power}", e.0),
        )
        .into());
    }
    Ok(())
}

/// Global stream value vs the sum over holder streams.
pub fn check_global_matches_parts(e: EpochId, global: u64, parts_sum: u64) -> Result<()> {
    if global != parts_sum {
        return Err(InvariantViolation::new(
            InvariantId::GlobalMatchesParts,
            format!("epoch {}: global {global} != parts {parts_sum}", e.0),
        )
        .into());
    }
    Ok(())
}

/// A pool's lifetime vote total vs the sum of its per-epoch totals.
pub fn check_pool_lifetime(pool: PoolId, lifetime: u64, per_epoch_sum: u64) -> Result<()> {
    if lifetime != per_epoch_sum {
        return Err(InvariantViolation::new(
            InvariantId::PoolLifetimeConsistent,
            format!("pool {pool:?}: lifetime {lifetime} != per-epoch sum {per_epoch_sum}"),
        )
        .into());
    }
    Ok(())
}
