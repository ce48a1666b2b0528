//! Per-epoch processing state machine.
//!
//! `Voting -> Ended -> Verified -> Processed -> Finalized`, with
//! `ForceFinalized` reachable from any non-terminal state. Every transition
//! is explicit; a skipped step surfaces as `WrongEpochState`, never as a
//! silently-wrong payout. The record carries all per-epoch processing state
//! (snapshot, stamped set, value counters, blocked verifiers) so the
//! pipeline passes explicit state instead of consulting globals.
//!
//! Value counters are kept separately for the reward side and the subsidy
//! side; `allocated()`/`claimed()` are the combined views used by the
//! conservation invariant.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::math::add_u64;
use crate::types::{EpochId, PoolId};
use crate::{AccountId, LedgerError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EpochState {
    /// Epoch window open: locks mutate, votes cast, pools created/removed.
    Voting,
    /// Window elapsed; pool membership frozen in the snapshot.
    Ended,
    /// Verifier outcomes recorded; awaiting allocation stamping.
    Verified,
    /// Every snapshot pool stamped; awaiting budget pull.
    Processed,
    /// Claim window open (terminal).
    Finalized,
    /// Abandoned with all allocations zeroed (terminal, nothing claimable).
    ForceFinalized,
}

impl EpochState {
    pub fn is_terminal(self) -> bool {
        matches!(self, EpochState::Finalized | EpochState::ForceFinalized)
    }
}

/// Processing record for one epoch.
#[derive(Clone, Debug)]
pub struct EpochRecord {
    state: EpochState,
    /// Pools claimable for this epoch, frozen when it ends.
    snapshot: BTreeSet<PoolId>,
    stamped: BTreeSet<PoolId>,
    /// Verifiers barred from subsidy claims for this epoch.
    blocked: BTreeSet<AccountId>,
    /// Reward budget stamped for the epoch.
    allocated_rewards: u64,
    /// Subsidy budget stamped for the epoch.
    allocated_subsidies: u64,
    /// Reward value actually transferred to claimants (net, fee, personal).
    claimed_rewards: u64,
    /// Subsidy value actually transferred to verifiers.
    claimed_subsidies: u64,
    /// Residue already swept to the treasury sink.
    swept: u64,
    /// Epoch (current at the time) in which finalization happened; anchors
    /// the sweep delay.
    finalized_in: Option<EpochId>,
}

impl Default for EpochRecord {
    fn default() -> Self {
        EpochRecord {
            state: EpochState::Voting,
            snapshot: BTreeSet::new(),
            stamped: BTreeSet::new(),
            blocked: BTreeSet::new(),
            allocated_rewards: 0,
            allocated_subsidies: 0,
            claimed_rewards: 0,
            claimed_subsidies: 0,
            swept: 0,
            finalized_in: None,
        }
    }
}

impl EpochRecord {
    pub fn state(&self) -> EpochState {
        self.state
    }

    /// Combined reward + subsidy budget. The stamping path checks the sum
    /// fits a `u64`, so the saturating add never actually saturates.
    pub fn allocated(&self) -> u64 {
        self.allocated_rewards.saturating_add(self.allocated_subsidies)
    }

    pub fn allocated_rewards(&self) -> u64 {
        self.allocated_rewards
    }

    pub fn allocated_subsidies(&self) -> u64 {
        self.allocated_subsidies
    }

    pub fn claimed(&self) -> u64 {
        self.claimed_rewards.saturating_add(self.claimed_subsidies)
    }

    pub fn claimed_rewards(&self) -> u64 {
        self.claimed_rewards
    }

    pub fn claimed_subsidies(&self) -> u64 {
        self.claimed_subsidies
    }

    pub fn swept(&self) -> u64 {
        self.swept
    }

    pub fn finalized_in(&self) -> Option<EpochId> {
        self.finalized_in
    }

    pub fn snapshot(&self) -> &BTreeSet<PoolId> {
        &self.snapshot
    }

    pub fn is_blocked(&self, verifier: AccountId) -> bool {
        self.blocked.contains(&verifier)
    }

    pub fn is_stamped(&self, pool: PoolId) -> bool {
        self.stamped.contains(&pool)
    }

    pub fn is_claimable(&self) -> bool {
        self.state == EpochState::Finalized
    }

    fn expect(&self, epoch: EpochId, expected: EpochState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(LedgerError::WrongEpochState {
                epoch,
                expected,
                actual: self.state,
            })
        }
    }

    /// `Voting -> Ended`, freezing the pool snapshot.
    pub fn end(&mut self, epoch: EpochId, snapshot: BTreeSet<PoolId>) -> Result<()> {
        self.expect(epoch, EpochState::Voting)?;
        self.snapshot = snapshot;
        self.state = EpochState::Ended;
        tracing::info!(epoch = epoch.0, pools = self.snapshot.len(), "epoch ended");
        Ok(())
    }

    /// `Ended -> Verified`, recording blocked verifiers. With an empty pool
    /// snapshot there is nothing to stamp or pull; the epoch goes straight
    /// to `Finalized` with a zero budget.
    pub fn verify(
        &mut self,
        epoch: EpochId,
        now_e: EpochId,
        blocked: BTreeSet<AccountId>,
        max_blocked: usize,
    ) -> Result<()> {
        self.expect(epoch, EpochState::Ended)?;
        if blocked.len() > max_blocked {
            return Err(LedgerError::BoundExceeded(
                "max_blocked_per_epoch exceeded".into(),
            ));
        }
        self.blocked = blocked;
        if self.snapshot.is_empty() {
            self.state = EpochState::Finalized;
            self.finalized_in = Some(now_e);
            tracing::info!(epoch = epoch.0, "epoch verified with no pools, finalized empty");
        } else {
            self.state = EpochState::Verified;
            tracing::info!(epoch = epoch.0, blocked = self.blocked.len(), "epoch verified");
        }
        Ok(())
    }

    /// Records one stamped pool; fires `Verified -> Processed` exactly once,
    /// when the last snapshot pool is stamped.
    pub fn note_stamped(
        &mut self,
        epoch: EpochId,
        pool: PoolId,
        reward: u64,
        subsidy: u64,
    ) -> Result<()> {
        self.expect(epoch, EpochState::Verified)?;
        if !self.snapshot.contains(&pool) {
            return Err(LedgerError::InvalidInput(
                "pool not in the epoch's snapshot".into(),
            ));
        }
        let new_rewards = add_u64(self.allocated_rewards, reward)?;
        let new_subsidies = add_u64(self.allocated_subsidies, subsidy)?;
        // The combined budget must also fit.
        add_u64(new_rewards, new_subsidies)?;
        if !self.stamped.insert(pool) {
            return Err(LedgerError::InvalidInput(
                "pool already stamped for this epoch".into(),
            ));
        }
        self.allocated_rewards = new_rewards;
        self.allocated_subsidies = new_subsidies;
        if self.stamped.len() == self.snapshot.len() {
            self.state = EpochState::Processed;
            tracing::info!(epoch = epoch.0, allocated = self.allocated(), "epoch processed");
        }
        Ok(())
    }

    /// `Processed -> Finalized`; the caller has pulled the budget.
    pub fn finalize(&mut self, epoch: EpochId, now_e: EpochId) -> Result<()> {
        self.expect(epoch, EpochState::Processed)?;
        self.state = EpochState::Finalized;
        self.finalized_in = Some(now_e);
        tracing::info!(epoch = epoch.0, allocated = self.allocated(), "epoch finalized");
        Ok(())
    }

    /// Abandons the epoch from any non-terminal state. The allocation is
    /// zeroed so nothing can ever be claimed; claims fail loudly with
    /// `EpochNotClaimable` rather than silently paying zero.
    pub fn force_finalize(&mut self, epoch: EpochId, now_e: EpochId) -> Result<()> {
        if self.state.is_terminal() {
            return Err(LedgerError::WrongEpochState {
                epoch,
                expected: EpochState::Voting,
                actual: self.state,
            });
        }
        self.state = EpochState::ForceFinalized;
        self.allocated_rewards = 0;
        self.allocated_subsidies = 0;
        self.finalized_in = Some(now_e);
        tracing::info!(epoch = epoch.0, "epoch force-finalized");
        Ok(())
    }

    /// Pure headroom check for a reward claim; `add_claimed_rewards` commits
    /// after the identical check, so callers can pre-validate a whole batch
    /// before committing any of it.
    pub fn check_add_claimed_rewards(&self, amount: u64) -> Result<()> {
        let next = add_u64(self.claimed_rewards, amount)?;
        if next > self.allocated_rewards {
            return Err(LedgerError::Overflow(
                "claims would exceed the epoch's reward allocation".into(),
            ));
        }
        self.check_outflow(next, self.claimed_subsidies)
    }

    pub fn add_claimed_rewards(&mut self, amount: u64) -> Result<()> {
        self.check_add_claimed_rewards(amount)?;
        self.claimed_rewards += amount;
        Ok(())
    }

    pub fn check_add_claimed_subsidies(&self, amount: u64) -> Result<()> {
        let next = add_u64(self.claimed_subsidies, amount)?;
        if next > self.allocated_subsidies {
            return Err(LedgerError::Overflow(
                "claims would exceed the epoch's subsidy allocation".into(),
            ));
        }
        self.check_outflow(self.claimed_rewards, next)
    }

    pub fn add_claimed_subsidies(&mut self, amount: u64) -> Result<()> {
        self.check_add_claimed_subsidies(amount)?;
        self.claimed_subsidies += amount;
        Ok(())
    }

    // claimed + swept can never exceed what was allocated, even after a
    // sweep has already taken part of the residual.
    fn check_outflow(&self, claimed_r: u64, claimed_s: u64) -> Result<()> {
        let outflow = claimed_r
            .saturating_add(claimed_s)
            .saturating_add(self.swept);
        if outflow > self.allocated() {
            return Err(LedgerError::Overflow(
                "claims would exceed the epoch allocation".into(),
            ));
        }
        Ok(())
    }

    pub fn add_swept(&mut self, amount: u64) -> Result<()> {
        let next = add_u64(self.swept, amount)?;
        if self.claimed().saturating_add(next) > self.allocated() {
            return Err(LedgerError::Overflow(
                "sweep would exceed the epoch allocation".into(),
            ));
        }
        self.swept = next;
        Ok(())
    }

    /// Unclaimed, unswept residue.
    pub fn residual(&self) -> u64 {
        self.allocated()
            .saturating_sub(self.claimed())
            .saturating_sub(self.swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Hash32;

    fn pool(b: u8) -> PoolId {
        PoolId(Hash32([b; 32]))
    }

    const E: EpochId = EpochId(7);

    fn snapshot(ids: &[u8]) -> BTreeSet<PoolId> {
        ids.iter().map(|b| pool(*b)).collect()
    }

    #[test]
    fn happy_path_walks_every_state() {
        let mut r = EpochRecord::default();
        assert_eq!(r.state(), EpochState::Voting);
        r.end(E, snapshot(&[1, 2])).unwrap();
        r.verify(E, EpochId(8), BTreeSet::new(), 10).unwrap();
        r.note_stamped(E, pool(1), 100, 0).unwrap();
        assert_eq!(r.state(), EpochState::Verified);
        r.note_stamped(E, pool(2), 30, 20).unwrap();
        assert_eq!(r.state(), EpochState::Processed);
        r.finalize(E, EpochId(8)).unwrap();
        assert!(r.is_claimable());
        assert_eq!(r.allocated(), 150);
        assert_eq!(r.allocated_rewards(), 130);
        assert_eq!(r.allocated_subsidies(), 20);
        assert_eq!(r.finalized_in(), Some(EpochId(8)));
    }

    #[test]
    fn skipped_steps_are_rejected() {
        let mut r = EpochRecord::default();
        assert!(matches!(
            r.verify(E, EpochId(8), BTreeSet::new(), 10),
            Err(LedgerError::WrongEpochState { .. })
        ));
        assert!(r.finalize(E, EpochId(8)).is_err());
        r.end(E, snapshot(&[1])).unwrap();
        assert!(r.end(E, snapshot(&[1])).is_err());
        assert!(r.finalize(E, EpochId(8)).is_err());
    }

    #[test]
    fn stamping_rejects_strays_and_duplicates() {
        let mut r = EpochRecord::default();
        r.end(E, snapshot(&[1])).unwrap();
        r.verify(E, EpochId(8), BTreeSet::new(), 10).unwrap();
        assert!(r.note_stamped(E, pool(9), 10, 0).is_err());
        r.note_stamped(E, pool(1), 10, 0).unwrap();
        // Already processed; a second stamp is a wrong-state error.
        assert!(r.note_stamped(E, pool(1), 10, 0).is_err());
    }

    #[test]
    fn empty_snapshot_finalizes_at_verify() {
        let mut r = EpochRecord::default();
        r.end(E, BTreeSet::new()).unwrap();
        r.verify(E, EpochId(9), BTreeSet::new(), 10).unwrap();
        assert_eq!(r.state(), EpochState::Finalized);
        assert_eq!(r.allocated(), 0);
        assert_eq!(r.finalized_in(), Some(EpochId(9)));
    }

    #[test]
    fn force_finalize_zeroes_and_terminates() {
        let mut r = EpochRecord::default();
        r.end(E, snapshot(&[1])).unwrap();
        r.verify(E, EpochId(8), BTreeSet::new(), 10).unwrap();
        r.note_stamped(E, pool(1), 400, 100).unwrap();
        r.force_finalize(E, EpochId(8)).unwrap();
        assert_eq!(r.state(), EpochState::ForceFinalized);
        assert_eq!(r.allocated(), 0);
        assert!(!r.is_claimable());
        assert!(r.force_finalize(E, EpochId(9)).is_err());
    }

    #[test]
    fn counters_never_exceed_allocation() {
        let mut r = EpochRecord::default();
        r.end(E, snapshot(&[1])).unwrap();
        r.verify(E, EpochId(8), BTreeSet::new(), 10).unwrap();
        r.note_stamped(E, pool(1), 100, 0).unwrap();
        r.finalize(E, EpochId(8)).unwrap();
        r.add_claimed_rewards(60).unwrap();
        assert!(r.add_claimed_rewards(41).is_err());
        r.add_swept(40).unwrap();
        assert_eq!(r.residual(), 0);
        assert!(r.add_swept(1).is_err());
    }

    #[test]
    fn claims_stay_within_their_side_of_the_budget() {
        let mut r = EpochRecord::default();
        r.end(E, snapshot(&[1])).unwrap();
        r.verify(E, EpochId(8), BTreeSet::new(), 10).unwrap();
        r.note_stamped(E, pool(1), 100, 40).unwrap();
        r.finalize(E, EpochId(8)).unwrap();

        // Subsidy claims cannot raid the reward side, and vice versa.
        assert!(r.add_claimed_subsidies(41).is_err());
        r.add_claimed_subsidies(40).unwrap();
        assert!(r.add_claimed_rewards(101).is_err());
        r.add_claimed_rewards(100).unwrap();
        assert_eq!(r.claimed(), 140);
        assert_eq!(r.residual(), 0);

        // Once a sweep took the residual, nothing more can leave even if a
        // side still shows headroom on its own counter.
        assert!(r.add_swept(1).is_err());
    }

    #[test]
    fn sweep_then_claim_cannot_overdraw() {
        let mut r = EpochRecord::default();
        r.end(E, snapshot(&[1])).unwrap();
        r.verify(E, EpochId(8), BTreeSet::new(), 10).unwrap();
        r.note_stamped(E, pool(1), 100, 0).unwrap();
        r.finalize(E, EpochId(8)).unwrap();
        r.add_swept(100).unwrap();
        assert!(r.add_claimed_rewards(1).is_err());
    }

    #[test]
    fn blocked_set_is_bounded() {
        let mut r = EpochRecord::default();
        r.end(E, snapshot(&[1])).unwrap();
        let blocked: BTreeSet<AccountId> =
            (0..5u8).map(|b| AccountId(Hash32([b; 32]))).collect();
        assert!(matches!(
            r.verify(E, EpochId(8), blocked.clone(), 4),
            Err(LedgerError::BoundExceeded(_))
        ));
        // Still in Ended; a bounded set goes through.
        r.verify(E, EpochId(8), blocked, 5).unwrap();
        assert!(r.is_blocked(AccountId(Hash32([2; 32]))));
    }
}
