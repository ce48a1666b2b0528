//! Pool registry and per-epoch vote/allocation records.
//!
//! Votes are denominated in end-of-epoch power units and recorded per
//! `(epoch, pool)` and per `(epoch, account, capacity)`. Spending is tracked
//! per capacity so personal and delegated budgets never mix. Allocation
//! stamping writes externally computed reward/subsidy figures onto the same
//! per-epoch records; the state gating for when stamping is legal lives in
//! the lifecycle machine, not here.
//!
//! Each pool also carries lifetime vote and allocation totals. The invariant
//! suite reconciles them against the sum of the per-epoch records, so a
//! bookkeeping slip in either direction surfaces as a violation instead of a
//! silent drift.

use std::collections::BTreeMap;

use crate::math::{add_u64, sub_u64};
use crate::types::{Capacity, EpochId, PoolId};
use crate::{AccountId, LedgerError, Result};

#[derive(Clone, Debug)]
struct Pool {
    active: bool,
    created_in: EpochId,
    removed_in: Option<EpochId>,
    lifetime_votes: u64,
    lifetime_rewards: u64,
    lifetime_subsidies: u64,
}

/// Votes, stamped allocations, and claimed counters for one pool in one
/// epoch.
#[derive(Clone, Debug, Default)]
pub struct PoolEpoch {
    total_votes: u64,
    votes: BTreeMap<(AccountId, Capacity), u64>,
    reward: Option<u64>,
    subsidy: Option<u64>,
    claimed_rewards: u64,
    claimed_subsidies: u64,
}

impl PoolEpoch {
    pub fn total_votes(&self) -> u64 {
        self.total_votes
    }

    pub fn reward(&self) -> u64 {
        self.reward.unwrap_or(0)
    }

    pub fn subsidy(&self) -> u64 {
        self.subsidy.unwrap_or(0)
    }

    pub fn claimed_rewards(&self) -> u64 {
        self.claimed_rewards
    }

    pub fn claimed_subsidies(&self) -> u64 {
        self.claimed_subsidies
    }

    pub fn is_stamped(&self) -> bool {
        self.reward.is_some()
    }
}

#[derive(Debug, Default)]
pub struct PoolVoteLedger {
    pools: BTreeMap<PoolId, Pool>,
    by_epoch: BTreeMap<(EpochId, PoolId), PoolEpoch>,
    spent: BTreeMap<(EpochId, AccountId, Capacity), u64>,
}

impl PoolVoteLedger {
    pub fn new() -> PoolVoteLedger {
        PoolVoteLedger::default()
    }

    // ---------------------------------------------------------------------
    // Pool membership
    // ---------------------------------------------------------------------

    pub fn create_pool(&mut self, id: PoolId, now_e: EpochId, max_pools: usize) -> Result<()> {
        if self.pools.contains_key(&id) {
            return Err(LedgerError::InvalidInput("pool id already used".into()));
        }
        if self.active_pool_count() >= max_pools {
            return Err(LedgerError::BoundExceeded("max_pools exceeded".into()));
        }
        self.pools.insert(
            id,
            Pool {
                active: true,
                created_in: now_e,
                removed_in: None,
                lifetime_votes: 0,
                lifetime_rewards: 0,
                lifetime_subsidies: 0,
            },
        );
        tracing::info!(?id, epoch = now_e.0, "pool created");
        Ok(())
    }

    /// Deactivates a pool.
    ///
    /// Preconditions:
    /// - the pool carries no votes in the current epoch (fail-closed; voters
    ///   would otherwise hold spent power against a vanished target).
    pub fn remove_pool(&mut self, id: PoolId, now_e: EpochId) -> Result<()> {
        match self.pools.get(&id) {
            None => return Err(LedgerError::UnknownPool(id)),
            Some(p) if !p.active => return Err(LedgerError::PoolInactive(id)),
            Some(_) => {}
        }
        if self.total_votes(now_e, id) > 0 {
            return Err(LedgerError::InvalidInput(
                "pool has votes in the current epoch".into(),
            ));
        }
        let p = self.pools.get_mut(&id).ok_or(LedgerError::UnknownPool(id))?;
        p.active = false;
        p.removed_in = Some(now_e);
        tracing::info!(?id, epoch = now_e.0, "pool removed");
        Ok(())
    }

    pub fn is_active(&self, id: PoolId) -> bool {
        self.pools.get(&id).map(|p| p.active).unwrap_or(false)
    }

    pub fn exists(&self, id: PoolId) -> bool {
        self.pools.contains_key(&id)
    }

    pub fn pool_epochs(&self, id: PoolId) -> Option<(EpochId, Option<EpochId>)> {
        self.pools.get(&id).map(|p| (p.created_in, p.removed_in))
    }

    pub fn active_pool_count(&self) -> usize {
        self.pools.values().filter(|p| p.active).count()
    }

    pub fn active_pool_ids(&self) -> Vec<PoolId> {
        self.pools
            .iter()
            .filter(|(_, p)| p.active)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn pool_ids(&self) -> Vec<PoolId> {
        self.pools.keys().copied().collect()
    }

    // ---------------------------------------------------------------------
    // Lifetime totals
    // ---------------------------------------------------------------------

    pub fn lifetime_votes(&self, id: PoolId) -> u64 {
        self.pools.get(&id).map(|p| p.lifetime_votes).unwrap_or(0)
    }

    pub fn lifetime_rewards(&self, id: PoolId) -> u64 {
        self.pools.get(&id).map(|p| p.lifetime_rewards).unwrap_or(0)
    }

    pub fn lifetime_subsidies(&self, id: PoolId) -> u64 {
        self.pools
            .get(&id)
            .map(|p| p.lifetime_subsidies)
            .unwrap_or(0)
    }

    /// Sum of a pool's per-epoch vote totals, for reconciliation against
    /// `lifetime_votes`.
    pub fn epoch_vote_total(&self, id: PoolId) -> u64 {
        self.by_epoch
            .iter()
            .filter(|((_, p), _)| *p == id)
            .fold(0u64, |acc, (_, rec)| acc.saturating_add(rec.total_votes))
    }

    // ---------------------------------------------------------------------
    // Voting
    // ---------------------------------------------------------------------

    /// Records a vote against the caller's remaining budget.
    ///
    /// `available` is the caller's full end-of-epoch power in the given
    /// capacity; the remaining budget is `available - spent_so_far`. All
    /// arithmetic is validated before any counter moves.
    pub fn cast_vote(
        &mut self,
        e: EpochId,
        account: AccountId,
        capacity: Capacity,
        pool: PoolId,
        amount: u64,
        available: u64,
    ) -> Result<()> {
        if amount == 0 {
            return Err(LedgerError::InvalidInput("vote amount must be > 0".into()));
        }
        if !self.exists(pool) {
            return Err(LedgerError::UnknownPool(pool));
        }
        if !self.is_active(pool) {
            return Err(LedgerError::PoolInactive(pool));
        }
        let spent = self.spent(e, account, capacity);
        let new_spent = add_u64(spent, amount)?;
        if new_spent > available {
            return Err(LedgerError::InsufficientVotes {
                requested: amount,
                available: available.saturating_sub(spent),
            });
        }
        let new_total = add_u64(self.total_votes(e, pool), amount)?;
        let new_votes = add_u64(self.votes_of(e, pool, account, capacity), amount)?;
        let new_lifetime = add_u64(self.lifetime_votes(pool), amount)?;

        self.spent.insert((e, account, capacity), new_spent);
        let rec = self.by_epoch.entry((e, pool)).or_default();
        rec.total_votes = new_total;
        rec.votes.insert((account, capacity), new_votes);
        if let Some(p) = self.pools.get_mut(&pool) {
            p.lifetime_votes = new_lifetime;
        }
        tracing::debug!(?account, ?pool, amount, epoch = e.0, "vote cast");
        Ok(())
    }

    /// Moves already-cast votes between pools. Spent totals are unchanged;
    /// the destination must be active. Lifetime totals move with the votes.
    pub fn migrate_votes(
        &mut self,
        e: EpochId,
        account: AccountId,
        capacity: Capacity,
        from: PoolId,
        to: PoolId,
        amount: u64,
    ) -> Result<()> {
        if amount == 0 {
            return Err(LedgerError::InvalidInput("vote amount must be > 0".into()));
        }
        if from == to {
            return Err(LedgerError::InvalidInput(
                "source and destination pool are the same".into(),
            ));
        }
        if !self.exists(to) {
            return Err(LedgerError::UnknownPool(to));
        }
        if !self.is_active(to) {
            return Err(LedgerError::PoolInactive(to));
        }
        let have = self.votes_of(e, from, account, capacity);
        if have < amount {
            return Err(LedgerError::InsufficientVotes {
                requested: amount,
                available: have,
            });
        }
        let src_total = sub_u64(self.total_votes(e, from), amount)?;
        let src_votes = sub_u64(have, amount)?;
        let dst_total = add_u64(self.total_votes(e, to), amount)?;
        let dst_votes = add_u64(self.votes_of(e, to, account, capacity), amount)?;
        let src_lifetime = sub_u64(self.lifetime_votes(from), amount)?;
        let dst_lifetime = add_u64(self.lifetime_votes(to), amount)?;

        let src = self
            .by_epoch
            .get_mut(&(e, from))
            .ok_or(LedgerError::UnknownPool(from))?;
        src.total_votes = src_total;
        if src_votes == 0 {
            src.votes.remove(&(account, capacity));
        } else {
            src.votes.insert((account, capacity), src_votes);
        }

        let dst = self.by_epoch.entry((e, to)).or_default();
        dst.total_votes = dst_total;
        dst.votes.insert((account, capacity), dst_votes);

        if let Some(p) = self.pools.get_mut(&from) {
            p.lifetime_votes = src_lifetime;
        }
        if let Some(p) = self.pools.get_mut(&to) {
            p.lifetime_votes = dst_lifetime;
        }
        tracing::debug!(?account, ?from, ?to, amount, epoch = e.0, "votes migrated");
        Ok(())
    }

    pub fn spent(&self, e: EpochId, account: AccountId, capacity: Capacity) -> u64 {
        self.spent
            .get(&(e, account, capacity))
            .copied()
            .unwrap_or(0)
    }

    pub fn votes_of(&self, e: EpochId, pool: PoolId, account: AccountId, capacity: Capacity) -> u64 {
        self.by_epoch
            .get(&(e, pool))
            .and_then(|r| r.votes.get(&(account, capacity)))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_votes(&self, e: EpochId, pool: PoolId) -> u64 {
        self.by_epoch
            .get(&(e, pool))
            .map(|r| r.total_votes)
            .unwrap_or(0)
    }

    /// Every account that spent votes in epoch `e`, with capacity and total
    /// spent (invariant checking).
    pub fn spenders(&self, e: EpochId) -> Vec<(AccountId, Capacity, u64)> {
        self.spent
            .range(
                (e, AccountId::MIN, Capacity::Personal)
                    ..=(e, AccountId::MAX, Capacity::Delegated),
            )
            .map(|((_, a, c), v)| (*a, *c, *v))
            .collect()
    }

    /// Pools with a record in epoch `e` (voted in, or stamped).
    pub fn pools_in_epoch(&self, e: EpochId) -> Vec<PoolId> {
        self.by_epoch
            .range((e, PoolId::MIN)..=(e, PoolId::MAX))
            .map(|((_, p), _)| *p)
            .collect()
    }

    // ---------------------------------------------------------------------
    // Allocation stamping and claimed counters
    // ---------------------------------------------------------------------

    /// Writes an epoch's reward/subsidy allocation onto a pool record.
    /// Double-stamping is rejected; a pool with no votes still gets a record
    /// so the processed-count accounting stays exact.
    pub fn stamp(&mut self, e: EpochId, pool: PoolId, reward: u64, subsidy: u64) -> Result<()> {
        if !self.exists(pool) {
            return Err(LedgerError::UnknownPool(pool));
        }
        let new_rewards = add_u64(self.lifetime_rewards(pool), reward)?;
        let new_subsidies = add_u64(self.lifetime_subsidies(pool), subsidy)?;
        let rec = self.by_epoch.entry((e, pool)).or_default();
        if rec.is_stamped() {
            return Err(LedgerError::InvalidInput(
                "pool already stamped for this epoch".into(),
            ));
        }
        rec.reward = Some(reward);
        rec.subsidy = Some(subsidy);
        if let Some(p) = self.pools.get_mut(&pool) {
            p.lifetime_rewards = new_rewards;
            p.lifetime_subsidies = new_subsidies;
        }
        tracing::debug!(?pool, reward, subsidy, epoch = e.0, "allocation stamped");
        Ok(())
    }

    /// Checks that a reward claim fits the pool's remaining stamped reward,
    /// without committing anything.
    pub fn check_claim_reward(&self, e: EpochId, pool: PoolId, amount: u64) -> Result<()> {
        let rec = self
            .by_epoch
            .get(&(e, pool))
            .ok_or(LedgerError::NothingToClaim)?;
        if add_u64(rec.claimed_rewards, amount)? > rec.reward() {
            return Err(LedgerError::Overflow(
                "claims would exceed the pool's stamped reward".into(),
            ));
        }
        Ok(())
    }

    pub fn note_claimed_reward(&mut self, e: EpochId, pool: PoolId, amount: u64) -> Result<()> {
        self.check_claim_reward(e, pool, amount)?;
        if let Some(rec) = self.by_epoch.get_mut(&(e, pool)) {
            rec.claimed_rewards += amount;
        }
        Ok(())
    }

    /// Checks that a subsidy claim fits the pool's remaining stamped
    /// subsidy, without committing anything.
    pub fn check_claim_subsidy(&self, e: EpochId, pool: PoolId, amount: u64) -> Result<()> {
        let rec = self
            .by_epoch
            .get(&(e, pool))
            .ok_or(LedgerError::NothingToClaim)?;
        if add_u64(rec.claimed_subsidies, amount)? > rec.subsidy() {
            return Err(LedgerError::Overflow(
                "claims would exceed the pool's stamped subsidy".into(),
            ));
        }
        Ok(())
    }

    pub fn note_claimed_subsidy(&mut self, e: EpochId, pool: PoolId, amount: u64) -> Result<()> {
        self.check_claim_subsidy(e, pool, amount)?;
        if let Some(rec) = self.by_epoch.get_mut(&(e, pool)) {
            rec.claimed_subsidies += amount;
        }
        Ok(())
    }

    /// Zeroes every allocation stamped for the epoch (force-finalize path),
    /// rolling the amounts back out of the lifetime totals.
    pub fn clear_allocations(&mut self, e: EpochId) {
        let ids: Vec<PoolId> = self.pools_in_epoch(e);
        for id in ids {
            if let Some(rec) = self.by_epoch.get_mut(&(e, id)) {
                let reward = rec.reward.take().unwrap_or(0);
                let subsidy = rec.subsidy.take().unwrap_or(0);
                if let Some(p) = self.pools.get_mut(&id) {
                    p.lifetime_rewards = p.lifetime_rewards.saturating_sub(reward);
                    p.lifetime_subsidies = p.lifetime_subsidies.saturating_sub(subsidy);
                }
            }
        }
    }

    pub fn record(&self, e: EpochId, pool: PoolId) -> Option<&PoolEpoch> {
        self.by_epoch.get(&(e, pool))
    }
}
