//! `VeLedger`: the single mutable facade over escrow, delegation, pools,
//! epoch lifecycle, and claims.
//!
//! The engine is a pure state machine; callers supply the timestamp, the
//! value adapter, the subsidy source, and the role gate per call. `&mut self`
//! is the serialization point: operations run to completion, and every
//! mutator validates fully before committing, so a returned `Err` means no
//! state changed.
//!
//! Value-movement ordering (part of the atomicity contract): inbound
//! transfers are ordered before the matching state commit; outbound
//! transfers after. A `ValueAdapter` must not fail for outbound amounts
//! already in its custody, and the engine checks the adapter's claimable
//! budget before committing any claim, so a vault that lost custody rejects
//! the claim cleanly instead of stranding a consumed claim key.

use std::collections::{BTreeMap, BTreeSet};

use crate::boundary::{SubsidySource, ValueAdapter};
use crate::claims::{self, ClaimKey};
use crate::config::LedgerConfig;
use crate::delegation::DelegateRegistry;
use crate::epoch::EpochClock;
use crate::escrow::{Lock, VotingEscrow};
use crate::gate::{Role, RoleGate};
use crate::invariants;
use crate::lifecycle::{EpochRecord, EpochState};
use crate::math::add_u64;
use crate::pools::{PoolEpoch, PoolVoteLedger};
use crate::types::{
    Amount, Bps, Capacity, EpochId, LedgerParams, LockId, PoolId, Power, RuntimeBounds,
};
use crate::{AccountId, Hash32, LedgerError, Result};

pub struct VeLedger {
    clock: EpochClock,
    params: LedgerParams,
    bounds: RuntimeBounds,
    escrow: VotingEscrow,
    registry: DelegateRegistry,
    pools: PoolVoteLedger,
    epochs: BTreeMap<EpochId, EpochRecord>,
    claims: BTreeSet<ClaimKey>,
    paused: bool,
    emergency: bool,
}

impl VeLedger {
    pub fn new(config: &LedgerConfig) -> Result<VeLedger> {
        config.validate()?;
        Self::from_parts(config.clock()?, config.params()?, config.bounds)
    }

    pub fn from_parts(
        clock: EpochClock,
        params: LedgerParams,
        bounds: RuntimeBounds,
    ) -> Result<VeLedger> {
        bounds.validate()?;
        Ok(VeLedger {
            clock,
            params,
            bounds,
            escrow: VotingEscrow::new(clock, &params, &bounds)?,
            registry: DelegateRegistry::new(),
            pools: PoolVoteLedger::new(),
            epochs: BTreeMap::new(),
            claims: BTreeSet::new(),
            paused: false,
            emergency: false,
        })
    }

    pub fn clock(&self) -> &EpochClock {
        &self.clock
    }

    pub fn params(&self) -> &LedgerParams {
        &self.params
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency
    }

    fn ensure_unpaused(&self) -> Result<()> {
        if self.paused {
            Err(LedgerError::Paused)
        } else {
            Ok(())
        }
    }

    fn record_mut(&mut self, e: EpochId) -> &mut EpochRecord {
        self.epochs.entry(e).or_default()
    }

    fn owned_lock(&self, caller: AccountId, id: LockId) -> Result<&Lock> {
        let lock = self.escrow.lock(id)?;
        if lock.owner != caller {
            return Err(LedgerError::NotAuthorized(
                "caller does not own this lock".into(),
            ));
        }
        Ok(lock)
    }

    // ---------------------------------------------------------------------
    // Lock operations
    // ---------------------------------------------------------------------

    /// Opens a lock for `caller`. Principal is pulled through the vault
    /// before the lock is committed.
    pub fn create_lock(
        &mut self,
        caller: AccountId,
        wallet: Amount,
        reward: Amount,
        expiry_ts: u64,
        nonce: Hash32,
        now: u64,
        vault: &mut dyn ValueAdapter,
    ) -> Result<LockId> {
        self.ensure_unpaused()?;
        let principal = self
            .escrow
            .validate_create(caller, wallet, reward, expiry_ts, now, nonce)?;
        vault.deposit_principal(caller, principal)?;
        self.escrow
            .create_lock(caller, wallet, reward, expiry_ts, now, nonce)
    }

    pub fn increase_amount(
        &mut self,
        caller: AccountId,
        id: LockId,
        wallet_add: Amount,
        reward_add: Amount,
        now: u64,
        vault: &mut dyn ValueAdapter,
    ) -> Result<()> {
        self.ensure_unpaused()?;
        let add = add_u64(wallet_add.get(), reward_add.get())?;
        if add == 0 {
            return Err(LedgerError::InvalidInput("increase must be > 0".into()));
        }
        let lock = self.owned_lock(caller, id)?;
        if lock.unlocked {
            return Err(LedgerError::LockUnlocked);
        }
        if now >= lock.expiry_ts {
            return Err(LedgerError::InvalidInput(
                "cannot increase an expired lock".into(),
            ));
        }
        add_u64(lock.principal(), add)?;
        vault.deposit_principal(caller, add)?;
        self.escrow.increase_amount(id, wallet_add, reward_add, now)
    }

    pub fn extend_lock(
        &mut self,
        caller: AccountId,
        id: LockId,
        new_expiry_ts: u64,
        now: u64,
    ) -> Result<()> {
        self.ensure_unpaused()?;
        self.owned_lock(caller, id)?;
        self.escrow.extend_lock(id, new_expiry_ts, now)
    }

    /// Releases an expired lock's principal. Available while paused; pausing
    /// must never trap matured principal.
    pub fn withdraw(
        &mut self,
        caller: AccountId,
        id: LockId,
        now: u64,
        vault: &mut dyn ValueAdapter,
    ) -> Result<Amount> {
        self.owned_lock(caller, id)?;
        let (wallet, reward) = self.escrow.withdraw(id, now)?;
        let total = add_u64(wallet.get(), reward.get())?;
        vault.release_principal(caller, total)?;
        Ok(Amount::new(total))
    }

    /// Early exit, allowed only while the emergency flag is set.
    pub fn emergency_withdraw(
        &mut self,
        caller: AccountId,
        id: LockId,
        now: u64,
        vault: &mut dyn ValueAdapter,
    ) -> Result<Amount> {
        if !self.emergency {
            return Err(LedgerError::NotAuthorized(
                "emergency exit is not enabled".into(),
            ));
        }
        self.owned_lock(caller, id)?;
        let (wallet, reward) = self.escrow.emergency_withdraw(id, now)?;
        let total = add_u64(wallet.get(), reward.get())?;
        vault.release_principal(caller, total)?;
        Ok(Amount::new(total))
    }

    // ---------------------------------------------------------------------
    // Delegation
    // ---------------------------------------------------------------------

    pub fn register_delegate(&mut self, caller: AccountId, fee: Bps) -> Result<()> {
        self.ensure_unpaused()?;
        self.registry.register(caller, fee, self.params.max_fee_bps())
    }

    /// Deregistration requires a quiet delegate: no votes spent in the
    /// current epoch and no delegated power inbound now or booked for the
    /// next boundary.
    pub fn unregister_delegate(&mut self, caller: AccountId, now: u64) -> Result<()> {
        self.ensure_unpaused()?;
        let e = self.clock.epoch_of(now);
        if self.pools.spent(e, caller, Capacity::Delegated) > 0 {
            return Err(LedgerError::InvalidInput(
                "delegate has votes in the current epoch".into(),
            ));
        }
        let now_power = self.escrow.power_at_epoch_end(caller, e, Capacity::Delegated)?;
        let next_power = self
            .escrow
            .power_at_epoch_end(caller, e.next(), Capacity::Delegated)?;
        if now_power != Power::ZERO || next_power != Power::ZERO {
            return Err(LedgerError::InvalidInput(
                "delegate still has inbound delegated power".into(),
            ));
        }
        self.registry.unregister(caller)
    }

    pub fn set_delegate_fee(&mut self, caller: AccountId, fee: Bps, now: u64) -> Result<()> {
        self.ensure_unpaused()?;
        self.registry.set_fee(
            caller,
            fee,
            self.clock.epoch_of(now),
            self.params.fee_raise_delay_epochs(),
            self.params.max_fee_bps(),
        )
    }

    pub fn delegate(
        &mut self,
        caller: AccountId,
        id: LockId,
        delegate: AccountId,
        now: u64,
    ) -> Result<()> {
        self.ensure_unpaused()?;
        self.owned_lock(caller, id)?;
        self.check_delegate_target(caller, delegate)?;
        self.escrow.delegate(id, delegate, now)
    }

    pub fn undelegate(&mut self, caller: AccountId, id: LockId, now: u64) -> Result<()> {
        self.ensure_unpaused()?;
        self.owned_lock(caller, id)?;
        self.escrow.undelegate(id, now)
    }

    pub fn switch_delegate(
        &mut self,
        caller: AccountId,
        id: LockId,
        new_delegate: AccountId,
        now: u64,
    ) -> Result<()> {
        self.ensure_unpaused()?;
        self.owned_lock(caller, id)?;
        self.check_delegate_target(caller, new_delegate)?;
        self.escrow.switch_delegate(id, new_delegate, now)
    }

    fn check_delegate_target(&self, holder: AccountId, delegate: AccountId) -> Result<()> {
        if !self.registry.is_registered(delegate) {
            return Err(LedgerError::UnknownDelegate);
        }
        let existing = self.escrow.delegators_of(delegate);
        if !existing.contains(&holder)
            && existing.len() >= self.bounds.max_delegators_per_delegate
        {
            return Err(LedgerError::BoundExceeded(
                "max_delegators_per_delegate exceeded".into(),
            ));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Voting
    // ---------------------------------------------------------------------

    pub fn cast_vote(
        &mut self,
        caller: AccountId,
        pool: PoolId,
        amount: u64,
        capacity: Capacity,
        now: u64,
    ) -> Result<()> {
        self.ensure_unpaused()?;
        let e = self.clock.epoch_of(now);
        self.ensure_voting(e)?;
        let mut first_delegated = false;
        if capacity == Capacity::Delegated {
            if !self.registry.is_registered(caller) {
                return Err(LedgerError::UnknownDelegate);
            }
            first_delegated = self.pools.spent(e, caller, Capacity::Delegated) == 0;
        }
        let available = self.escrow.power_at_epoch_end(caller, e, capacity)?;
        self.pools
            .cast_vote(e, caller, capacity, pool, amount, available.get())?;
        // The first delegated vote that lands freezes the fee for all of
        // this epoch's claims. A rejected vote must not freeze anything.
        if first_delegated {
            self.registry.snapshot_fee(caller, e)?;
        }
        Ok(())
    }

    pub fn migrate_votes(
        &mut self,
        caller: AccountId,
        from: PoolId,
        to: PoolId,
        amount: u64,
        capacity: Capacity,
        now: u64,
    ) -> Result<()> {
        self.ensure_unpaused()?;
        let e = self.clock.epoch_of(now);
        self.ensure_voting(e)?;
        self.pools.migrate_votes(e, caller, capacity, from, to, amount)
    }

    fn ensure_voting(&mut self, e: EpochId) -> Result<()> {
        let state = self.record_mut(e).state();
        if state != EpochState::Voting {
            return Err(LedgerError::WrongEpochState {
                epoch: e,
                expected: EpochState::Voting,
                actual: state,
            });
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Pool administration
    // ---------------------------------------------------------------------

    pub fn create_pool(
        &mut self,
        caller: AccountId,
        gate: &dyn RoleGate,
        id: PoolId,
        now: u64,
    ) -> Result<()> {
        gate.check(caller, Role::PoolAdmin)?;
        let e = self.clock.epoch_of(now);
        self.ensure_voting(e)?;
        self.pools.create_pool(id, e, self.bounds.max_pools)
    }

    pub fn remove_pool(
        &mut self,
        caller: AccountId,
        gate: &dyn RoleGate,
        id: PoolId,
        now: u64,
    ) -> Result<()> {
        gate.check(caller, Role::PoolAdmin)?;
        let e = self.clock.epoch_of(now);
        self.ensure_voting(e)?;
        self.pools.remove_pool(id, e)
    }

    // ---------------------------------------------------------------------
    // Epoch pipeline
    // ---------------------------------------------------------------------

    /// `Voting -> Ended` once the epoch's time window has elapsed.
    pub fn end_epoch(
        &mut self,
        caller: AccountId,
        gate: &dyn RoleGate,
        epoch: EpochId,
        now: u64,
    ) -> Result<()> {
        gate.check(caller, Role::EpochOperator)?;
        if now < self.clock.end(epoch) {
            return Err(LedgerError::InvalidInput(
                "epoch window has not elapsed".into(),
            ));
        }
        // Active pools, plus any pool that collected this epoch's votes but
        // was removed between the boundary and this (possibly late) call.
        // Dropping such a pool would strand its voters' claims.
        let mut snapshot: BTreeSet<PoolId> = self.pools.active_pool_ids().into_iter().collect();
        for pool in self.pools.pools_in_epoch(epoch) {
            if self.pools.total_votes(epoch, pool) > 0 {
                snapshot.insert(pool);
            }
        }
        self.record_mut(epoch).end(epoch, snapshot)
    }

    /// `Ended -> Verified` (or straight to `Finalized` when no pools were
    /// active), recording verifiers blocked from subsidy claims.
    pub fn verify_epoch(
        &mut self,
        caller: AccountId,
        gate: &dyn RoleGate,
        epoch: EpochId,
        blocked: BTreeSet<AccountId>,
        now: u64,
    ) -> Result<()> {
        gate.check(caller, Role::EpochOperator)?;
        let now_e = self.clock.epoch_of(now);
        let max_blocked = self.bounds.max_blocked_per_epoch;
        self.record_mut(epoch).verify(epoch, now_e, blocked, max_blocked)
    }

    /// Stamps `(pool, reward, subsidy)` allocations onto the epoch.
    /// Repeatable in batches; the whole batch is validated before any pool
    /// is stamped. `Verified -> Processed` fires when the last snapshot pool
    /// is stamped.
    pub fn stamp_allocations(
        &mut self,
        caller: AccountId,
        gate: &dyn RoleGate,
        epoch: EpochId,
        batch: &[(PoolId, u64, u64)],
    ) -> Result<()> {
        gate.check(caller, Role::EpochOperator)?;
        let rec = self
            .epochs
            .get(&epoch)
            .ok_or(LedgerError::WrongEpochState {
                epoch,
                expected: EpochState::Verified,
                actual: EpochState::Voting,
            })?;
        if rec.state() != EpochState::Verified {
            return Err(LedgerError::WrongEpochState {
                epoch,
                expected: EpochState::Verified,
                actual: rec.state(),
            });
        }
        let mut seen = BTreeSet::new();
        let mut rewards_total = rec.allocated_rewards();
        let mut subsidies_total = rec.allocated_subsidies();
        for (pool, reward, subsidy) in batch {
            if !seen.insert(*pool) {
                return Err(LedgerError::InvalidInput(
                    "duplicate pool in stamping batch".into(),
                ));
            }
            if !rec.snapshot().contains(pool) {
                return Err(LedgerError::InvalidInput(
                    "pool not in the epoch's snapshot".into(),
                ));
            }
            if rec.is_stamped(*pool) {
                return Err(LedgerError::InvalidInput(
                    "pool already stamped for this epoch".into(),
                ));
            }
            // Running epoch totals and the pool lifetime counters must all
            // fit, or the batch is rejected before any pool is stamped.
            rewards_total = add_u64(rewards_total, *reward)?;
            subsidies_total = add_u64(subsidies_total, *subsidy)?;
            add_u64(rewards_total, subsidies_total)?;
            add_u64(self.pools.lifetime_rewards(*pool), *reward)?;
            add_u64(self.pools.lifetime_subsidies(*pool), *subsidy)?;
        }

        for (pool, reward, subsidy) in batch {
            self.pools.stamp(epoch, *pool, *reward, *subsidy)?;
            self.record_mut(epoch)
                .note_stamped(epoch, *pool, *reward, *subsidy)?;
        }
        Ok(())
    }

    /// `Processed -> Finalized`: pulls the epoch's full budget into claim
    /// custody and opens the claim window.
    pub fn finalize_epoch(
        &mut self,
        caller: AccountId,
        gate: &dyn RoleGate,
        epoch: EpochId,
        now: u64,
        vault: &mut dyn ValueAdapter,
    ) -> Result<()> {
        gate.check(caller, Role::EpochOperator)?;
        let now_e = self.clock.epoch_of(now);
        let rec = self
            .epochs
            .get(&epoch)
            .ok_or(LedgerError::WrongEpochState {
                epoch,
                expected: EpochState::Processed,
                actual: EpochState::Voting,
            })?;
        if rec.state() != EpochState::Processed {
            return Err(LedgerError::WrongEpochState {
                epoch,
                expected: EpochState::Processed,
                actual: rec.state(),
            });
        }
        vault.pull_budget(epoch, rec.allocated())?;
        self.record_mut(epoch).finalize(epoch, now_e)
    }

    /// Abandons an epoch from any non-terminal state. Allocations are
    /// zeroed; every later claim for the epoch fails with
    /// `EpochNotClaimable`.
    pub fn force_finalize(
        &mut self,
        caller: AccountId,
        gate: &dyn RoleGate,
        epoch: EpochId,
        now: u64,
    ) -> Result<()> {
        gate.check(caller, Role::Guardian)?;
        let now_e = self.clock.epoch_of(now);
        self.record_mut(epoch).force_finalize(epoch, now_e)?;
        self.pools.clear_allocations(epoch);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Claims
    // ---------------------------------------------------------------------

    fn claimable_record(&self, epoch: EpochId) -> Result<&EpochRecord> {
        match self.epochs.get(&epoch) {
            Some(rec) if rec.is_claimable() => Ok(rec),
            _ => Err(LedgerError::EpochNotClaimable(epoch)),
        }
    }

    fn take_claim_key(&mut self, key: ClaimKey) -> Result<()> {
        if !self.claims.insert(key) {
            return Err(LedgerError::AlreadyClaimed);
        }
        Ok(())
    }

    fn ensure_vault_covers(vault: &dyn ValueAdapter, amount: u64) -> Result<()> {
        if vault.claimable_budget() < amount {
            return Err(LedgerError::InvalidInput(
                "vault budget does not cover the payout".into(),
            ));
        }
        Ok(())
    }

    /// Commits and pays a reward-side claim. Every fallible step is checked
    /// before the claim key or any counter moves, so a failure leaves no
    /// partial claim behind.
    fn pay_reward(
        &mut self,
        epoch: EpochId,
        pool: PoolId,
        to: AccountId,
        amount: u64,
        key: ClaimKey,
        vault: &mut dyn ValueAdapter,
    ) -> Result<u64> {
        Self::ensure_vault_covers(vault, amount)?;
        self.pools.check_claim_reward(epoch, pool, amount)?;
        self.epochs
            .get(&epoch)
            .ok_or(LedgerError::EpochNotClaimable(epoch))?
            .check_add_claimed_rewards(amount)?;

        self.take_claim_key(key)?;
        self.pools.note_claimed_reward(epoch, pool, amount)?;
        self.record_mut(epoch).add_claimed_rewards(amount)?;
        vault.pay_out(to, amount)?;
        tracing::debug!(?to, amount, epoch = epoch.0, "reward claim paid");
        Ok(amount)
    }

    fn pay_subsidy(
        &mut self,
        epoch: EpochId,
        pool: PoolId,
        to: AccountId,
        amount: u64,
        key: ClaimKey,
        vault: &mut dyn ValueAdapter,
    ) -> Result<u64> {
        Self::ensure_vault_covers(vault, amount)?;
        self.pools.check_claim_subsidy(epoch, pool, amount)?;
        self.epochs
            .get(&epoch)
            .ok_or(LedgerError::EpochNotClaimable(epoch))?
            .check_add_claimed_subsidies(amount)?;

        self.take_claim_key(key)?;
        self.pools.note_claimed_subsidy(epoch, pool, amount)?;
        self.record_mut(epoch).add_claimed_subsidies(amount)?;
        vault.pay_out(to, amount)?;
        tracing::debug!(?to, amount, epoch = epoch.0, "subsidy claim paid");
        Ok(amount)
    }

    /// Personal reward: the holder's floor pro-rata share of the pool's
    /// reward, by votes cast in personal capacity.
    pub fn claim_personal(
        &mut self,
        caller: AccountId,
        epoch: EpochId,
        pool: PoolId,
        vault: &mut dyn ValueAdapter,
    ) -> Result<u64> {
        self.claimable_record(epoch)?;
        let key = ClaimKey::Personal {
            epoch,
            holder: caller,
            pool,
        };
        if self.claims.contains(&key) {
            return Err(LedgerError::AlreadyClaimed);
        }
        let votes = self.pools.votes_of(epoch, pool, caller, Capacity::Personal);
        if votes == 0 {
            return Err(LedgerError::NothingToClaim);
        }
        let reward = self.pools.record(epoch, pool).map(|r| r.reward()).unwrap_or(0);
        let total = self.pools.total_votes(epoch, pool);
        let amount = claims::pro_rata(votes, reward, total)?;
        if amount == 0 {
            return Err(LedgerError::NothingToClaim);
        }
        self.pay_reward(epoch, pool, caller, amount, key, vault)
    }

    /// Delegated reward, net of the snapshotted fee. The delegate's pool
    /// share is split across contributors by end-of-epoch pair power.
    pub fn claim_delegated(
        &mut self,
        caller: AccountId,
        epoch: EpochId,
        delegate: AccountId,
        pool: PoolId,
        vault: &mut dyn ValueAdapter,
    ) -> Result<u64> {
        self.claimable_record(epoch)?;
        let key = ClaimKey::Delegated {
            epoch,
            delegator: caller,
            delegate,
            pool,
        };
        if self.claims.contains(&key) {
            return Err(LedgerError::AlreadyClaimed);
        }
        let (_, net) = self.delegated_share(epoch, caller, delegate, pool)?;
        if net == 0 {
            return Err(LedgerError::NothingToClaim);
        }
        self.pay_reward(epoch, pool, caller, net, key, vault)
    }

    /// A delegate's accumulated fee take for the epoch, across all their
    /// pools and contributors. Derived from the same snapshot arithmetic as
    /// the net claims, so claim order never changes either figure.
    pub fn claim_fee(
        &mut self,
        caller: AccountId,
        epoch: EpochId,
        vault: &mut dyn ValueAdapter,
    ) -> Result<u64> {
        self.claimable_record(epoch)?;
        let key = ClaimKey::Fee {
            epoch,
            delegate: caller,
        };
        if self.claims.contains(&key) {
            return Err(LedgerError::AlreadyClaimed);
        }
        let delegators = self.escrow.delegators_of(caller);
        let mut per_pool: Vec<(PoolId, u64)> = Vec::new();
        let mut total_fee: u64 = 0;
        for pool in self.pools.pools_in_epoch(epoch) {
            let mut pool_fee: u64 = 0;
            for delegator in &delegators {
                let (fee_part, _) = self.delegated_share(epoch, *delegator, caller, pool)?;
                pool_fee = add_u64(pool_fee, fee_part)?;
            }
            if pool_fee > 0 {
                per_pool.push((pool, pool_fee));
                total_fee = add_u64(total_fee, pool_fee)?;
            }
        }
        if total_fee == 0 {
            return Err(LedgerError::NothingToClaim);
        }

        // Validate the whole payout before committing any of it.
        Self::ensure_vault_covers(vault, total_fee)?;
        for (pool, pool_fee) in &per_pool {
            self.pools.check_claim_reward(epoch, *pool, *pool_fee)?;
        }
        self.epochs
            .get(&epoch)
            .ok_or(LedgerError::EpochNotClaimable(epoch))?
            .check_add_claimed_rewards(total_fee)?;

        self.take_claim_key(key)?;
        for (pool, pool_fee) in &per_pool {
            self.pools.note_claimed_reward(epoch, *pool, *pool_fee)?;
        }
        self.record_mut(epoch).add_claimed_rewards(total_fee)?;
        self.registry.record_fees(caller, total_fee)?;
        vault.pay_out(caller, total_fee)?;
        tracing::debug!(?caller, total_fee, epoch = epoch.0, "fee claim paid");
        Ok(total_fee)
    }

    /// `(fee, net)` portions of one delegator's gross share of a delegate's
    /// reward in one pool. Zero when the delegate did not vote in the pool
    /// or the pair contributed no power.
    fn delegated_share(
        &self,
        epoch: EpochId,
        delegator: AccountId,
        delegate: AccountId,
        pool: PoolId,
    ) -> Result<(u64, u64)> {
        let d_votes = self
            .pools
            .votes_of(epoch, pool, delegate, Capacity::Delegated);
        if d_votes == 0 {
            return Ok((0, 0));
        }
        let pair = self
            .escrow
            .pair_power_at_epoch_end(delegator, delegate, epoch)?;
        if pair == Power::ZERO {
            return Ok((0, 0));
        }
        let reward = self.pools.record(epoch, pool).map(|r| r.reward()).unwrap_or(0);
        let total = self.pools.total_votes(epoch, pool);
        let d_share = claims::pro_rata(d_votes, reward, total)?;
        let d_total = self
            .escrow
            .power_at_epoch_end(delegate, epoch, Capacity::Delegated)?;
        let gross = claims::pro_rata(pair.get(), d_share, d_total.get())?;
        let fee = self
            .registry
            .fee_for_epoch(delegate, epoch)
            .ok_or(LedgerError::NothingToClaim)?;
        let (net, fee_part) = claims::fee_split(gross, fee)?;
        Ok((fee_part, net))
    }

    /// Verifier subsidy: floor pro-rata over the external accrual ledger.
    pub fn claim_subsidy(
        &mut self,
        caller: AccountId,
        epoch: EpochId,
        pool: PoolId,
        source: &dyn SubsidySource,
        vault: &mut dyn ValueAdapter,
    ) -> Result<u64> {
        let rec = self.claimable_record(epoch)?;
        if rec.is_blocked(caller) {
            return Err(LedgerError::NotAuthorized(
                "verifier is blocked for this epoch".into(),
            ));
        }
        let key = ClaimKey::Subsidy {
            epoch,
            verifier: caller,
            pool,
        };
        if self.claims.contains(&key) {
            return Err(LedgerError::AlreadyClaimed);
        }
        let subsidy = self.pools.record(epoch, pool).map(|r| r.subsidy()).unwrap_or(0);
        let accrued = source.accrued(epoch, pool, caller)?;
        let total = source.total_accrued(epoch, pool)?;
        let amount = claims::pro_rata(accrued, subsidy, total)?;
        if amount == 0 {
            return Err(LedgerError::NothingToClaim);
        }
        self.pay_subsidy(epoch, pool, caller, amount, key, vault)
    }

    /// Sweeps `allocated - claimed - swept` to the treasury sink, once the
    /// delay past finalization has elapsed.
    pub fn sweep_residual(
        &mut self,
        caller: AccountId,
        gate: &dyn RoleGate,
        epoch: EpochId,
        now: u64,
        vault: &mut dyn ValueAdapter,
    ) -> Result<u64> {
        gate.check(caller, Role::Sweeper)?;
        let now_e = self.clock.epoch_of(now);
        let rec = self.claimable_record(epoch)?;
        let finalized_in = rec
            .finalized_in()
            .ok_or(LedgerError::EpochNotClaimable(epoch))?;
        let ready_at = EpochId(
            finalized_in
                .0
                .saturating_add(self.params.sweep_delay_epochs()),
        );
        if now_e.0 < ready_at.0 {
            return Err(LedgerError::SweepNotReady { ready_at });
        }
        let remaining = rec.residual();
        if remaining == 0 {
            return Err(LedgerError::NothingToClaim);
        }
        Self::ensure_vault_covers(vault, remaining)?;
        self.record_mut(epoch).add_swept(remaining)?;
        vault.sweep_to_treasury(remaining)?;
        tracing::info!(epoch = epoch.0, amount = remaining, "residual swept");
        Ok(remaining)
    }

    // ---------------------------------------------------------------------
    // Guardian controls
    // ---------------------------------------------------------------------

    pub fn set_paused(
        &mut self,
        caller: AccountId,
        gate: &dyn RoleGate,
        paused: bool,
    ) -> Result<()> {
        gate.check(caller, Role::Guardian)?;
        self.paused = paused;
        tracing::info!(paused, "pause flag updated");
        Ok(())
    }

    pub fn set_emergency(
        &mut self,
        caller: AccountId,
        gate: &dyn RoleGate,
        emergency: bool,
    ) -> Result<()> {
        gate.check(caller, Role::Guardian)?;
        self.emergency = emergency;
        tracing::info!(emergency, "emergency flag updated");
        Ok(())
    }

    pub fn set_bounds(
        &mut self,
        caller: AccountId,
        gate: &dyn RoleGate,
        bounds: RuntimeBounds,
    ) -> Result<()> {
        gate.check(caller, Role::Guardian)?;
        bounds.validate()?;
        self.bounds = bounds;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Queries and audit
    // ---------------------------------------------------------------------

    pub fn lock(&self, id: LockId) -> Result<&Lock> {
        self.escrow.lock(id)
    }

    pub fn power_at(&self, account: AccountId, ts: u64, capacity: Capacity) -> Result<Power> {
        self.escrow.power_at(account, ts, capacity)
    }

    pub fn power_at_epoch_end(
        &self,
        account: AccountId,
        e: EpochId,
        capacity: Capacity,
    ) -> Result<Power> {
        self.escrow.power_at_epoch_end(account, e, capacity)
    }

    pub fn total_power_at_epoch_end(&self, e: EpochId) -> Result<Power> {
        self.escrow.total_power_at_epoch_end(e)
    }

    pub fn epoch_record(&self, e: EpochId) -> Option<&EpochRecord> {
        self.epochs.get(&e)
    }

    pub fn pool_epoch(&self, e: EpochId, pool: PoolId) -> Option<&PoolEpoch> {
        self.pools.record(e, pool)
    }

    pub fn spent_votes(&self, e: EpochId, account: AccountId, capacity: Capacity) -> u64 {
        self.pools.spent(e, account, capacity)
    }

    pub fn fees_collected(&self, delegate: AccountId) -> Result<u64> {
        self.registry.fees_collected(delegate)
    }

    /// Residue still claimable or sweepable for an epoch.
    pub fn epoch_residual(&self, e: EpochId) -> u64 {
        self.epochs.get(&e).map(|r| r.residual()).unwrap_or(0)
    }

    /// Runs the whole-state invariant suite for epoch `e`.
    pub fn check_invariants(&self, e: EpochId) -> Result<()> {
        if let Some(rec) = self.epochs.get(&e) {
            invariants::check_epoch_conservation(e, rec)?;
        }
        for (account, capacity, spent) in self.pools.spenders(e) {
            let power = self.escrow.power_at_epoch_end(account, e, capacity)?;
            invariants::check_votes_backed(e, spent, power.get())?;
        }
        let mut parts: u64 = 0;
        for a in self.escrow.personal_accounts() {
            parts = add_u64(
                parts,
                self.escrow
                    .power_at_epoch_end(a, e, Capacity::Personal)?
                    .get(),
            )?;
        }
        for d in self.escrow.delegate_accounts() {
            parts = add_u64(
                parts,
                self.escrow
                    .power_at_epoch_end(d, e, Capacity::Delegated)?
                    .get(),
            )?;
        }
        let global = self.escrow.total_power_at_epoch_end(e)?.get();
        invariants::check_global_matches_parts(e, global, parts)?;
        for pool in self.pools.pool_ids() {
            invariants::check_pool_lifetime(
                pool,
                self.pools.lifetime_votes(pool),
                self.pools.epoch_vote_total(pool),
            )?;
        }
        Ok(())
    }
}
