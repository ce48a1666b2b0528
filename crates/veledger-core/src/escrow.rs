//! Lock lifecycle and quad-accounting voting-power streams.
//!
//! [`VotingEscrow`] owns every lock record and four families of
//! [`CheckpointStream`]s: the global aggregate, per-account personal streams,
//! per-delegate aggregate streams, and per-(delegate, holder) pair streams.
//! The pair stream receives exactly the deltas the matching delegate
//! aggregate receives for that holder's locks; the two are independent
//! instances of the same abstraction, never derived from one another.
//!
//! Delegation changes are forward-booked: the lock's constant `VeBalance` is
//! scheduled to move between streams at the next epoch boundary, so the owner
//! retains personal voting rights through the current epoch and the stream
//! algebra is unaffected by when the move lands.

use std::collections::BTreeMap;

use crate::checkpoint::CheckpointStream;
use crate::epoch::EpochClock;
use crate::math::{add_u64, lock_balance};
use crate::types::{
    Amount, Capacity, EpochId, LedgerParams, LockId, Power, RuntimeBounds, VeBalance, VeDelta,
};
use crate::{AccountId, Hash32, LedgerError, Result};

/// A principal-value commitment with an absolute, epoch-aligned expiry.
#[derive(Clone, Debug)]
pub struct Lock {
    pub owner: AccountId,
    /// Principal funded from the holder's wallet.
    pub wallet_amount: Amount,
    /// Principal funded from re-locked rewards. Fungible with the wallet
    /// portion for all power math; tracked separately for audit.
    pub reward_amount: Amount,
    pub expiry_ts: u64,
    pub unlocked: bool,
    /// Delegation target effective from `delegate_effective` (`None` = the
    /// owner holds the voting rights personally).
    pub delegate: Option<AccountId>,
    /// Holder of voting rights before `delegate_effective`.
    pub prev_delegate: Option<AccountId>,
    pub delegate_effective: EpochId,
}

impl Lock {
    /// Total principal. Invariant: the sum fits u64 (enforced on every
    /// amount mutation).
    pub fn principal(&self) -> u64 {
        self.wallet_amount.get().saturating_add(self.reward_amount.get())
    }

    fn has_pending(&self, now_e: EpochId) -> bool {
        self.delegate_effective.0 > now_e.0
    }

    /// Holder of voting rights during the current epoch.
    fn holder_now(&self, now_e: EpochId) -> Option<AccountId> {
        if self.has_pending(now_e) {
            self.prev_delegate
        } else {
            self.delegate
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HolderRef {
    Personal(AccountId),
    Delegated {
        holder: AccountId,
        delegate: AccountId,
    },
}

fn holder_ref(owner: AccountId, delegate: Option<AccountId>) -> HolderRef {
    match delegate {
        None => HolderRef::Personal(owner),
        Some(d) => HolderRef::Delegated {
            holder: owner,
            delegate: d,
        },
    }
}

pub struct VotingEscrow {
    clock: EpochClock,
    min_lock_secs: u64,
    max_lock_secs: u64,
    max_locks_per_account: usize,
    locks: BTreeMap<LockId, Lock>,
    open_locks: BTreeMap<AccountId, usize>,
    global: CheckpointStream,
    personal: BTreeMap<AccountId, CheckpointStream>,
    delegated: BTreeMap<AccountId, CheckpointStream>,
    /// Keyed (delegate, holder) so a delegate's contributors range-scan.
    pair: BTreeMap<(AccountId, AccountId), CheckpointStream>,
}

impl VotingEscrow {
    pub fn new(clock: EpochClock, params: &LedgerParams, bounds: &RuntimeBounds) -> Result<Self> {
        let min_lock_secs = params
            .min_lock_epochs()
            .checked_mul(clock.epoch_secs())
            .ok_or_else(|| LedgerError::Overflow("min lock span".into()))?;
        let max_lock_secs = params
            .max_lock_epochs()
            .checked_mul(clock.epoch_secs())
            .ok_or_else(|| LedgerError::Overflow("max lock span".into()))?;
        Ok(VotingEscrow {
            clock,
            min_lock_secs,
            max_lock_secs,
            max_locks_per_account: bounds.max_locks_per_account,
            locks: BTreeMap::new(),
            open_locks: BTreeMap::new(),
            global: CheckpointStream::new(),
            personal: BTreeMap::new(),
            delegated: BTreeMap::new(),
            pair: BTreeMap::new(),
        })
    }

    /// Fixed slope denominator (maximum lock span, seconds).
    pub fn max_lock_secs(&self) -> u64 {
        self.max_lock_secs
    }

    pub fn lock(&self, id: LockId) -> Result<&Lock> {
        self.locks.get(&id).ok_or(LedgerError::UnknownLock)
    }

    pub fn open_lock_count(&self, account: AccountId) -> usize {
        self.open_locks.get(&account).copied().unwrap_or(0)
    }

    pub fn delegator_count(&self, delegate: AccountId) -> usize {
        self.delegators_of(delegate).len()
    }

    /// Holders with a pair-accounting stream toward `delegate` (their pair
    /// balance at a given epoch may still be zero).
    pub fn delegators_of(&self, delegate: AccountId) -> Vec<AccountId> {
        self.pair
            .range((delegate, AccountId::MIN)..=(delegate, AccountId::MAX))
            .map(|((_, holder), _)| *holder)
            .collect()
    }

    // ---------------------------------------------------------------------
    // Lock lifecycle
    // ---------------------------------------------------------------------

    /// Runs every `create_lock` precondition without committing anything.
    /// Returns the total principal. The engine uses this to order the
    /// inbound value transfer before the state commit.
    pub fn validate_create(
        &self,
        owner: AccountId,
        wallet: Amount,
        reward: Amount,
        expiry_ts: u64,
        now: u64,
        nonce: Hash32,
    ) -> Result<u64> {
        let principal = add_u64(wallet.get(), reward.get())?;
        if principal == 0 {
            return Err(LedgerError::InvalidInput("principal must be > 0".into()));
        }
        if !self.clock.is_boundary(expiry_ts) {
            return Err(LedgerError::InvalidInput(
                "expiry must land on an epoch boundary".into(),
            ));
        }
        let min_expiry = add_u64(now, self.min_lock_secs)?;
        let max_expiry = add_u64(now, self.max_lock_secs)?;
        if expiry_ts < min_expiry {
            return Err(LedgerError::InvalidInput(
                "expiry below minimum lock span".into(),
            ));
        }
        if expiry_ts > max_expiry {
            return Err(LedgerError::InvalidInput(
                "expiry beyond maximum lock span".into(),
            ));
        }
        if self.open_lock_count(owner) >= self.max_locks_per_account {
            return Err(LedgerError::BoundExceeded(
                "max locks per account exceeded".into(),
            ));
        }
        let id = LockId::derive(owner, self.clock.epoch_of(now), nonce);
        if self.locks.contains_key(&id) {
            return Err(LedgerError::InvalidInput("lock id collision".into()));
        }
        Ok(principal)
    }

    /// Opens a lock.
    ///
    /// Preconditions:
    /// - `wallet + reward > 0` and the sum fits u64;
    /// - `expiry_ts` lands exactly on an epoch boundary;
    /// - `now + min_span <= expiry_ts <= now + max_span`.
    ///
    /// Postconditions:
    /// - the lock's balance is live in the owner's personal stream and the
    ///   global stream, with the expiry reduction scheduled.
    pub fn create_lock(
        &mut self,
        owner: AccountId,
        wallet: Amount,
        reward: Amount,
        expiry_ts: u64,
        now: u64,
        nonce: Hash32,
    ) -> Result<LockId> {
        let principal = self.validate_create(owner, wallet, reward, expiry_ts, now, nonce)?;
        let now_e = self.clock.epoch_of(now);
        let id = LockId::derive(owner, now_e, nonce);

        let bal = lock_balance(principal, expiry_ts, self.max_lock_secs)?;
        let expiry_e = self.clock.epoch_of(expiry_ts);
        let d = VeDelta::from(bal);

        self.place(HolderRef::Personal(owner), now_e, expiry_e, d)?;
        self.global.apply_now(now_e, d)?;
        self.global.schedule(expiry_e, d.neg())?;

        self.locks.insert(
            id,
            Lock {
                owner,
                wallet_amount: wallet,
                reward_amount: reward,
                expiry_ts,
                unlocked: false,
                delegate: None,
                prev_delegate: None,
                delegate_effective: now_e,
            },
        );
        *self.open_locks.entry(owner).or_insert(0) += 1;
        tracing::debug!(?id, ?owner, principal, expiry_ts, "lock created");
        Ok(id)
    }

    /// Adds principal to an open, unexpired lock.
    pub fn increase_amount(
        &mut self,
        id: LockId,
        wallet_add: Amount,
        reward_add: Amount,
        now: u64,
    ) -> Result<()> {
        let add = add_u64(wallet_add.get(), reward_add.get())?;
        if add == 0 {
            return Err(LedgerError::InvalidInput("increase must be > 0".into()));
        }
        let lock = self.locks.get(&id).ok_or(LedgerError::UnknownLock)?.clone();
        if lock.unlocked {
            return Err(LedgerError::LockUnlocked);
        }
        if now >= lock.expiry_ts {
            return Err(LedgerError::InvalidInput(
                "cannot increase an expired lock".into(),
            ));
        }
        let new_principal = add_u64(lock.principal(), add)?;
        let old_bal = lock_balance(lock.principal(), lock.expiry_ts, self.max_lock_secs)?;
        let new_bal = lock_balance(new_principal, lock.expiry_ts, self.max_lock_secs)?;
        let delta = VeDelta::from(new_bal).checked_add(VeDelta::from(old_bal).neg())?;

        let now_e = self.clock.epoch_of(now);
        let expiry_e = self.clock.epoch_of(lock.expiry_ts);
        let pending = lock.has_pending(now_e) && lock.prev_delegate != lock.delegate;

        if pending {
            self.book_move(
                lock.owner,
                lock.prev_delegate,
                lock.delegate,
                old_bal,
                lock.delegate_effective,
                expiry_e,
                false,
            )?;
        }
        let cur = holder_ref(lock.owner, lock.holder_now(now_e));
        self.place(cur, now_e, expiry_e, delta)?;
        self.global.apply_now(now_e, delta)?;
        self.global.schedule(expiry_e, delta.neg())?;
        if pending {
            self.book_move(
                lock.owner,
                lock.prev_delegate,
                lock.delegate,
                new_bal,
                lock.delegate_effective,
                expiry_e,
                true,
            )?;
        }

        let stored = self.locks.get_mut(&id).ok_or(LedgerError::UnknownLock)?;
        stored.wallet_amount = Amount::new(add_u64(
            stored.wallet_amount.get(),
            wallet_add.get(),
        )?);
        stored.reward_amount = Amount::new(add_u64(
            stored.reward_amount.get(),
            reward_add.get(),
        )?);
        tracing::debug!(?id, add, "lock amount increased");
        Ok(())
    }

    /// Raises a lock's expiry to a later epoch boundary.
    pub fn extend_lock(&mut self, id: LockId, new_expiry_ts: u64, now: u64) -> Result<()> {
        let lock = self.locks.get(&id).ok_or(LedgerError::UnknownLock)?.clone();
        if lock.unlocked {
            return Err(LedgerError::LockUnlocked);
        }
        if now >= lock.expiry_ts {
            return Err(LedgerError::InvalidInput(
                "cannot extend an expired lock".into(),
            ));
        }
        if !self.clock.is_boundary(new_expiry_ts) {
            return Err(LedgerError::InvalidInput(
                "expiry must land on an epoch boundary".into(),
            ));
        }
        if new_expiry_ts <= lock.expiry_ts {
            return Err(LedgerError::InvalidInput(
                "new expiry must exceed the current expiry".into(),
            ));
        }
        if new_expiry_ts > add_u64(now, self.max_lock_secs)? {
            return Err(LedgerError::InvalidInput(
                "expiry beyond maximum lock span".into(),
            ));
        }

        let old_bal = lock_balance(lock.principal(), lock.expiry_ts, self.max_lock_secs)?;
        let new_bal = lock_balance(lock.principal(), new_expiry_ts, self.max_lock_secs)?;
        let delta = VeDelta::from(new_bal).checked_add(VeDelta::from(old_bal).neg())?;

        let now_e = self.clock.epoch_of(now);
        let old_e = self.clock.epoch_of(lock.expiry_ts);
        let new_e = self.clock.epoch_of(new_expiry_ts);
        let pending = lock.has_pending(now_e) && lock.prev_delegate != lock.delegate;

        if pending {
            self.book_move(
                lock.owner,
                lock.prev_delegate,
                lock.delegate,
                old_bal,
                lock.delegate_effective,
                old_e,
                false,
            )?;
        }
        let cur = holder_ref(lock.owner, lock.holder_now(now_e));
        self.apply_holder(cur, now_e, delta)?;
        self.schedule_holder(cur, old_e, VeDelta::from(old_bal))?;
        self.schedule_holder(cur, new_e, VeDelta::from(new_bal).neg())?;
        self.global.apply_now(now_e, delta)?;
        self.global.schedule(old_e, VeDelta::from(old_bal))?;
        self.global.schedule(new_e, VeDelta::from(new_bal).neg())?;
        if pending {
            self.book_move(
                lock.owner,
                lock.prev_delegate,
                lock.delegate,
                new_bal,
                lock.delegate_effective,
                new_e,
                true,
            )?;
        }

        let stored = self.locks.get_mut(&id).ok_or(LedgerError::UnknownLock)?;
        stored.expiry_ts = new_expiry_ts;
        tracing::debug!(?id, new_expiry_ts, "lock extended");
        Ok(())
    }

    /// Releases an expired lock's principal.
    ///
    /// The streams need no adjustment: the expiry entry in each scheduled
    /// map already zeroes the contribution at the boundary.
    pub fn withdraw(&mut self, id: LockId, now: u64) -> Result<(Amount, Amount)> {
        let lock = self.locks.get(&id).ok_or(LedgerError::UnknownLock)?;
        if lock.unlocked {
            return Err(LedgerError::LockUnlocked);
        }
        if now < lock.expiry_ts {
            return Err(LedgerError::LockNotExpired {
                expiry_ts: lock.expiry_ts,
                now,
            });
        }
        let owner = lock.owner;
        let out = (lock.wallet_amount, lock.reward_amount);
        let stored = self.locks.get_mut(&id).ok_or(LedgerError::UnknownLock)?;
        stored.unlocked = true;
        if let Some(c) = self.open_locks.get_mut(&owner) {
            *c = c.saturating_sub(1);
        }
        tracing::debug!(?id, "lock withdrawn");
        Ok(out)
    }

    /// Exit path that bypasses the expiry check. The engine gates this on
    /// its emergency flag; the escrow only unwinds the bookkeeping.
    pub fn emergency_withdraw(&mut self, id: LockId, now: u64) -> Result<(Amount, Amount)> {
        let lock = self.locks.get(&id).ok_or(LedgerError::UnknownLock)?.clone();
        if lock.unlocked {
            return Err(LedgerError::LockUnlocked);
        }
        if now >= lock.expiry_ts {
            return self.withdraw(id, now);
        }

        let bal = lock_balance(lock.principal(), lock.expiry_ts, self.max_lock_secs)?;
        let now_e = self.clock.epoch_of(now);
        let expiry_e = self.clock.epoch_of(lock.expiry_ts);
        if lock.has_pending(now_e) && lock.prev_delegate != lock.delegate {
            self.book_move(
                lock.owner,
                lock.prev_delegate,
                lock.delegate,
                bal,
                lock.delegate_effective,
                expiry_e,
                false,
            )?;
        }
        let cur = holder_ref(lock.owner, lock.holder_now(now_e));
        self.place(cur, now_e, expiry_e, VeDelta::from(bal).neg())?;
        self.global.apply_now(now_e, VeDelta::from(bal).neg())?;
        self.global.schedule(expiry_e, VeDelta::from(bal))?;

        let owner = lock.owner;
        let out = (lock.wallet_amount, lock.reward_amount);
        let stored = self.locks.get_mut(&id).ok_or(LedgerError::UnknownLock)?;
        stored.unlocked = true;
        if let Some(c) = self.open_locks.get_mut(&owner) {
            *c = c.saturating_sub(1);
        }
        tracing::debug!(?id, "emergency withdrawal");
        Ok(out)
    }

    // ---------------------------------------------------------------------
    // Delegation moves (forward-booked)
    // ---------------------------------------------------------------------

    /// Delegates a lock's voting rights, effective next epoch.
    ///
    /// Delegate registration and fan-out bounds are checked by the engine;
    /// the escrow performs only the stream bookkeeping.
    pub fn delegate(&mut self, id: LockId, delegate: AccountId, now: u64) -> Result<()> {
        self.rebook_delegation(id, Some(delegate), now)
    }

    /// Returns a lock's voting rights to its owner, effective next epoch.
    pub fn undelegate(&mut self, id: LockId, now: u64) -> Result<()> {
        let lock = self.locks.get(&id).ok_or(LedgerError::UnknownLock)?;
        let now_e = self.clock.epoch_of(now);
        let base = if lock.has_pending(now_e) {
            lock.prev_delegate
        } else {
            lock.delegate
        };
        if base.is_none() && lock.delegate.is_none() {
            return Err(LedgerError::InvalidInput("lock is not delegated".into()));
        }
        self.rebook_delegation(id, None, now)
    }

    /// Moves a lock between delegates. Defined as the composition of
    /// undelegate and delegate; results are numerically identical to calling
    /// them sequentially.
    pub fn switch_delegate(&mut self, id: LockId, new_delegate: AccountId, now: u64) -> Result<()> {
        self.undelegate(id, now)?;
        self.delegate(id, new_delegate, now)
    }

    fn rebook_delegation(
        &mut self,
        id: LockId,
        target: Option<AccountId>,
        now: u64,
    ) -> Result<()> {
        let lock = self.locks.get(&id).ok_or(LedgerError::UnknownLock)?.clone();
        if lock.unlocked {
            return Err(LedgerError::LockUnlocked);
        }
        if now >= lock.expiry_ts {
            return Err(LedgerError::InvalidInput(
                "cannot change delegation of an expired lock".into(),
            ));
        }
        let now_e = self.clock.epoch_of(now);
        let next_e = now_e.next();
        let expiry_e = self.clock.epoch_of(lock.expiry_ts);
        let bal = lock_balance(lock.principal(), lock.expiry_ts, self.max_lock_secs)?;

        let pending = lock.has_pending(now_e);
        let base = if pending {
            lock.prev_delegate
        } else {
            lock.delegate
        };
        // Cancel a not-yet-effective booking before re-booking; the opposing
        // scheduled entries merge away exactly.
        if pending && base != lock.delegate {
            self.book_move(
                lock.owner,
                base,
                lock.delegate,
                bal,
                lock.delegate_effective,
                expiry_e,
                false,
            )?;
        }

        let stored = self.locks.get_mut(&id).ok_or(LedgerError::UnknownLock)?;
        if base == target {
            stored.prev_delegate = base;
            stored.delegate = base;
            stored.delegate_effective = now_e;
            return Ok(());
        }
        stored.prev_delegate = base;
        stored.delegate = target;
        stored.delegate_effective = next_e;
        self.book_move(lock.owner, base, target, bal, next_e, expiry_e, true)?;
        tracing::debug!(?id, ?target, effective = next_e.0, "delegation re-booked");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Instantaneous power at `ts` in the given capacity.
    pub fn power_at(&self, account: AccountId, ts: u64, capacity: Capacity) -> Result<Power> {
        match self.capacity_stream(account, capacity) {
            Some(s) => s.value_at(&self.clock, ts),
            None => Ok(Power::ZERO),
        }
    }

    /// Power at the end boundary of epoch `e` — the only figure usable for
    /// casting votes during `e`.
    pub fn power_at_epoch_end(
        &self,
        account: AccountId,
        e: EpochId,
        capacity: Capacity,
    ) -> Result<Power> {
        match self.capacity_stream(account, capacity) {
            Some(s) => s.value_at_epoch_end(&self.clock, e),
            None => Ok(Power::ZERO),
        }
    }

    /// End-of-epoch power a specific holder contributed to a delegate.
    pub fn pair_power_at_epoch_end(
        &self,
        holder: AccountId,
        delegate: AccountId,
        e: EpochId,
    ) -> Result<Power> {
        match self.pair.get(&(delegate, holder)) {
            Some(s) => s.value_at_epoch_end(&self.clock, e),
            None => Ok(Power::ZERO),
        }
    }

    pub fn total_power_at_epoch_end(&self, e: EpochId) -> Result<Power> {
        self.global.value_at_epoch_end(&self.clock, e)
    }

    pub fn total_power_at(&self, ts: u64) -> Result<Power> {
        self.global.value_at(&self.clock, ts)
    }

    /// Global balance coefficients during `e` (invariant checking).
    pub fn global_balance_during(&self, e: EpochId) -> Result<VeBalance> {
        self.global.balance_during(e)
    }

    /// Accounts with a personal stream (invariant checking).
    pub fn personal_accounts(&self) -> Vec<AccountId> {
        self.personal.keys().copied().collect()
    }

    /// Delegates with an aggregate stream (invariant checking).
    pub fn delegate_accounts(&self) -> Vec<AccountId> {
        self.delegated.keys().copied().collect()
    }

    fn capacity_stream(&self, account: AccountId, capacity: Capacity) -> Option<&CheckpointStream> {
        match capacity {
            Capacity::Personal => self.personal.get(&account),
            Capacity::Delegated => self.delegated.get(&account),
        }
    }

    // ---------------------------------------------------------------------
    // Stream plumbing
    // ---------------------------------------------------------------------

    fn apply_holder(&mut self, h: HolderRef, e: EpochId, d: VeDelta) -> Result<()> {
        match h {
            HolderRef::Personal(a) => self.personal.entry(a).or_default().apply_now(e, d),
            HolderRef::Delegated { holder, delegate } => {
                self.delegated.entry(delegate).or_default().apply_now(e, d)?;
                self.pair
                    .entry((delegate, holder))
                    .or_default()
                    .apply_now(e, d)
            }
        }
    }

    fn schedule_holder(&mut self, h: HolderRef, at: EpochId, d: VeDelta) -> Result<()> {
        match h {
            HolderRef::Personal(a) => self.personal.entry(a).or_default().schedule(at, d),
            HolderRef::Delegated { holder, delegate } => {
                self.delegated.entry(delegate).or_default().schedule(at, d)?;
                self.pair
                    .entry((delegate, holder))
                    .or_default()
                    .schedule(at, d)
            }
        }
    }

    /// Applies `d` now and books its inverse at the expiry boundary.
    fn place(&mut self, h: HolderRef, now_e: EpochId, expiry_e: EpochId, d: VeDelta) -> Result<()> {
        self.apply_holder(h, now_e, d)?;
        self.schedule_holder(h, expiry_e, d.neg())
    }

    /// Books (or cancels, with `forward = false`) a balance move between two
    /// holders at boundary `at_e`, relocating the expiry entry with it.
    #[allow(clippy::too_many_arguments)]
    fn book_move(
        &mut self,
        owner: AccountId,
        from: Option<AccountId>,
        to: Option<AccountId>,
        bal: VeBalance,
        at_e: EpochId,
        expiry_e: EpochId,
        forward: bool,
    ) -> Result<()> {
        if from == to {
            return Ok(());
        }
        let d = VeDelta::from(bal);
        let (on, off) = if forward { (d, d.neg()) } else { (d.neg(), d) };
        let fh = holder_ref(owner, from);
        let th = holder_ref(owner, to);
        self.schedule_holder(fh, at_e, off)?;
        self.schedule_holder(fh, expiry_e, on)?;
        self.schedule_holder(th, at_e, on)?;
        self.schedule_holder(th, expiry_e, off)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Bps;

    const EPOCH: u64 = 1_000;

    fn escrow() -> VotingEscrow {
        let clock = EpochClock::new(EPOCH).unwrap();
        let params = LedgerParams::new(1, 52, 2, 4, Bps::MAX).unwrap();
        VotingEscrow::new(clock, &params, &RuntimeBounds::default()).unwrap()
    }

    fn acct(b: u8) -> AccountId {
        AccountId(Hash32([b; 32]))
    }

    fn nonce(b: u8) -> Hash32 {
        Hash32([b; 32])
    }

    // Principal sized so slope = principal / (52 * EPOCH) is exact.
    fn principal(units: u64) -> Amount {
        Amount::new(units * 52 * EPOCH)
    }

    #[test]
    fn lock_votes_immediately_with_end_of_epoch_value() {
        let mut es = escrow();
        let a = acct(1);
        // Open mid-epoch 2, expiry at start of epoch 7 (end of epoch 6).
        let id = es
            .create_lock(a, principal(10), Amount::ZERO, 7 * EPOCH, 2_500, nonce(1))
            .unwrap();
        let slope = 10u64; // principal / max span

        // End-of-epoch-2 benchmark: slope * (expiry - end(2)).
        let p = es
            .power_at_epoch_end(a, EpochId(2), Capacity::Personal)
            .unwrap();
        assert_eq!(p.get(), slope * (7 * EPOCH - 3 * EPOCH));

        // Final epoch: the end-of-epoch benchmark is already zero.
        let p_last = es
            .power_at_epoch_end(a, EpochId(6), Capacity::Personal)
            .unwrap();
        assert_eq!(p_last, Power::ZERO);

        // Instantaneous value still decays between boundaries.
        let inst = es.power_at(a, 3_000, Capacity::Personal).unwrap();
        assert_eq!(inst.get(), slope * 4 * EPOCH);
        assert!(es.lock(id).is_ok());
    }

    #[test]
    fn worked_example_matches_slope_times_remaining() {
        // Lock with slope 200, expiry = end of epoch E+5 (E = 0).
        let mut es = escrow();
        let a = acct(2);
        es.create_lock(a, principal(200), Amount::ZERO, 6 * EPOCH, 100, nonce(1))
            .unwrap();
        for k in 0..=4u64 {
            let p = es
                .power_at_epoch_end(a, EpochId(k), Capacity::Personal)
                .unwrap();
            assert_eq!(p.get(), 200 * (6 * EPOCH - (k + 1) * EPOCH));
        }
        let p = es
            .power_at_epoch_end(a, EpochId(5), Capacity::Personal)
            .unwrap();
        assert_eq!(p, Power::ZERO);
    }

    #[test]
    fn expiry_must_be_aligned_and_within_span() {
        let mut es = escrow();
        let a = acct(1);
        assert!(es
            .create_lock(a, principal(1), Amount::ZERO, 2_500, 100, nonce(1))
            .is_err());
        assert!(es
            .create_lock(a, principal(1), Amount::ZERO, 0, 100, nonce(1))
            .is_err());
        // Beyond max span (52 epochs).
        assert!(es
            .create_lock(a, principal(1), Amount::ZERO, 60 * EPOCH, 100, nonce(1))
            .is_err());
        assert!(es
            .create_lock(a, Amount::ZERO, Amount::ZERO, 2 * EPOCH, 100, nonce(1))
            .is_err());
    }

    #[test]
    fn delegation_is_forward_booked() {
        let mut es = escrow();
        let (a, d) = (acct(1), acct(9));
        let id = es
            .create_lock(a, principal(10), Amount::ZERO, 10 * EPOCH, 500, nonce(1))
            .unwrap();
        es.delegate(id, d, 600).unwrap();

        // Owner retains personal rights through the current epoch.
        assert!(es
            .power_at_epoch_end(a, EpochId(0), Capacity::Personal)
            .unwrap()
            .get()
            > 0);
        assert_eq!(
            es.power_at_epoch_end(d, EpochId(0), Capacity::Delegated)
                .unwrap(),
            Power::ZERO
        );

        // Next epoch the full contribution sits with the delegate, and the
        // pair stream mirrors the aggregate for a single contributor.
        let agg = es
            .power_at_epoch_end(d, EpochId(1), Capacity::Delegated)
            .unwrap();
        let pair = es.pair_power_at_epoch_end(a, d, EpochId(1)).unwrap();
        assert!(agg.get() > 0);
        assert_eq!(agg, pair);
        assert_eq!(
            es.power_at_epoch_end(a, EpochId(1), Capacity::Personal)
                .unwrap(),
            Power::ZERO
        );
    }

    #[test]
    fn undelegate_then_delegate_matches_switch() {
        let mk = |nonce_b: u8| {
            let mut es = escrow();
            let (a, d1, d2) = (acct(1), acct(8), acct(9));
            let id = es
                .create_lock(a, principal(10), Amount::ZERO, 10 * EPOCH, 300, nonce(nonce_b))
                .unwrap();
            es.delegate(id, d1, 400).unwrap();
            (es, id, a, d1, d2)
        };

        let (mut seq, id1, a, d1, d2) = mk(1);
        seq.undelegate(id1, EPOCH + 100).unwrap();
        seq.delegate(id1, d2, EPOCH + 200).unwrap();

        let (mut sw, id2, _, _, _) = mk(1);
        sw.switch_delegate(id2, d2, EPOCH + 150).unwrap();

        for e in 0..4u64 {
            let e = EpochId(e);
            for acc in [a, d1, d2] {
                assert_eq!(
                    seq.power_at_epoch_end(acc, e, Capacity::Personal).unwrap(),
                    sw.power_at_epoch_end(acc, e, Capacity::Personal).unwrap()
                );
                assert_eq!(
                    seq.power_at_epoch_end(acc, e, Capacity::Delegated).unwrap(),
                    sw.power_at_epoch_end(acc, e, Capacity::Delegated).unwrap()
                );
            }
        }
        // The owner's own net delta across the change is zero: personal power
        // in epoch 1 reflects the original d1 booking in both timelines.
        assert_eq!(
            seq.power_at_epoch_end(a, EpochId(2), Capacity::Personal)
                .unwrap(),
            Power::ZERO
        );
        assert_eq!(
            seq.power_at_epoch_end(d1, EpochId(2), Capacity::Delegated)
                .unwrap(),
            Power::ZERO
        );
        assert!(
            seq.power_at_epoch_end(d2, EpochId(2), Capacity::Delegated)
                .unwrap()
                .get()
                > 0
        );
    }

    #[test]
    fn increase_amount_tracks_pending_delegation() {
        let mut es = escrow();
        let (a, d) = (acct(1), acct(9));
        let id = es
            .create_lock(a, principal(10), Amount::ZERO, 10 * EPOCH, 100, nonce(1))
            .unwrap();
        es.delegate(id, d, 200).unwrap();
        es.increase_amount(id, principal(10), Amount::ZERO, 300).unwrap();

        // This epoch the owner holds the doubled balance personally.
        let own = es
            .power_at_epoch_end(a, EpochId(0), Capacity::Personal)
            .unwrap();
        assert_eq!(own.get(), 20 * (10 * EPOCH - EPOCH));
        // Next epoch the delegate holds it all.
        let del = es
            .power_at_epoch_end(d, EpochId(1), Capacity::Delegated)
            .unwrap();
        assert_eq!(del.get(), 20 * (10 * EPOCH - 2 * EPOCH));
        assert_eq!(
            es.power_at_epoch_end(a, EpochId(1), Capacity::Personal)
                .unwrap(),
            Power::ZERO
        );
    }

    #[test]
    fn extend_moves_the_expiry_schedule() {
        let mut es = escrow();
        let a = acct(1);
        let id = es
            .create_lock(a, principal(10), Amount::ZERO, 4 * EPOCH, 100, nonce(1))
            .unwrap();
        es.extend_lock(id, 8 * EPOCH, 200).unwrap();

        // Power after the old expiry is now non-zero.
        let p = es
            .power_at_epoch_end(a, EpochId(5), Capacity::Personal)
            .unwrap();
        assert_eq!(p.get(), 10 * (8 * EPOCH - 6 * EPOCH));
        assert_eq!(
            es.power_at_epoch_end(a, EpochId(7), Capacity::Personal)
                .unwrap(),
            Power::ZERO
        );
        // Shrinking is rejected.
        assert!(es.extend_lock(id, 6 * EPOCH, 300).is_err());
    }

    #[test]
    fn withdraw_only_after_expiry() {
        let mut es = escrow();
        let a = acct(1);
        let id = es
            .create_lock(a, principal(5), Amount::new(7), 3 * EPOCH, 100, nonce(1))
            .unwrap();
        assert!(matches!(
            es.withdraw(id, 2_999),
            Err(LedgerError::LockNotExpired { .. })
        ));
        let (w, r) = es.withdraw(id, 3 * EPOCH).unwrap();
        assert_eq!(w, principal(5));
        assert_eq!(r, Amount::new(7));
        assert!(matches!(
            es.withdraw(id, 3 * EPOCH + 1),
            Err(LedgerError::LockUnlocked)
        ));
        assert_eq!(es.open_lock_count(a), 0);
    }

    #[test]
    fn emergency_withdraw_unwinds_live_contribution() {
        let mut es = escrow();
        let a = acct(1);
        let id = es
            .create_lock(a, principal(10), Amount::ZERO, 10 * EPOCH, 100, nonce(1))
            .unwrap();
        let (w, _) = es.emergency_withdraw(id, 200).unwrap();
        assert_eq!(w, principal(10));
        assert_eq!(
            es.power_at_epoch_end(a, EpochId(0), Capacity::Personal)
                .unwrap(),
            Power::ZERO
        );
        assert_eq!(es.total_power_at_epoch_end(EpochId(3)).unwrap(), Power::ZERO);
    }

    #[test]
    fn global_equals_sum_of_holders() {
        let mut es = escrow();
        let (a, b, d) = (acct(1), acct(2), acct(9));
        let id = es
            .create_lock(a, principal(10), Amount::ZERO, 10 * EPOCH, 100, nonce(1))
            .unwrap();
        es.create_lock(b, principal(4), Amount::ZERO, 6 * EPOCH, 150, nonce(2))
            .unwrap();
        es.delegate(id, d, 200).unwrap();

        for e in 0..8u64 {
            let e = EpochId(e);
            let total = es.total_power_at_epoch_end(e).unwrap().get();
            let parts = es
                .power_at_epoch_end(a, e, Capacity::Personal)
                .unwrap()
                .get()
                + es.power_at_epoch_end(b, e, Capacity::Personal)
                    .unwrap()
                    .get()
                + es.power_at_epoch_end(d, e, Capacity::Delegated)
                    .unwrap()
                    .get();
            assert_eq!(total, parts, "epoch {e:?}");
        }
    }
}
