//! Integration seams: value custody and the external subsidy ledger.
//!
//! The core never moves value itself; it orders movements through a
//! [`ValueAdapter`]. The ordering contract is part of the engine's atomicity
//! story: inbound transfers happen before the matching state commit,
//! outbound transfers after, so a failed call never strands value inside the
//! ledger's accounting.

use std::collections::BTreeMap;

use crate::types::{EpochId, PoolId};
use crate::{AccountId, LedgerError, Result};

/// Escrow-token custody primitives.
///
/// Implementations must not fail for outbound amounts the adapter already
/// holds in custody; the engine commits state before ordering outbound
/// movement and relies on that.
pub trait ValueAdapter {
    /// Takes lock principal from a holder into escrow custody. Called
    /// before the lock state is committed.
    fn deposit_principal(&mut self, from: AccountId, amount: u64) -> Result<()>;

    /// Returns principal to a holder. Called after the unlock is committed.
    fn release_principal(&mut self, to: AccountId, amount: u64) -> Result<()>;

    /// Pulls an epoch's full reward+subsidy budget into claim custody
    /// (mint-from-native and transfer-in combined behind the seam).
    fn pull_budget(&mut self, epoch: EpochId, amount: u64) -> Result<()>;

    /// Budget currently held in claim custody. The engine checks this
    /// before committing a claim, so a vault that lost custody fails the
    /// claim up front instead of after the claim key is consumed.
    fn claimable_budget(&self) -> u64;

    /// Pays a claim out of budget custody.
    fn pay_out(&mut self, to: AccountId, amount: u64) -> Result<()>;

    /// Moves residual budget to the treasury sink.
    fn sweep_to_treasury(&mut self, amount: u64) -> Result<()>;
}

/// Read-only view of the external payments ledger's per-verifier accrual.
pub trait SubsidySource {
    fn accrued(&self, epoch: EpochId, pool: PoolId, verifier: AccountId) -> Result<u64>;
    fn total_accrued(&self, epoch: EpochId, pool: PoolId) -> Result<u64>;
}

/// Balance-tracking vault for tests and simulation.
#[derive(Debug, Default)]
pub struct InMemoryVault {
    escrowed: u64,
    budget: u64,
    treasury: u64,
    paid: BTreeMap<AccountId, u64>,
    released: BTreeMap<AccountId, u64>,
}

impl InMemoryVault {
    pub fn new() -> InMemoryVault {
        InMemoryVault::default()
    }

    pub fn escrowed(&self) -> u64 {
        self.escrowed
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn treasury(&self) -> u64 {
        self.treasury
    }

    pub fn paid_to(&self, a: AccountId) -> u64 {
        self.paid.get(&a).copied().unwrap_or(0)
    }

    pub fn released_to(&self, a: AccountId) -> u64 {
        self.released.get(&a).copied().unwrap_or(0)
    }
}

impl ValueAdapter for InMemoryVault {
    fn deposit_principal(&mut self, _from: AccountId, amount: u64) -> Result<()> {
        self.escrowed = self
            .escrowed
            .checked_add(amount)
            .ok_or_else(|| LedgerError::Overflow("vault escrow balance".into()))?;
        Ok(())
    }

    fn release_principal(&mut self, to: AccountId, amount: u64) -> Result<()> {
        self.escrowed = self
            .escrowed
            .checked_sub(amount)
            .ok_or_else(|| LedgerError::InvalidInput("vault escrow underflow".into()))?;
        *self.released.entry(to).or_insert(0) += amount;
        Ok(())
    }

    fn pull_budget(&mut self, _epoch: EpochId, amount: u64) -> Result<()> {
        self.budget = self
            .budget
            .checked_add(amount)
            .ok_or_else(|| LedgerError::Overflow("vault budget balance".into()))?;
        Ok(())
    }

    fn claimable_budget(&self) -> u64 {
        self.budget
    }

    fn pay_out(&mut self, to: AccountId, amount: u64) -> Result<()> {
        self.budget = self
            .budget
            .checked_sub(amount)
            .ok_or_else(|| LedgerError::InvalidInput("vault budget underflow".into()))?;
        *self.paid.entry(to).or_insert(0) += amount;
        Ok(())
    }

    fn sweep_to_treasury(&mut self, amount: u64) -> Result<()> {
        self.budget = self
            .budget
            .checked_sub(amount)
            .ok_or_else(|| LedgerError::InvalidInput("vault budget underflow".into()))?;
        self.treasury += amount;
        Ok(())
    }
}

/// Fixed per-verifier accrual table for tests and simulation.
#[derive(Debug, Default)]
pub struct StaticSubsidies {
    accrued: BTreeMap<(EpochId, PoolId, AccountId), u64>,
}

impl StaticSubsidies {
    pub fn new() -> StaticSubsidies {
        StaticSubsidies::default()
    }

    pub fn set(&mut self, epoch: EpochId, pool: PoolId, verifier: AccountId, amount: u64) {
        self.accrued.insert((epoch, pool, verifier), amount);
    }
}

impl SubsidySource for StaticSubsidies {
    fn accrued(&self, epoch: EpochId, pool: PoolId, verifier: AccountId) -> Result<u64> {
        Ok(self
            .accrued
            .get(&(epoch, pool, verifier))
            .copied()
            .unwrap_or(0))
    }

    fn total_accrued(&self, epoch: EpochId, pool: PoolId) -> Result<u64> {
        let mut total: u64 = 0;
        for ((e, p, _), v) in &self.accrued {
            if *e == epoch && *p == pool {
                total = total
                    .checked_add(*v)
                    .ok_or_else(|| LedgerError::Overflow("subsidy accrual total".into()))?;
            }
        }
        Ok(total)
    }
}
