//! Authorization hook for privileged ledger operations.
//!
//! The engine calls `check()` before mutating state on any privileged path.
//! The trait is IO-free; adapters may perform IO externally and implement a
//! pure `check()` over already-verified evidence (session keys, multisig
//! outcomes, on-chain role registries).

use crate::{AccountId, LedgerError, Result};

/// Privileged capabilities the ledger distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    /// Create and remove reward pools.
    PoolAdmin,
    /// Drive the epoch pipeline (end, verify, stamp, finalize).
    EpochOperator,
    /// Sweep unclaimed residuals to the treasury sink.
    Sweeper,
    /// Pause/unpause and flip the emergency-exit flag.
    Guardian,
}

pub trait RoleGate {
    fn check(&self, caller: AccountId, role: Role) -> Result<()>;
}

/// Gate that allows all callers (simulation/tests).
pub struct AllowAllGate;

impl RoleGate for AllowAllGate {
    fn check(&self, _caller: AccountId, _role: Role) -> Result<()> {
        Ok(())
    }
}

/// Gate that denies all callers (tests).
pub struct DenyAllGate;

impl RoleGate for DenyAllGate {
    fn check(&self, _caller: AccountId, role: Role) -> Result<()> {
        Err(LedgerError::NotAuthorized(format!("{role:?} denied")))
    }
}
