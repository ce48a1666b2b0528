//! veledger-core: a time-decaying voting-power ledger coupled to an
//! epoch-based reward/subsidy distribution engine.
//!
//! Users lock principal to receive voting power that decays linearly to zero
//! at an epoch-aligned expiry. Power may be delegated (forward-booked to the
//! next epoch boundary). Each epoch, votes are tallied per pool, externally
//! computed reward/subsidy allocations are stamped on, and a claims engine
//! pays out exact pro-rata shares while tracking integer-truncation residue
//! for a delayed privileged sweep.
//!
//! Design goals:
//! - Deterministic and bounded arithmetic (u128 intermediates, floor division)
//! - Fail-closed on malformed/unknown inputs (callers validate at boundaries)
//! - IO-free core (pure state machine); integration layers provide time,
//!   value custody, and permissions through injected traits

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod boundary;
pub mod checkpoint;
pub mod claims;
pub mod config;
pub mod delegation;
pub mod engine;
pub mod epoch;
pub mod escrow;
pub mod gate;
pub mod hash;
pub mod invariants;
pub mod lifecycle;
pub mod math;
pub mod pools;
pub mod types;

pub use boundary::{InMemoryVault, StaticSubsidies, SubsidySource, ValueAdapter};
pub use config::LedgerConfig;
pub use engine::VeLedger;
pub use epoch::EpochClock;
pub use gate::{AllowAllGate, DenyAllGate, Role, RoleGate};
pub use lifecycle::EpochState;
pub use types::{
    Amount, Bps, Capacity, EpochId, LedgerParams, LockId, PoolId, Power, RuntimeBounds, VeBalance,
};

/// 32-byte hash newtype used for identities (accounts, locks, pools).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    /// Shortened hex form for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Opaque account identity (holder, delegate, verifier, or automation caller).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct AccountId(pub Hash32);

impl AccountId {
    /// Smallest representable account id (range-scan lower bound).
    pub const MIN: AccountId = AccountId(Hash32([0u8; 32]));
    /// Largest representable account id (range-scan upper bound).
    pub const MAX: AccountId = AccountId(Hash32([0xffu8; 32]));
}

/// Errors surfaced by the ledger.
///
/// Taxonomy:
/// - precondition violations (inactive pool, insufficient votes, zero
///   amounts, wrong epoch state, delay not elapsed) — surfaced synchronously,
///   never retried internally;
/// - state-consistency violations (skipped finalization step, pool removal
///   after stamping began) — rejected outright;
/// - value-conservation risks (double claim, un-finalized epoch, zero-balance
///   delegation) — rejected before any value movement.
///
/// All failures are all-or-nothing: a failed call leaves no partial state.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("bound exceeded: {0}")]
    BoundExceeded(String),

    #[error("arithmetic overflow: {0}")]
    Overflow(String),

    #[error("pool {0:?} is not active")]
    PoolInactive(PoolId),

    #[error("unknown pool {0:?}")]
    UnknownPool(PoolId),

    #[error("insufficient votes: requested {requested}, available {available}")]
    InsufficientVotes { requested: u64, available: u64 },

    #[error("epoch {epoch:?} is in state {actual:?}, expected {expected:?}")]
    WrongEpochState {
        epoch: EpochId,
        expected: EpochState,
        actual: EpochState,
    },

    #[error("epoch {0:?} is not in a claimable state")]
    EpochNotClaimable(EpochId),

    #[error("already claimed")]
    AlreadyClaimed,

    #[error("nothing to claim")]
    NothingToClaim,

    #[error("residual sweep not available before epoch {ready_at:?}")]
    SweepNotReady { ready_at: EpochId },

    #[error("lock has not expired (expiry {expiry_ts}, now {now})")]
    LockNotExpired { expiry_ts: u64, now: u64 },

    #[error("lock already unlocked")]
    LockUnlocked,

    #[error("unknown lock")]
    UnknownLock,

    #[error("unknown delegate")]
    UnknownDelegate,

    #[error("caller not authorized: {0}")]
    NotAuthorized(String),

    #[error("ledger is paused")]
    Paused,
}

pub type Result<T> = std::result::Result<T, LedgerError>;
