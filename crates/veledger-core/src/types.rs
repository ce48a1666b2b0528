use crate::{hash, AccountId, Hash32, LedgerError, Result};
use serde::{Deserialize, Serialize};

pub const BPS_U16: u16 = 10_000;
pub const BPS_U64: u64 = 10_000;

/// Basis points in `[0, 10_000]` (correct-by-construction).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bps(u16);

impl Bps {
    pub const ZERO: Bps = Bps(0);
    pub const MAX: Bps = Bps(BPS_U16);

    /// Constructs a bounded bps value.
    ///
    /// Preconditions:
    /// - `v <= 10_000` (else returns an error; fail-closed).
    pub fn new(v: u16) -> Result<Bps> {
        if v <= BPS_U16 {
            Ok(Bps(v))
        } else {
            Err(LedgerError::InvalidInput(format!(
                "bps out of range: {v} > {BPS_U16}"
            )))
        }
    }

    pub fn get(self) -> u16 {
        self.0
    }

    pub fn as_u64(self) -> u64 {
        self.0 as u64
    }
}

impl TryFrom<u16> for Bps {
    type Error = LedgerError;
    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        Bps::new(value)
    }
}

/// Principal / reward token amount, in smallest units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn new(v: u64) -> Amount {
        Amount(v)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Voting power, in power units.
///
/// A lock at the full maximum span carries power equal to its principal;
/// shorter remaining spans decay linearly toward zero at expiry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Power(u64);

impl Power {
    pub const ZERO: Power = Power(0);

    pub fn new(v: u64) -> Power {
        Power(v)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EpochId(pub u64);

impl EpochId {
    pub fn next(self) -> EpochId {
        EpochId(self.0.saturating_add(1))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PoolId(pub Hash32);

impl PoolId {
    /// Smallest representable pool id (range-scan lower bound).
    pub const MIN: PoolId = PoolId(Hash32([0u8; 32]));
    /// Largest representable pool id (range-scan upper bound).
    pub const MAX: PoolId = PoolId(Hash32([0xffu8; 32]));
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LockId(pub Hash32);

impl LockId {
    pub const DOMAIN_V1: &'static [u8] = b"VELEDGER_LOCK_ID_V1";

    /// Deterministically derives a lock identifier.
    ///
    /// Lock ids are content-addressed (domain-separated hash) so callers do
    /// not coordinate a global counter; uniqueness comes from
    /// `(owner, epoch, nonce)`.
    pub fn derive(owner: AccountId, epoch: EpochId, nonce: Hash32) -> LockId {
        let mut bytes = Vec::with_capacity(32 + 8 + 32);
        bytes.extend_from_slice(&owner.0 .0);
        bytes.extend_from_slice(&epoch.0.to_le_bytes());
        bytes.extend_from_slice(&nonce.0);
        LockId(hash::sha256_domain(Self::DOMAIN_V1, &bytes))
    }
}

/// Capacity in which a holder spends voting power.
///
/// The same per-epoch account structure is kept for both capacities; which
/// one applies must be stated at the call site, never inferred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capacity {
    /// The holder spends power from their own locks.
    Personal,
    /// A registered delegate spends power delegated to them by others.
    Delegated,
}

/// A decaying linear voting-power function anchored at absolute time zero.
///
/// `slope = principal / MAX_LOCK_SPAN`, `bias = slope * expiry`; instantaneous
/// power at time `t` is `max(0, bias - slope*t)`. Two balances compose by
/// independent addition/subtraction of their components, which is what makes
/// aggregation over any number of locks cheap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VeBalance {
    pub bias: u128,
    pub slope: u128,
}

impl VeBalance {
    pub const ZERO: VeBalance = VeBalance { bias: 0, slope: 0 };

    pub fn is_zero(&self) -> bool {
        self.bias == 0 && self.slope == 0
    }

    /// Instantaneous value at time `t`, floored at zero.
    pub fn value_at(&self, t: u64) -> Result<Power> {
        let decay = self
            .slope
            .checked_mul(t as u128)
            .ok_or_else(|| LedgerError::Overflow("slope * t".into()))?;
        let v = self.bias.saturating_sub(decay);
        u64::try_from(v)
            .map(Power::new)
            .map_err(|_| LedgerError::Overflow("voting power does not fit u64".into()))
    }

    /// Applies a signed delta to both components.
    ///
    /// Postconditions:
    /// - both components remain non-negative (fail-closed otherwise).
    pub fn apply(&self, d: VeDelta) -> Result<VeBalance> {
        let bias = checked_signed(self.bias, d.bias, "bias")?;
        let slope = checked_signed(self.slope, d.slope, "slope")?;
        Ok(VeBalance { bias, slope })
    }
}

fn checked_signed(base: u128, delta: i128, what: &str) -> Result<u128> {
    let cur = i128::try_from(base)
        .map_err(|_| LedgerError::Overflow(format!("{what} exceeds i128")))?;
    let next = cur
        .checked_add(delta)
        .ok_or_else(|| LedgerError::Overflow(format!("{what} delta overflow")))?;
    u128::try_from(next)
        .map_err(|_| LedgerError::Overflow(format!("{what} would go negative")))
}

/// Signed delta form of [`VeBalance`], used in scheduled-reduction maps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VeDelta {
    pub bias: i128,
    pub slope: i128,
}

impl VeDelta {
    pub const ZERO: VeDelta = VeDelta { bias: 0, slope: 0 };

    pub fn is_zero(&self) -> bool {
        self.bias == 0 && self.slope == 0
    }

    pub fn neg(self) -> VeDelta {
        VeDelta {
            bias: -self.bias,
            slope: -self.slope,
        }
    }

    pub fn checked_add(self, other: VeDelta) -> Result<VeDelta> {
        let bias = self
            .bias
            .checked_add(other.bias)
            .ok_or_else(|| LedgerError::Overflow("bias delta sum".into()))?;
        let slope = self
            .slope
            .checked_add(other.slope)
            .ok_or_else(|| LedgerError::Overflow("slope delta sum".into()))?;
        Ok(VeDelta { bias, slope })
    }
}

impl From<VeBalance> for VeDelta {
    fn from(b: VeBalance) -> VeDelta {
        // Safe: bias/slope are bounded far below i128::MAX (see math::lock_balance).
        VeDelta {
            bias: b.bias as i128,
            slope: b.slope as i128,
        }
    }
}

/// Ledger policy parameters (validated once at construction).
///
/// These values are policy-set at deployment and are not market outputs.
#[derive(Clone, Copy, Debug)]
pub struct LedgerParams {
    min_lock_epochs: u64,
    max_lock_epochs: u64,
    fee_raise_delay_epochs: u64,
    sweep_delay_epochs: u64,
    max_fee_bps: Bps,
}

impl LedgerParams {
    /// Creates a new parameter bundle.
    ///
    /// Preconditions (enforced):
    /// - `min_lock_epochs >= 1` (one epoch is the minimum lock span);
    /// - `max_lock_epochs >= min_lock_epochs`;
    /// - `fee_raise_delay_epochs >= 1` (a raise must never apply to the epoch
    ///   in which it was requested);
    /// - `sweep_delay_epochs >= 1` (claimants get at least one full epoch).
    pub fn new(
        min_lock_epochs: u64,
        max_lock_epochs: u64,
        fee_raise_delay_epochs: u64,
        sweep_delay_epochs: u64,
        max_fee_bps: Bps,
    ) -> Result<LedgerParams> {
        if min_lock_epochs == 0 {
            return Err(LedgerError::InvalidInput(
                "min_lock_epochs must be >= 1".into(),
            ));
        }
        if max_lock_epochs < min_lock_epochs {
            return Err(LedgerError::InvalidInput(
                "max_lock_epochs must be >= min_lock_epochs".into(),
            ));
        }
        if fee_raise_delay_epochs == 0 {
            return Err(LedgerError::InvalidInput(
                "fee_raise_delay_epochs must be >= 1".into(),
            ));
        }
        if sweep_delay_epochs == 0 {
            return Err(LedgerError::InvalidInput(
                "sweep_delay_epochs must be >= 1".into(),
            ));
        }
        Ok(LedgerParams {
            min_lock_epochs,
            max_lock_epochs,
            fee_raise_delay_epochs,
            sweep_delay_epochs,
            max_fee_bps,
        })
    }

    /// Minimum lock span, in epochs.
    pub fn min_lock_epochs(&self) -> u64 {
        self.min_lock_epochs
    }

    /// Maximum lock span, in epochs. Also the fixed slope denominator: every
    /// lock's slope is computed against this span, never against the lock's
    /// own duration, so scheduled reductions stay epoch-indexed.
    pub fn max_lock_epochs(&self) -> u64 {
        self.max_lock_epochs
    }

    /// Epochs a fee *increase* is deferred; decreases apply immediately.
    pub fn fee_raise_delay_epochs(&self) -> u64 {
        self.fee_raise_delay_epochs
    }

    /// Epochs past finalization before the residual sweep opens.
    pub fn sweep_delay_epochs(&self) -> u64 {
        self.sweep_delay_epochs
    }

    /// Upper bound on a delegate's fee.
    pub fn max_fee_bps(&self) -> Bps {
        self.max_fee_bps
    }
}

/// Runtime bounds for the in-memory ledger.
///
/// These are **safety bounds**, not economic parameters: they prevent
/// unbounded memory/CPU usage and keep claim/settlement costs predictable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeBounds {
    pub max_pools: usize,
    pub max_locks_per_account: usize,
    pub max_delegators_per_delegate: usize,
    pub max_blocked_per_epoch: usize,
}

impl RuntimeBounds {
    pub const HARD_MAX_POOLS: usize = 100_000;
    pub const HARD_MAX_LOCKS_PER_ACCOUNT: usize = 1_024;
    pub const HARD_MAX_DELEGATORS_PER_DELEGATE: usize = 1_000_000;
    pub const HARD_MAX_BLOCKED_PER_EPOCH: usize = 100_000;

    pub const DEFAULT_MAX_POOLS: usize = 1_024;
    pub const DEFAULT_MAX_LOCKS_PER_ACCOUNT: usize = 64;
    pub const DEFAULT_MAX_DELEGATORS_PER_DELEGATE: usize = 10_000;
    pub const DEFAULT_MAX_BLOCKED_PER_EPOCH: usize = 4_096;

    pub fn new(
        max_pools: usize,
        max_locks_per_account: usize,
        max_delegators_per_delegate: usize,
        max_blocked_per_epoch: usize,
    ) -> Result<Self> {
        let b = RuntimeBounds {
            max_pools,
            max_locks_per_account,
            max_delegators_per_delegate,
            max_blocked_per_epoch,
        };
        b.validate()?;
        Ok(b)
    }

    pub fn validate(self) -> Result<()> {
        if self.max_pools == 0 || self.max_pools > Self::HARD_MAX_POOLS {
            return Err(LedgerError::InvalidInput(format!(
                "max_pools out of bounds: {}",
                self.max_pools
            )));
        }
        if self.max_locks_per_account == 0
            || self.max_locks_per_account > Self::HARD_MAX_LOCKS_PER_ACCOUNT
        {
            return Err(LedgerError::InvalidInput(format!(
                "max_locks_per_account out of bounds: {}",
                self.max_locks_per_account
            )));
        }
        if self.max_delegators_per_delegate == 0
            || self.max_delegators_per_delegate > Self::HARD_MAX_DELEGATORS_PER_DELEGATE
        {
            return Err(LedgerError::InvalidInput(format!(
                "max_delegators_per_delegate out of bounds: {}",
                self.max_delegators_per_delegate
            )));
        }
        if self.max_blocked_per_epoch == 0
            || self.max_blocked_per_epoch > Self::HARD_MAX_BLOCKED_PER_EPOCH
        {
            return Err(LedgerError::InvalidInput(format!(
                "max_blocked_per_epoch out of bounds: {}",
                self.max_blocked_per_epoch
            )));
        }
        Ok(())
    }
}

impl Default for RuntimeBounds {
    fn default() -> Self {
        Self {
            max_pools: Self::DEFAULT_MAX_POOLS,
            max_locks_per_account: Self::DEFAULT_MAX_LOCKS_PER_ACCOUNT,
            max_delegators_per_delegate: Self::DEFAULT_MAX_DELEGATORS_PER_DELEGATE,
            max_blocked_per_epoch: Self::DEFAULT_MAX_BLOCKED_PER_EPOCH,
        }
    }
}
