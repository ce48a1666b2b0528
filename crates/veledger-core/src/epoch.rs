//! Fixed-length epoch arithmetic.
//!
//! Every decay checkpoint, delegation booking, and reward cycle in the ledger
//! is anchored to epoch boundaries produced by this clock. The clock is a pure
//! function of wall-clock seconds; it holds no mutable state.

use crate::types::EpochId;
use crate::{LedgerError, Result};

/// Default epoch length: 14 days, in seconds.
pub const DEFAULT_EPOCH_SECS: u64 = 14 * 86_400;

/// Maps wall-clock seconds to epoch indices and boundaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EpochClock {
    epoch_secs: u64,
}

impl EpochClock {
    /// Creates a clock with an explicit epoch length.
    ///
    /// Preconditions:
    /// - `epoch_secs > 0`.
    pub fn new(epoch_secs: u64) -> Result<EpochClock> {
        if epoch_secs == 0 {
            return Err(LedgerError::InvalidInput("epoch_secs must be > 0".into()));
        }
        Ok(EpochClock { epoch_secs })
    }

    pub fn epoch_secs(&self) -> u64 {
        self.epoch_secs
    }

    /// Epoch index containing timestamp `ts`.
    pub fn epoch_of(&self, ts: u64) -> EpochId {
        EpochId(ts / self.epoch_secs)
    }

    /// First second of epoch `e`.
    pub fn start(&self, e: EpochId) -> u64 {
        e.0.saturating_mul(self.epoch_secs)
    }

    /// End boundary of epoch `e` (identical to `start(e + 1)`).
    ///
    /// End-of-epoch voting power is always evaluated at this instant.
    pub fn end(&self, e: EpochId) -> u64 {
        self.start(EpochId(e.0.saturating_add(1)))
    }

    /// Smallest epoch boundary at or after `ts`.
    pub fn align_up(&self, ts: u64) -> u64 {
        if self.is_boundary(ts) {
            ts
        } else {
            self.end(self.epoch_of(ts))
        }
    }

    /// Whether `ts` lands exactly on an epoch boundary.
    pub fn is_boundary(&self, ts: u64) -> bool {
        ts % self.epoch_secs == 0
    }
}

impl Default for EpochClock {
    fn default() -> Self {
        EpochClock {
            epoch_secs: DEFAULT_EPOCH_SECS,
        }
    }
}
