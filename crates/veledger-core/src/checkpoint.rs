//! Epoch-anchored checkpoint histories with scheduled reductions.
//!
//! A [`CheckpointStream`] records, for every epoch it has been settled
//! through, the `VeBalance` coefficients in force during that epoch, plus a
//! sparse map of deltas to apply when crossing into future epoch boundaries
//! (lock expiries, forward-booked delegation moves).
//!
//! Settlement (`catch_up`) always steps boundary by boundary from the last
//! checkpoint, consuming scheduled deltas in order; skipping a boundary is
//! impossible by construction, and work is bounded by elapsed epochs, never
//! by the number of locks feeding the stream. Reads are pure projections:
//! querying any epoch, past or future, never advances the settled frontier,
//! so a read of a future epoch cannot block a later booking there.

use std::collections::BTreeMap;

use crate::epoch::EpochClock;
use crate::types::{EpochId, Power, VeBalance, VeDelta};
use crate::{LedgerError, Result};

#[derive(Clone, Debug, Default)]
pub struct CheckpointStream {
    /// Coefficients in force during each settled epoch.
    history: BTreeMap<EpochId, VeBalance>,
    /// Last epoch the stream has been settled through.
    updated_through: Option<EpochId>,
    /// Deltas applied when crossing into the keyed epoch.
    scheduled: BTreeMap<EpochId, VeDelta>,
}

impl CheckpointStream {
    pub fn new() -> CheckpointStream {
        CheckpointStream::default()
    }

    pub fn updated_through(&self) -> Option<EpochId> {
        self.updated_through
    }

    /// Settles boundary by boundary from the last checkpoint up to `to`,
    /// consuming scheduled deltas in order and recording an intermediate
    /// checkpoint at every step. A no-op when already settled through `to`.
    pub fn catch_up(&mut self, to: EpochId) -> Result<()> {
        let from = match self.updated_through {
            Some(cur) if to.0 <= cur.0 => return Ok(()),
            Some(cur) => cur,
            None => {
                // First touch: anchor a zero balance just before the earliest
                // scheduled boundary so no delta can be skipped.
                let anchor = match self.scheduled.keys().next().copied() {
                    Some(first) if first.0 <= to.0 => EpochId(first.0.saturating_sub(1)),
                    _ => to,
                };
                self.history.insert(anchor, VeBalance::ZERO);
                self.updated_through = Some(anchor);
                if anchor.0 >= to.0 {
                    return Ok(());
                }
                anchor
            }
        };

        let mut bal = self.history.get(&from).copied().unwrap_or(VeBalance::ZERO);
        for raw in (from.0 + 1)..=to.0 {
            let e = EpochId(raw);
            if let Some(delta) = self.scheduled.remove(&e) {
                bal = bal.apply(delta)?;
            }
            self.history.insert(e, bal);
        }
        self.updated_through = Some(to);
        Ok(())
    }

    /// Mutates the balance in force during `epoch`, settling through it
    /// first.
    ///
    /// Preconditions:
    /// - `epoch` is at or after the last settled boundary (retroactive
    ///   mutation of settled epochs is forbidden).
    pub fn apply_now(&mut self, epoch: EpochId, delta: VeDelta) -> Result<()> {
        if let Some(cur) = self.updated_through {
            if epoch.0 < cur.0 {
                return Err(LedgerError::InvalidInput(
                    "cannot mutate a settled past epoch".into(),
                ));
            }
        }
        self.catch_up(epoch)?;
        let cur = self.history.get(&epoch).copied().unwrap_or(VeBalance::ZERO);
        let next = cur.apply(delta)?;
        self.history.insert(epoch, next);
        Ok(())
    }

    /// Books a delta at a future boundary. Opposing entries at the same
    /// boundary merge and cancel exactly.
    ///
    /// Preconditions:
    /// - `at` lies strictly after the last settled boundary.
    pub fn schedule(&mut self, at: EpochId, delta: VeDelta) -> Result<()> {
        if let Some(cur) = self.updated_through {
            if at.0 <= cur.0 {
                return Err(LedgerError::InvalidInput(
                    "cannot schedule at or before a settled boundary".into(),
                ));
            }
        }
        let merged = self
            .scheduled
            .get(&at)
            .copied()
            .unwrap_or(VeDelta::ZERO)
            .checked_add(delta)?;
        if merged.is_zero() {
            self.scheduled.remove(&at);
        } else {
            self.scheduled.insert(at, merged);
        }
        Ok(())
    }

    /// Balance coefficients in force during `e`. Settled epochs read from
    /// history (zero before the first checkpoint); epochs beyond the
    /// settled frontier are projected by folding the not-yet-consumed
    /// scheduled deltas, without mutating the stream.
    pub fn balance_during(&self, e: EpochId) -> Result<VeBalance> {
        match self.updated_through {
            Some(u) if e.0 <= u.0 => {
                Ok(self.history.get(&e).copied().unwrap_or(VeBalance::ZERO))
            }
            Some(u) => {
                let mut bal = self.history.get(&u).copied().unwrap_or(VeBalance::ZERO);
                for (_, d) in self.scheduled.range(EpochId(u.0 + 1)..=e) {
                    bal = bal.apply(*d)?;
                }
                Ok(bal)
            }
            None => {
                let mut bal = VeBalance::ZERO;
                for (_, d) in self.scheduled.range(..=e) {
                    bal = bal.apply(*d)?;
                }
                Ok(bal)
            }
        }
    }

    /// Instantaneous value at timestamp `ts`.
    pub fn value_at(&self, clock: &EpochClock, ts: u64) -> Result<Power> {
        let bal = self.balance_during(clock.epoch_of(ts))?;
        bal.value_at(ts)
    }

    /// Value at the *end* boundary of epoch `e` — the only figure usable for
    /// casting votes during `e` (forward-decay benchmarking).
    pub fn value_at_epoch_end(&self, clock: &EpochClock, e: EpochId) -> Result<Power> {
        let bal = self.balance_during(e)?;
        bal.value_at(clock.end(e))
    }
}
