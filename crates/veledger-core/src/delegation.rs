//! Delegate registry: registration, fee schedule, and per-epoch fee snapshots.
//!
//! Fee changes are asymmetric. A decrease takes effect immediately; an
//! increase is deferred by `fee_raise_delay_epochs`, so a raise can never
//! apply to the epoch in which it was requested. The fee actually used for an
//! epoch's claims is the snapshot taken at the delegate's first vote of that
//! epoch; later fee changes never touch a snapshotted epoch.

use std::collections::BTreeMap;

use crate::types::{Bps, EpochId};
use crate::{AccountId, LedgerError, Result};

#[derive(Clone, Debug)]
struct DelegateInfo {
    fee: Bps,
    /// A deferred raise: `(new_fee, effective_epoch)`.
    pending: Option<(Bps, EpochId)>,
    fees_collected: u64,
}

#[derive(Debug, Default)]
pub struct DelegateRegistry {
    delegates: BTreeMap<AccountId, DelegateInfo>,
    /// Fee in force for claims of a given epoch, frozen at the delegate's
    /// first vote of that epoch.
    fee_history: BTreeMap<(EpochId, AccountId), Bps>,
}

impl DelegateRegistry {
    pub fn new() -> DelegateRegistry {
        DelegateRegistry::default()
    }

    pub fn is_registered(&self, d: AccountId) -> bool {
        self.delegates.contains_key(&d)
    }

    pub fn register(&mut self, d: AccountId, fee: Bps, max_fee: Bps) -> Result<()> {
        if fee > max_fee {
            return Err(LedgerError::InvalidInput(format!(
                "fee {} exceeds maximum {}",
                fee.get(),
                max_fee.get()
            )));
        }
        if self.delegates.contains_key(&d) {
            return Err(LedgerError::InvalidInput(
                "delegate already registered".into(),
            ));
        }
        self.delegates.insert(
            d,
            DelegateInfo {
                fee,
                pending: None,
                fees_collected: 0,
            },
        );
        tracing::debug!(?d, fee = fee.get(), "delegate registered");
        Ok(())
    }

    /// Removes a delegate. Vote and inbound-power preconditions are the
    /// engine's responsibility; epoch snapshots already taken are kept so
    /// outstanding claims still resolve.
    pub fn unregister(&mut self, d: AccountId) -> Result<()> {
        self.delegates
            .remove(&d)
            .map(|_| ())
            .ok_or(LedgerError::UnknownDelegate)
    }

    /// Updates a delegate's fee.
    ///
    /// Decreases apply immediately and cancel any pending raise; increases
    /// are booked to take effect `raise_delay_epochs` from `now_e`.
    pub fn set_fee(
        &mut self,
        d: AccountId,
        new_fee: Bps,
        now_e: EpochId,
        raise_delay_epochs: u64,
        max_fee: Bps,
    ) -> Result<()> {
        if new_fee > max_fee {
            return Err(LedgerError::InvalidInput(format!(
                "fee {} exceeds maximum {}",
                new_fee.get(),
                max_fee.get()
            )));
        }
        let current = self.current_fee(d, now_e)?;
        let info = self.delegates.get_mut(&d).ok_or(LedgerError::UnknownDelegate)?;
        if new_fee <= current {
            info.fee = new_fee;
            info.pending = None;
        } else {
            info.fee = current;
            let effective = EpochId(now_e.0.saturating_add(raise_delay_epochs));
            info.pending = Some((new_fee, effective));
        }
        tracing::debug!(?d, fee = new_fee.get(), "delegate fee updated");
        Ok(())
    }

    /// Fee in force during `now_e`, with any matured pending raise folded in.
    pub fn current_fee(&self, d: AccountId, now_e: EpochId) -> Result<Bps> {
        let info = self.delegates.get(&d).ok_or(LedgerError::UnknownDelegate)?;
        match info.pending {
            Some((fee, effective)) if effective.0 <= now_e.0 => Ok(fee),
            _ => Ok(info.fee),
        }
    }

    /// Freezes the fee used for all of epoch `e`'s claims. Called on the
    /// delegate's first vote of the epoch; later calls are no-ops.
    pub fn snapshot_fee(&mut self, d: AccountId, e: EpochId) -> Result<Bps> {
        if let Some(f) = self.fee_history.get(&(e, d)) {
            return Ok(*f);
        }
        let fee = self.current_fee(d, e)?;
        self.fee_history.insert((e, d), fee);
        Ok(fee)
    }

    /// Snapshotted fee for epoch `e`, if the delegate voted that epoch.
    pub fn fee_for_epoch(&self, d: AccountId, e: EpochId) -> Option<Bps> {
        self.fee_history.get(&(e, d)).copied()
    }

    /// Accumulates a delegate's lifetime fee takings (audit counter).
    pub fn record_fees(&mut self, d: AccountId, amount: u64) -> Result<()> {
        let info = self.delegates.get_mut(&d).ok_or(LedgerError::UnknownDelegate)?;
        info.fees_collected = info
            .fees_collected
            .checked_add(amount)
            .ok_or_else(|| LedgerError::Overflow("fees_collected".into()))?;
        Ok(())
    }

    pub fn fees_collected(&self, d: AccountId) -> Result<u64> {
        self.delegates
            .get(&d)
            .map(|i| i.fees_collected)
            .ok_or(LedgerError::UnknownDelegate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Hash32;

    fn acct(b: u8) -> AccountId {
        AccountId(Hash32([b; 32]))
    }

    fn bps(v: u16) -> Bps {
        Bps::new(v).unwrap()
    }

    #[test]
    fn register_rejects_duplicates_and_excess_fee() {
        let mut r = DelegateRegistry::new();
        let d = acct(1);
        assert!(r.register(d, bps(500), bps(2_000)).is_ok());
        assert!(r.register(d, bps(500), bps(2_000)).is_err());
        assert!(r.register(acct(2), bps(2_001), bps(2_000)).is_err());
    }

    #[test]
    fn fee_decrease_is_immediate_raise_is_deferred() {
        let mut r = DelegateRegistry::new();
        let d = acct(1);
        r.register(d, bps(1_000), Bps::MAX).unwrap();

        r.set_fee(d, bps(500), EpochId(3), 2, Bps::MAX).unwrap();
        assert_eq!(r.current_fee(d, EpochId(3)).unwrap(), bps(500));

        r.set_fee(d, bps(1_500), EpochId(3), 2, Bps::MAX).unwrap();
        assert_eq!(r.current_fee(d, EpochId(3)).unwrap(), bps(500));
        assert_eq!(r.current_fee(d, EpochId(4)).unwrap(), bps(500));
        assert_eq!(r.current_fee(d, EpochId(5)).unwrap(), bps(1_500));
    }

    #[test]
    fn decrease_cancels_pending_raise() {
        let mut r = DelegateRegistry::new();
        let d = acct(1);
        r.register(d, bps(1_000), Bps::MAX).unwrap();
        r.set_fee(d, bps(2_000), EpochId(0), 1, Bps::MAX).unwrap();
        r.set_fee(d, bps(800), EpochId(0), 1, Bps::MAX).unwrap();
        assert_eq!(r.current_fee(d, EpochId(10)).unwrap(), bps(800));
    }

    #[test]
    fn snapshot_freezes_the_fee_for_an_epoch() {
        let mut r = DelegateRegistry::new();
        let d = acct(1);
        r.register(d, bps(1_000), Bps::MAX).unwrap();
        assert_eq!(r.snapshot_fee(d, EpochId(2)).unwrap(), bps(1_000));

        // A later decrease does not rewrite the snapshot.
        r.set_fee(d, bps(100), EpochId(2), 1, Bps::MAX).unwrap();
        assert_eq!(r.snapshot_fee(d, EpochId(2)).unwrap(), bps(1_000));
        assert_eq!(r.fee_for_epoch(d, EpochId(2)), Some(bps(1_000)));
        assert_eq!(r.fee_for_epoch(d, EpochId(3)), None);
    }

    #[test]
    fn snapshots_survive_unregistration() {
        let mut r = DelegateRegistry::new();
        let d = acct(1);
        r.register(d, bps(700), Bps::MAX).unwrap();
        r.snapshot_fee(d, EpochId(1)).unwrap();
        r.unregister(d).unwrap();
        assert_eq!(r.fee_for_epoch(d, EpochId(1)), Some(bps(700)));
        assert!(r.current_fee(d, EpochId(1)).is_err());
    }
}
