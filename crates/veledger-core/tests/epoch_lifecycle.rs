//! Epoch pipeline scenarios: transition ordering, the zero-pool fast path,
//! force-finalization, and whole-state invariants over a driven run.

use std::collections::BTreeSet;

use veledger_core::boundary::InMemoryVault;
use veledger_core::gate::AllowAllGate;
use veledger_core::lifecycle::EpochState;
use veledger_core::types::{Amount, Capacity, EpochId, PoolId};
use veledger_core::{AccountId, Hash32, LedgerConfig, LedgerError, VeLedger};

const EPOCH: u64 = 1_000;

fn ledger() -> VeLedger {
    let config = LedgerConfig::builder()
        .epoch_secs(EPOCH)
        .max_lock_epochs(52)
        .sweep_delay_epochs(1)
        .build()
        .unwrap();
    VeLedger::new(&config).unwrap()
}

fn acct(b: u8) -> AccountId {
    AccountId(Hash32([b; 32]))
}

fn pool(b: u8) -> PoolId {
    PoolId(Hash32([b; 32]))
}

fn nonce(b: u8) -> Hash32 {
    Hash32([b; 32])
}

fn principal(units: u64) -> Amount {
    Amount::new(units * 52 * EPOCH)
}

#[test]
fn pipeline_rejects_out_of_order_transitions() {
    let mut l = ledger();
    let mut vault = InMemoryVault::new();
    let op = acct(99);
    let p = pool(1);
    let e = EpochId(0);

    l.create_pool(op, &AllowAllGate, p, 100).unwrap();

    // Cannot verify or finalize before ending.
    assert!(matches!(
        l.verify_epoch(op, &AllowAllGate, e, BTreeSet::new(), EPOCH),
        Err(LedgerError::WrongEpochState { .. })
    ));
    assert!(l
        .finalize_epoch(op, &AllowAllGate, e, EPOCH, &mut vault)
        .is_err());

    // Cannot end before the window elapses.
    assert!(matches!(
        l.end_epoch(op, &AllowAllGate, e, EPOCH - 1),
        Err(LedgerError::InvalidInput(_))
    ));
    l.end_epoch(op, &AllowAllGate, e, EPOCH).unwrap();

    // Stamping before verification is rejected.
    assert!(matches!(
        l.stamp_allocations(op, &AllowAllGate, e, &[(p, 10, 0)]),
        Err(LedgerError::WrongEpochState { .. })
    ));
    l.verify_epoch(op, &AllowAllGate, e, BTreeSet::new(), EPOCH)
        .unwrap();

    // Batch validation is all-or-nothing: one stray pool poisons the batch.
    assert!(l
        .stamp_allocations(op, &AllowAllGate, e, &[(p, 10, 0), (pool(9), 5, 0)])
        .is_err());
    assert_eq!(l.epoch_record(e).unwrap().allocated(), 0);

    l.stamp_allocations(op, &AllowAllGate, e, &[(p, 10, 0)]).unwrap();
    assert_eq!(l.epoch_record(e).unwrap().state(), EpochState::Processed);
    assert!(l
        .stamp_allocations(op, &AllowAllGate, e, &[(p, 10, 0)])
        .is_err());

    l.finalize_epoch(op, &AllowAllGate, e, EPOCH + 10, &mut vault)
        .unwrap();
    assert_eq!(vault.budget(), 10);
    assert!(l.epoch_record(e).unwrap().is_claimable());
}

#[test]
fn stamping_overflow_rejects_the_whole_batch() {
    let mut l = ledger();
    let op = acct(99);
    let (p1, p2) = (pool(1), pool(2));
    let e = EpochId(0);

    l.create_pool(op, &AllowAllGate, p1, 100).unwrap();
    l.create_pool(op, &AllowAllGate, p2, 100).unwrap();
    l.end_epoch(op, &AllowAllGate, e, EPOCH).unwrap();
    l.verify_epoch(op, &AllowAllGate, e, BTreeSet::new(), EPOCH)
        .unwrap();

    // The running budget total overflows on the second entry; neither pool
    // may end up stamped.
    assert!(matches!(
        l.stamp_allocations(op, &AllowAllGate, e, &[(p1, u64::MAX, 0), (p2, 1, 0)]),
        Err(LedgerError::Overflow(_))
    ));
    let rec = l.epoch_record(e).unwrap();
    assert_eq!(rec.allocated(), 0);
    assert!(!rec.is_stamped(p1));
    assert!(!rec.is_stamped(p2));

    // A sane batch still goes through afterwards.
    l.stamp_allocations(op, &AllowAllGate, e, &[(p1, 10, 0), (p2, 5, 5)])
        .unwrap();
    assert_eq!(l.epoch_record(e).unwrap().allocated(), 20);
}

#[test]
fn late_end_keeps_a_removed_pool_claimable() {
    let mut l = ledger();
    let mut vault = InMemoryVault::new();
    let (op, a) = (acct(99), acct(1));
    let p = pool(1);
    let e = EpochId(0);

    l.create_pool(op, &AllowAllGate, p, 100).unwrap();
    l.create_lock(a, principal(10), Amount::ZERO, 10 * EPOCH, nonce(1), 100, &mut vault)
        .unwrap();
    l.cast_vote(a, p, 10, Capacity::Personal, 200).unwrap();

    // The pool is retired during epoch 1, before anyone ended epoch 0.
    // Epoch 0's votes must still resolve against it.
    l.remove_pool(op, &AllowAllGate, p, EPOCH + 100).unwrap();
    l.end_epoch(op, &AllowAllGate, e, EPOCH + 200).unwrap();
    assert!(l.epoch_record(e).unwrap().snapshot().contains(&p));

    l.verify_epoch(op, &AllowAllGate, e, BTreeSet::new(), EPOCH + 200)
        .unwrap();
    l.stamp_allocations(op, &AllowAllGate, e, &[(p, 50, 0)]).unwrap();
    l.finalize_epoch(op, &AllowAllGate, e, EPOCH + 200, &mut vault)
        .unwrap();
    assert_eq!(l.claim_personal(a, e, p, &mut vault).unwrap(), 50);
}

#[test]
fn zero_pool_epoch_finalizes_empty_at_verify() {
    let mut l = ledger();
    let op = acct(99);
    let e = EpochId(0);

    l.end_epoch(op, &AllowAllGate, e, EPOCH).unwrap();
    l.verify_epoch(op, &AllowAllGate, e, BTreeSet::new(), EPOCH + 5)
        .unwrap();

    let rec = l.epoch_record(e).unwrap();
    assert_eq!(rec.state(), EpochState::Finalized);
    assert_eq!(rec.allocated(), 0);
    // Claimable in the state-machine sense, but nothing was ever at stake.
    assert_eq!(l.epoch_residual(e), 0);
}

#[test]
fn force_finalize_makes_the_epoch_unclaimable() {
    let mut l = ledger();
    let mut vault = InMemoryVault::new();
    let (op, g, a) = (acct(99), acct(98), acct(1));
    let p = pool(1);
    let e = EpochId(0);

    l.create_pool(op, &AllowAllGate, p, 100).unwrap();
    l.create_lock(a, principal(10), Amount::ZERO, 10 * EPOCH, nonce(1), 100, &mut vault)
        .unwrap();
    l.cast_vote(a, p, 10, Capacity::Personal, 200).unwrap();

    l.end_epoch(op, &AllowAllGate, e, EPOCH).unwrap();
    l.verify_epoch(op, &AllowAllGate, e, BTreeSet::new(), EPOCH)
        .unwrap();
    l.stamp_allocations(op, &AllowAllGate, e, &[(p, 500, 0)]).unwrap();

    l.force_finalize(g, &AllowAllGate, e, EPOCH + 50).unwrap();
    let rec = l.epoch_record(e).unwrap();
    assert_eq!(rec.state(), EpochState::ForceFinalized);
    assert_eq!(rec.allocated(), 0);

    // Claims fail loudly; they never silently pay zero.
    assert!(matches!(
        l.claim_personal(a, e, p, &mut vault),
        Err(LedgerError::EpochNotClaimable(_))
    ));
    // Terminal states cannot be re-finalized or re-forced.
    assert!(l.force_finalize(g, &AllowAllGate, e, EPOCH + 60).is_err());
    assert!(l
        .finalize_epoch(op, &AllowAllGate, e, EPOCH + 60, &mut vault)
        .is_err());
}

#[test]
fn force_finalizing_the_current_epoch_halts_voting() {
    let mut l = ledger();
    let mut vault = InMemoryVault::new();
    let (g, a) = (acct(98), acct(1));
    let p = pool(1);

    l.create_pool(g, &AllowAllGate, p, 100).unwrap();
    l.create_lock(a, principal(10), Amount::ZERO, 10 * EPOCH, nonce(1), 100, &mut vault)
        .unwrap();

    l.force_finalize(g, &AllowAllGate, EpochId(0), 300).unwrap();
    assert!(matches!(
        l.cast_vote(a, p, 10, Capacity::Personal, 400),
        Err(LedgerError::WrongEpochState { .. })
    ));
}

#[test]
fn votes_are_bounded_by_end_of_epoch_power() {
    let mut l = ledger();
    let mut vault = InMemoryVault::new();
    let (op, a) = (acct(99), acct(1));
    let p = pool(1);

    l.create_pool(op, &AllowAllGate, p, 100).unwrap();
    l.create_lock(a, principal(10), Amount::ZERO, 4 * EPOCH, nonce(1), 100, &mut vault)
        .unwrap();

    // End-of-epoch-0 power: slope 10 over the 3 remaining epochs.
    let budget = 10 * 3 * EPOCH;
    assert_eq!(
        l.power_at_epoch_end(a, EpochId(0), Capacity::Personal)
            .unwrap()
            .get(),
        budget
    );
    assert!(matches!(
        l.cast_vote(a, p, budget + 1, Capacity::Personal, 200),
        Err(LedgerError::InsufficientVotes { .. })
    ));
    l.cast_vote(a, p, budget, Capacity::Personal, 200).unwrap();
    assert_eq!(l.spent_votes(EpochId(0), a, Capacity::Personal), budget);
}

#[test]
fn invariants_hold_across_a_mixed_scenario() {
    let mut l = ledger();
    let mut vault = InMemoryVault::new();
    let (op, a, b, d) = (acct(99), acct(1), acct(2), acct(8));
    let p = pool(1);

    l.create_pool(op, &AllowAllGate, p, 100).unwrap();
    l.register_delegate(d, veledger_core::types::Bps::new(500).unwrap())
        .unwrap();
    let id_a = l
        .create_lock(a, principal(10), Amount::ZERO, 20 * EPOCH, nonce(1), 100, &mut vault)
        .unwrap();
    l.create_lock(b, principal(4), Amount::ZERO, 6 * EPOCH, nonce(2), 150, &mut vault)
        .unwrap();
    l.delegate(a, id_a, d, 200).unwrap();

    l.cast_vote(b, p, 50, Capacity::Personal, 300).unwrap();
    l.cast_vote(a, p, 100, Capacity::Personal, 350).unwrap();

    for e in 0..8u64 {
        l.check_invariants(EpochId(e)).unwrap();
    }
}
