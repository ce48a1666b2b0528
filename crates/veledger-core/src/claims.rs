//! Pro-rata claim arithmetic (pure functions) and claim idempotency keys.
//!
//! Every share multiplies before dividing (u128 intermediates, floor), so
//! small claimants are not floored to zero any earlier than integer
//! arithmetic forces. Truncation residue is never redistributed here; it
//! stays in the epoch's allocated-minus-claimed gap for the delayed sweep.

use crate::math::{floor_bps, mul_div_floor_u64, sub_u64};
use crate::types::{Bps, EpochId, PoolId};
use crate::{AccountId, Result};

/// Idempotency key for a completed claim. One key, one payout, ever.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClaimKey {
    Personal {
        epoch: EpochId,
        holder: AccountId,
        pool: PoolId,
    },
    Delegated {
        epoch: EpochId,
        delegator: AccountId,
        delegate: AccountId,
        pool: PoolId,
    },
    Fee {
        epoch: EpochId,
        delegate: AccountId,
    },
    Subsidy {
        epoch: EpochId,
        verifier: AccountId,
        pool: PoolId,
    },
}

/// `floor(share * total_value / total_share)`; zero when nothing was shared.
pub fn pro_rata(share: u64, total_value: u64, total_share: u64) -> Result<u64> {
    if total_share == 0 || share == 0 {
        return Ok(0);
    }
    mul_div_floor_u64(share, total_value, total_share)
}

/// Splits a gross delegated reward into `(net, fee)` using the snapshotted
/// fee. `net + fee == gross` always; the fee side takes the floor.
pub fn fee_split(gross: u64, fee: Bps) -> Result<(u64, u64)> {
    let fee_amount = floor_bps(gross, fee)?;
    let net = sub_u64(gross, fee_amount)?;
    Ok((net, fee_amount))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_leaves_residue() {
        // 5 units across 10 votes split 4/3/3: payouts 2/1/1, residue 1.
        let total_votes = 10;
        let reward = 5;
        let a = pro_rata(4, reward, total_votes).unwrap();
        let b = pro_rata(3, reward, total_votes).unwrap();
        let c = pro_rata(3, reward, total_votes).unwrap();
        assert_eq!((a, b, c), (2, 1, 1));
        assert_eq!(reward - (a + b + c), 1);
    }

    #[test]
    fn zero_total_share_pays_nothing() {
        assert_eq!(pro_rata(0, 100, 0).unwrap(), 0);
        assert_eq!(pro_rata(5, 100, 0).unwrap(), 0);
    }

    #[test]
    fn ten_percent_fee_splits_ninety_ten() {
        let fee = Bps::new(1_000).unwrap();
        let (net, fee_amt) = fee_split(100, fee).unwrap();
        assert_eq!((net, fee_amt), (90, 10));
    }

    #[test]
    fn fee_split_conserves_gross() {
        for gross in [0u64, 1, 7, 99, 10_000, u32::MAX as u64] {
            for bps in [0u16, 1, 333, 5_000, 9_999, 10_000] {
                let fee = Bps::new(bps).unwrap();
                let (net, fee_amt) = fee_split(gross, fee).unwrap();
                assert_eq!(net + fee_amt, gross);
            }
        }
    }

    #[test]
    fn full_fee_nets_zero() {
        let (net, fee_amt) = fee_split(57, Bps::MAX).unwrap();
        assert_eq!((net, fee_amt), (0, 57));
    }
}
