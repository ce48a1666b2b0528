use crate::types::{Bps, VeBalance, BPS_U64};
use crate::{LedgerError, Result};

pub fn add_u64(a: u64, b: u64) -> Result<u64> {
    a.checked_add(b)
        .ok_or_else(|| LedgerError::Overflow("u64 overflow in add".into()))
}

pub fn sub_u64(a: u64, b: u64) -> Result<u64> {
    a.checked_sub(b)
        .ok_or_else(|| LedgerError::InvalidInput("u64 underflow in sub".into()))
}

pub fn add_u128(a: u128, b: u128) -> Result<u128> {
    a.checked_add(b)
        .ok_or_else(|| LedgerError::Overflow("u128 overflow in add".into()))
}

/// `floor(a * b / denom)` with a u128 intermediate.
///
/// Multiplication happens before division so small numerators are not floored
/// to zero any earlier than arithmetic forces.
pub fn mul_div_floor_u64(a: u64, b: u64, denom: u64) -> Result<u64> {
    if denom == 0 {
        return Err(LedgerError::InvalidInput("division by zero".into()));
    }
    let num = (a as u128)
        .checked_mul(b as u128)
        .ok_or_else(|| LedgerError::Overflow("u128 overflow in mul".into()))?;
    let out = num / (denom as u128);
    u64::try_from(out).map_err(|_| LedgerError::Overflow("u64 overflow in div".into()))
}

pub fn floor_bps(amount: u64, bps: Bps) -> Result<u64> {
    mul_div_floor_u64(amount, bps.as_u64(), BPS_U64)
}

/// Derives the decaying balance of a lock.
///
/// `slope = principal / max_span_secs` (floor, against the fixed maximum
/// span — never the lock's own duration) and `bias = slope * expiry_ts`
/// (against the absolute expiry, so no creation time is stored). The value
/// `bias - slope*t` recovers power at any `t` up to expiry.
pub fn lock_balance(principal: u64, expiry_ts: u64, max_span_secs: u64) -> Result<VeBalance> {
    if max_span_secs == 0 {
        return Err(LedgerError::InvalidInput("max_span_secs must be > 0".into()));
    }
    let slope = (principal / max_span_secs) as u128;
    let bias = slope
        .checked_mul(expiry_ts as u128)
        .ok_or_else(|| LedgerError::Overflow("slope * expiry".into()))?;
    Ok(VeBalance { bias, slope })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Power;
    use proptest::prelude::*;

    #[test]
    fn mul_div_floors() {
        assert_eq!(mul_div_floor_u64(3, 5, 10).unwrap(), 1);
        assert_eq!(mul_div_floor_u64(1, 5, 10).unwrap(), 0);
        assert!(mul_div_floor_u64(1, 1, 0).is_err());
    }

    #[test]
    fn floor_bps_examples() {
        let ten_pct = Bps::new(1_000).unwrap();
        assert_eq!(floor_bps(100, ten_pct).unwrap(), 10);
        assert_eq!(floor_bps(9, ten_pct).unwrap(), 0);
    }

    #[test]
    fn lock_balance_full_span_recovers_principal() {
        // A lock opened at t=0 with expiry = max span carries power equal to
        // the slope-floored principal at t=0.
        let span = 728 * 86_400;
        let principal = 200 * span;
        let b = lock_balance(principal, span, span).unwrap();
        assert_eq!(b.slope, 200);
        assert_eq!(b.value_at(0).unwrap(), Power::new(200 * span));
        assert_eq!(b.value_at(span).unwrap(), Power::ZERO);
    }

    proptest! {
        #[test]
        fn decay_is_monotone_nonincreasing(
            principal in 0u64..1_000_000_000_000u64,
            expiry in 1u64..100_000_000u64,
            t1 in 0u64..200_000_000u64,
            t2 in 0u64..200_000_000u64,
        ) {
            let span = 728 * 86_400;
            let b = lock_balance(principal, expiry, span).unwrap();
            let (a, z) = if t1 <= t2 { (t1, t2) } else { (t2, t1) };
            prop_assert!(b.value_at(a).unwrap() >= b.value_at(z).unwrap());
        }

        #[test]
        fn zero_at_and_after_expiry(
            principal in 0u64..1_000_000_000_000u64,
            expiry in 1u64..100_000_000u64,
            after in 0u64..100_000_000u64,
        ) {
            let span = 728 * 86_400;
            let b = lock_balance(principal, expiry, span).unwrap();
            prop_assert_eq!(b.value_at(expiry).unwrap(), Power::ZERO);
            prop_assert_eq!(b.value_at(expiry + after).unwrap(), Power::ZERO);
        }
    }
}
