// =============================================================================
// COUPON MODULE
// =============================================================================
// Decides whether a coupon applies to a subtotal and how much it takes off.
//
// The evaluator is pure: looking the code up and recording usage both happen
// in the checkout transaction (see checkout.rs).
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{Coupon, DiscountKind};
use crate::pricing::round_money;

/// Why a coupon gave no discount. Never surfaced to the shopper as an error;
/// the order simply proceeds without a discount.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotApplicable {
    #[error("unknown coupon code")]
    UnknownCode,

    #[error("coupon is inactive")]
    Inactive,

    #[error("coupon expired at {0}")]
    Expired(DateTime<Utc>),

    #[error("subtotal {subtotal} is below the minimum of {minimum}")]
    BelowMinimum { subtotal: Decimal, minimum: Decimal },
}

/// Discount `coupon` grants on `subtotal` at instant `now`.
///
/// # Rules
/// 1. Missing, inactive or expired (`now >= valid_until`) → not applicable
/// 2. `subtotal < minimum_amount` → not applicable
/// 3. Fixed → `min(value, subtotal)`
/// 4. Percentage → `subtotal * value / 100`, capped at `maximum_discount`
pub fn evaluate(
    coupon: Option<&Coupon>,
    subtotal: Decimal,
    now: DateTime<Utc>,
) -> Result<Decimal, NotApplicable> {
    let coupon = coupon.ok_or(NotApplicable::UnknownCode)?;

    if !coupon.is_active {
        return Err(NotApplicable::Inactive);
    }

    if let Some(valid_until) = coupon.valid_until {
        if now >= valid_until {
            return Err(NotApplicable::Expired(valid_until));
        }
    }

    if subtotal < coupon.minimum_amount {
        return Err(NotApplicable::BelowMinimum {
            subtotal,
            minimum: coupon.minimum_amount,
        });
    }

    let discount = match coupon.kind {
        DiscountKind::Fixed => coupon.value.min(subtotal),
        DiscountKind::Percentage => {
            let raw = round_money(subtotal * coupon.value / Decimal::ONE_HUNDRED);
            match coupon.maximum_discount {
                Some(cap) => raw.min(cap),
                None => raw,
            }
        }
    };

    Ok(discount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn coupon(kind: DiscountKind, value: Decimal) -> Coupon {
        Coupon {
            id: 1,
            code: "GREEN".to_string(),
            kind,
            value,
            minimum_amount: Decimal::ZERO,
            maximum_discount: None,
            is_active: true,
            valid_until: None,
            used_count: 0,
        }
    }

    #[test]
    fn missing_code_is_not_applicable() {
        assert_eq!(
            evaluate(None, dec!(100), Utc::now()),
            Err(NotApplicable::UnknownCode)
        );
    }

    #[test]
    fn below_minimum_gives_nothing() {
        let mut c = coupon(DiscountKind::Percentage, dec!(10));
        c.minimum_amount = dec!(100);
        c.maximum_discount = Some(dec!(20));

        let result = evaluate(Some(&c), dec!(80), Utc::now());
        assert!(matches!(result, Err(NotApplicable::BelowMinimum { .. })));
    }

    #[test]
    fn percentage_is_capped() {
        let mut c = coupon(DiscountKind::Percentage, dec!(10));
        c.minimum_amount = dec!(100);
        c.maximum_discount = Some(dec!(20));

        assert_eq!(evaluate(Some(&c), dec!(150), Utc::now()), Ok(dec!(15)));
        assert_eq!(evaluate(Some(&c), dec!(500), Utc::now()), Ok(dec!(20)));
    }

    #[test]
    fn fixed_never_exceeds_subtotal() {
        let c = coupon(DiscountKind::Fixed, dec!(50));
        assert_eq!(evaluate(Some(&c), dec!(30), Utc::now()), Ok(dec!(30)));
        assert_eq!(evaluate(Some(&c), dec!(80), Utc::now()), Ok(dec!(50)));
    }

    #[test]
    fn inactive_and_expired_are_rejected() {
        let now = Utc::now();

        let mut inactive = coupon(DiscountKind::Fixed, dec!(5));
        inactive.is_active = false;
        assert_eq!(
            evaluate(Some(&inactive), dec!(100), now),
            Err(NotApplicable::Inactive)
        );

        let mut expired = coupon(DiscountKind::Fixed, dec!(5));
        expired.valid_until = Some(now - Duration::days(1));
        assert!(matches!(
            evaluate(Some(&expired), dec!(100), now),
            Err(NotApplicable::Expired(_))
        ));

        // Expiry instant itself is already too late
        expired.valid_until = Some(now);
        assert!(evaluate(Some(&expired), dec!(100), now).is_err());

        expired.valid_until = Some(now + Duration::hours(1));
        assert_eq!(evaluate(Some(&expired), dec!(100), now), Ok(dec!(5)));
    }
}
