// =============================================================================
// PRICING MODULE
// =============================================================================
// Price locking and order totals.
//
// LEARNING NOTES:
// - Money is rust_decimal::Decimal: 0.1 + 0.2 == 0.3, unlike f64
// - Every figure stored on an order is rounded to cents *before* the total is
//   derived, so total = subtotal + shipping + tax - discount holds exactly on
//   the persisted row
// =============================================================================

use rust_decimal::{Decimal, RoundingStrategy};

/// Site setting keys read from `site_settings`.
pub const FREE_SHIPPING_THRESHOLD_KEY: &str = "free_shipping_threshold";
pub const TAX_RATE_KEY: &str = "tax_rate";
pub const SHIPPING_FLAT_FEE_KEY: &str = "shipping_flat_fee";

// -----------------------------------------------------------------------------
// SITE SETTINGS
// -----------------------------------------------------------------------------
/// Storefront-wide pricing knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteSettings {
    /// Subtotal at or above which shipping is free (default 150)
    pub free_shipping_threshold: Decimal,

    /// Tax rate in percent, so 6 means 6% (default 6)
    pub tax_rate_percent: Decimal,

    /// Shipping fee below the threshold (default 15)
    pub shipping_flat_fee: Decimal,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            free_shipping_threshold: Decimal::from(150),
            tax_rate_percent: Decimal::from(6),
            shipping_flat_fee: Decimal::from(15),
        }
    }
}

impl SiteSettings {
    /// Build settings from raw `(key, value)` rows.
    ///
    /// Missing keys keep their default. Unparseable values are logged and
    /// also fall back to the default rather than failing the request.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut settings = Self::default();

        for (key, value) in pairs {
            let key = key.as_ref();
            let target = match key {
                FREE_SHIPPING_THRESHOLD_KEY => &mut settings.free_shipping_threshold,
                TAX_RATE_KEY => &mut settings.tax_rate_percent,
                SHIPPING_FLAT_FEE_KEY => &mut settings.shipping_flat_fee,
                _ => continue,
            };

            match value.as_ref().trim().parse::<Decimal>() {
                Ok(parsed) => *target = parsed,
                Err(e) => tracing::warn!(
                    setting = key,
                    value = value.as_ref(),
                    error = %e,
                    "Ignoring unparseable site setting"
                ),
            }
        }

        settings
    }

    pub fn shipping_for(&self, subtotal: Decimal) -> Decimal {
        if subtotal >= self.free_shipping_threshold {
            Decimal::ZERO
        } else {
            self.shipping_flat_fee
        }
    }

    pub fn tax_for(&self, subtotal: Decimal) -> Decimal {
        round_money(subtotal * self.tax_rate_percent / Decimal::ONE_HUNDRED)
    }

    /// How much more the shopper has to spend for free shipping.
    pub fn remaining_for_free_shipping(&self, subtotal: Decimal) -> Decimal {
        (self.free_shipping_threshold - subtotal).max(Decimal::ZERO)
    }
}

// -----------------------------------------------------------------------------
// HELPERS
// -----------------------------------------------------------------------------

/// Round to cents, half away from zero (what a NUMERIC(10,2) column does).
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Sale price if there is one and it actually undercuts the list price.
pub fn unit_price(list_price: Decimal, sale_price: Option<Decimal>) -> Decimal {
    match sale_price {
        Some(sale) if sale < list_price => sale,
        _ => list_price,
    }
}

pub fn line_total(unit_price: Decimal, quantity: i32) -> Decimal {
    unit_price * Decimal::from(quantity)
}

// -----------------------------------------------------------------------------
// QUOTE
// -----------------------------------------------------------------------------
/// The money figures of one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    pub subtotal: Decimal,
    pub shipping_amount: Decimal,
    pub tax_amount: Decimal,
    pub discount_amount: Decimal,
    pub total_amount: Decimal,
}

impl Quote {
    /// Derive shipping, tax and total from a subtotal and discount.
    ///
    /// The total is deliberately not floored at zero: a discount larger than
    /// everything else yields a negative total.
    pub fn compute(subtotal: Decimal, settings: &SiteSettings, discount: Decimal) -> Self {
        let subtotal = round_money(subtotal);
        let shipping_amount = settings.shipping_for(subtotal);
        let tax_amount = settings.tax_for(subtotal);
        let discount_amount = round_money(discount);

        Self {
            subtotal,
            shipping_amount,
            tax_amount,
            discount_amount,
            total_amount: subtotal + shipping_amount + tax_amount - discount_amount,
        }
    }
}
