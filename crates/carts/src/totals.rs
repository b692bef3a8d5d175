//! Deterministic cart totals.

use serde::{Deserialize, Serialize};

use crate::cart::{Cart, CouponKind};

/// Tenant-level pricing knobs applied to every cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingPolicy {
    /// Tax applied to the discounted subtotal, in basis points.
    pub tax_rate_bps: u32,
    /// Flat delivery charge in minor units.
    pub delivery_fee: u64,
    /// Discounted subtotal at which delivery becomes free.
    pub free_delivery_threshold: Option<u64>,
    /// Display currency for totals.
    pub currency: String,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            tax_rate_bps: 0,
            delivery_fee: 0,
            free_delivery_threshold: None,
            currency: "USD".to_string(),
        }
    }
}

/// Computed money view of a cart, all minor units, never negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartTotals {
    pub subtotal: u64,
    pub discount: u64,
    pub tax: u64,
    pub delivery_charge: u64,
    pub grand_total: u64,
    pub currency: String,
}

impl CartTotals {
    /// Recompute from scratch. Same cart + same policy always yields the same
    /// totals; intermediate math runs in u128 and clamps instead of wrapping.
    pub fn compute(cart: &Cart, policy: &PricingPolicy) -> Self {
        let subtotal = clamp_u128(
            cart.items
                .iter()
                .map(|item| item.unit_price as u128 * item.quantity.max(0) as u128)
                .sum(),
        );

        let discount = match &cart.coupon {
            None => 0,
            Some(coupon) => match coupon.kind {
                CouponKind::PercentOff { basis_points } => clamp_u128(
                    subtotal as u128 * basis_points.min(10_000) as u128 / 10_000,
                ),
                CouponKind::AmountOff { amount } => amount.min(subtotal),
            },
        };

        let discounted = subtotal - discount;
        let tax = clamp_u128(discounted as u128 * policy.tax_rate_bps as u128 / 10_000);

        let delivery_charge = if cart.is_empty() {
            0
        } else {
            match policy.free_delivery_threshold {
                Some(threshold) if discounted >= threshold => 0,
                _ => policy.delivery_fee,
            }
        };

        let grand_total = clamp_u128(discounted as u128 + tax as u128 + delivery_charge as u128);

        Self {
            subtotal,
            discount,
            tax,
            delivery_charge,
            grand_total,
            currency: policy.currency.clone(),
        }
    }
}

fn clamp_u128(value: u128) -> u64 {
    value.min(u64::MAX as u128) as u64
}
