//! Cart module (shopper carts, totals, merge planning).
//!
//! Pure domain logic only: no IO, no HTTP, no persistence concerns. Carts
//! mirror reservation state; the aggregation service in the infra layer keeps
//! the two in step.

pub mod cart;
pub mod merge;
pub mod totals;

pub use cart::{AppliedCoupon, Cart, CartItem, CouponKind};
pub use merge::{plan_merge, MergeLine, MergeWarning};
pub use totals::{CartTotals, PricingPolicy};
