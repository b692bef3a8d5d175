//! Guest-to-user cart merge planning.

use serde::{Deserialize, Serialize};

use stocklock_core::ProductRef;

use crate::cart::Cart;

/// One quantity target the merge must reach on the user's reservation.
///
/// Only products present in the guest cart produce lines; user-only lines are
/// already where they should be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeLine {
    pub product_ref: ProductRef,
    pub user_quantity: i64,
    pub guest_quantity: i64,
    pub target_quantity: i64,
    /// Price the guest line was held at, used when the user cart has no line.
    pub guest_unit_price: u64,
    pub name: String,
}

/// Anything the merge could not do in full.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MergeWarning {
    /// Stock could not cover the summed quantity; the line was capped.
    QuantityCapped {
        product_ref: ProductRef,
        requested: i64,
        granted: i64,
    },
    /// The guest line's product is no longer purchasable at all.
    LineDropped { product_ref: ProductRef, detail: String },
    /// The guest coupon did not survive revalidation against the merged cart.
    CouponDropped { code: String, detail: String },
}

/// Compute the per-product targets for merging `guest` into `user`.
/// Overlapping lines sum; ordering follows the guest cart for determinism.
pub fn plan_merge(user: &Cart, guest: &Cart) -> Vec<MergeLine> {
    guest
        .items
        .iter()
        .map(|guest_item| {
            let user_quantity = user.quantity_of(guest_item.product_ref);
            MergeLine {
                product_ref: guest_item.product_ref,
                user_quantity,
                guest_quantity: guest_item.quantity,
                target_quantity: user_quantity + guest_item.quantity,
                guest_unit_price: guest_item.unit_price,
                name: guest_item.name.clone(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stocklock_core::{OwnerKey, ProductId, ShopperId, TenantId};

    fn cart(owner: OwnerKey) -> Cart {
        Cart::open(TenantId::new(), owner, Utc::now())
    }

    #[test]
    fn overlapping_lines_sum() {
        let now = Utc::now();
        let product = ProductRef::product(ProductId::new());

        let mut user = cart(OwnerKey::shopper(ShopperId::new()));
        user.upsert_item(product, 1, 900, "Mug", now).unwrap();

        let mut guest = cart(OwnerKey::session("fp").unwrap());
        guest.upsert_item(product, 2, 900, "Mug", now).unwrap();

        let plan = plan_merge(&user, &guest);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].user_quantity, 1);
        assert_eq!(plan[0].guest_quantity, 2);
        assert_eq!(plan[0].target_quantity, 3);
    }

    #[test]
    fn guest_only_lines_are_planned_and_user_only_lines_are_not() {
        let now = Utc::now();
        let guest_product = ProductRef::product(ProductId::new());
        let user_product = ProductRef::product(ProductId::new());

        let mut user = cart(OwnerKey::shopper(ShopperId::new()));
        user.upsert_item(user_product, 4, 100, "Poster", now).unwrap();

        let mut guest = cart(OwnerKey::session("fp").unwrap());
        guest
            .upsert_item(guest_product, 1, 2_500, "Hoodie", now)
            .unwrap();

        let plan = plan_merge(&user, &guest);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].product_ref, guest_product);
        assert_eq!(plan[0].user_quantity, 0);
        assert_eq!(plan[0].target_quantity, 1);
    }

    #[test]
    fn empty_guest_cart_plans_nothing() {
        let user = cart(OwnerKey::shopper(ShopperId::new()));
        let guest = cart(OwnerKey::session("fp").unwrap());
        assert!(plan_merge(&user, &guest).is_empty());
    }
}
