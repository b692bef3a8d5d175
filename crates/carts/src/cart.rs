//! Cart rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stocklock_core::{
    CartId, DomainError, DomainResult, Entity, OwnerKey, ProductRef, ReservationId, TenantId,
    Versioned,
};

/// How a coupon discounts the cart.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum CouponKind {
    PercentOff { basis_points: u32 },
    AmountOff { amount: u64 },
}

/// Snapshot of a validated coupon attached to a cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedCoupon {
    pub code: String,
    pub kind: CouponKind,
}

/// One cart line. Quantity and price mirror the backing reservation item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub product_ref: ProductRef,
    pub quantity: i64,
    /// Minor units, locked when the hold was placed.
    pub unit_price: u64,
    pub name: String,
}

/// A shopper's cart. One per owner key per tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub id: CartId,
    pub tenant_id: TenantId,
    pub owner_key: OwnerKey,
    pub items: Vec<CartItem>,
    pub coupon: Option<AppliedCoupon>,
    pub reservation_id: Option<ReservationId>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for Cart {
    type Id = CartId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl Versioned for Cart {
    fn version(&self) -> u64 {
        self.version
    }
}

impl Cart {
    pub fn open(tenant_id: TenantId, owner_key: OwnerKey, now: DateTime<Utc>) -> Self {
        Self {
            id: CartId::new(),
            tenant_id,
            owner_key,
            items: Vec::new(),
            coupon: None,
            reservation_id: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn quantity_of(&self, product_ref: ProductRef) -> i64 {
        self.items
            .iter()
            .find(|item| item.product_ref == product_ref)
            .map(|item| item.quantity)
            .unwrap_or(0)
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
        self.version += 1;
    }

    /// Mirror a reservation item into the cart: absolute quantity, zero
    /// removes the line. The quantity always comes from the reservation
    /// write's outcome, never from the caller's stale view.
    pub fn upsert_item(
        &mut self,
        product_ref: ProductRef,
        quantity: i64,
        unit_price: u64,
        name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if quantity < 0 {
            return Err(DomainError::validation("quantity cannot be negative"));
        }
        if quantity == 0 {
            self.items.retain(|item| item.product_ref != product_ref);
        } else {
            match self
                .items
                .iter_mut()
                .find(|item| item.product_ref == product_ref)
            {
                Some(item) => {
                    item.quantity = quantity;
                    item.unit_price = unit_price;
                }
                None => self.items.push(CartItem {
                    product_ref,
                    quantity,
                    unit_price,
                    name: name.into(),
                }),
            }
        }
        self.touch(now);
        Ok(())
    }

    pub fn link_reservation(&mut self, reservation_id: ReservationId, now: DateTime<Utc>) {
        if self.reservation_id != Some(reservation_id) {
            self.reservation_id = Some(reservation_id);
            self.touch(now);
        }
    }

    pub fn set_coupon(&mut self, coupon: AppliedCoupon, now: DateTime<Utc>) {
        self.coupon = Some(coupon);
        self.touch(now);
    }

    pub fn clear_coupon(&mut self, now: DateTime<Utc>) {
        if self.coupon.take().is_some() {
            self.touch(now);
        }
    }

    /// Reset after checkout: the hold is settled, the cart starts over.
    pub fn clear_after_order(&mut self, now: DateTime<Utc>) {
        self.items.clear();
        self.coupon = None;
        self.reservation_id = None;
        self.touch(now);
    }

    /// Drop lines whose backing hold lapsed or was released elsewhere. The
    /// coupon survives for whatever the shopper holds next.
    pub fn clear_lapsed_hold(&mut self, now: DateTime<Utc>) {
        self.items.clear();
        self.reservation_id = None;
        self.touch(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stocklock_core::{ProductId, ShopperId};

    fn test_cart(now: DateTime<Utc>) -> Cart {
        Cart::open(TenantId::new(), OwnerKey::shopper(ShopperId::new()), now)
    }

    #[test]
    fn upsert_is_absolute_and_zero_removes() {
        let now = Utc::now();
        let mut cart = test_cart(now);
        let product = ProductRef::product(ProductId::new());

        cart.upsert_item(product, 2, 500, "Mug", now).unwrap();
        cart.upsert_item(product, 5, 500, "Mug", now).unwrap();
        assert_eq!(cart.quantity_of(product), 5);
        assert_eq!(cart.items.len(), 1);

        cart.upsert_item(product, 0, 500, "Mug", now).unwrap();
        assert!(cart.is_empty());
    }

    #[test]
    fn negative_quantity_rejected() {
        let now = Utc::now();
        let mut cart = test_cart(now);
        let product = ProductRef::product(ProductId::new());

        assert!(matches!(
            cart.upsert_item(product, -1, 500, "Mug", now),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn version_increments_on_mutations() {
        let now = Utc::now();
        let mut cart = test_cart(now);
        let product = ProductRef::product(ProductId::new());
        assert_eq!(cart.version, 1);

        cart.upsert_item(product, 1, 100, "Mug", now).unwrap();
        assert_eq!(cart.version, 2);

        cart.set_coupon(
            AppliedCoupon {
                code: "WELCOME".to_string(),
                kind: CouponKind::PercentOff { basis_points: 1000 },
            },
            now,
        );
        assert_eq!(cart.version, 3);

        // Clearing an absent coupon is not a write.
        cart.clear_coupon(now);
        cart.clear_coupon(now);
        assert_eq!(cart.version, 4);
    }

    #[test]
    fn clear_after_order_resets_everything() {
        let now = Utc::now();
        let mut cart = test_cart(now);
        let product = ProductRef::product(ProductId::new());

        cart.upsert_item(product, 2, 100, "Mug", now).unwrap();
        cart.link_reservation(ReservationId::new(), now);
        cart.set_coupon(
            AppliedCoupon {
                code: "TEN".to_string(),
                kind: CouponKind::AmountOff { amount: 1000 },
            },
            now,
        );

        cart.clear_after_order(now);
        assert!(cart.is_empty());
        assert!(cart.coupon.is_none());
        assert!(cart.reservation_id.is_none());
    }
}
