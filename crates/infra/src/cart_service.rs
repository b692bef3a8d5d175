//! Cart aggregation over the reservation manager.
//!
//! Carts never hold stock themselves. Every quantity change goes to the
//! reservation manager first; only what the hold actually granted is then
//! mirrored into the cart row. When a mirror write loses a race the cart may
//! briefly trail its hold, and the next read reconciles it from the
//! reservation, which stays the source of truth for quantities and locked
//! prices.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use stocklock_carts::{plan_merge, Cart, CartTotals, MergeWarning, PricingPolicy};
use stocklock_core::{
    DomainError, DomainResult, ExpectedVersion, OrderId, OwnerKey, ProductRef, ReservationId,
    TenantId,
};
use stocklock_ledger::LedgerEntry;
use stocklock_reservations::{Reservation, ReservationStatus};

use crate::cart_store::CartStore;
use crate::catalog::Catalog;
use crate::coupons::CouponDirectory;
use crate::ledger_store::LedgerStore;
use crate::manager::{ReservationManager, ReserveRequest};
use crate::reservation_store::ReservationStore;

/// Conditional-write budget for cart rows.
const WRITE_ATTEMPTS: u32 = 3;

/// A cart with its computed totals and the backing hold's deadline.
#[derive(Debug, Clone, Serialize)]
pub struct CartView {
    pub cart: Cart,
    pub totals: CartTotals,
    pub hold_expires_at: Option<DateTime<Utc>>,
}

/// Result of folding a guest cart into a signed-in shopper's cart.
#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub view: CartView,
    pub warnings: Vec<MergeWarning>,
}

/// Result of checking a cart out into an order.
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutOutcome {
    pub order_id: OrderId,
    pub reservation: Reservation,
    pub entries: Vec<LedgerEntry>,
    pub totals: CartTotals,
    /// False when the same order had already settled this cart.
    pub newly_converted: bool,
}

/// Storefront cart operations: item changes, coupons, guest merge, checkout.
#[derive(Debug)]
pub struct CartAggregator<L, R, C, S, D> {
    manager: Arc<ReservationManager<L, R, C>>,
    carts: S,
    catalog: C,
    coupons: D,
    policy: PricingPolicy,
}

impl<L, R, C, S, D> CartAggregator<L, R, C, S, D> {
    pub fn new(
        manager: Arc<ReservationManager<L, R, C>>,
        carts: S,
        catalog: C,
        coupons: D,
        policy: PricingPolicy,
    ) -> Self {
        Self {
            manager,
            carts,
            catalog,
            coupons,
            policy,
        }
    }

    pub fn policy(&self) -> &PricingPolicy {
        &self.policy
    }
}

impl<L, R, C, S, D> CartAggregator<L, R, C, S, D>
where
    L: LedgerStore,
    R: ReservationStore,
    C: Catalog,
    S: CartStore,
    D: CouponDirectory,
{
    /// Current view of the owner's cart, reconciled against its hold.
    ///
    /// Reading never creates a cart row; an owner without one gets an empty
    /// view. A cart linked to a hold that lapsed or closed elsewhere is
    /// cleaned up here.
    pub fn cart(&self, tenant_id: TenantId, owner_key: &OwnerKey) -> DomainResult<CartView> {
        let (cart, hold) = self.load_reconciled(tenant_id, owner_key)?;
        Ok(self.view_of(cart, hold.as_ref()))
    }

    /// Add quantity of a product to the cart. The hold grows first; the cart
    /// line mirrors whatever the hold granted.
    pub fn add_item(
        &self,
        tenant_id: TenantId,
        owner_key: &OwnerKey,
        product_ref: ProductRef,
        quantity: i64,
        window: Option<Duration>,
    ) -> DomainResult<CartView> {
        let cart = self.ensure_cart(tenant_id, owner_key)?;
        let mut request = ReserveRequest::new(owner_key.clone(), cart.id, product_ref, quantity);
        if let Some(window) = window {
            request = request.with_window(window);
        }
        let row = self.manager.reserve(tenant_id, request)?;
        self.sync_view(tenant_id, owner_key, row.id)
    }

    /// Set a cart line to an absolute quantity; zero removes it. Removing the
    /// last line releases the hold entirely.
    pub fn update_quantity(
        &self,
        tenant_id: TenantId,
        owner_key: &OwnerKey,
        product_ref: ProductRef,
        quantity: i64,
    ) -> DomainResult<CartView> {
        if quantity < 0 {
            return Err(DomainError::validation("quantity cannot be negative"));
        }

        let (cart, hold) = self.load_reconciled(tenant_id, owner_key)?;
        let Some(hold) = hold else {
            if quantity == 0 {
                // Nothing is held; at most a stale line to drop.
                if cart.quantity_of(product_ref) != 0 {
                    let cart = self.persist_with(tenant_id, owner_key, |cart, now| {
                        cart.upsert_item(product_ref, 0, 0, "", now)
                    })?;
                    return Ok(self.view_of(cart, None));
                }
                return Ok(self.view_of(cart, None));
            }
            return self.add_item(tenant_id, owner_key, product_ref, quantity, None);
        };

        let updated = self
            .manager
            .update_item(tenant_id, hold.id, product_ref, quantity)?;
        if updated.items.is_empty() {
            self.manager
                .release(tenant_id, updated.id, "cart emptied")?;
        }
        self.sync_view(tenant_id, owner_key, updated.id)
    }

    pub fn remove_item(
        &self,
        tenant_id: TenantId,
        owner_key: &OwnerKey,
        product_ref: ProductRef,
    ) -> DomainResult<CartView> {
        self.update_quantity(tenant_id, owner_key, product_ref, 0)
    }

    /// Validate and attach a coupon code to the cart.
    pub fn apply_coupon(
        &self,
        tenant_id: TenantId,
        owner_key: &OwnerKey,
        code: &str,
    ) -> DomainResult<CartView> {
        let (cart, hold) = self.load_reconciled(tenant_id, owner_key)?;
        let subtotal = CartTotals::compute(&cart, &self.policy).subtotal;
        let applied = self.coupons.validate(tenant_id, code, subtotal, Utc::now())?;

        let cart = self.persist_with(tenant_id, owner_key, |cart, now| {
            cart.set_coupon(applied.clone(), now);
            Ok(())
        })?;
        Ok(self.view_of(cart, hold.as_ref()))
    }

    pub fn clear_coupon(&self, tenant_id: TenantId, owner_key: &OwnerKey) -> DomainResult<CartView> {
        let (cart, hold) = self.load_reconciled(tenant_id, owner_key)?;
        if cart.coupon.is_none() {
            return Ok(self.view_of(cart, hold.as_ref()));
        }
        let cart = self.persist_with(tenant_id, owner_key, |cart, now| {
            cart.clear_coupon(now);
            Ok(())
        })?;
        Ok(self.view_of(cart, hold.as_ref()))
    }

    /// Fold a guest cart into the signed-in shopper's cart at login.
    ///
    /// Overlapping lines sum. The guest hold is released up front so its
    /// stock is back in the pool before the user's hold grows; lines the
    /// pool cannot cover are capped, lines whose product is gone are
    /// dropped, and each shortfall is reported as a warning rather than
    /// failing the merge. The guest cart row is removed at the end.
    pub fn merge_guest_cart(
        &self,
        tenant_id: TenantId,
        guest_owner: &OwnerKey,
        user_owner: &OwnerKey,
    ) -> DomainResult<MergeOutcome> {
        if guest_owner == user_owner {
            return Err(DomainError::validation("cannot merge a cart into itself"));
        }
        let Some(guest_cart) = self.carts.get(tenant_id, guest_owner)? else {
            return Ok(MergeOutcome {
                view: self.cart(tenant_id, user_owner)?,
                warnings: Vec::new(),
            });
        };

        if let Some(reservation_id) = guest_cart.reservation_id {
            match self
                .manager
                .release(tenant_id, reservation_id, "cart merged")
            {
                Ok(_) | Err(DomainError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }

        self.ensure_cart(tenant_id, user_owner)?;
        let (user_cart, user_hold) = self.load_reconciled(tenant_id, user_owner)?;
        let plan = plan_merge(&user_cart, &guest_cart);

        let mut warnings = Vec::new();
        let mut last_reservation = user_hold.map(|row| row.id);

        for line in plan {
            let mut want = line.guest_quantity;
            let mut granted = None;
            let mut dropped = false;

            for _attempt in 1..=WRITE_ATTEMPTS {
                if want <= 0 {
                    break;
                }
                let request =
                    ReserveRequest::new(user_owner.clone(), user_cart.id, line.product_ref, want);
                match self.manager.reserve(tenant_id, request) {
                    Ok(row) => {
                        last_reservation = Some(row.id);
                        granted = Some(row.quantity_of(line.product_ref));
                        break;
                    }
                    Err(DomainError::InsufficientStock { available, .. }) => {
                        want = want.min(available.max(0));
                    }
                    Err(err) if err.is_integrity() || matches!(err, DomainError::Storage(_)) => {
                        return Err(err);
                    }
                    Err(err) => {
                        warnings.push(MergeWarning::LineDropped {
                            product_ref: line.product_ref,
                            detail: err.to_string(),
                        });
                        dropped = true;
                        break;
                    }
                }
            }
            if dropped {
                continue;
            }
            match granted {
                Some(_) if want == line.guest_quantity => {}
                Some(granted) => warnings.push(MergeWarning::QuantityCapped {
                    product_ref: line.product_ref,
                    requested: line.target_quantity,
                    granted,
                }),
                None => warnings.push(MergeWarning::QuantityCapped {
                    product_ref: line.product_ref,
                    requested: line.target_quantity,
                    granted: line.user_quantity,
                }),
            }
        }

        let synced = match last_reservation {
            Some(reservation_id) => self.persist_with(tenant_id, user_owner, |cart, now| {
                self.mirror_current_hold(tenant_id, cart, reservation_id, now)
            })?,
            None => user_cart,
        };

        let final_cart = match (&synced.coupon, guest_cart.coupon.clone()) {
            (None, Some(guest_coupon)) => {
                let subtotal = CartTotals::compute(&synced, &self.policy).subtotal;
                match self
                    .coupons
                    .validate(tenant_id, &guest_coupon.code, subtotal, Utc::now())
                {
                    Ok(applied) => self.persist_with(tenant_id, user_owner, |cart, now| {
                        cart.set_coupon(applied.clone(), now);
                        Ok(())
                    })?,
                    Err(DomainError::CouponInvalid(detail)) => {
                        warnings.push(MergeWarning::CouponDropped {
                            code: guest_coupon.code,
                            detail,
                        });
                        synced
                    }
                    Err(err) => return Err(err),
                }
            }
            (Some(own), Some(guest_coupon)) if own.code != guest_coupon.code => {
                warnings.push(MergeWarning::CouponDropped {
                    code: guest_coupon.code,
                    detail: "a coupon is already applied".to_string(),
                });
                synced
            }
            _ => synced,
        };

        self.carts.remove(tenant_id, guest_owner)?;

        let hold = self.active_hold(tenant_id, &final_cart)?;
        info!(
            guest = %guest_owner,
            user = %user_owner,
            warnings = warnings.len(),
            "guest cart merged"
        );
        Ok(MergeOutcome {
            view: self.view_of(final_cart, hold.as_ref()),
            warnings,
        })
    }

    /// Check the cart out: convert its hold into the given order, count the
    /// coupon redemption, and reset the cart. Replaying the same order
    /// returns the settled state again without side effects.
    pub fn convert_to_order(
        &self,
        tenant_id: TenantId,
        owner_key: &OwnerKey,
        reservation_id: ReservationId,
        order_id: OrderId,
    ) -> DomainResult<CheckoutOutcome> {
        let cart = self.carts.get(tenant_id, owner_key)?;
        if let Some(linked) = cart.as_ref().and_then(|cart| cart.reservation_id) {
            if linked != reservation_id {
                return Err(DomainError::validation(
                    "reservation does not back this cart",
                ));
            }
        }

        let outcome = self.manager.convert(tenant_id, reservation_id, order_id)?;

        // Price from the cart while it still mirrors the hold; a replay after
        // the reset prices from the settled reservation instead (without the
        // coupon, which was consumed by the first conversion).
        let totals = match &cart {
            Some(cart) if cart.reservation_id == Some(reservation_id) && !cart.is_empty() => {
                CartTotals::compute(cart, &self.policy)
            }
            _ => self.reservation_totals(tenant_id, owner_key, &outcome.reservation)?,
        };

        if outcome.newly_converted {
            if let Some(coupon) = cart.as_ref().and_then(|cart| cart.coupon.as_ref()) {
                if let Err(err) = self.coupons.record_usage(tenant_id, &coupon.code) {
                    warn!(code = %coupon.code, error = %err, "coupon usage was not recorded");
                }
            }
            if cart.is_some() {
                if let Err(err) = self.persist_with(tenant_id, owner_key, |cart, now| {
                    cart.clear_after_order(now);
                    Ok(())
                }) {
                    // The next cart read clears the settled link.
                    warn!(owner = %owner_key, error = %err, "cart reset after checkout deferred");
                }
            }
            info!(
                order = %order_id,
                reservation = %reservation_id,
                total = totals.grand_total,
                "cart converted to order"
            );
        }

        Ok(CheckoutOutcome {
            order_id,
            reservation: outcome.reservation,
            entries: outcome.entries,
            totals,
            newly_converted: outcome.newly_converted,
        })
    }

    fn view_of(&self, cart: Cart, hold: Option<&Reservation>) -> CartView {
        let totals = CartTotals::compute(&cart, &self.policy);
        CartView {
            totals,
            hold_expires_at: hold.map(|row| row.expires_at),
            cart,
        }
    }

    /// Load the owner's cart and bring it in step with its hold. Never
    /// creates a store row; a missing cart comes back as an unsaved empty one.
    fn load_reconciled(
        &self,
        tenant_id: TenantId,
        owner_key: &OwnerKey,
    ) -> DomainResult<(Cart, Option<Reservation>)> {
        let now = Utc::now();
        let Some(cart) = self.carts.get(tenant_id, owner_key)? else {
            return Ok((Cart::open(tenant_id, owner_key.clone(), now), None));
        };
        let Some(reservation_id) = cart.reservation_id else {
            return Ok((cart, None));
        };

        match self.manager.reservation(tenant_id, reservation_id)? {
            Some(row) if row.is_active(now) => {
                if cart_mirrors(&cart, &row) {
                    return Ok((cart, Some(row)));
                }
                let healed = self.persist_with(tenant_id, owner_key, |cart, now| {
                    self.mirror_hold(tenant_id, cart, &row, now)
                })?;
                Ok((healed, Some(row)))
            }
            Some(row) if row.status == ReservationStatus::Committed => {
                let healed = self.persist_with(tenant_id, owner_key, |cart, now| {
                    cart.clear_after_order(now);
                    Ok(())
                })?;
                Ok((healed, None))
            }
            _ => {
                let healed = self.persist_with(tenant_id, owner_key, |cart, now| {
                    cart.clear_lapsed_hold(now);
                    Ok(())
                })?;
                Ok((healed, None))
            }
        }
    }

    /// Load the owner's cart, creating the store row on first touch.
    fn ensure_cart(&self, tenant_id: TenantId, owner_key: &OwnerKey) -> DomainResult<Cart> {
        if let Some(cart) = self.carts.get(tenant_id, owner_key)? {
            return Ok(cart);
        }
        let cart = Cart::open(tenant_id, owner_key.clone(), Utc::now());
        match self.carts.upsert(cart.clone(), ExpectedVersion::Exact(0)) {
            Ok(()) => Ok(cart),
            // Lost the creation race; take the winner's row.
            Err(err) if err.is_retriable() => self
                .carts
                .get(tenant_id, owner_key)?
                .ok_or_else(|| DomainError::storage("cart vanished after a creation race")),
            Err(err) => Err(err),
        }
    }

    /// Re-read the hold and persist a cart that mirrors it, then build the
    /// view. Runs after every reservation write.
    fn sync_view(
        &self,
        tenant_id: TenantId,
        owner_key: &OwnerKey,
        reservation_id: ReservationId,
    ) -> DomainResult<CartView> {
        let cart = self.persist_with(tenant_id, owner_key, |cart, now| {
            self.mirror_current_hold(tenant_id, cart, reservation_id, now)
        })?;
        let hold = self.active_hold(tenant_id, &cart)?;
        Ok(self.view_of(cart, hold.as_ref()))
    }

    /// Mirror whatever state the hold is in right now. The hold is re-read
    /// inside the write loop so a concurrent change lands in full rather
    /// than as a stale snapshot.
    fn mirror_current_hold(
        &self,
        tenant_id: TenantId,
        cart: &mut Cart,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        match self.manager.reservation(tenant_id, reservation_id)? {
            Some(row) if row.is_active(now) => self.mirror_hold(tenant_id, cart, &row, now),
            Some(row) if row.status == ReservationStatus::Committed => {
                cart.clear_after_order(now);
                Ok(())
            }
            _ => {
                cart.clear_lapsed_hold(now);
                Ok(())
            }
        }
    }

    fn mirror_hold(
        &self,
        tenant_id: TenantId,
        cart: &mut Cart,
        row: &Reservation,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        let stale: Vec<ProductRef> = cart
            .items
            .iter()
            .map(|item| item.product_ref)
            .filter(|product_ref| row.quantity_of(*product_ref) == 0)
            .collect();
        for product_ref in stale {
            cart.upsert_item(product_ref, 0, 0, "", now)?;
        }
        for item in &row.items {
            let name = match cart
                .items
                .iter()
                .find(|line| line.product_ref == item.product_ref)
            {
                Some(line) => line.name.clone(),
                None => self.catalog.product(tenant_id, item.product_ref)?.name,
            };
            cart.upsert_item(item.product_ref, item.quantity, item.unit_price, name, now)?;
        }
        cart.link_reservation(row.id, now);
        Ok(())
    }

    fn active_hold(
        &self,
        tenant_id: TenantId,
        cart: &Cart,
    ) -> DomainResult<Option<Reservation>> {
        let Some(reservation_id) = cart.reservation_id else {
            return Ok(None);
        };
        let now = Utc::now();
        Ok(self
            .manager
            .reservation(tenant_id, reservation_id)?
            .filter(|row| row.is_active(now)))
    }

    fn reservation_totals(
        &self,
        tenant_id: TenantId,
        owner_key: &OwnerKey,
        row: &Reservation,
    ) -> DomainResult<CartTotals> {
        let now = Utc::now();
        let mut pricing = Cart::open(tenant_id, owner_key.clone(), now);
        for item in &row.items {
            pricing.upsert_item(item.product_ref, item.quantity, item.unit_price, "", now)?;
        }
        Ok(CartTotals::compute(&pricing, &self.policy))
    }

    /// Optimistic cart write: load fresh, apply, store at the loaded version,
    /// retry the whole cycle on contention.
    fn persist_with<F>(
        &self,
        tenant_id: TenantId,
        owner_key: &OwnerKey,
        mut apply: F,
    ) -> DomainResult<Cart>
    where
        F: FnMut(&mut Cart, DateTime<Utc>) -> DomainResult<()>,
    {
        for _attempt in 1..=WRITE_ATTEMPTS {
            let now = Utc::now();
            let (mut cart, expected) = match self.carts.get(tenant_id, owner_key)? {
                Some(cart) => {
                    let version = cart.version;
                    (cart, ExpectedVersion::Exact(version))
                }
                None => (
                    Cart::open(tenant_id, owner_key.clone(), now),
                    ExpectedVersion::Exact(0),
                ),
            };
            apply(&mut cart, now)?;
            match self.carts.upsert(cart.clone(), expected) {
                Ok(()) => return Ok(cart),
                Err(err) if err.is_retriable() => continue,
                Err(err) => return Err(err),
            }
        }
        Err(DomainError::conflict(
            "cart kept changing underneath the write",
        ))
    }
}

fn cart_mirrors(cart: &Cart, row: &Reservation) -> bool {
    cart.items.len() == row.items.len()
        && row.items.iter().all(|item| {
            cart.items.iter().any(|line| {
                line.product_ref == item.product_ref
                    && line.quantity == item.quantity
                    && line.unit_price == item.unit_price
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    use stocklock_carts::CouponKind;
    use stocklock_core::{ProductId, ShopperId};

    use crate::catalog::{InMemoryCatalog, ProductSnapshot};
    use crate::coupons::{CouponRule, InMemoryCouponDirectory};
    use crate::cart_store::InMemoryCartStore;
    use crate::ledger_store::InMemoryLedgerStore;
    use crate::manager::ManagerConfig;
    use crate::reservation_store::InMemoryReservationStore;

    type TestAggregator = CartAggregator<
        Arc<InMemoryLedgerStore>,
        Arc<InMemoryReservationStore>,
        Arc<InMemoryCatalog>,
        Arc<InMemoryCartStore>,
        Arc<InMemoryCouponDirectory>,
    >;

    struct Setup {
        tenant_id: TenantId,
        product: ProductRef,
        service: TestAggregator,
        manager: Arc<
            ReservationManager<
                Arc<InMemoryLedgerStore>,
                Arc<InMemoryReservationStore>,
                Arc<InMemoryCatalog>,
            >,
        >,
        reservations: Arc<InMemoryReservationStore>,
        catalog: Arc<InMemoryCatalog>,
        coupons: Arc<InMemoryCouponDirectory>,
    }

    fn setup(initial_stock: i64) -> Setup {
        let tenant_id = TenantId::new();
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let reservations = Arc::new(InMemoryReservationStore::new());
        let catalog = Arc::new(InMemoryCatalog::new());
        let coupons = Arc::new(InMemoryCouponDirectory::new());
        let manager = Arc::new(ReservationManager::new(
            ledger,
            reservations.clone(),
            catalog.clone(),
            ManagerConfig::default(),
        ));
        let service = CartAggregator::new(
            manager.clone(),
            Arc::new(InMemoryCartStore::new()),
            catalog.clone(),
            coupons.clone(),
            PricingPolicy {
                tax_rate_bps: 0,
                delivery_fee: 0,
                free_delivery_threshold: None,
                currency: "USD".to_string(),
            },
        );

        let product = ProductRef::product(ProductId::new());
        catalog
            .upsert(
                tenant_id,
                ProductSnapshot {
                    product_ref: product,
                    name: "Enamel Mug".to_string(),
                    unit_price: 1_000,
                    currency: "USD".to_string(),
                    sellable: true,
                },
            )
            .unwrap();
        if initial_stock > 0 {
            manager
                .receive_stock(tenant_id, product, initial_stock, None)
                .unwrap();
        }

        Setup {
            tenant_id,
            product,
            service,
            manager,
            reservations,
            catalog,
            coupons,
        }
    }

    fn force_lapse(setup: &Setup, reservation_id: ReservationId) {
        let mut row = setup
            .reservations
            .get(setup.tenant_id, reservation_id)
            .unwrap()
            .unwrap();
        let stored_version = row.version;
        row.expires_at = Utc::now() - Duration::seconds(1);
        row.updated_at = Utc::now();
        row.version += 1;
        setup
            .reservations
            .update(row, ExpectedVersion::Exact(stored_version))
            .unwrap();
    }

    fn coupon_rule(code: &str, kind: CouponKind, min_subtotal: u64) -> CouponRule {
        CouponRule {
            code: code.to_string(),
            kind,
            starts_at: Some(Utc::now() - Duration::hours(1)),
            ends_at: Some(Utc::now() + Duration::hours(1)),
            min_subtotal,
            usage_limit: Some(10),
        }
    }

    #[test]
    fn adding_an_item_holds_stock_and_mirrors_the_cart() {
        let s = setup(10);
        let owner = OwnerKey::shopper(ShopperId::new());

        let view = s
            .service
            .add_item(s.tenant_id, &owner, s.product, 2, None)
            .unwrap();
        assert_eq!(view.cart.quantity_of(s.product), 2);
        assert_eq!(view.cart.items[0].name, "Enamel Mug");
        assert_eq!(view.totals.subtotal, 2_000);
        assert!(view.hold_expires_at.is_some());
        assert!(view.cart.reservation_id.is_some());

        assert_eq!(
            s.manager
                .availability(s.tenant_id, s.product)
                .unwrap()
                .available,
            8
        );
    }

    #[test]
    fn repeated_adds_accumulate_on_one_hold() {
        let s = setup(10);
        let owner = OwnerKey::shopper(ShopperId::new());

        let first = s
            .service
            .add_item(s.tenant_id, &owner, s.product, 1, None)
            .unwrap();
        let second = s
            .service
            .add_item(s.tenant_id, &owner, s.product, 2, None)
            .unwrap();

        assert_eq!(second.cart.quantity_of(s.product), 3);
        assert_eq!(first.cart.reservation_id, second.cart.reservation_id);
        assert_eq!(
            s.manager
                .availability(s.tenant_id, s.product)
                .unwrap()
                .active_reserved,
            3
        );
    }

    #[test]
    fn update_is_absolute_and_emptying_releases_the_hold() {
        let s = setup(10);
        let owner = OwnerKey::shopper(ShopperId::new());
        s.service
            .add_item(s.tenant_id, &owner, s.product, 3, None)
            .unwrap();

        let view = s
            .service
            .update_quantity(s.tenant_id, &owner, s.product, 1)
            .unwrap();
        assert_eq!(view.cart.quantity_of(s.product), 1);
        assert_eq!(
            s.manager
                .availability(s.tenant_id, s.product)
                .unwrap()
                .available,
            9
        );
        let reservation_id = view.cart.reservation_id.unwrap();

        let emptied = s
            .service
            .remove_item(s.tenant_id, &owner, s.product)
            .unwrap();
        assert!(emptied.cart.is_empty());
        assert!(emptied.cart.reservation_id.is_none());
        assert!(emptied.hold_expires_at.is_none());

        let row = s
            .manager
            .reservation(s.tenant_id, reservation_id)
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ReservationStatus::Released);
        assert_eq!(row.closed_reason.as_deref(), Some("cart emptied"));
        assert_eq!(
            s.manager
                .availability(s.tenant_id, s.product)
                .unwrap()
                .available,
            10
        );
    }

    #[test]
    fn a_lapsed_hold_empties_the_cart_on_the_next_read() {
        let s = setup(10);
        let owner = OwnerKey::shopper(ShopperId::new());
        let view = s
            .service
            .add_item(s.tenant_id, &owner, s.product, 4, None)
            .unwrap();
        force_lapse(&s, view.cart.reservation_id.unwrap());

        let reread = s.service.cart(s.tenant_id, &owner).unwrap();
        assert!(reread.cart.is_empty());
        assert!(reread.cart.reservation_id.is_none());
        assert_eq!(reread.totals.grand_total, 0);
        assert_eq!(
            s.manager
                .availability(s.tenant_id, s.product)
                .unwrap()
                .available,
            10
        );
    }

    #[test]
    fn coupons_validate_against_the_current_subtotal() {
        let s = setup(10);
        let owner = OwnerKey::shopper(ShopperId::new());
        s.coupons
            .upsert(
                s.tenant_id,
                coupon_rule("save10", CouponKind::PercentOff { basis_points: 1_000 }, 2_000),
            )
            .unwrap();

        s.service
            .add_item(s.tenant_id, &owner, s.product, 1, None)
            .unwrap();
        assert!(matches!(
            s.service.apply_coupon(s.tenant_id, &owner, "save10"),
            Err(DomainError::CouponInvalid(_))
        ));

        s.service
            .add_item(s.tenant_id, &owner, s.product, 1, None)
            .unwrap();
        let view = s
            .service
            .apply_coupon(s.tenant_id, &owner, " save10 ")
            .unwrap();
        assert_eq!(view.cart.coupon.as_ref().unwrap().code, "SAVE10");
        assert_eq!(view.totals.discount, 200);
        assert_eq!(view.totals.grand_total, 1_800);

        let cleared = s.service.clear_coupon(s.tenant_id, &owner).unwrap();
        assert!(cleared.cart.coupon.is_none());
        assert_eq!(cleared.totals.grand_total, 2_000);
    }

    #[test]
    fn merging_sums_guest_and_user_quantities() {
        let s = setup(10);
        let guest = OwnerKey::session("guest-fingerprint").unwrap();
        let user = OwnerKey::shopper(ShopperId::new());

        let guest_view = s
            .service
            .add_item(s.tenant_id, &guest, s.product, 2, None)
            .unwrap();
        s.service
            .add_item(s.tenant_id, &user, s.product, 1, None)
            .unwrap();

        let outcome = s
            .service
            .merge_guest_cart(s.tenant_id, &guest, &user)
            .unwrap();
        assert!(outcome.warnings.is_empty());
        assert_eq!(outcome.view.cart.quantity_of(s.product), 3);
        assert_eq!(outcome.view.totals.subtotal, 3_000);

        // The guest hold is gone and its cart row with it.
        let guest_row = s
            .manager
            .reservation(s.tenant_id, guest_view.cart.reservation_id.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(guest_row.status, ReservationStatus::Released);
        assert_eq!(guest_row.closed_reason.as_deref(), Some("cart merged"));
        let guest_after = s.service.cart(s.tenant_id, &guest).unwrap();
        assert!(guest_after.cart.is_empty());

        // Only the merged hold counts against stock.
        assert_eq!(
            s.manager
                .availability(s.tenant_id, s.product)
                .unwrap()
                .active_reserved,
            3
        );
    }

    #[test]
    fn merging_caps_lines_the_pool_cannot_cover() {
        let s = setup(3);
        let guest = OwnerKey::session("guest-fingerprint").unwrap();
        let user = OwnerKey::shopper(ShopperId::new());

        s.service
            .add_item(s.tenant_id, &guest, s.product, 2, None)
            .unwrap();
        s.service
            .add_item(s.tenant_id, &user, s.product, 1, None)
            .unwrap();
        // Shrink the pool so the merged quantity no longer fits.
        s.manager
            .adjust_stock(s.tenant_id, s.product, -2, "cycle count".to_string())
            .unwrap();

        let outcome = s
            .service
            .merge_guest_cart(s.tenant_id, &guest, &user)
            .unwrap();
        assert_eq!(outcome.view.cart.quantity_of(s.product), 1);
        assert_eq!(outcome.warnings.len(), 1);
        match &outcome.warnings[0] {
            MergeWarning::QuantityCapped {
                requested, granted, ..
            } => {
                assert_eq!(*requested, 3);
                assert_eq!(*granted, 1);
            }
            other => panic!("expected a capped line, got {other:?}"),
        }
    }

    #[test]
    fn merging_drops_lines_whose_product_is_gone() {
        let s = setup(10);
        let guest = OwnerKey::session("guest-fingerprint").unwrap();
        let user = OwnerKey::shopper(ShopperId::new());

        s.service
            .add_item(s.tenant_id, &guest, s.product, 2, None)
            .unwrap();
        // The product stops being sellable between the guest's add and login.
        s.catalog
            .upsert(
                s.tenant_id,
                ProductSnapshot {
                    product_ref: s.product,
                    name: "Enamel Mug".to_string(),
                    unit_price: 1_000,
                    currency: "USD".to_string(),
                    sellable: false,
                },
            )
            .unwrap();

        let outcome = s
            .service
            .merge_guest_cart(s.tenant_id, &guest, &user)
            .unwrap();
        assert!(outcome.view.cart.is_empty());
        assert!(matches!(
            outcome.warnings[0],
            MergeWarning::LineDropped { .. }
        ));
    }

    #[test]
    fn merging_carries_the_guest_coupon_when_the_user_has_none() {
        let s = setup(10);
        let guest = OwnerKey::session("guest-fingerprint").unwrap();
        let user = OwnerKey::shopper(ShopperId::new());
        s.coupons
            .upsert(
                s.tenant_id,
                coupon_rule("welcome", CouponKind::AmountOff { amount: 500 }, 0),
            )
            .unwrap();

        s.service
            .add_item(s.tenant_id, &guest, s.product, 2, None)
            .unwrap();
        s.service
            .apply_coupon(s.tenant_id, &guest, "welcome")
            .unwrap();

        let outcome = s
            .service
            .merge_guest_cart(s.tenant_id, &guest, &user)
            .unwrap();
        assert!(outcome.warnings.is_empty());
        assert_eq!(outcome.view.cart.coupon.as_ref().unwrap().code, "WELCOME");
        assert_eq!(outcome.view.totals.discount, 500);
    }

    #[test]
    fn merging_into_an_absent_guest_cart_is_a_no_op() {
        let s = setup(10);
        let guest = OwnerKey::session("guest-fingerprint").unwrap();
        let user = OwnerKey::shopper(ShopperId::new());
        s.service
            .add_item(s.tenant_id, &user, s.product, 1, None)
            .unwrap();

        let outcome = s
            .service
            .merge_guest_cart(s.tenant_id, &guest, &user)
            .unwrap();
        assert!(outcome.warnings.is_empty());
        assert_eq!(outcome.view.cart.quantity_of(s.product), 1);

        assert!(matches!(
            s.service.merge_guest_cart(s.tenant_id, &user, &user),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn checkout_settles_counts_the_coupon_and_resets_the_cart() {
        let s = setup(10);
        let owner = OwnerKey::shopper(ShopperId::new());
        s.coupons
            .upsert(
                s.tenant_id,
                coupon_rule("save10", CouponKind::PercentOff { basis_points: 1_000 }, 0),
            )
            .unwrap();

        let view = s
            .service
            .add_item(s.tenant_id, &owner, s.product, 2, None)
            .unwrap();
        s.service
            .apply_coupon(s.tenant_id, &owner, "save10")
            .unwrap();
        let reservation_id = view.cart.reservation_id.unwrap();
        let order_id = OrderId::new();

        let outcome = s
            .service
            .convert_to_order(s.tenant_id, &owner, reservation_id, order_id)
            .unwrap();
        assert!(outcome.newly_converted);
        assert_eq!(outcome.totals.subtotal, 2_000);
        assert_eq!(outcome.totals.discount, 200);
        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(
            s.coupons.usage_count(s.tenant_id, "save10").unwrap(),
            1
        );

        let after = s.service.cart(s.tenant_id, &owner).unwrap();
        assert!(after.cart.is_empty());
        assert!(after.cart.coupon.is_none());
        assert_eq!(
            s.manager
                .availability(s.tenant_id, s.product)
                .unwrap()
                .balance,
            8
        );

        // Replaying the same order neither recounts nor resettles.
        let replay = s
            .service
            .convert_to_order(s.tenant_id, &owner, reservation_id, order_id)
            .unwrap();
        assert!(!replay.newly_converted);
        assert_eq!(replay.totals.subtotal, 2_000);
        assert_eq!(
            s.coupons.usage_count(s.tenant_id, "save10").unwrap(),
            1
        );
        assert_eq!(
            s.manager
                .availability(s.tenant_id, s.product)
                .unwrap()
                .balance,
            8
        );
    }
}
