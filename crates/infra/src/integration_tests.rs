//! Integration tests for the full reservation pipeline.
//!
//! Tests: cart -> reservation manager -> ledger chain -> sweeper
//!
//! Verifies:
//! - Holds, conversions, and releases land as a verifiable ledger chain
//! - Racing shoppers never oversell, with or without contention
//! - Lapsed holds return their stock through the sweeper
//! - A conversion that cannot settle rolls back cleanly

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;
    use std::time::Duration as StdDuration;

    use chrono::{DateTime, Duration, Utc};

    use stocklock_carts::{CouponKind, PricingPolicy};
    use stocklock_core::{
        CartId, DomainError, DomainResult, ExpectedVersion, OrderId, OwnerKey, ProductId,
        ProductRef, ReservationId, ShopperId, TenantId,
    };
    use stocklock_ledger::LedgerAction;
    use stocklock_reservations::{Reservation, ReservationStatus};

    use crate::cart_service::CartAggregator;
    use crate::cart_store::InMemoryCartStore;
    use crate::catalog::{InMemoryCatalog, ProductSnapshot};
    use crate::coupons::{CouponRule, InMemoryCouponDirectory};
    use crate::ledger_store::InMemoryLedgerStore;
    use crate::manager::{ManagerConfig, ReservationManager, ReserveRequest};
    use crate::reservation_store::{InMemoryReservationStore, ReservationStore};
    use crate::sweeper::ExpirySweeper;

    type Manager = ReservationManager<
        Arc<InMemoryLedgerStore>,
        Arc<InMemoryReservationStore>,
        Arc<InMemoryCatalog>,
    >;

    type Aggregator = CartAggregator<
        Arc<InMemoryLedgerStore>,
        Arc<InMemoryReservationStore>,
        Arc<InMemoryCatalog>,
        Arc<InMemoryCartStore>,
        Arc<InMemoryCouponDirectory>,
    >;

    struct Harness {
        tenant_id: TenantId,
        product: ProductRef,
        manager: Arc<Manager>,
        service: Aggregator,
        reservations: Arc<InMemoryReservationStore>,
        catalog: Arc<InMemoryCatalog>,
        coupons: Arc<InMemoryCouponDirectory>,
        sweeper: ExpirySweeper<
            Arc<InMemoryLedgerStore>,
            Arc<InMemoryReservationStore>,
            Arc<InMemoryCatalog>,
        >,
    }

    fn harness(initial_stock: i64, config: ManagerConfig) -> Harness {
        let tenant_id = TenantId::new();
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let reservations = Arc::new(InMemoryReservationStore::new());
        let catalog = Arc::new(InMemoryCatalog::new());
        let coupons = Arc::new(InMemoryCouponDirectory::new());
        let manager = Arc::new(ReservationManager::new(
            ledger,
            reservations.clone(),
            catalog.clone(),
            config,
        ));
        let service = CartAggregator::new(
            manager.clone(),
            Arc::new(InMemoryCartStore::new()),
            catalog.clone(),
            coupons.clone(),
            PricingPolicy::default(),
        );
        let sweeper = ExpirySweeper::new(manager.clone(), reservations.clone());

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

        Harness {
            tenant_id,
            product,
            manager,
            service,
            reservations,
            catalog,
            coupons,
            sweeper,
        }
    }

    fn shopper() -> OwnerKey {
        OwnerKey::shopper(ShopperId::new())
    }

    #[test]
    fn checkout_journey_settles_the_ledger_end_to_end() {
        let h = harness(10, ManagerConfig::default());
        let owner = shopper();

        let view = h
            .service
            .add_item(h.tenant_id, &owner, h.product, 2, None)
            .unwrap();
        let reservation_id = view.cart.reservation_id.unwrap();
        let order_id = OrderId::new();

        let outcome = h
            .service
            .convert_to_order(h.tenant_id, &owner, reservation_id, order_id)
            .unwrap();
        assert!(outcome.newly_converted);
        assert_eq!(outcome.reservation.order_id, Some(order_id));

        // The chain carries the whole story and still verifies.
        let entries = h.manager.audit_chain(h.tenant_id, h.product).unwrap();
        let actions: Vec<LedgerAction> = entries.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![LedgerAction::In, LedgerAction::Reserve, LedgerAction::Commit]
        );
        assert_eq!(entries.last().unwrap().resulting_quantity, 8);

        let availability = h.manager.availability(h.tenant_id, h.product).unwrap();
        assert_eq!(availability.balance, 8);
        assert_eq!(availability.active_reserved, 0);
        assert_eq!(availability.available, 8);
    }

    #[test]
    fn two_shoppers_race_for_the_last_unit() {
        let h = harness(1, ManagerConfig::default());
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let manager = h.manager.clone();
                let barrier = barrier.clone();
                let tenant_id = h.tenant_id;
                let product = h.product;
                thread::spawn(move || {
                    let request =
                        ReserveRequest::new(shopper(), CartId::new(), product, 1);
                    barrier.wait();
                    manager.reserve(tenant_id, request)
                })
            })
            .collect();

        let results: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        let winners: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
        assert_eq!(winners.len(), 1);
        for result in &results {
            if let Err(err) = result {
                assert!(
                    matches!(err, DomainError::InsufficientStock { .. }),
                    "loser got {err:?}"
                );
            }
        }

        // The winner converts and the shelf is empty.
        let row = results
            .into_iter()
            .find_map(|result| result.ok())
            .unwrap();
        h.manager
            .convert(h.tenant_id, row.id, OrderId::new())
            .unwrap();
        let availability = h.manager.availability(h.tenant_id, h.product).unwrap();
        assert_eq!(availability.balance, 0);
        assert_eq!(availability.available, 0);
        h.manager.audit_chain(h.tenant_id, h.product).unwrap();
    }

    /// Store that runs a queued action just before delegating the first row
    /// insert, so a rival request can be wedged into the middle of an
    /// in-flight reserve instead of hoping a barrier lines the threads up.
    struct FirstInsertHook {
        inner: InMemoryReservationStore,
        hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl FirstInsertHook {
        fn new() -> Self {
            Self {
                inner: InMemoryReservationStore::new(),
                hook: Mutex::new(None),
            }
        }

        fn arm(&self, hook: impl FnOnce() + Send + 'static) {
            *self.hook.lock().unwrap() = Some(Box::new(hook));
        }
    }

    impl ReservationStore for FirstInsertHook {
        fn insert(&self, reservation: Reservation) -> DomainResult<()> {
            let hook = self.hook.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }
            self.inner.insert(reservation)
        }

        fn update(&self, reservation: Reservation, expected: ExpectedVersion) -> DomainResult<()> {
            self.inner.update(reservation, expected)
        }

        fn get(
            &self,
            tenant_id: TenantId,
            id: ReservationId,
        ) -> DomainResult<Option<Reservation>> {
            self.inner.get(tenant_id, id)
        }

        fn find_active_by_owner(
            &self,
            tenant_id: TenantId,
            owner_key: &OwnerKey,
            now: DateTime<Utc>,
        ) -> DomainResult<Option<Reservation>> {
            self.inner.find_active_by_owner(tenant_id, owner_key, now)
        }

        fn active_reserved_quantity(
            &self,
            tenant_id: TenantId,
            product_ref: ProductRef,
            now: DateTime<Utc>,
        ) -> DomainResult<i64> {
            self.inner.active_reserved_quantity(tenant_id, product_ref, now)
        }

        fn expiring_before(
            &self,
            cutoff: DateTime<Utc>,
            limit: usize,
        ) -> DomainResult<Vec<Reservation>> {
            self.inner.expiring_before(cutoff, limit)
        }
    }

    // A reserve paused between its availability check and its row write must
    // not let a rival double-book the same unit. The rival runs to completion
    // inside the pause; whichever marker appends second loses the chain head
    // and re-checks against the rival's now-visible row.
    #[test]
    fn reserve_paused_mid_write_cannot_oversell_to_a_rival() {
        let tenant_id = TenantId::new();
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let reservations = Arc::new(FirstInsertHook::new());
        let catalog = Arc::new(InMemoryCatalog::new());
        let manager = Arc::new(ReservationManager::new(
            ledger,
            reservations.clone(),
            catalog.clone(),
            ManagerConfig::default(),
        ));

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
        manager.receive_stock(tenant_id, product, 1, None).unwrap();

        let rival_result = Arc::new(Mutex::new(None));
        {
            let manager = manager.clone();
            let rival_result = rival_result.clone();
            reservations.arm(move || {
                let result = manager.reserve(
                    tenant_id,
                    ReserveRequest::new(shopper(), CartId::new(), product, 1),
                );
                *rival_result.lock().unwrap() = Some(result);
            });
        }

        let paused = manager.reserve(
            tenant_id,
            ReserveRequest::new(shopper(), CartId::new(), product, 1),
        );
        let rival = rival_result.lock().unwrap().take().unwrap();

        // Exactly one of the interleaved requests holds the last unit: the
        // rival's row landed and its marker won the head, so the paused
        // request's re-check refuses it.
        assert!(rival.is_ok(), "rival got {rival:?}");
        assert!(
            matches!(paused, Err(DomainError::InsufficientStock { .. })),
            "paused reserve got {paused:?}"
        );

        let availability = manager.availability(tenant_id, product).unwrap();
        assert_eq!(availability.balance, 1);
        assert_eq!(availability.active_reserved, 1);
        assert_eq!(availability.available, 0);
        // One marker on the chain: the retracted attempt never moved the head.
        let actions: Vec<LedgerAction> = manager
            .audit_chain(tenant_id, product)
            .unwrap()
            .iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec![LedgerAction::In, LedgerAction::Reserve]);
    }

    #[test]
    fn eight_shoppers_race_for_three_units() {
        // A loser can lose the chain head once per winner, so give the
        // retry budget room to let every racer reach a definite answer.
        let h = harness(3, ManagerConfig::default().with_max_attempts(8));
        let racers = 8;
        let barrier = Arc::new(Barrier::new(racers));

        let handles: Vec<_> = (0..racers)
            .map(|_| {
                let manager = h.manager.clone();
                let barrier = barrier.clone();
                let tenant_id = h.tenant_id;
                let product = h.product;
                thread::spawn(move || {
                    let request =
                        ReserveRequest::new(shopper(), CartId::new(), product, 1);
                    barrier.wait();
                    manager.reserve(tenant_id, request)
                })
            })
            .collect();

        let results: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        let successes = results.iter().filter(|r| r.is_ok()).count();
        let refusals = results
            .iter()
            .filter(|r| matches!(r, Err(DomainError::InsufficientStock { .. })))
            .count();
        assert_eq!(successes, 3);
        assert_eq!(refusals, racers - 3);

        let availability = h.manager.availability(h.tenant_id, h.product).unwrap();
        assert_eq!(availability.active_reserved, 3);
        assert_eq!(availability.available, 0);
        h.manager.audit_chain(h.tenant_id, h.product).unwrap();
    }

    #[test]
    fn concurrent_adds_for_one_shopper_share_a_hold() {
        let h = harness(10, ManagerConfig::default());
        let owner = shopper();
        let poster = ProductRef::product(ProductId::new());
        h.catalog
            .upsert(
                h.tenant_id,
                ProductSnapshot {
                    product_ref: poster,
                    name: "Poster".to_string(),
                    unit_price: 500,
                    currency: "USD".to_string(),
                    sellable: true,
                },
            )
            .unwrap();
        h.manager
            .receive_stock(h.tenant_id, poster, 10, None)
            .unwrap();

        // Two tabs add different products at the same instant. Whichever
        // row insert loses must land its line on the winner's row.
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [(h.product, 1), (poster, 2)]
            .into_iter()
            .map(|(product, quantity)| {
                let manager = h.manager.clone();
                let barrier = barrier.clone();
                let tenant_id = h.tenant_id;
                let owner = owner.clone();
                thread::spawn(move || {
                    let request = ReserveRequest::new(owner, CartId::new(), product, quantity);
                    barrier.wait();
                    manager.reserve(tenant_id, request)
                })
            })
            .collect();

        let results: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap().unwrap())
            .collect();
        assert_eq!(results[0].id, results[1].id);

        let row = h
            .reservations
            .find_active_by_owner(h.tenant_id, &owner, chrono::Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(row.items.len(), 2);
        assert_eq!(row.quantity_of(h.product), 1);
        assert_eq!(row.quantity_of(poster), 2);
        assert_eq!(
            h.manager
                .availability(h.tenant_id, h.product)
                .unwrap()
                .active_reserved,
            1
        );
        assert_eq!(
            h.manager
                .availability(h.tenant_id, poster)
                .unwrap()
                .active_reserved,
            2
        );
    }

    #[test]
    fn holds_lapse_and_the_sweeper_returns_stock() {
        let h = harness(5, ManagerConfig::default());
        let owner = shopper();

        let row = h
            .manager
            .reserve(
                h.tenant_id,
                ReserveRequest::new(owner.clone(), CartId::new(), h.product, 3)
                    .with_window(Duration::milliseconds(40)),
            )
            .unwrap();
        thread::sleep(StdDuration::from_millis(80));

        // The lapsed hold no longer counts, even before the sweep runs.
        let availability = h.manager.availability(h.tenant_id, h.product).unwrap();
        assert_eq!(availability.active_reserved, 0);
        assert_eq!(availability.available, 5);

        // Converting a lapsed hold is refused.
        assert!(matches!(
            h.manager.convert(h.tenant_id, row.id, OrderId::new()),
            Err(DomainError::ReservationExpired { .. })
        ));

        let report = h.sweeper.sweep_once(100).unwrap();
        assert_eq!(report.expired, 1);
        let swept = h
            .manager
            .reservation(h.tenant_id, row.id)
            .unwrap()
            .unwrap();
        assert_eq!(swept.status, ReservationStatus::Expired);
        assert_eq!(swept.closed_reason.as_deref(), Some("expired"));

        let marker = h
            .manager
            .audit_chain(h.tenant_id, h.product)
            .unwrap()
            .into_iter()
            .last()
            .unwrap();
        assert_eq!(marker.action, LedgerAction::Release);
        assert_eq!(marker.reason.as_deref(), Some("expired"));

        // Idempotent: a second pass finds nothing.
        assert_eq!(h.sweeper.sweep_once(100).unwrap().examined, 0);

        // The shopper can hold the stock again.
        let again = h
            .manager
            .reserve(
                h.tenant_id,
                ReserveRequest::new(owner, CartId::new(), h.product, 3),
            )
            .unwrap();
        assert_ne!(again.id, row.id);
        assert_eq!(again.quantity_of(h.product), 3);
    }

    #[test]
    fn checkout_survives_a_shrunken_balance() {
        let h = harness(3, ManagerConfig::default());
        let owner = shopper();

        let view = h
            .service
            .add_item(h.tenant_id, &owner, h.product, 2, None)
            .unwrap();
        let reservation_id = view.cart.reservation_id.unwrap();

        // A cycle count finds less on the shelf than the ledger thought.
        h.manager
            .adjust_stock(h.tenant_id, h.product, -2, "cycle count".to_string())
            .unwrap();

        let order_id = OrderId::new();
        let err = h
            .service
            .convert_to_order(h.tenant_id, &owner, reservation_id, order_id)
            .unwrap_err();
        assert!(matches!(err, DomainError::InsufficientStock { .. }));

        // The failed checkout changed nothing: hold intact, cart intact.
        let row = h
            .manager
            .reservation(h.tenant_id, reservation_id)
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ReservationStatus::Reserved);
        let cart = h.service.cart(h.tenant_id, &owner).unwrap();
        assert_eq!(cart.cart.quantity_of(h.product), 2);
        assert!(h
            .manager
            .audit_chain(h.tenant_id, h.product)
            .unwrap()
            .iter()
            .all(|e| e.action != LedgerAction::Commit));

        // The shopper drops to what the shelf can cover and checks out.
        h.service
            .update_quantity(h.tenant_id, &owner, h.product, 1)
            .unwrap();
        let outcome = h
            .service
            .convert_to_order(h.tenant_id, &owner, reservation_id, order_id)
            .unwrap();
        assert!(outcome.newly_converted);
        assert_eq!(
            h.manager
                .availability(h.tenant_id, h.product)
                .unwrap()
                .balance,
            0
        );
        h.manager.audit_chain(h.tenant_id, h.product).unwrap();
    }

    #[test]
    fn merged_cart_checks_out_with_the_guest_coupon() {
        let h = harness(10, ManagerConfig::default());
        let guest = OwnerKey::session("device-77").unwrap();
        let user = shopper();
        h.coupons
            .upsert(
                h.tenant_id,
                CouponRule {
                    code: "WELCOME".to_string(),
                    kind: CouponKind::AmountOff { amount: 500 },
                    starts_at: Some(chrono::Utc::now() - Duration::hours(1)),
                    ends_at: Some(chrono::Utc::now() + Duration::hours(1)),
                    min_subtotal: 0,
                    usage_limit: Some(1),
                },
            )
            .unwrap();

        h.service
            .add_item(h.tenant_id, &guest, h.product, 2, None)
            .unwrap();
        h.service
            .apply_coupon(h.tenant_id, &guest, "welcome")
            .unwrap();
        h.service
            .add_item(h.tenant_id, &user, h.product, 1, None)
            .unwrap();

        let merged = h
            .service
            .merge_guest_cart(h.tenant_id, &guest, &user)
            .unwrap();
        assert!(merged.warnings.is_empty());
        assert_eq!(merged.view.cart.quantity_of(h.product), 3);
        assert_eq!(merged.view.cart.coupon.as_ref().unwrap().code, "WELCOME");

        let reservation_id = merged.view.cart.reservation_id.unwrap();
        let outcome = h
            .service
            .convert_to_order(h.tenant_id, &user, reservation_id, OrderId::new())
            .unwrap();
        assert_eq!(outcome.totals.subtotal, 3_000);
        assert_eq!(outcome.totals.discount, 500);
        assert_eq!(h.coupons.usage_count(h.tenant_id, "WELCOME").unwrap(), 1);
        assert_eq!(
            h.manager
                .availability(h.tenant_id, h.product)
                .unwrap()
                .balance,
            7
        );

        // The coupon hit its usage limit; the next shopper is refused.
        assert!(matches!(
            h.service.apply_coupon(h.tenant_id, &user, "WELCOME"),
            Err(DomainError::CouponInvalid(_))
        ));
    }
}
