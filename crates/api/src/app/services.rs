//! Infrastructure wiring for the HTTP surface.
//!
//! Builds the in-memory stores, the reservation manager, the cart aggregator,
//! and the expiry sweeper, and owns the bridge between the async handlers and
//! the synchronous store stack. Reserve-shaped and convert-shaped operations
//! run on the blocking pool under an operation timeout; a timed-out attempt
//! is abandoned cleanly (every store write is atomic, so no partial state can
//! leak out of it).

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tracing::{info, warn};

use stocklock_carts::PricingPolicy;
use stocklock_core::{
    DomainError, DomainResult, OrderId, OwnerKey, ProductId, ProductRef, ReservationId, TenantId,
};
use stocklock_infra::{
    CartAggregator, CartView, CheckoutOutcome, CouponRule, ExpirySweeper, InMemoryCartStore,
    InMemoryCatalog, InMemoryCouponDirectory, InMemoryLedgerStore, InMemoryReservationStore,
    ManagerConfig, MergeOutcome, ProductSnapshot, ReservationManager, StockAvailability,
    SweeperConfig, SweeperHandle, SweeperStats,
};
use stocklock_ledger::LedgerEntry;
use stocklock_reservations::{HoldPolicy, Reservation};

type Ledger = Arc<InMemoryLedgerStore>;
type Reservations = Arc<InMemoryReservationStore>;
type CatalogStore = Arc<InMemoryCatalog>;
type Carts = Arc<InMemoryCartStore>;
type Coupons = Arc<InMemoryCouponDirectory>;

type Manager = ReservationManager<Ledger, Reservations, CatalogStore>;
type Aggregator = CartAggregator<Ledger, Reservations, CatalogStore, Carts, Coupons>;

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: String,
    pub jwt_secret: String,
    pub hold_window: ChronoDuration,
    pub sweep_interval: Duration,
    pub op_timeout: Duration,
    pub pricing: PricingPolicy,
    pub seed_demo_data: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            jwt_secret: "dev-secret".to_string(),
            hold_window: ChronoDuration::minutes(30),
            sweep_interval: Duration::from_secs(60),
            op_timeout: Duration::from_secs(5),
            pricing: PricingPolicy::default(),
            seed_demo_data: false,
        }
    }
}

impl ApiConfig {
    /// Read configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let jwt_secret = std::env::var("JWT_SECRET").unwrap_or_else(|_| {
            warn!("JWT_SECRET not set; using insecure dev default");
            defaults.jwt_secret.clone()
        });

        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            jwt_secret,
            hold_window: ChronoDuration::seconds(env_i64(
                "STOCKLOCK_HOLD_WINDOW_SECS",
                defaults.hold_window.num_seconds(),
            )),
            sweep_interval: Duration::from_secs(env_u64(
                "STOCKLOCK_SWEEP_SECS",
                defaults.sweep_interval.as_secs(),
            )),
            op_timeout: Duration::from_millis(env_u64(
                "STOCKLOCK_OP_TIMEOUT_MS",
                defaults.op_timeout.as_millis() as u64,
            )),
            pricing: PricingPolicy {
                tax_rate_bps: env_u64("STOCKLOCK_TAX_RATE_BPS", 0) as u32,
                delivery_fee: env_u64("STOCKLOCK_DELIVERY_FEE_MINOR", 0),
                free_delivery_threshold: std::env::var("STOCKLOCK_FREE_DELIVERY_MINOR")
                    .ok()
                    .and_then(|v| v.parse().ok()),
                currency: std::env::var("STOCKLOCK_CURRENCY")
                    .unwrap_or_else(|_| "USD".to_string()),
            },
            seed_demo_data: std::env::var("STOCKLOCK_SEED").as_deref() == Ok("1"),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(%name, %raw, "ignoring unparsable env var");
            default
        }),
        Err(_) => default,
    }
}

fn env_i64(name: &str, default: i64) -> i64 {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(%name, %raw, "ignoring unparsable env var");
            default
        }),
        Err(_) => default,
    }
}

/// Everything the routes touch, shared as one `Arc` extension.
pub struct AppServices {
    manager: Arc<Manager>,
    aggregator: Arc<Aggregator>,
    catalog: CatalogStore,
    coupons: Coupons,
    op_timeout: Duration,
    // Held so the sweep thread outlives the router; dropping the handle
    // closes the shutdown channel and the thread winds down.
    sweeper: SweeperHandle,
}

/// Build the full service stack and start the sweeper.
pub fn build_services(config: &ApiConfig) -> AppServices {
    let ledger: Ledger = Arc::new(InMemoryLedgerStore::new());
    let reservations: Reservations = Arc::new(InMemoryReservationStore::new());
    let catalog: CatalogStore = Arc::new(InMemoryCatalog::new());
    let carts: Carts = Arc::new(InMemoryCartStore::new());
    let coupons: Coupons = Arc::new(InMemoryCouponDirectory::new());

    let manager = Arc::new(ReservationManager::new(
        ledger,
        reservations.clone(),
        catalog.clone(),
        ManagerConfig::default().with_hold_policy(HoldPolicy {
            window: config.hold_window,
            ..HoldPolicy::default()
        }),
    ));

    let aggregator = Arc::new(CartAggregator::new(
        manager.clone(),
        carts,
        catalog.clone(),
        coupons.clone(),
        config.pricing.clone(),
    ));

    let sweeper = ExpirySweeper::new(manager.clone(), reservations).spawn(
        SweeperConfig::default().with_interval(config.sweep_interval),
    );

    let services = AppServices {
        manager,
        aggregator,
        catalog,
        coupons,
        op_timeout: config.op_timeout,
        sweeper,
    };

    if config.seed_demo_data {
        services.seed_demo_data();
    }

    services
}

impl AppServices {
    pub fn catalog(&self) -> &InMemoryCatalog {
        &self.catalog
    }

    pub fn coupons(&self) -> &InMemoryCouponDirectory {
        &self.coupons
    }

    pub fn sweeper_stats(&self) -> SweeperStats {
        self.sweeper.stats()
    }

    // ---- shopper surface -------------------------------------------------

    pub fn cart_view(&self, tenant_id: TenantId, owner_key: &OwnerKey) -> DomainResult<CartView> {
        self.aggregator.cart(tenant_id, owner_key)
    }

    pub async fn add_item(
        &self,
        tenant_id: TenantId,
        owner_key: OwnerKey,
        product_ref: ProductRef,
        quantity: i64,
        window: Option<ChronoDuration>,
    ) -> DomainResult<CartView> {
        let aggregator = self.aggregator.clone();
        self.run_bounded("add_item", move || {
            aggregator.add_item(tenant_id, &owner_key, product_ref, quantity, window)
        })
        .await
    }

    pub async fn update_quantity(
        &self,
        tenant_id: TenantId,
        owner_key: OwnerKey,
        product_ref: ProductRef,
        quantity: i64,
    ) -> DomainResult<CartView> {
        let aggregator = self.aggregator.clone();
        self.run_bounded("update_quantity", move || {
            aggregator.update_quantity(tenant_id, &owner_key, product_ref, quantity)
        })
        .await
    }

    pub async fn remove_item(
        &self,
        tenant_id: TenantId,
        owner_key: OwnerKey,
        product_ref: ProductRef,
    ) -> DomainResult<CartView> {
        let aggregator = self.aggregator.clone();
        self.run_bounded("remove_item", move || {
            aggregator.remove_item(tenant_id, &owner_key, product_ref)
        })
        .await
    }

    pub fn apply_coupon(
        &self,
        tenant_id: TenantId,
        owner_key: &OwnerKey,
        code: &str,
    ) -> DomainResult<CartView> {
        self.aggregator.apply_coupon(tenant_id, owner_key, code)
    }

    pub fn clear_coupon(&self, tenant_id: TenantId, owner_key: &OwnerKey) -> DomainResult<CartView> {
        self.aggregator.clear_coupon(tenant_id, owner_key)
    }

    pub async fn merge_guest_cart(
        &self,
        tenant_id: TenantId,
        guest_owner: OwnerKey,
        user_owner: OwnerKey,
    ) -> DomainResult<MergeOutcome> {
        let aggregator = self.aggregator.clone();
        self.run_bounded("merge_guest_cart", move || {
            aggregator.merge_guest_cart(tenant_id, &guest_owner, &user_owner)
        })
        .await
    }

    pub async fn reserve(
        &self,
        tenant_id: TenantId,
        owner_key: OwnerKey,
        product_ref: ProductRef,
        quantity: i64,
        window: Option<ChronoDuration>,
    ) -> DomainResult<Reservation> {
        let aggregator = self.aggregator.clone();
        // The reservation route holds stock through the aggregator too, so
        // the cart row always agrees with the hold it fronts.
        let view = self
            .run_bounded("reserve", move || {
                aggregator.add_item(tenant_id, &owner_key, product_ref, quantity, window)
            })
            .await?;
        let reservation_id = view
            .cart
            .reservation_id
            .ok_or_else(|| DomainError::storage("hold placed but cart carries no reservation"))?;
        self.manager
            .reservation(tenant_id, reservation_id)?
            .ok_or(DomainError::NotFound)
    }

    pub fn extend(
        &self,
        tenant_id: TenantId,
        reservation_id: ReservationId,
        window: Option<ChronoDuration>,
    ) -> DomainResult<Reservation> {
        self.manager.extend(tenant_id, reservation_id, window)
    }

    pub fn release(
        &self,
        tenant_id: TenantId,
        reservation_id: ReservationId,
        reason: &str,
    ) -> DomainResult<stocklock_infra::ReleaseOutcome> {
        self.manager.release(tenant_id, reservation_id, reason)
    }

    pub async fn convert(
        &self,
        tenant_id: TenantId,
        owner_key: OwnerKey,
        reservation_id: ReservationId,
        order_id: OrderId,
    ) -> DomainResult<CheckoutOutcome> {
        let aggregator = self.aggregator.clone();
        self.run_bounded("convert", move || {
            aggregator.convert_to_order(tenant_id, &owner_key, reservation_id, order_id)
        })
        .await
    }

    pub fn reservation(
        &self,
        tenant_id: TenantId,
        reservation_id: ReservationId,
    ) -> DomainResult<Option<Reservation>> {
        self.manager.reservation(tenant_id, reservation_id)
    }

    // ---- merchant surface ------------------------------------------------

    pub fn availability(
        &self,
        tenant_id: TenantId,
        product_ref: ProductRef,
    ) -> DomainResult<StockAvailability> {
        self.manager.availability(tenant_id, product_ref)
    }

    pub fn audit_chain(
        &self,
        tenant_id: TenantId,
        product_ref: ProductRef,
    ) -> DomainResult<Vec<LedgerEntry>> {
        self.manager.audit_chain(tenant_id, product_ref)
    }

    pub fn receive_stock(
        &self,
        tenant_id: TenantId,
        product_ref: ProductRef,
        quantity: i64,
        reason: Option<String>,
    ) -> DomainResult<LedgerEntry> {
        self.manager
            .receive_stock(tenant_id, product_ref, quantity, reason)
    }

    pub fn withdraw_stock(
        &self,
        tenant_id: TenantId,
        product_ref: ProductRef,
        quantity: i64,
        reason: Option<String>,
    ) -> DomainResult<LedgerEntry> {
        self.manager
            .withdraw_stock(tenant_id, product_ref, quantity, reason)
    }

    pub fn adjust_stock(
        &self,
        tenant_id: TenantId,
        product_ref: ProductRef,
        delta: i64,
        reason: String,
    ) -> DomainResult<LedgerEntry> {
        self.manager.adjust_stock(tenant_id, product_ref, delta, reason)
    }

    pub fn transfer_stock(
        &self,
        tenant_id: TenantId,
        from: ProductRef,
        to: ProductRef,
        quantity: i64,
        reason: Option<String>,
    ) -> DomainResult<Vec<LedgerEntry>> {
        self.manager
            .transfer_stock(tenant_id, from, to, quantity, reason)
    }

    // ---- plumbing --------------------------------------------------------

    /// Run a store-touching closure on the blocking pool under the operation
    /// timeout. The closure's writes are individually atomic, so abandoning
    /// it at the deadline cannot leave partial state; whatever it did or did
    /// not commit, the caller is told to retry.
    async fn run_bounded<T, F>(&self, label: &'static str, task: F) -> DomainResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> DomainResult<T> + Send + 'static,
    {
        let budget = self.op_timeout;
        match tokio::time::timeout(budget, tokio::task::spawn_blocking(task)).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(DomainError::storage(format!(
                "{label} task failed: {join_err}"
            ))),
            Err(_elapsed) => Err(DomainError::timeout(format!(
                "{label} exceeded its {}ms budget",
                budget.as_millis()
            ))),
        }
    }

    /// Dev/demo data: one tenant, two products, a coupon, some stock.
    fn seed_demo_data(&self) {
        let tenant_id = std::env::var("STOCKLOCK_SEED_TENANT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_else(TenantId::new);

        let mug = ProductRef::product(ProductId::new());
        let tee = ProductRef::product(ProductId::new());
        let seeded: DomainResult<()> = (|| {
            self.catalog.upsert(
                tenant_id,
                ProductSnapshot {
                    product_ref: mug,
                    name: "Enamel Mug".to_string(),
                    unit_price: 1_500,
                    currency: "USD".to_string(),
                    sellable: true,
                },
            )?;
            self.catalog.upsert(
                tenant_id,
                ProductSnapshot {
                    product_ref: tee,
                    name: "Logo Tee".to_string(),
                    unit_price: 2_500,
                    currency: "USD".to_string(),
                    sellable: true,
                },
            )?;
            self.manager.receive_stock(tenant_id, mug, 25, None)?;
            self.manager.receive_stock(tenant_id, tee, 40, None)?;
            self.coupons.upsert(
                tenant_id,
                CouponRule {
                    code: "WELCOME10".to_string(),
                    kind: stocklock_carts::CouponKind::PercentOff { basis_points: 1_000 },
                    starts_at: None,
                    ends_at: None,
                    min_subtotal: 0,
                    usage_limit: None,
                },
            )?;
            Ok(())
        })();

        match seeded {
            Ok(()) => info!(
                tenant = %tenant_id,
                mug = %mug,
                tee = %tee,
                "seeded demo catalog, stock, and coupon"
            ),
            Err(err) => warn!(error = %err, "demo data seeding failed"),
        }
    }
}
