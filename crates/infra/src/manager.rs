//! Reservation lifecycle orchestration.
//!
//! The manager owns every transition of a hold: placing it, resizing it,
//! extending it, releasing it, expiring it, and converting it into an order.
//! Each write follows the same shape:
//!
//! 1. read the chain head and the row, compute availability
//! 2. decide in memory (pure domain calls)
//! 3. write conditionally (expected head / expected version)
//! 4. on a conflict, re-read and retry up to the configured attempt budget
//!
//! Availability is `balance - active_reserved`: the chain head supplies the
//! balance, the reservation rows supply the held quantity. The conditional
//! ledger append is the linearization point for anything that consumes
//! availability; the row CAS is the gate for lifecycle transitions. Reserve
//! markers orphaned by a lost row race carry zero delta and never move the
//! balance.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use stocklock_core::{
    CartId, DomainError, DomainResult, ExpectedVersion, OrderId, OwnerKey, ProductRef,
    ReservationId, TenantId,
};
use stocklock_ledger::{verify_chain, HeadState, LedgerAction, LedgerEntry, NewEntry};
use stocklock_reservations::{HoldPolicy, Reservation, ReservationStatus};

use crate::catalog::Catalog;
use crate::ledger_store::{ConditionalAppend, LedgerStore};
use crate::reservation_store::ReservationStore;

/// Tuning knobs for the manager.
#[derive(Debug, Copy, Clone)]
pub struct ManagerConfig {
    pub hold_policy: HoldPolicy,
    /// Conditional-write budget before an operation gives up with a conflict.
    pub max_attempts: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            hold_policy: HoldPolicy::default(),
            max_attempts: 3,
        }
    }
}

impl ManagerConfig {
    pub fn with_hold_policy(mut self, hold_policy: HoldPolicy) -> Self {
        self.hold_policy = hold_policy;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

/// A request to hold stock for an owner's cart.
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub owner_key: OwnerKey,
    pub cart_id: CartId,
    pub product_ref: ProductRef,
    /// Quantity to add on top of whatever the owner already holds.
    pub quantity: i64,
    /// Hold window; the policy default applies when absent.
    pub window: Option<Duration>,
}

impl ReserveRequest {
    pub fn new(
        owner_key: OwnerKey,
        cart_id: CartId,
        product_ref: ProductRef,
        quantity: i64,
    ) -> Self {
        Self {
            owner_key,
            cart_id,
            product_ref,
            quantity,
            window: None,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }
}

/// What a release (or expiry) call did.
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseOutcome {
    pub reservation: Reservation,
    /// False when the row was already terminal: the call was a no-op replay.
    pub released_now: bool,
}

/// What a conversion call did.
#[derive(Debug, Clone, Serialize)]
pub struct ConvertOutcome {
    pub reservation: Reservation,
    /// The COMMIT entries that settled the hold against the chain.
    pub entries: Vec<LedgerEntry>,
    /// False when the same order had already converted this reservation.
    pub newly_converted: bool,
}

/// Sellable-stock picture for one product.
///
/// `available` can go negative after an admin shrinks stock below what is
/// currently held; new holds are refused until the holds drain.
#[derive(Debug, Copy, Clone, Serialize)]
pub struct StockAvailability {
    pub product_ref: ProductRef,
    pub balance: i64,
    pub active_reserved: i64,
    pub available: i64,
}

/// Orchestrates holds across the ledger, the reservation rows, and the
/// catalog. All methods are synchronous and safe to call from any thread.
#[derive(Debug)]
pub struct ReservationManager<L, R, C> {
    ledger: L,
    reservations: R,
    catalog: C,
    config: ManagerConfig,
}

impl<L, R, C> ReservationManager<L, R, C> {
    pub fn new(ledger: L, reservations: R, catalog: C, config: ManagerConfig) -> Self {
        Self {
            ledger,
            reservations,
            catalog,
            config,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }
}

impl<L, R, C> ReservationManager<L, R, C>
where
    L: LedgerStore,
    R: ReservationStore,
    C: Catalog,
{
    /// Place (or grow) a hold for the owner's cart.
    ///
    /// Availability is checked against an observed chain head, the row lands,
    /// and only then does the marker append at that same head. Anyone who
    /// reads the moved head therefore also sees the hold row; an append that
    /// loses the head race retracts the row before the re-check.
    pub fn reserve(&self, tenant_id: TenantId, request: ReserveRequest) -> DomainResult<Reservation> {
        if request.quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        // Window bounds fail fast, before any store traffic.
        self.config
            .hold_policy
            .expiry_from(Utc::now(), request.window)?;

        let snapshot = self.catalog.product(tenant_id, request.product_ref)?;
        if !snapshot.sellable {
            return Err(DomainError::validation(format!(
                "product {} is not sellable",
                request.product_ref
            )));
        }

        for attempt in 1..=self.config.max_attempts {
            let now = Utc::now();
            let (head, availability) = self.availability_at(tenant_id, request.product_ref, now)?;
            if request.quantity > availability.available {
                return Err(DomainError::insufficient_stock(
                    request.quantity,
                    availability.available,
                ));
            }

            let existing =
                self.reservations
                    .find_active_by_owner(tenant_id, &request.owner_key, now)?;
            let refreshed = self.config.hold_policy.expiry_from(now, request.window)?;

            // Build the whole write in memory first.
            let (mut row, stored_version) = match existing {
                Some(row) => {
                    // A refresh never pulls an extended window backwards.
                    let version = row.version;
                    (row, Some(version))
                }
                None => (
                    Reservation::open(
                        tenant_id,
                        request.owner_key.clone(),
                        request.cart_id,
                        refreshed,
                        now,
                    ),
                    None,
                ),
            };
            let expires_at = refreshed.max(row.expires_at);
            row.add_quantity(
                request.product_ref,
                request.quantity,
                snapshot.unit_price,
                expires_at,
                now,
            )?;

            // The row must be visible before the head moves; a marker that
            // lands first opens a window where a concurrent reserve reads the
            // new head, counts zero held, and double-books the stock.
            let write = match stored_version {
                Some(version) => self
                    .reservations
                    .update(row.clone(), ExpectedVersion::Exact(version)),
                None => self.reservations.insert(row.clone()),
            };
            match write {
                Ok(()) => {}
                Err(err) if err.is_retriable() => {
                    debug!(attempt, owner = %request.owner_key, "hold row raced, retrying");
                    continue;
                }
                Err(err) => return Err(err),
            }

            let marker = ConditionalAppend::at(
                NewEntry::reserve_marker(request.product_ref, row.id),
                head,
            );
            match self.ledger.append(tenant_id, vec![marker]) {
                Ok(_) => {
                    debug!(
                        reservation = %row.id,
                        product = %request.product_ref,
                        quantity = request.quantity,
                        "hold placed"
                    );
                    return Ok(row);
                }
                Err(err) if err.is_retriable() => {
                    // The head moved after our check. The provisional line has
                    // to come back out before the retry, or it would sit in
                    // availability with no marker ever arbitrating it.
                    debug!(attempt, product = %request.product_ref, "chain head moved, retracting hold and retrying");
                    self.retract_hold(&row, request.product_ref, request.quantity)?;
                    continue;
                }
                Err(err) => {
                    self.retract_hold(&row, request.product_ref, request.quantity)?;
                    return Err(err);
                }
            }
        }

        Err(DomainError::conflict(format!(
            "could not place hold for {} after {} attempts",
            request.product_ref, self.config.max_attempts
        )))
    }

    /// Set one line of a hold to an absolute quantity; zero removes the line.
    ///
    /// Growth consumes availability and is linearized through a reserve
    /// marker; shrinkage frees availability the instant the row lands and
    /// trails an unconditional release marker.
    pub fn update_item(
        &self,
        tenant_id: TenantId,
        reservation_id: ReservationId,
        product_ref: ProductRef,
        quantity: i64,
    ) -> DomainResult<Reservation> {
        if quantity < 0 {
            return Err(DomainError::validation("quantity cannot be negative"));
        }

        for attempt in 1..=self.config.max_attempts {
            let now = Utc::now();
            let row = self
                .reservations
                .get(tenant_id, reservation_id)?
                .ok_or(DomainError::NotFound)?;
            let stored_version = row.version;
            let delta = quantity - row.quantity_of(product_ref);
            if delta == 0 {
                return Ok(row);
            }

            let unit_price = match row
                .items
                .iter()
                .find(|item| item.product_ref == product_ref)
            {
                Some(item) => item.unit_price,
                None => {
                    let snapshot = self.catalog.product(tenant_id, product_ref)?;
                    if !snapshot.sellable {
                        return Err(DomainError::validation(format!(
                            "product {product_ref} is not sellable"
                        )));
                    }
                    snapshot.unit_price
                }
            };

            let expires_at = self
                .config
                .hold_policy
                .expiry_from(now, None)?
                .max(row.expires_at);
            let mut updated = row;
            updated.set_quantity(product_ref, quantity, unit_price, expires_at, now)?;

            if delta > 0 {
                let (head, availability) = self.availability_at(tenant_id, product_ref, now)?;
                if delta > availability.available {
                    return Err(DomainError::insufficient_stock(delta, availability.available));
                }
                // Same ordering as `reserve`: the grown row lands before the
                // marker moves the head.
                match self
                    .reservations
                    .update(updated.clone(), ExpectedVersion::Exact(stored_version))
                {
                    Ok(()) => {}
                    Err(err) if err.is_retriable() => {
                        debug!(attempt, reservation = %reservation_id, "hold row raced, retrying update");
                        continue;
                    }
                    Err(err) => return Err(err),
                }
                let marker = ConditionalAppend::at(
                    NewEntry::reserve_marker(product_ref, updated.id),
                    head,
                );
                match self.ledger.append(tenant_id, vec![marker]) {
                    Ok(_) => return Ok(updated),
                    Err(err) if err.is_retriable() => {
                        debug!(attempt, product = %product_ref, "chain head moved, retracting growth and retrying");
                        self.retract_hold(&updated, product_ref, delta)?;
                        continue;
                    }
                    Err(err) => {
                        self.retract_hold(&updated, product_ref, delta)?;
                        return Err(err);
                    }
                }
            } else {
                match self
                    .reservations
                    .update(updated.clone(), ExpectedVersion::Exact(stored_version))
                {
                    Ok(()) => {
                        self.ledger.append(
                            tenant_id,
                            vec![ConditionalAppend::any(NewEntry::release_marker(
                                product_ref,
                                updated.id,
                                "quantity reduced",
                            ))],
                        )?;
                        return Ok(updated);
                    }
                    Err(err) if err.is_retriable() => {
                        debug!(attempt, reservation = %reservation_id, "hold row raced, retrying update");
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        Err(DomainError::conflict(format!(
            "could not update reservation {reservation_id} after {} attempts",
            self.config.max_attempts
        )))
    }

    /// Push a hold's expiry to `now + window` (policy default when absent).
    pub fn extend(
        &self,
        tenant_id: TenantId,
        reservation_id: ReservationId,
        window: Option<Duration>,
    ) -> DomainResult<Reservation> {
        for attempt in 1..=self.config.max_attempts {
            let now = Utc::now();
            let row = self
                .reservations
                .get(tenant_id, reservation_id)?
                .ok_or(DomainError::NotFound)?;
            let stored_version = row.version;

            let expires_at = self.config.hold_policy.expiry_from(now, window)?;
            let mut updated = row;
            updated.extend_to(expires_at, now)?;

            match self
                .reservations
                .update(updated.clone(), ExpectedVersion::Exact(stored_version))
            {
                Ok(()) => {
                    debug!(reservation = %reservation_id, expires_at = %expires_at, "hold extended");
                    return Ok(updated);
                }
                Err(err) if err.is_retriable() => {
                    debug!(attempt, reservation = %reservation_id, "hold row raced, retrying extension");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        Err(DomainError::conflict(format!(
            "could not extend reservation {reservation_id} after {} attempts",
            self.config.max_attempts
        )))
    }

    /// Return a hold to the pool. Replaying a release (or releasing a row the
    /// sweeper already expired) reports `released_now: false` instead of
    /// failing.
    pub fn release(
        &self,
        tenant_id: TenantId,
        reservation_id: ReservationId,
        reason: &str,
    ) -> DomainResult<ReleaseOutcome> {
        for attempt in 1..=self.config.max_attempts {
            let now = Utc::now();
            let row = self
                .reservations
                .get(tenant_id, reservation_id)?
                .ok_or(DomainError::NotFound)?;
            if row.status.is_terminal() {
                return Ok(ReleaseOutcome {
                    reservation: row,
                    released_now: false,
                });
            }
            let stored_version = row.version;

            let mut released = row;
            released.mark_released(reason, now)?;

            match self
                .reservations
                .update(released.clone(), ExpectedVersion::Exact(stored_version))
            {
                Ok(()) => {
                    // The row already freed the availability; the markers are
                    // audit only and must not lose to chain contention.
                    let markers = released
                        .items
                        .iter()
                        .map(|item| {
                            ConditionalAppend::any(NewEntry::release_marker(
                                item.product_ref,
                                released.id,
                                reason,
                            ))
                        })
                        .collect();
                    self.ledger.append(tenant_id, markers)?;
                    debug!(reservation = %reservation_id, reason, "hold released");
                    return Ok(ReleaseOutcome {
                        reservation: released,
                        released_now: true,
                    });
                }
                Err(err) if err.is_retriable() => {
                    debug!(attempt, reservation = %reservation_id, "hold row raced, retrying release");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        Err(DomainError::conflict(format!(
            "could not release reservation {reservation_id} after {} attempts",
            self.config.max_attempts
        )))
    }

    /// Sweeper transition: close a hold whose window has lapsed.
    ///
    /// Rows that were extended or closed since they were picked up report
    /// `released_now: false`; the guard is the row CAS, so a racing extension
    /// is never clobbered.
    pub fn expire(
        &self,
        tenant_id: TenantId,
        reservation_id: ReservationId,
    ) -> DomainResult<ReleaseOutcome> {
        for attempt in 1..=self.config.max_attempts {
            let now = Utc::now();
            let row = self
                .reservations
                .get(tenant_id, reservation_id)?
                .ok_or(DomainError::NotFound)?;
            if row.status.is_terminal() || now < row.expires_at {
                return Ok(ReleaseOutcome {
                    reservation: row,
                    released_now: false,
                });
            }
            let stored_version = row.version;

            let mut expired = row;
            expired.mark_expired(now)?;

            match self
                .reservations
                .update(expired.clone(), ExpectedVersion::Exact(stored_version))
            {
                Ok(()) => {
                    let markers = expired
                        .items
                        .iter()
                        .map(|item| {
                            ConditionalAppend::any(NewEntry::release_marker(
                                item.product_ref,
                                expired.id,
                                "expired",
                            ))
                        })
                        .collect();
                    self.ledger.append(tenant_id, markers)?;
                    debug!(reservation = %reservation_id, "hold expired");
                    return Ok(ReleaseOutcome {
                        reservation: expired,
                        released_now: true,
                    });
                }
                Err(err) if err.is_retriable() => {
                    debug!(attempt, reservation = %reservation_id, "hold row raced, retrying expiry");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        Err(DomainError::conflict(format!(
            "could not expire reservation {reservation_id} after {} attempts",
            self.config.max_attempts
        )))
    }

    /// Convert a hold into an order: the row turns `committed`, then every
    /// item settles against its chain with a COMMIT entry, atomically per
    /// batch. Replaying the same order is idempotent; a different order on a
    /// converted reservation is an error.
    ///
    /// If settlement cannot land (the balance shrank under the hold), the row
    /// reverts to `reserved` and the settlement error surfaces.
    pub fn convert(
        &self,
        tenant_id: TenantId,
        reservation_id: ReservationId,
        order_id: OrderId,
    ) -> DomainResult<ConvertOutcome> {
        for attempt in 1..=self.config.max_attempts {
            let now = Utc::now();
            let row = self
                .reservations
                .get(tenant_id, reservation_id)?
                .ok_or(DomainError::NotFound)?;

            match row.status {
                ReservationStatus::Committed => {
                    if row.order_id == Some(order_id) {
                        let entries = self.commit_entries(tenant_id, reservation_id)?;
                        return Ok(ConvertOutcome {
                            reservation: row,
                            entries,
                            newly_converted: false,
                        });
                    }
                    return Err(DomainError::validation(format!(
                        "reservation {reservation_id} already converted to a different order"
                    )));
                }
                ReservationStatus::Released => {
                    return Err(DomainError::not_active(format!(
                        "reservation {reservation_id} was released"
                    )));
                }
                ReservationStatus::Expired => {
                    return Err(DomainError::expired(row.expires_at));
                }
                ReservationStatus::Reserved => {
                    if now >= row.expires_at {
                        return Err(DomainError::expired(row.expires_at));
                    }
                }
            }
            let stored_version = row.version;

            let mut committed = row;
            committed.mark_committed(order_id, now)?;

            match self
                .reservations
                .update(committed.clone(), ExpectedVersion::Exact(stored_version))
            {
                // The terminal row now blocks the sweeper and other writers;
                // settlement runs without a competing lifecycle transition.
                Ok(()) => return self.settle_conversion(tenant_id, committed),
                Err(err) if err.is_retriable() => {
                    debug!(attempt, reservation = %reservation_id, "hold row raced, retrying conversion");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        Err(DomainError::conflict(format!(
            "could not convert reservation {reservation_id} after {} attempts",
            self.config.max_attempts
        )))
    }

    fn settle_conversion(
        &self,
        tenant_id: TenantId,
        row: Reservation,
    ) -> DomainResult<ConvertOutcome> {
        match self.append_commit_batch(tenant_id, &row) {
            Ok(entries) => {
                info!(
                    reservation = %row.id,
                    order = ?row.order_id,
                    items = row.items.len(),
                    "reservation converted"
                );
                Ok(ConvertOutcome {
                    reservation: row,
                    entries,
                    newly_converted: true,
                })
            }
            Err(err) => {
                warn!(reservation = %row.id, error = %err, "settlement failed, reverting conversion");
                if let Err(revert_err) = self.revert_conversion(tenant_id, row.id) {
                    error!(
                        reservation = %row.id,
                        error = %revert_err,
                        "conversion rollback failed, row left committed without settlement"
                    );
                    return Err(DomainError::storage(format!(
                        "conversion rollback failed: {revert_err}"
                    )));
                }
                Err(err)
            }
        }
    }

    fn append_commit_batch(
        &self,
        tenant_id: TenantId,
        row: &Reservation,
    ) -> DomainResult<Vec<LedgerEntry>> {
        for attempt in 1..=self.config.max_attempts {
            let mut batch = Vec::with_capacity(row.items.len());
            for item in &row.items {
                let head = self.ledger.head(tenant_id, item.product_ref)?;
                batch.push(ConditionalAppend::at(
                    NewEntry::commit(item.product_ref, row.id, item.quantity),
                    head,
                ));
            }
            match self.ledger.append(tenant_id, batch) {
                Ok(entries) => return Ok(entries),
                Err(err) if err.is_retriable() => {
                    debug!(attempt, reservation = %row.id, "chain head moved, retrying settlement");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(DomainError::conflict(format!(
            "settlement for reservation {} kept losing the chain head",
            row.id
        )))
    }

    fn revert_conversion(&self, tenant_id: TenantId, reservation_id: ReservationId) -> DomainResult<()> {
        for _attempt in 1..=self.config.max_attempts {
            let row = self
                .reservations
                .get(tenant_id, reservation_id)?
                .ok_or(DomainError::NotFound)?;
            if row.status != ReservationStatus::Committed {
                return Ok(());
            }
            let stored_version = row.version;

            let mut reverted = row;
            reverted.revert_commit(Utc::now())?;

            match self
                .reservations
                .update(reverted, ExpectedVersion::Exact(stored_version))
            {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retriable() => continue,
                Err(err) => return Err(err),
            }
        }
        Err(DomainError::conflict(format!(
            "could not revert reservation {reservation_id}"
        )))
    }

    /// Back out a provisionally written hold line whose reserve marker lost
    /// the chain head race. Restores the quantity the row carried before the
    /// write; a line that only existed for this write comes out entirely, and
    /// a row left with nothing held closes.
    fn retract_hold(
        &self,
        row: &Reservation,
        product_ref: ProductRef,
        quantity: i64,
    ) -> DomainResult<()> {
        let now = Utc::now();
        let restored = row.quantity_of(product_ref) - quantity;
        let mut reverted = row.clone();
        if restored > 0 || reverted.items.len() > 1 {
            let unit_price = reverted
                .items
                .iter()
                .find(|item| item.product_ref == product_ref)
                .map(|item| item.unit_price)
                .unwrap_or(0);
            reverted.set_quantity(product_ref, restored, unit_price, reverted.expires_at, now)?;
        } else {
            reverted.mark_released("hold retracted", now)?;
        }
        // Nothing else writes this row between our write and the retraction
        // except a same-owner racer; losing that CAS surfaces as the conflict
        // it is.
        self.reservations
            .update(reverted, ExpectedVersion::Exact(row.version))
    }

    fn commit_entries(
        &self,
        tenant_id: TenantId,
        reservation_id: ReservationId,
    ) -> DomainResult<Vec<LedgerEntry>> {
        Ok(self
            .ledger
            .entries_for_reservation(tenant_id, reservation_id)?
            .into_iter()
            .filter(|entry| entry.action == LedgerAction::Commit)
            .collect())
    }

    pub fn reservation(
        &self,
        tenant_id: TenantId,
        reservation_id: ReservationId,
    ) -> DomainResult<Option<Reservation>> {
        self.reservations.get(tenant_id, reservation_id)
    }

    pub fn availability(
        &self,
        tenant_id: TenantId,
        product_ref: ProductRef,
    ) -> DomainResult<StockAvailability> {
        let (_, availability) = self.availability_at(tenant_id, product_ref, Utc::now())?;
        Ok(availability)
    }

    /// Full movement chain for a product, verified end to end before it is
    /// returned. A broken chain surfaces as `LedgerIntegrity`.
    pub fn audit_chain(
        &self,
        tenant_id: TenantId,
        product_ref: ProductRef,
    ) -> DomainResult<Vec<LedgerEntry>> {
        let entries = self.ledger.entries(tenant_id, product_ref)?;
        verify_chain(&entries)?;
        Ok(entries)
    }

    /// Record received goods.
    pub fn receive_stock(
        &self,
        tenant_id: TenantId,
        product_ref: ProductRef,
        quantity: i64,
        reason: Option<String>,
    ) -> DomainResult<LedgerEntry> {
        if quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        for attempt in 1..=self.config.max_attempts {
            let head = self.ledger.head(tenant_id, product_ref)?;
            let draft = NewEntry::stock_in(product_ref, quantity, reason.clone());
            match self
                .ledger
                .append(tenant_id, vec![ConditionalAppend::at(draft, head)])
            {
                Ok(entries) => return only_entry(entries),
                Err(err) if err.is_retriable() => {
                    debug!(attempt, product = %product_ref, "chain head moved, retrying receipt");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(DomainError::conflict(format!(
            "stock receipt for {product_ref} kept losing the chain head"
        )))
    }

    /// Take goods out of sellable stock (damage, shrinkage found in count).
    /// Refuses to take stock that active holds have claimed.
    pub fn withdraw_stock(
        &self,
        tenant_id: TenantId,
        product_ref: ProductRef,
        quantity: i64,
        reason: Option<String>,
    ) -> DomainResult<LedgerEntry> {
        if quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        for attempt in 1..=self.config.max_attempts {
            let now = Utc::now();
            let (head, availability) = self.availability_at(tenant_id, product_ref, now)?;
            if quantity > availability.available {
                return Err(DomainError::insufficient_stock(
                    quantity,
                    availability.available,
                ));
            }
            let draft = NewEntry::stock_out(product_ref, quantity, reason.clone());
            match self
                .ledger
                .append(tenant_id, vec![ConditionalAppend::at(draft, head)])
            {
                Ok(entries) => return only_entry(entries),
                Err(err) if err.is_retriable() => {
                    debug!(attempt, product = %product_ref, "chain head moved, retrying withdrawal");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(DomainError::conflict(format!(
            "stock withdrawal for {product_ref} kept losing the chain head"
        )))
    }

    /// Manual correction, either direction. Unlike a withdrawal, a negative
    /// adjustment may shrink the balance below the held quantity; the holds
    /// then fail at conversion instead of blocking the correction.
    pub fn adjust_stock(
        &self,
        tenant_id: TenantId,
        product_ref: ProductRef,
        delta: i64,
        reason: String,
    ) -> DomainResult<LedgerEntry> {
        if delta == 0 {
            return Err(DomainError::validation("adjustment delta cannot be zero"));
        }
        for attempt in 1..=self.config.max_attempts {
            let head = self.ledger.head(tenant_id, product_ref)?;
            let draft = NewEntry::adjustment(product_ref, delta, reason.clone());
            match self
                .ledger
                .append(tenant_id, vec![ConditionalAppend::at(draft, head)])
            {
                Ok(entries) => return only_entry(entries),
                Err(err) if err.is_retriable() => {
                    debug!(attempt, product = %product_ref, "chain head moved, retrying adjustment");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(DomainError::conflict(format!(
            "stock adjustment for {product_ref} kept losing the chain head"
        )))
    }

    /// Move stock between two product refs (restock a variant from the bare
    /// product, rebalance variants). Both sides land in one atomic batch.
    pub fn transfer_stock(
        &self,
        tenant_id: TenantId,
        from: ProductRef,
        to: ProductRef,
        quantity: i64,
        reason: Option<String>,
    ) -> DomainResult<Vec<LedgerEntry>> {
        if quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        if from == to {
            return Err(DomainError::validation("transfer endpoints must differ"));
        }
        for attempt in 1..=self.config.max_attempts {
            let now = Utc::now();
            let (from_head, availability) = self.availability_at(tenant_id, from, now)?;
            if quantity > availability.available {
                return Err(DomainError::insufficient_stock(
                    quantity,
                    availability.available,
                ));
            }
            let to_head = self.ledger.head(tenant_id, to)?;

            let batch = vec![
                ConditionalAppend::at(
                    NewEntry::transfer(from, to, -quantity, reason.clone()),
                    from_head,
                ),
                ConditionalAppend::at(NewEntry::transfer(to, from, quantity, reason.clone()), to_head),
            ];
            match self.ledger.append(tenant_id, batch) {
                Ok(entries) => return Ok(entries),
                Err(err) if err.is_retriable() => {
                    debug!(attempt, from = %from, to = %to, "chain head moved, retrying transfer");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(DomainError::conflict(format!(
            "stock transfer {from} -> {to} kept losing the chain head"
        )))
    }

    fn availability_at(
        &self,
        tenant_id: TenantId,
        product_ref: ProductRef,
        now: DateTime<Utc>,
    ) -> DomainResult<(Option<HeadState>, StockAvailability)> {
        let head = self.ledger.head(tenant_id, product_ref)?;
        let balance = head.map(|h| h.resulting_quantity).unwrap_or(0);
        let active_reserved =
            self.reservations
                .active_reserved_quantity(tenant_id, product_ref, now)?;
        Ok((
            head,
            StockAvailability {
                product_ref,
                balance,
                active_reserved,
                available: balance - active_reserved,
            },
        ))
    }
}

fn only_entry(mut entries: Vec<LedgerEntry>) -> DomainResult<LedgerEntry> {
    entries
        .pop()
        .ok_or_else(|| DomainError::storage("append committed no entries"))
}
