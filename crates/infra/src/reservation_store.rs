//! Reservation row store.
//!
//! Rows are mutable but version-guarded: `update` is a compare-and-swap on the
//! stored version, so concurrent writers lose with a conflict instead of
//! clobbering each other. The store also keeps an expiry index so the sweeper
//! can find due holds without scanning every row.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use stocklock_core::{
    DomainError, DomainResult, ExpectedVersion, OwnerKey, ProductRef, ReservationId, TenantId,
};
use stocklock_reservations::{Reservation, ReservationStatus};

/// Version-guarded store of reservation rows.
pub trait ReservationStore: Send + Sync {
    /// Insert a fresh row. The id must not exist yet, and an active row must
    /// not land beside another active row for the same owner.
    fn insert(&self, reservation: Reservation) -> DomainResult<()>;

    /// Replace a row, conditionally on the stored version.
    fn update(&self, reservation: Reservation, expected: ExpectedVersion) -> DomainResult<()>;

    fn get(&self, tenant_id: TenantId, id: ReservationId) -> DomainResult<Option<Reservation>>;

    /// The owner's current active hold, if any. Latest wins when several
    /// qualify.
    fn find_active_by_owner(
        &self,
        tenant_id: TenantId,
        owner_key: &OwnerKey,
        now: DateTime<Utc>,
    ) -> DomainResult<Option<Reservation>>;

    /// Total quantity of a product held by active reservations right now.
    fn active_reserved_quantity(
        &self,
        tenant_id: TenantId,
        product_ref: ProductRef,
        now: DateTime<Utc>,
    ) -> DomainResult<i64>;

    /// Open holds whose window lapses at or before the cutoff, oldest first.
    fn expiring_before(&self, cutoff: DateTime<Utc>, limit: usize)
        -> DomainResult<Vec<Reservation>>;
}

impl<S> ReservationStore for Arc<S>
where
    S: ReservationStore + ?Sized,
{
    fn insert(&self, reservation: Reservation) -> DomainResult<()> {
        (**self).insert(reservation)
    }

    fn update(&self, reservation: Reservation, expected: ExpectedVersion) -> DomainResult<()> {
        (**self).update(reservation, expected)
    }

    fn get(&self, tenant_id: TenantId, id: ReservationId) -> DomainResult<Option<Reservation>> {
        (**self).get(tenant_id, id)
    }

    fn find_active_by_owner(
        &self,
        tenant_id: TenantId,
        owner_key: &OwnerKey,
        now: DateTime<Utc>,
    ) -> DomainResult<Option<Reservation>> {
        (**self).find_active_by_owner(tenant_id, owner_key, now)
    }

    fn active_reserved_quantity(
        &self,
        tenant_id: TenantId,
        product_ref: ProductRef,
        now: DateTime<Utc>,
    ) -> DomainResult<i64> {
        (**self).active_reserved_quantity(tenant_id, product_ref, now)
    }

    fn expiring_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> DomainResult<Vec<Reservation>> {
        (**self).expiring_before(cutoff, limit)
    }
}

type RowKey = (TenantId, ReservationId);

#[derive(Debug, Default)]
struct ReservationCells {
    rows: HashMap<RowKey, Reservation>,
    /// Only open rows are indexed; terminal transitions unindex them.
    by_expiry: BTreeMap<DateTime<Utc>, Vec<RowKey>>,
}

impl ReservationCells {
    fn index(&mut self, row: &Reservation) {
        if row.status == ReservationStatus::Reserved {
            self.by_expiry
                .entry(row.expires_at)
                .or_default()
                .push((row.tenant_id, row.id));
        }
    }

    fn unindex(&mut self, expires_at: DateTime<Utc>, key: RowKey) {
        if let Some(bucket) = self.by_expiry.get_mut(&expires_at) {
            bucket.retain(|k| *k != key);
            if bucket.is_empty() {
                self.by_expiry.remove(&expires_at);
            }
        }
    }
}

/// In-memory reservation store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryReservationStore {
    cells: RwLock<ReservationCells>,
}

impl InMemoryReservationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReservationStore for InMemoryReservationStore {
    fn insert(&self, reservation: Reservation) -> DomainResult<()> {
        let mut cells = self
            .cells
            .write()
            .map_err(|_| DomainError::storage("reservation store lock poisoned"))?;

        let key = (reservation.tenant_id, reservation.id);
        if cells.rows.contains_key(&key) {
            return Err(DomainError::conflict(format!(
                "reservation {} already exists",
                reservation.id
            )));
        }

        // One active hold per owner within a tenant. Of two racers who both
        // opened fresh rows, one wins; the loser retries onto the winner's row.
        let now = Utc::now();
        if reservation.is_active(now) {
            let clash = cells.rows.values().any(|row| {
                row.tenant_id == reservation.tenant_id
                    && row.owner_key == reservation.owner_key
                    && row.is_active(now)
            });
            if clash {
                return Err(DomainError::conflict(format!(
                    "owner {} already holds an active reservation",
                    reservation.owner_key
                )));
            }
        }

        cells.index(&reservation);
        cells.rows.insert(key, reservation);
        Ok(())
    }

    fn update(&self, reservation: Reservation, expected: ExpectedVersion) -> DomainResult<()> {
        let mut cells = self
            .cells
            .write()
            .map_err(|_| DomainError::storage("reservation store lock poisoned"))?;

        let key = (reservation.tenant_id, reservation.id);
        let (stored_version, stored_expires_at) = match cells.rows.get(&key) {
            Some(stored) => (stored.version, stored.expires_at),
            None => return Err(DomainError::not_found()),
        };
        expected.check(stored_version)?;

        cells.unindex(stored_expires_at, key);
        cells.index(&reservation);
        cells.rows.insert(key, reservation);
        Ok(())
    }

    fn get(&self, tenant_id: TenantId, id: ReservationId) -> DomainResult<Option<Reservation>> {
        let cells = self
            .cells
            .read()
            .map_err(|_| DomainError::storage("reservation store lock poisoned"))?;
        Ok(cells.rows.get(&(tenant_id, id)).cloned())
    }

    fn find_active_by_owner(
        &self,
        tenant_id: TenantId,
        owner_key: &OwnerKey,
        now: DateTime<Utc>,
    ) -> DomainResult<Option<Reservation>> {
        let cells = self
            .cells
            .read()
            .map_err(|_| DomainError::storage("reservation store lock poisoned"))?;
        Ok(cells
            .rows
            .values()
            .filter(|row| {
                row.tenant_id == tenant_id && &row.owner_key == owner_key && row.is_active(now)
            })
            .max_by_key(|row| (row.created_at, *row.id.as_uuid()))
            .cloned())
    }

    fn active_reserved_quantity(
        &self,
        tenant_id: TenantId,
        product_ref: ProductRef,
        now: DateTime<Utc>,
    ) -> DomainResult<i64> {
        let cells = self
            .cells
            .read()
            .map_err(|_| DomainError::storage("reservation store lock poisoned"))?;
        Ok(cells
            .rows
            .values()
            .filter(|row| row.tenant_id == tenant_id && row.is_active(now))
            .map(|row| row.quantity_of(product_ref))
            .sum())
    }

    fn expiring_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> DomainResult<Vec<Reservation>> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let cells = self
            .cells
            .read()
            .map_err(|_| DomainError::storage("reservation store lock poisoned"))?;

        let mut due = Vec::new();
        for (_, bucket) in cells.by_expiry.range(..=cutoff) {
            for key in bucket {
                if let Some(row) = cells.rows.get(key) {
                    due.push(row.clone());
                    if due.len() >= limit {
                        return Ok(due);
                    }
                }
            }
        }
        Ok(due)
    }
}
