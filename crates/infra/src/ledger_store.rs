//! Append-only stock ledger store.
//!
//! One chain per tenant + product ref. Appends are conditional: each draft in
//! a batch carries an [`ExpectedHead`], and the whole batch lands atomically
//! or not at all. The conditional append is what turns an availability check
//! into a linearizable decision.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use stocklock_core::{DomainError, DomainResult, ProductRef, ReservationId, TenantId};
use stocklock_ledger::{next_entry, EntryReference, ExpectedHead, HeadState, LedgerEntry, NewEntry};

/// Key of one product movement chain.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ChainKey {
    pub tenant_id: TenantId,
    pub product_ref: ProductRef,
}

/// A draft entry paired with the head it expects to land on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalAppend {
    pub draft: NewEntry,
    pub expected: ExpectedHead,
}

impl ConditionalAppend {
    /// Append only if the chain head is still where the caller observed it.
    pub fn at(draft: NewEntry, head: Option<HeadState>) -> Self {
        Self {
            draft,
            expected: ExpectedHead::At(head),
        }
    }

    /// Append unconditionally. For zero-delta audit markers only; anything
    /// that moves the balance must state the head it decided against.
    pub fn any(draft: NewEntry) -> Self {
        Self {
            draft,
            expected: ExpectedHead::Any,
        }
    }
}

/// Append-only, tenant-scoped stock ledger.
///
/// `append()`:
/// - rejects batches that touch the same product ref twice (the expectations
///   would alias each other)
/// - checks every draft's expected head against the current chain
/// - assigns sequence numbers and resulting quantities via the chain math
/// - persists atomically (all drafts or none)
///
/// Implementations must keep each chain gap-free and never mutate or delete
/// stored entries.
pub trait LedgerStore: Send + Sync {
    /// Conditionally append a batch of drafts, atomically.
    fn append(
        &self,
        tenant_id: TenantId,
        batch: Vec<ConditionalAppend>,
    ) -> DomainResult<Vec<LedgerEntry>>;

    /// Current head of a product's chain; `None` when nothing has moved yet.
    fn head(&self, tenant_id: TenantId, product_ref: ProductRef) -> DomainResult<Option<HeadState>>;

    /// On-hand balance, straight from the chain head.
    fn balance(&self, tenant_id: TenantId, product_ref: ProductRef) -> DomainResult<i64> {
        Ok(self
            .head(tenant_id, product_ref)?
            .map(|h| h.resulting_quantity)
            .unwrap_or(0))
    }

    /// Full chain for a tenant + product, in sequence order.
    fn entries(&self, tenant_id: TenantId, product_ref: ProductRef)
        -> DomainResult<Vec<LedgerEntry>>;

    /// All entries referencing a reservation, across the tenant's chains.
    fn entries_for_reservation(
        &self,
        tenant_id: TenantId,
        reservation_id: ReservationId,
    ) -> DomainResult<Vec<LedgerEntry>>;
}

impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    fn append(
        &self,
        tenant_id: TenantId,
        batch: Vec<ConditionalAppend>,
    ) -> DomainResult<Vec<LedgerEntry>> {
        (**self).append(tenant_id, batch)
    }

    fn head(&self, tenant_id: TenantId, product_ref: ProductRef) -> DomainResult<Option<HeadState>> {
        (**self).head(tenant_id, product_ref)
    }

    fn balance(&self, tenant_id: TenantId, product_ref: ProductRef) -> DomainResult<i64> {
        (**self).balance(tenant_id, product_ref)
    }

    fn entries(
        &self,
        tenant_id: TenantId,
        product_ref: ProductRef,
    ) -> DomainResult<Vec<LedgerEntry>> {
        (**self).entries(tenant_id, product_ref)
    }

    fn entries_for_reservation(
        &self,
        tenant_id: TenantId,
        reservation_id: ReservationId,
    ) -> DomainResult<Vec<LedgerEntry>> {
        (**self).entries_for_reservation(tenant_id, reservation_id)
    }
}

/// In-memory ledger store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    chains: RwLock<HashMap<ChainKey, Vec<LedgerEntry>>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn append(
        &self,
        tenant_id: TenantId,
        batch: Vec<ConditionalAppend>,
    ) -> DomainResult<Vec<LedgerEntry>> {
        if batch.is_empty() {
            return Ok(vec![]);
        }

        // Two drafts for the same chain would race each other within the batch.
        for (idx, item) in batch.iter().enumerate() {
            let duplicated = batch[..idx]
                .iter()
                .any(|earlier| earlier.draft.product_ref == item.draft.product_ref);
            if duplicated {
                return Err(DomainError::validation(format!(
                    "batch contains the same product ref twice (index {idx})"
                )));
            }
        }

        let mut chains = self
            .chains
            .write()
            .map_err(|_| DomainError::storage("ledger store lock poisoned"))?;

        // Phase 1: check every expectation and materialize every draft against
        // the current heads. Nothing is written until the whole batch passes.
        let now = Utc::now();
        let mut accepted = Vec::with_capacity(batch.len());
        for item in batch {
            let key = ChainKey {
                tenant_id,
                product_ref: item.draft.product_ref,
            };
            let current = chains.get(&key).and_then(|c| c.last()).map(HeadState::of);

            if !item.expected.matches(current) {
                return Err(DomainError::conflict(format!(
                    "chain for {} moved: expected head {:?}, found {:?}",
                    item.draft.product_ref, item.expected, current
                )));
            }
            // A head that matches on sequence but disagrees on balance means
            // the caller read data this chain never produced.
            if let (ExpectedHead::At(Some(expected)), Some(actual)) = (item.expected, current) {
                if expected.resulting_quantity != actual.resulting_quantity {
                    return Err(DomainError::integrity(format!(
                        "chain for {} at sequence {} has balance {}, caller observed {}",
                        item.draft.product_ref,
                        actual.sequence,
                        actual.resulting_quantity,
                        expected.resulting_quantity
                    )));
                }
            }

            let entry = next_entry(tenant_id, current, item.draft, now)?;
            accepted.push((key, entry));
        }

        // Phase 2: append everything (append-only).
        let mut committed = Vec::with_capacity(accepted.len());
        for (key, entry) in accepted {
            chains.entry(key).or_default().push(entry.clone());
            committed.push(entry);
        }

        Ok(committed)
    }

    fn head(&self, tenant_id: TenantId, product_ref: ProductRef) -> DomainResult<Option<HeadState>> {
        let chains = self
            .chains
            .read()
            .map_err(|_| DomainError::storage("ledger store lock poisoned"))?;
        let key = ChainKey {
            tenant_id,
            product_ref,
        };
        Ok(chains.get(&key).and_then(|c| c.last()).map(HeadState::of))
    }

    fn entries(
        &self,
        tenant_id: TenantId,
        product_ref: ProductRef,
    ) -> DomainResult<Vec<LedgerEntry>> {
        let chains = self
            .chains
            .read()
            .map_err(|_| DomainError::storage("ledger store lock poisoned"))?;
        let key = ChainKey {
            tenant_id,
            product_ref,
        };
        Ok(chains.get(&key).cloned().unwrap_or_default())
    }

    fn entries_for_reservation(
        &self,
        tenant_id: TenantId,
        reservation_id: ReservationId,
    ) -> DomainResult<Vec<LedgerEntry>> {
        let chains = self
            .chains
            .read()
            .map_err(|_| DomainError::storage("ledger store lock poisoned"))?;

        let mut matched: Vec<LedgerEntry> = chains
            .iter()
            .filter(|(key, _)| key.tenant_id == tenant_id)
            .flat_map(|(_, chain)| chain.iter())
            .filter(|entry| {
                entry.reference == Some(EntryReference::Reservation(reservation_id))
            })
            .cloned()
            .collect();
        matched.sort_by_key(|entry| (entry.created_at, *entry.id.as_uuid()));
        Ok(matched)
    }
}
