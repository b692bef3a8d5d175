//! Cart store, keyed by tenant + owner.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use stocklock_core::{DomainError, DomainResult, ExpectedVersion, OwnerKey, TenantId};
use stocklock_carts::Cart;

/// Version-guarded store of carts, one per owner key per tenant.
///
/// `upsert` compares the expectation against the stored row's version; an
/// absent row counts as version 0, so creating a cart is `Exact(0)` and two
/// racers opening the same owner's cart resolve to one winner.
pub trait CartStore: Send + Sync {
    fn get(&self, tenant_id: TenantId, owner_key: &OwnerKey) -> DomainResult<Option<Cart>>;

    fn upsert(&self, cart: Cart, expected: ExpectedVersion) -> DomainResult<()>;

    /// Drop the owner's cart. Removing an absent cart is a no-op.
    fn remove(&self, tenant_id: TenantId, owner_key: &OwnerKey) -> DomainResult<()>;
}

impl<S> CartStore for Arc<S>
where
    S: CartStore + ?Sized,
{
    fn get(&self, tenant_id: TenantId, owner_key: &OwnerKey) -> DomainResult<Option<Cart>> {
        (**self).get(tenant_id, owner_key)
    }

    fn upsert(&self, cart: Cart, expected: ExpectedVersion) -> DomainResult<()> {
        (**self).upsert(cart, expected)
    }

    fn remove(&self, tenant_id: TenantId, owner_key: &OwnerKey) -> DomainResult<()> {
        (**self).remove(tenant_id, owner_key)
    }
}

/// In-memory cart store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryCartStore {
    carts: RwLock<HashMap<(TenantId, OwnerKey), Cart>>,
}

impl InMemoryCartStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CartStore for InMemoryCartStore {
    fn get(&self, tenant_id: TenantId, owner_key: &OwnerKey) -> DomainResult<Option<Cart>> {
        let carts = self
            .carts
            .read()
            .map_err(|_| DomainError::storage("cart store lock poisoned"))?;
        Ok(carts.get(&(tenant_id, owner_key.clone())).cloned())
    }

    fn upsert(&self, cart: Cart, expected: ExpectedVersion) -> DomainResult<()> {
        let mut carts = self
            .carts
            .write()
            .map_err(|_| DomainError::storage("cart store lock poisoned"))?;

        let key = (cart.tenant_id, cart.owner_key.clone());
        let stored_version = carts.get(&key).map(|c| c.version).unwrap_or(0);
        expected.check(stored_version)?;

        carts.insert(key, cart);
        Ok(())
    }

    fn remove(&self, tenant_id: TenantId, owner_key: &OwnerKey) -> DomainResult<()> {
        let mut carts = self
            .carts
            .write()
            .map_err(|_| DomainError::storage("cart store lock poisoned"))?;
        carts.remove(&(tenant_id, owner_key.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stocklock_core::ShopperId;

    fn test_owner() -> OwnerKey {
        OwnerKey::shopper(ShopperId::new())
    }

    #[test]
    fn create_expects_version_zero() {
        let store = InMemoryCartStore::new();
        let tenant_id = TenantId::new();
        let owner = test_owner();
        let cart = Cart::open(tenant_id, owner.clone(), Utc::now());

        store.upsert(cart.clone(), ExpectedVersion::Exact(0)).unwrap();
        assert_eq!(store.get(tenant_id, &owner).unwrap(), Some(cart.clone()));

        // A second racer creating the same owner's cart loses.
        let racer = Cart::open(tenant_id, owner.clone(), Utc::now());
        let err = store.upsert(racer, ExpectedVersion::Exact(0)).unwrap_err();
        assert!(err.is_retriable());
    }

    #[test]
    fn update_rejects_stale_versions() {
        let store = InMemoryCartStore::new();
        let tenant_id = TenantId::new();
        let owner = test_owner();
        let now = Utc::now();
        let cart = Cart::open(tenant_id, owner.clone(), now);
        store.upsert(cart.clone(), ExpectedVersion::Exact(0)).unwrap();

        let mut updated = cart.clone();
        updated.clear_after_order(now);
        store
            .upsert(updated, ExpectedVersion::Exact(cart.version))
            .unwrap();

        let mut stale = cart.clone();
        stale.clear_after_order(now);
        assert!(store
            .upsert(stale, ExpectedVersion::Exact(cart.version))
            .is_err());
    }

    #[test]
    fn remove_is_idempotent_and_scoped() {
        let store = InMemoryCartStore::new();
        let tenant_id = TenantId::new();
        let other_tenant = TenantId::new();
        let owner = test_owner();
        let cart = Cart::open(tenant_id, owner.clone(), Utc::now());
        store.upsert(cart, ExpectedVersion::Exact(0)).unwrap();

        store.remove(other_tenant, &owner).unwrap();
        assert!(store.get(tenant_id, &owner).unwrap().is_some());

        store.remove(tenant_id, &owner).unwrap();
        store.remove(tenant_id, &owner).unwrap();
        assert!(store.get(tenant_id, &owner).unwrap().is_none());
    }
}
