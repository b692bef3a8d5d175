//! Catalog lookups.
//!
//! The engine does not own the product catalog; it only needs a snapshot per
//! product ref to price and name a hold at the moment it is placed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use stocklock_core::{DomainError, DomainResult, ProductRef, TenantId};

/// What the engine needs to know about a product right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductSnapshot {
    pub product_ref: ProductRef,
    pub name: String,
    /// Minor units.
    pub unit_price: u64,
    pub currency: String,
    /// Unsellable products (unpublished, archived) cannot be held.
    pub sellable: bool,
}

/// Read-only catalog access.
pub trait Catalog: Send + Sync {
    /// Snapshot of a product; `NotFound` when the tenant has no such product.
    fn product(&self, tenant_id: TenantId, product_ref: ProductRef)
        -> DomainResult<ProductSnapshot>;
}

impl<C> Catalog for Arc<C>
where
    C: Catalog + ?Sized,
{
    fn product(
        &self,
        tenant_id: TenantId,
        product_ref: ProductRef,
    ) -> DomainResult<ProductSnapshot> {
        (**self).product(tenant_id, product_ref)
    }
}

/// In-memory catalog.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    products: RwLock<HashMap<(TenantId, ProductRef), ProductSnapshot>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, tenant_id: TenantId, snapshot: ProductSnapshot) -> DomainResult<()> {
        let mut products = self
            .products
            .write()
            .map_err(|_| DomainError::storage("catalog lock poisoned"))?;
        products.insert((tenant_id, snapshot.product_ref), snapshot);
        Ok(())
    }
}

impl Catalog for InMemoryCatalog {
    fn product(
        &self,
        tenant_id: TenantId,
        product_ref: ProductRef,
    ) -> DomainResult<ProductSnapshot> {
        let products = self
            .products
            .read()
            .map_err(|_| DomainError::storage("catalog lock poisoned"))?;
        products
            .get(&(tenant_id, product_ref))
            .cloned()
            .ok_or(DomainError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stocklock_core::ProductId;

    #[test]
    fn lookup_is_tenant_scoped() {
        let catalog = InMemoryCatalog::new();
        let tenant_id = TenantId::new();
        let product = ProductRef::product(ProductId::new());

        catalog
            .upsert(
                tenant_id,
                ProductSnapshot {
                    product_ref: product,
                    name: "Enamel Mug".to_string(),
                    unit_price: 1450,
                    currency: "USD".to_string(),
                    sellable: true,
                },
            )
            .unwrap();

        let found = catalog.product(tenant_id, product).unwrap();
        assert_eq!(found.name, "Enamel Mug");

        assert!(matches!(
            catalog.product(TenantId::new(), product),
            Err(DomainError::NotFound)
        ));
    }
}
