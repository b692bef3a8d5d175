//! `stocklock-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! strongly-typed identifiers, owner keys, the shared error taxonomy, and the
//! optimistic-versioning vocabulary used by every store.

pub mod error;
pub mod id;
pub mod owner;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use id::{
    CartId, LedgerEntryId, OrderId, ProductId, ProductRef, ReservationId, ShopperId, TenantId,
    VariantId,
};
pub use owner::OwnerKey;
pub use version::{Entity, ExpectedVersion, Versioned};
