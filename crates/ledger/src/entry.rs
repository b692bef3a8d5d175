//! Ledger entry types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stocklock_core::{
    DomainError, DomainResult, LedgerEntryId, ProductRef, ReservationId, TenantId,
};

/// Kind of stock movement an entry records.
///
/// `Reserve` and `Release` are zero-delta audit markers: they pin hold
/// activity into the chain without moving the balance (holds are counted from
/// reservation rows). Every other action moves the balance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LedgerAction {
    /// Goods received into sellable stock.
    In,
    /// Goods taken out of sellable stock outside the reservation flow.
    Out,
    /// Manual correction, either direction.
    Adjustment,
    /// One side of a paired move between product refs.
    Transfer,
    /// A hold was placed (marker, delta must be zero).
    Reserve,
    /// A hold was returned to the pool (marker, delta must be zero).
    Release,
    /// A hold became a permanent decrement at order conversion.
    Commit,
}

impl LedgerAction {
    /// Whether entries of this action change `resulting_quantity`.
    pub fn moves_balance(self) -> bool {
        !matches!(self, Self::Reserve | Self::Release)
    }

    /// Sign discipline per action, checked before an entry enters the chain.
    pub fn validate_delta(self, delta: i64) -> DomainResult<()> {
        let ok = match self {
            Self::In => delta > 0,
            Self::Out | Self::Commit => delta < 0,
            Self::Adjustment | Self::Transfer => delta != 0,
            Self::Reserve | Self::Release => delta == 0,
        };
        if ok {
            Ok(())
        } else {
            Err(DomainError::validation(format!(
                "delta {delta} is not valid for a {self} entry"
            )))
        }
    }
}

impl core::fmt::Display for LedgerAction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Self::In => "IN",
            Self::Out => "OUT",
            Self::Adjustment => "ADJUSTMENT",
            Self::Transfer => "TRANSFER",
            Self::Reserve => "RESERVE",
            Self::Release => "RELEASE",
            Self::Commit => "COMMIT",
        };
        f.write_str(s)
    }
}

/// What an entry points back at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryReference {
    /// The reservation whose hold this entry records or settles.
    Reservation(ReservationId),
    /// The other side of a transfer pair.
    Counterpart(ProductRef),
}

/// One immutable row of a product's movement chain.
///
/// Entries are never updated or deleted. `sequence` is per tenant + product
/// ref, gap-free from 1; `resulting_quantity` is the running balance after
/// this entry and must equal the predecessor's plus `delta_quantity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub tenant_id: TenantId,
    pub product_ref: ProductRef,
    pub sequence: u64,
    pub delta_quantity: i64,
    pub resulting_quantity: i64,
    pub action: LedgerAction,
    pub reference: Option<EntryReference>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Draft entry before the chain assigns sequence and resulting quantity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub product_ref: ProductRef,
    pub action: LedgerAction,
    pub delta_quantity: i64,
    pub reference: Option<EntryReference>,
    pub reason: Option<String>,
}

impl NewEntry {
    pub fn stock_in(product_ref: ProductRef, quantity: i64, reason: Option<String>) -> Self {
        Self {
            product_ref,
            action: LedgerAction::In,
            delta_quantity: quantity,
            reference: None,
            reason,
        }
    }

    pub fn stock_out(product_ref: ProductRef, quantity: i64, reason: Option<String>) -> Self {
        Self {
            product_ref,
            action: LedgerAction::Out,
            delta_quantity: -quantity,
            reference: None,
            reason,
        }
    }

    pub fn adjustment(product_ref: ProductRef, delta: i64, reason: String) -> Self {
        Self {
            product_ref,
            action: LedgerAction::Adjustment,
            delta_quantity: delta,
            reference: None,
            reason: Some(reason),
        }
    }

    pub fn transfer(
        product_ref: ProductRef,
        counterpart: ProductRef,
        delta: i64,
        reason: Option<String>,
    ) -> Self {
        Self {
            product_ref,
            action: LedgerAction::Transfer,
            delta_quantity: delta,
            reference: Some(EntryReference::Counterpart(counterpart)),
            reason,
        }
    }

    pub fn reserve_marker(product_ref: ProductRef, reservation_id: ReservationId) -> Self {
        Self {
            product_ref,
            action: LedgerAction::Reserve,
            delta_quantity: 0,
            reference: Some(EntryReference::Reservation(reservation_id)),
            reason: None,
        }
    }

    pub fn release_marker(
        product_ref: ProductRef,
        reservation_id: ReservationId,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            product_ref,
            action: LedgerAction::Release,
            delta_quantity: 0,
            reference: Some(EntryReference::Reservation(reservation_id)),
            reason: Some(reason.into()),
        }
    }

    pub fn commit(product_ref: ProductRef, reservation_id: ReservationId, quantity: i64) -> Self {
        Self {
            product_ref,
            action: LedgerAction::Commit,
            delta_quantity: -quantity,
            reference: Some(EntryReference::Reservation(reservation_id)),
            reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_discipline_per_action() {
        assert!(LedgerAction::In.validate_delta(5).is_ok());
        assert!(LedgerAction::In.validate_delta(-5).is_err());
        assert!(LedgerAction::In.validate_delta(0).is_err());

        assert!(LedgerAction::Out.validate_delta(-5).is_ok());
        assert!(LedgerAction::Out.validate_delta(5).is_err());

        assert!(LedgerAction::Commit.validate_delta(-1).is_ok());
        assert!(LedgerAction::Commit.validate_delta(0).is_err());

        assert!(LedgerAction::Adjustment.validate_delta(-3).is_ok());
        assert!(LedgerAction::Adjustment.validate_delta(3).is_ok());
        assert!(LedgerAction::Adjustment.validate_delta(0).is_err());
    }

    #[test]
    fn markers_must_carry_zero_delta() {
        assert!(LedgerAction::Reserve.validate_delta(0).is_ok());
        assert!(LedgerAction::Reserve.validate_delta(1).is_err());
        assert!(LedgerAction::Release.validate_delta(0).is_ok());
        assert!(LedgerAction::Release.validate_delta(-1).is_err());

        assert!(!LedgerAction::Reserve.moves_balance());
        assert!(!LedgerAction::Release.moves_balance());
        assert!(LedgerAction::Commit.moves_balance());
    }

    #[test]
    fn constructors_fix_action_and_sign() {
        let product = ProductRef::product(stocklock_core::ProductId::new());
        let rid = ReservationId::new();

        let received = NewEntry::stock_in(product, 10, None);
        assert_eq!(received.delta_quantity, 10);

        let committed = NewEntry::commit(product, rid, 4);
        assert_eq!(committed.delta_quantity, -4);
        assert_eq!(
            committed.reference,
            Some(EntryReference::Reservation(rid))
        );

        let marker = NewEntry::reserve_marker(product, rid);
        assert_eq!(marker.delta_quantity, 0);
    }
}
