//! Reservation rows and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stocklock_core::{
    CartId, DomainError, DomainResult, Entity, OrderId, OwnerKey, ProductRef, ReservationId,
    TenantId, Versioned,
};

/// Lifecycle of a reservation. `Reserved` is the only non-terminal state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Reserved,
    Committed,
    Released,
    Expired,
}

impl ReservationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Reserved)
    }
}

/// One held line: quantity of a product ref at the price locked when the hold
/// was first placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationItem {
    pub product_ref: ProductRef,
    pub quantity: i64,
    /// Minor units; survives catalog price changes for the life of the hold.
    pub unit_price: u64,
}

/// Outcome of an absolute quantity change on one item.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ItemChange {
    pub previous_quantity: i64,
    pub new_quantity: i64,
}

impl ItemChange {
    pub fn delta(&self) -> i64 {
        self.new_quantity - self.previous_quantity
    }
}

/// A time-limited hold on stock, owned by one cart.
///
/// Rows are mutable but every mutation bumps `version`; stores only accept
/// writes whose expected version matches, so concurrent writers lose cleanly
/// instead of clobbering each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub tenant_id: TenantId,
    pub owner_key: OwnerKey,
    pub cart_id: CartId,
    pub items: Vec<ReservationItem>,
    pub status: ReservationStatus,
    pub expires_at: DateTime<Utc>,
    /// Present once the hold converted into an order.
    pub order_id: Option<OrderId>,
    /// Why a terminal row closed (released / expired / converted detail).
    pub closed_reason: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for Reservation {
    type Id = ReservationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl Versioned for Reservation {
    fn version(&self) -> u64 {
        self.version
    }
}

impl Reservation {
    /// Open a fresh hold with no items yet.
    pub fn open(
        tenant_id: TenantId,
        owner_key: OwnerKey,
        cart_id: CartId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ReservationId::new(),
            tenant_id,
            owner_key,
            cart_id,
            items: Vec::new(),
            status: ReservationStatus::Reserved,
            expires_at,
            order_id: None,
            closed_reason: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Active means holdable: status is `reserved` and the window has not
    /// lapsed. Expired-but-unswept rows are inactive everywhere.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Reserved && now < self.expires_at
    }

    pub fn quantity_of(&self, product_ref: ProductRef) -> i64 {
        self.items
            .iter()
            .find(|item| item.product_ref == product_ref)
            .map(|item| item.quantity)
            .unwrap_or(0)
    }

    pub fn total_quantity(&self) -> i64 {
        self.items.iter().map(|item| item.quantity).sum()
    }

    fn ensure_active(&self, now: DateTime<Utc>) -> DomainResult<()> {
        match self.status {
            ReservationStatus::Reserved => {
                if now >= self.expires_at {
                    Err(DomainError::expired(self.expires_at))
                } else {
                    Ok(())
                }
            }
            status => Err(DomainError::not_active(format!(
                "reservation {} is {status:?}",
                self.id
            ))),
        }
    }

    fn touch(&mut self, expires_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.expires_at = expires_at;
        self.updated_at = now;
        self.version += 1;
    }

    /// Add quantity to an item (creating it at the given locked price),
    /// refreshing the hold window. Returns the item's new quantity.
    pub fn add_quantity(
        &mut self,
        product_ref: ProductRef,
        quantity: i64,
        unit_price: u64,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DomainResult<i64> {
        self.ensure_active(now)?;
        if quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }

        let new_quantity = match self
            .items
            .iter_mut()
            .find(|item| item.product_ref == product_ref)
        {
            // The price stays locked at what the first hold saw.
            Some(item) => {
                item.quantity += quantity;
                item.quantity
            }
            None => {
                self.items.push(ReservationItem {
                    product_ref,
                    quantity,
                    unit_price,
                });
                quantity
            }
        };
        self.touch(expires_at, now);
        Ok(new_quantity)
    }

    /// Set an item to an absolute quantity; zero removes the line.
    pub fn set_quantity(
        &mut self,
        product_ref: ProductRef,
        quantity: i64,
        unit_price: u64,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DomainResult<ItemChange> {
        self.ensure_active(now)?;
        if quantity < 0 {
            return Err(DomainError::validation("quantity cannot be negative"));
        }

        let previous_quantity = self.quantity_of(product_ref);
        if quantity == 0 {
            self.items.retain(|item| item.product_ref != product_ref);
        } else {
            match self
                .items
                .iter_mut()
                .find(|item| item.product_ref == product_ref)
            {
                Some(item) => item.quantity = quantity,
                None => self.items.push(ReservationItem {
                    product_ref,
                    quantity,
                    unit_price,
                }),
            }
        }
        self.touch(expires_at, now);
        Ok(ItemChange {
            previous_quantity,
            new_quantity: quantity,
        })
    }

    /// Push the hold window forward without touching items.
    pub fn extend_to(&mut self, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_active(now)?;
        if expires_at <= self.expires_at {
            return Err(DomainError::validation(
                "extension must move the expiry forward",
            ));
        }
        self.touch(expires_at, now);
        Ok(())
    }

    pub fn mark_released(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::not_active(format!(
                "reservation {} is {:?}",
                self.id, self.status
            )));
        }
        self.status = ReservationStatus::Released;
        self.closed_reason = Some(reason.into());
        self.updated_at = now;
        self.version += 1;
        Ok(())
    }

    /// Sweeper transition. Only rows whose window has actually lapsed qualify.
    pub fn mark_expired(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::not_active(format!(
                "reservation {} is {:?}",
                self.id, self.status
            )));
        }
        if now < self.expires_at {
            return Err(DomainError::validation(format!(
                "reservation {} does not expire until {}",
                self.id, self.expires_at
            )));
        }
        self.status = ReservationStatus::Expired;
        self.closed_reason = Some("expired".to_string());
        self.updated_at = now;
        self.version += 1;
        Ok(())
    }

    pub fn mark_committed(&mut self, order_id: OrderId, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_active(now)?;
        if self.items.is_empty() {
            return Err(DomainError::validation(
                "cannot convert a reservation with no items",
            ));
        }
        self.status = ReservationStatus::Committed;
        self.order_id = Some(order_id);
        self.closed_reason = Some(format!("converted to order {order_id}"));
        self.updated_at = now;
        self.version += 1;
        Ok(())
    }

    /// Undo `mark_committed` when the stock settlement could not land. The
    /// hold stands again exactly as it was, window included.
    pub fn revert_commit(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != ReservationStatus::Committed {
            return Err(DomainError::validation(format!(
                "reservation {} is {:?}, nothing to revert",
                self.id, self.status
            )));
        }
        self.status = ReservationStatus::Reserved;
        self.order_id = None;
        self.closed_reason = None;
        self.updated_at = now;
        self.version += 1;
        Ok(())
    }
}
