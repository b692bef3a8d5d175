//! Domain error model.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// availability, lifecycle, conflicts). Infrastructure failures enter through
/// the `Storage` variant so callers see one taxonomy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input, non-positive quantity).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,

    /// Authorization failure at the domain boundary.
    #[error("unauthorized")]
    Unauthorized,

    /// Requested quantity cannot be covered by sellable stock.
    #[error("insufficient stock: requested {requested}, available {available}")]
    InsufficientStock { requested: i64, available: i64 },

    /// An optimistic conditional write kept losing and the retry budget ran out.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// The reservation is in a terminal state and cannot serve the operation.
    #[error("reservation not active: {0}")]
    ReservationNotActive(String),

    /// The reservation's hold window has lapsed.
    #[error("reservation expired at {expired_at}")]
    ReservationExpired { expired_at: DateTime<Utc> },

    /// The append-only stock chain is broken. Fatal: never downgraded or
    /// swallowed, always surfaced to operators.
    #[error("ledger integrity violation: {0}")]
    LedgerIntegrity(String),

    /// Coupon rejected by the coupon directory.
    #[error("coupon invalid: {0}")]
    CouponInvalid(String),

    /// The operation's time budget lapsed before the conditional write landed.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Backing store failure (lock poisoning, IO).
    #[error("storage failure: {0}")]
    Storage(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    pub fn insufficient_stock(requested: i64, available: i64) -> Self {
        Self::InsufficientStock {
            requested,
            available,
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::ConcurrencyConflict(msg.into())
    }

    pub fn not_active(msg: impl Into<String>) -> Self {
        Self::ReservationNotActive(msg.into())
    }

    pub fn expired(expired_at: DateTime<Utc>) -> Self {
        Self::ReservationExpired { expired_at }
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::LedgerIntegrity(msg.into())
    }

    pub fn coupon_invalid(msg: impl Into<String>) -> Self {
        Self::CouponInvalid(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Integrity violations must be escalated, never retried or skipped.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::LedgerIntegrity(_))
    }

    /// Conflicts are the one class a bounded retry loop may re-attempt.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict(_))
    }
}
