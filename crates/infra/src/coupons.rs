//! Coupon directory.
//!
//! Codes are canonicalized (trimmed, uppercased) so "save10" and " SAVE10 "
//! are the same coupon. Validation answers one question: may this code
//! discount this subtotal right now. Every rejection is a `CouponInvalid`
//! with the reason in the message.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use stocklock_core::{DomainError, DomainResult, TenantId};
use stocklock_carts::{AppliedCoupon, CouponKind};

/// A merchant-configured coupon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CouponRule {
    pub code: String,
    pub kind: CouponKind,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    /// Minor units; zero means no floor.
    pub min_subtotal: u64,
    pub usage_limit: Option<u32>,
}

/// Canonical form of a coupon code.
pub fn canonical_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Coupon validation and usage accounting.
pub trait CouponDirectory: Send + Sync {
    /// Check a code against the subtotal and the rule's schedule and limits.
    fn validate(
        &self,
        tenant_id: TenantId,
        code: &str,
        subtotal: u64,
        now: DateTime<Utc>,
    ) -> DomainResult<AppliedCoupon>;

    /// Count one redemption against the code's usage limit.
    fn record_usage(&self, tenant_id: TenantId, code: &str) -> DomainResult<()>;
}

impl<D> CouponDirectory for Arc<D>
where
    D: CouponDirectory + ?Sized,
{
    fn validate(
        &self,
        tenant_id: TenantId,
        code: &str,
        subtotal: u64,
        now: DateTime<Utc>,
    ) -> DomainResult<AppliedCoupon> {
        (**self).validate(tenant_id, code, subtotal, now)
    }

    fn record_usage(&self, tenant_id: TenantId, code: &str) -> DomainResult<()> {
        (**self).record_usage(tenant_id, code)
    }
}

#[derive(Debug)]
struct CouponCell {
    rule: CouponRule,
    used: u32,
}

/// In-memory coupon directory.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryCouponDirectory {
    cells: RwLock<HashMap<(TenantId, String), CouponCell>>,
}

impl InMemoryCouponDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, tenant_id: TenantId, mut rule: CouponRule) -> DomainResult<()> {
        rule.code = canonical_code(&rule.code);
        let mut cells = self
            .cells
            .write()
            .map_err(|_| DomainError::storage("coupon directory lock poisoned"))?;
        let key = (tenant_id, rule.code.clone());
        cells.insert(key, CouponCell { rule, used: 0 });
        Ok(())
    }

    pub fn usage_count(&self, tenant_id: TenantId, code: &str) -> DomainResult<u32> {
        let cells = self
            .cells
            .read()
            .map_err(|_| DomainError::storage("coupon directory lock poisoned"))?;
        Ok(cells
            .get(&(tenant_id, canonical_code(code)))
            .map(|cell| cell.used)
            .unwrap_or(0))
    }
}

impl CouponDirectory for InMemoryCouponDirectory {
    fn validate(
        &self,
        tenant_id: TenantId,
        code: &str,
        subtotal: u64,
        now: DateTime<Utc>,
    ) -> DomainResult<AppliedCoupon> {
        let canon = canonical_code(code);
        let cells = self
            .cells
            .read()
            .map_err(|_| DomainError::storage("coupon directory lock poisoned"))?;

        let cell = cells
            .get(&(tenant_id, canon.clone()))
            .ok_or_else(|| DomainError::coupon_invalid("unknown code"))?;
        let rule = &cell.rule;

        if let Some(starts_at) = rule.starts_at {
            if now < starts_at {
                return Err(DomainError::coupon_invalid(format!(
                    "not active until {starts_at}"
                )));
            }
        }
        if let Some(ends_at) = rule.ends_at {
            if now > ends_at {
                return Err(DomainError::coupon_invalid(format!("expired at {ends_at}")));
            }
        }
        if let Some(limit) = rule.usage_limit {
            if cell.used >= limit {
                return Err(DomainError::coupon_invalid("usage limit reached"));
            }
        }
        if subtotal < rule.min_subtotal {
            return Err(DomainError::coupon_invalid(format!(
                "subtotal below the {} minimum",
                rule.min_subtotal
            )));
        }

        Ok(AppliedCoupon {
            code: canon,
            kind: rule.kind,
        })
    }

    fn record_usage(&self, tenant_id: TenantId, code: &str) -> DomainResult<()> {
        let mut cells = self
            .cells
            .write()
            .map_err(|_| DomainError::storage("coupon directory lock poisoned"))?;
        let cell = cells
            .get_mut(&(tenant_id, canonical_code(code)))
            .ok_or(DomainError::NotFound)?;
        cell.used += 1;
        Ok(())
    }
}
