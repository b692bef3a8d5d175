use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stocklock_core::{OwnerKey, ShopperId, TenantId};

use crate::Role;

/// JWT claims model (transport-agnostic).
///
/// The minimal claims a storefront token carries once it has been decoded and
/// signature-verified. Guests carry no subject; their session fingerprint is
/// what ties requests to a cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShopperClaims {
    /// Subject: the authenticated shopper, absent for guests.
    pub sub: Option<ShopperId>,

    /// Tenant context for the token (which storefront).
    pub tenant_id: TenantId,

    /// Browser session fingerprint minted by the storefront.
    pub session: String,

    /// Roles granted within the tenant (merchant dashboard tokens carry
    /// `merchant`; shopper tokens usually carry none).
    #[serde(default)]
    pub roles: Vec<Role>,

    /// Issued-at timestamp.
    pub issued_at: DateTime<Utc>,

    /// Expiration timestamp.
    pub expires_at: DateTime<Utc>,
}

impl ShopperClaims {
    /// Resolve the owner key this request shops under: the shopper id when
    /// authenticated, the session fingerprint otherwise.
    pub fn owner_key(&self) -> Result<OwnerKey, TokenValidationError> {
        match self.sub {
            Some(shopper) => Ok(OwnerKey::shopper(shopper)),
            None => OwnerKey::session(self.session.as_str())
                .map_err(|_| TokenValidationError::MissingOwner),
        }
    }

    pub fn has_role(&self, role: &Role) -> bool {
        self.roles.contains(role)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenValidationError {
    #[error("token is malformed or its signature does not verify")]
    Malformed,

    #[error("token has expired")]
    Expired,

    #[error("token not yet valid (issued_at is in the future)")]
    NotYetValid,

    #[error("invalid token time window (expires_at <= issued_at)")]
    InvalidTimeWindow,

    #[error("token carries neither a subject nor a usable session fingerprint")]
    MissingOwner,
}

/// Deterministically validate JWT claims.
///
/// Note: this validates the *claims* only. Signature verification / decoding
/// lives in the `jwt` module.
pub fn validate_claims(
    claims: &ShopperClaims,
    now: DateTime<Utc>,
) -> Result<(), TokenValidationError> {
    if claims.expires_at <= claims.issued_at {
        return Err(TokenValidationError::InvalidTimeWindow);
    }
    if now < claims.issued_at {
        return Err(TokenValidationError::NotYetValid);
    }
    if now >= claims.expires_at {
        return Err(TokenValidationError::Expired);
    }
    claims.owner_key().map(|_| ())
}
