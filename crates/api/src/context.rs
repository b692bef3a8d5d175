use stocklock_auth::Role;
use stocklock_core::{OwnerKey, ShopperId, TenantId};

/// Tenant context for a request.
///
/// This is immutable and must be present for all storefront routes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant_id: TenantId,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId) -> Self {
        Self { tenant_id }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

/// Shopper context for a request: who is shopping and what they may touch.
///
/// The owner key is resolved from the token claims (shopper id when
/// authenticated, session fingerprint for guests) and scopes every cart and
/// reservation the request can reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShopperContext {
    owner_key: OwnerKey,
    shopper_id: Option<ShopperId>,
    roles: Vec<Role>,
}

impl ShopperContext {
    pub fn new(owner_key: OwnerKey, shopper_id: Option<ShopperId>, roles: Vec<Role>) -> Self {
        Self {
            owner_key,
            shopper_id,
            roles,
        }
    }

    pub fn owner_key(&self) -> &OwnerKey {
        &self.owner_key
    }

    pub fn shopper_id(&self) -> Option<ShopperId> {
        self.shopper_id
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    pub fn is_guest(&self) -> bool {
        self.owner_key.is_guest()
    }

    pub fn has_role(&self, role: &Role) -> bool {
        self.roles.contains(role)
    }
}
