use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Role identifier carried in storefront tokens.
///
/// Roles are opaque strings at this layer; the API decides what each role may
/// touch. Shopper tokens usually carry none, merchant dashboard tokens carry
/// `merchant`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    /// The role that unlocks stock administration routes.
    pub fn merchant() -> Self {
        Self::new("merchant")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
