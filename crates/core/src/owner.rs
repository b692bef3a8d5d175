//! Cart ownership keys.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::ShopperId;

/// Stable identifier for cart ownership within a tenant.
///
/// Authenticated shoppers own their cart through their shopper id; guests own
/// theirs through the session fingerprint minted by the storefront. Both render
/// as a prefixed string (`shopper:<uuid>` / `session:<fingerprint>`) so the key
/// can travel through tokens, storage, and logs unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OwnerKey {
    Shopper(ShopperId),
    Session(String),
}

impl OwnerKey {
    pub fn shopper(id: ShopperId) -> Self {
        Self::Shopper(id)
    }

    /// Build a guest owner key from a session fingerprint.
    pub fn session(fingerprint: impl Into<String>) -> Result<Self, DomainError> {
        let fingerprint = fingerprint.into();
        let trimmed = fingerprint.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("session fingerprint is empty"));
        }
        if trimmed.len() > 128 {
            return Err(DomainError::validation(
                "session fingerprint exceeds 128 characters",
            ));
        }
        Ok(Self::Session(trimmed.to_string()))
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Self::Session(_))
    }
}

impl core::fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Shopper(id) => write!(f, "shopper:{id}"),
            Self::Session(fingerprint) => write!(f, "session:{fingerprint}"),
        }
    }
}

impl FromStr for OwnerKey {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("shopper", id)) => Ok(Self::Shopper(id.parse()?)),
            Some(("session", fingerprint)) => Self::session(fingerprint),
            _ => Err(DomainError::invalid_id(format!(
                "OwnerKey: expected shopper:<uuid> or session:<fingerprint>, got {s:?}"
            ))),
        }
    }
}

impl TryFrom<String> for OwnerKey {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OwnerKey> for String {
    fn from(value: OwnerKey) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shopper_key_round_trips() {
        let key = OwnerKey::shopper(ShopperId::new());
        let parsed: OwnerKey = key.to_string().parse().unwrap();
        assert_eq!(key, parsed);
        assert!(!key.is_guest());
    }

    #[test]
    fn session_key_trims_and_round_trips() {
        let key = OwnerKey::session("  fp-123  ").unwrap();
        assert_eq!(key.to_string(), "session:fp-123");
        assert!(key.is_guest());
    }

    #[test]
    fn empty_fingerprint_rejected() {
        match OwnerKey::session("   ") {
            Err(DomainError::Validation(_)) => {}
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_prefix_rejected() {
        match "merchant:abc".parse::<OwnerKey>() {
            Err(DomainError::InvalidId(_)) => {}
            other => panic!("expected invalid id error, got {other:?}"),
        }
    }
}
