//! `stocklock-auth` — storefront identity boundary (zero-trust).
//!
//! This crate is intentionally decoupled from HTTP and storage. It models the
//! claims a storefront token carries, validates tokens, and resolves the
//! owner key a request shops under.

pub mod claims;
pub mod jwt;
pub mod roles;

pub use claims::{validate_claims, ShopperClaims, TokenValidationError};
pub use jwt::{Hs256JwtValidator, JwtValidator};
pub use roles::Role;
