//! API-side authorization guards.
//!
//! Role checks run at the route boundary, before any store traffic, so the
//! manager and the stores stay auth-agnostic. Shopper routes need no role at
//! all; stock administration needs the merchant role.

use axum::http::StatusCode;
use axum::response::Response;

use stocklock_auth::Role;

use crate::app::errors::json_error;
use crate::context::ShopperContext;

/// Gate for the stock administration surface.
pub fn require_merchant(shopper: &ShopperContext) -> Result<(), Response> {
    if shopper.has_role(&Role::merchant()) {
        return Ok(());
    }
    Err(json_error(
        StatusCode::FORBIDDEN,
        "forbidden",
        "this route requires the merchant role",
    ))
}
