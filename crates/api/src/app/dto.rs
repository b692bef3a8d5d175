use axum::http::StatusCode;
use chrono::Duration as ChronoDuration;
use serde::Deserialize;
use serde_json::json;

use stocklock_core::{OrderId, OwnerKey, ProductRef, ReservationId};
use stocklock_infra::CartView;
use stocklock_reservations::Reservation;

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct ReserveBody {
    pub product_id: String,
    pub variant_id: Option<String>,
    pub quantity: i64,
    pub ttl_seconds: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ExtendBody {
    pub minutes: i64,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseBody {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConvertBody {
    pub order_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CartItemBody {
    pub product_id: String,
    pub variant_id: Option<String>,
    pub quantity: i64,
    pub ttl_seconds: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateQuantityBody {
    pub product_id: String,
    pub variant_id: Option<String>,
    pub quantity: i64,
}

#[derive(Debug, Deserialize)]
pub struct RemoveItemBody {
    pub product_id: String,
    pub variant_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CouponBody {
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct MergeBody {
    /// The guest session fingerprint whose cart folds into the caller's.
    pub guest_session: String,
}

#[derive(Debug, Deserialize)]
pub struct StockQuantityBody {
    pub quantity: i64,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AdjustBody {
    pub delta: i64,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct TransferBody {
    pub to_product_id: String,
    pub to_variant_id: Option<String>,
    pub quantity: i64,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VariantQuery {
    pub variant: Option<String>,
}

// -------------------------
// Parsing helpers
// -------------------------

pub fn parse_product_ref(
    product_id: &str,
    variant_id: Option<&str>,
) -> Result<ProductRef, axum::response::Response> {
    let product_id = product_id.parse().map_err(invalid_id)?;
    match variant_id {
        Some(raw) => {
            let variant_id = raw.parse().map_err(invalid_id)?;
            Ok(ProductRef::variant(product_id, variant_id))
        }
        None => Ok(ProductRef::product(product_id)),
    }
}

pub fn parse_reservation_id(raw: &str) -> Result<ReservationId, axum::response::Response> {
    raw.parse().map_err(invalid_id)
}

pub fn parse_order_id(raw: &str) -> Result<OrderId, axum::response::Response> {
    raw.parse().map_err(invalid_id)
}

pub fn parse_guest_session(raw: &str) -> Result<OwnerKey, axum::response::Response> {
    OwnerKey::session(raw).map_err(|e| {
        errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
    })
}

pub fn ttl_from_seconds(
    ttl_seconds: Option<i64>,
) -> Result<Option<ChronoDuration>, axum::response::Response> {
    match ttl_seconds {
        None => Ok(None),
        Some(secs) if secs > 0 => Ok(Some(ChronoDuration::seconds(secs))),
        Some(_) => Err(errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "ttl_seconds must be positive",
        )),
    }
}

fn invalid_id(err: stocklock_core::DomainError) -> axum::response::Response {
    errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", err.to_string())
}

// -------------------------
// Response mapping
// -------------------------

pub fn reservation_json(reservation: &Reservation) -> serde_json::Value {
    json!({
        "reservation_id": reservation.id.to_string(),
        "status": reservation.status,
        "expires_at": reservation.expires_at,
        "items": reservation
            .items
            .iter()
            .map(|item| {
                json!({
                    "product_id": item.product_ref.product_id.to_string(),
                    "variant_id": item.product_ref.variant_id.map(|v| v.to_string()),
                    "quantity": item.quantity,
                    "unit_price": item.unit_price,
                })
            })
            .collect::<Vec<_>>(),
    })
}

pub fn cart_view_json(view: &CartView) -> serde_json::Value {
    json!({
        "cart_id": view.cart.id.to_string(),
        "owner_key": view.cart.owner_key.to_string(),
        "reservation_id": view.cart.reservation_id.map(|id| id.to_string()),
        "hold_expires_at": view.hold_expires_at,
        "items": view
            .cart
            .items
            .iter()
            .map(|item| {
                json!({
                    "product_id": item.product_ref.product_id.to_string(),
                    "variant_id": item.product_ref.variant_id.map(|v| v.to_string()),
                    "name": item.name,
                    "quantity": item.quantity,
                    "unit_price": item.unit_price,
                    "subtotal": item.unit_price.saturating_mul(item.quantity.max(0) as u64),
                })
            })
            .collect::<Vec<_>>(),
        "coupon": view.cart.coupon.as_ref().map(|c| json!({ "code": c.code, "kind": c.kind })),
        "totals": view.totals,
    })
}
