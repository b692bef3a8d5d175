use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use stocklock_core::DomainError;

/// Map a domain failure onto the wire.
///
/// Shopper-correctable failures carry their detail so the storefront can
/// re-prompt; integrity violations surface as opaque 500s (the detail goes to
/// the operator log at the point of failure, never to the shopper).
pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::InsufficientStock {
            requested,
            available,
        } => (
            StatusCode::CONFLICT,
            axum::Json(json!({
                "error": "insufficient_stock",
                "message": "not enough stock available",
                "requested": requested,
                "available": available.max(0),
            })),
        )
            .into_response(),
        DomainError::ConcurrencyConflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        DomainError::ReservationNotActive(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "reservation_not_active", msg)
        }
        DomainError::ReservationExpired { expired_at } => json_error(
            StatusCode::GONE,
            "reservation_expired",
            format!("reservation expired at {expired_at}; re-add the items to reserve again"),
        ),
        DomainError::CouponInvalid(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "coupon_invalid", msg)
        }
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        DomainError::Unauthorized => {
            json_error(StatusCode::FORBIDDEN, "unauthorized", "unauthorized")
        }
        DomainError::LedgerIntegrity(_) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ledger_integrity",
            "stock ledger integrity violation; the operation was aborted",
        ),
        DomainError::Timeout(msg) => json_error(StatusCode::SERVICE_UNAVAILABLE, "timeout", msg),
        DomainError::Storage(_) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            "storage failure",
        ),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
