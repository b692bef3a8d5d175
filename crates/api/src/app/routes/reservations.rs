use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Duration as ChronoDuration;

use stocklock_core::ReservationId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::{ShopperContext, TenantContext};

pub fn router() -> Router {
    Router::new()
        .route("/", post(reserve))
        .route("/:id", get(get_reservation))
        .route("/:id/extend", post(extend))
        .route("/:id/release", post(release))
        .route("/:id/convert", post(convert))
}

/// Place (or grow) the caller's hold on a product.
pub async fn reserve(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(shopper): Extension<ShopperContext>,
    Json(body): Json<dto::ReserveBody>,
) -> axum::response::Response {
    let product_ref = match dto::parse_product_ref(&body.product_id, body.variant_id.as_deref()) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let window = match dto::ttl_from_seconds(body.ttl_seconds) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services
        .reserve(
            tenant.tenant_id(),
            shopper.owner_key().clone(),
            product_ref,
            body.quantity,
            window,
        )
        .await
    {
        Ok(reservation) => (
            StatusCode::CREATED,
            Json(dto::reservation_json(&reservation)),
        )
            .into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn get_reservation(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(shopper): Extension<ShopperContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let reservation_id = match dto::parse_reservation_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match owned_reservation(&services, &tenant, &shopper, reservation_id) {
        Ok(reservation) => Json(dto::reservation_json(&reservation)).into_response(),
        Err(resp) => resp,
    }
}

pub async fn extend(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(shopper): Extension<ShopperContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::ExtendBody>,
) -> axum::response::Response {
    let reservation_id = match dto::parse_reservation_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = owned_reservation(&services, &tenant, &shopper, reservation_id) {
        return resp;
    }
    if body.minutes <= 0 {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "minutes must be positive",
        );
    }

    match services.extend(
        tenant.tenant_id(),
        reservation_id,
        Some(ChronoDuration::minutes(body.minutes)),
    ) {
        Ok(reservation) => Json(serde_json::json!({
            "reservation_id": reservation.id.to_string(),
            "expires_at": reservation.expires_at,
        }))
        .into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn release(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(shopper): Extension<ShopperContext>,
    Path(id): Path<String>,
    body: Option<Json<dto::ReleaseBody>>,
) -> axum::response::Response {
    let reservation_id = match dto::parse_reservation_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = owned_reservation(&services, &tenant, &shopper, reservation_id) {
        return resp;
    }
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "released by shopper".to_string());

    match services.release(tenant.tenant_id(), reservation_id, &reason) {
        Ok(outcome) => Json(serde_json::json!({
            "released": true,
            "already_terminal": !outcome.released_now,
            "status": outcome.reservation.status,
        }))
        .into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

/// Checkout completion: settle the hold against the chain under an order id.
pub async fn convert(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(shopper): Extension<ShopperContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::ConvertBody>,
) -> axum::response::Response {
    let reservation_id = match dto::parse_reservation_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let order_id = match dto::parse_order_id(&body.order_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = owned_reservation(&services, &tenant, &shopper, reservation_id) {
        return resp;
    }

    match services
        .convert(
            tenant.tenant_id(),
            shopper.owner_key().clone(),
            reservation_id,
            order_id,
        )
        .await
    {
        Ok(outcome) => Json(serde_json::json!({
            "committed": true,
            "order_id": outcome.order_id.to_string(),
            "ledger_entry_ids": outcome
                .entries
                .iter()
                .map(|entry| entry.id.to_string())
                .collect::<Vec<_>>(),
            "totals": outcome.totals,
            "replayed": !outcome.newly_converted,
        }))
        .into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

/// Load a reservation and refuse callers that do not own it. Foreign rows
/// read as 404 so ids do not leak across shoppers.
fn owned_reservation(
    services: &AppServices,
    tenant: &TenantContext,
    shopper: &ShopperContext,
    reservation_id: ReservationId,
) -> Result<stocklock_reservations::Reservation, axum::response::Response> {
    match services.reservation(tenant.tenant_id(), reservation_id) {
        Ok(Some(reservation)) if reservation.owner_key == *shopper.owner_key() => Ok(reservation),
        Ok(_) => Err(errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            "not found",
        )),
        Err(e) => Err(errors::domain_error_to_response(e)),
    }
}
