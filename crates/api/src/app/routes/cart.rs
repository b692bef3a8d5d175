use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::{ShopperContext, TenantContext};

pub fn router() -> Router {
    Router::new()
        .route("/", get(get_cart))
        .route("/items", post(add_item).put(update_quantity).delete(remove_item))
        .route("/coupon", post(apply_coupon).delete(clear_coupon))
        .route("/merge", post(merge))
}

pub async fn get_cart(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(shopper): Extension<ShopperContext>,
) -> axum::response::Response {
    match services.cart_view(tenant.tenant_id(), shopper.owner_key()) {
        Ok(view) => Json(dto::cart_view_json(&view)).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn add_item(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(shopper): Extension<ShopperContext>,
    Json(body): Json<dto::CartItemBody>,
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
        .add_item(
            tenant.tenant_id(),
            shopper.owner_key().clone(),
            product_ref,
            body.quantity,
            window,
        )
        .await
    {
        Ok(view) => (StatusCode::CREATED, Json(dto::cart_view_json(&view))).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn update_quantity(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(shopper): Extension<ShopperContext>,
    Json(body): Json<dto::UpdateQuantityBody>,
) -> axum::response::Response {
    let product_ref = match dto::parse_product_ref(&body.product_id, body.variant_id.as_deref()) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services
        .update_quantity(
            tenant.tenant_id(),
            shopper.owner_key().clone(),
            product_ref,
            body.quantity,
        )
        .await
    {
        Ok(view) => Json(dto::cart_view_json(&view)).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn remove_item(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(shopper): Extension<ShopperContext>,
    Json(body): Json<dto::RemoveItemBody>,
) -> axum::response::Response {
    let product_ref = match dto::parse_product_ref(&body.product_id, body.variant_id.as_deref()) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services
        .remove_item(tenant.tenant_id(), shopper.owner_key().clone(), product_ref)
        .await
    {
        Ok(view) => Json(dto::cart_view_json(&view)).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn apply_coupon(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(shopper): Extension<ShopperContext>,
    Json(body): Json<dto::CouponBody>,
) -> axum::response::Response {
    match services.apply_coupon(tenant.tenant_id(), shopper.owner_key(), &body.code) {
        Ok(view) => Json(dto::cart_view_json(&view)).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn clear_coupon(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(shopper): Extension<ShopperContext>,
) -> axum::response::Response {
    match services.clear_coupon(tenant.tenant_id(), shopper.owner_key()) {
        Ok(view) => Json(dto::cart_view_json(&view)).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

/// Fold the guest cart named in the body into the caller's cart. The caller
/// must be signed in; merging guest-into-guest is refused.
pub async fn merge(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(shopper): Extension<ShopperContext>,
    Json(body): Json<dto::MergeBody>,
) -> axum::response::Response {
    if shopper.is_guest() {
        return errors::json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "validation_error",
            "cart merge requires an authenticated shopper",
        );
    }
    let guest_owner = match dto::parse_guest_session(&body.guest_session) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services
        .merge_guest_cart(
            tenant.tenant_id(),
            guest_owner,
            shopper.owner_key().clone(),
        )
        .await
    {
        Ok(outcome) => Json(serde_json::json!({
            "cart": dto::cart_view_json(&outcome.view),
            "warnings": outcome.warnings,
        }))
        .into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}
