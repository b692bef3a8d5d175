use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::authz;
use crate::context::{ShopperContext, TenantContext};

/// Merchant-only stock administration. Every handler checks the merchant
/// role before touching the ledger.
pub fn router() -> Router {
    Router::new()
        .route("/:product", get(availability))
        .route("/:product/ledger", get(ledger))
        .route("/:product/receive", post(receive))
        .route("/:product/withdraw", post(withdraw))
        .route("/:product/adjust", post(adjust))
        .route("/:product/transfer", post(transfer))
}

pub async fn availability(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(shopper): Extension<ShopperContext>,
    Path(product): Path<String>,
    Query(query): Query<dto::VariantQuery>,
) -> axum::response::Response {
    if let Err(resp) = authz::require_merchant(&shopper) {
        return resp;
    }
    let product_ref = match dto::parse_product_ref(&product, query.variant.as_deref()) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.availability(tenant.tenant_id(), product_ref) {
        Ok(availability) => Json(serde_json::json!({
            "product_ref": availability.product_ref.to_string(),
            "balance": availability.balance,
            "active_reserved": availability.active_reserved,
            "available": availability.available,
        }))
        .into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn ledger(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(shopper): Extension<ShopperContext>,
    Path(product): Path<String>,
    Query(query): Query<dto::VariantQuery>,
) -> axum::response::Response {
    if let Err(resp) = authz::require_merchant(&shopper) {
        return resp;
    }
    let product_ref = match dto::parse_product_ref(&product, query.variant.as_deref()) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.audit_chain(tenant.tenant_id(), product_ref) {
        Ok(entries) => Json(serde_json::json!({ "entries": entries })).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn receive(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(shopper): Extension<ShopperContext>,
    Path(product): Path<String>,
    Query(query): Query<dto::VariantQuery>,
    Json(body): Json<dto::StockQuantityBody>,
) -> axum::response::Response {
    if let Err(resp) = authz::require_merchant(&shopper) {
        return resp;
    }
    let product_ref = match dto::parse_product_ref(&product, query.variant.as_deref()) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.receive_stock(tenant.tenant_id(), product_ref, body.quantity, body.reason) {
        Ok(entry) => (StatusCode::CREATED, Json(serde_json::json!({ "entry": entry })))
            .into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn withdraw(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(shopper): Extension<ShopperContext>,
    Path(product): Path<String>,
    Query(query): Query<dto::VariantQuery>,
    Json(body): Json<dto::StockQuantityBody>,
) -> axum::response::Response {
    if let Err(resp) = authz::require_merchant(&shopper) {
        return resp;
    }
    let product_ref = match dto::parse_product_ref(&product, query.variant.as_deref()) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.withdraw_stock(tenant.tenant_id(), product_ref, body.quantity, body.reason) {
        Ok(entry) => (StatusCode::CREATED, Json(serde_json::json!({ "entry": entry })))
            .into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn adjust(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(shopper): Extension<ShopperContext>,
    Path(product): Path<String>,
    Query(query): Query<dto::VariantQuery>,
    Json(body): Json<dto::AdjustBody>,
) -> axum::response::Response {
    if let Err(resp) = authz::require_merchant(&shopper) {
        return resp;
    }
    let product_ref = match dto::parse_product_ref(&product, query.variant.as_deref()) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.adjust_stock(tenant.tenant_id(), product_ref, body.delta, body.reason) {
        Ok(entry) => (StatusCode::CREATED, Json(serde_json::json!({ "entry": entry })))
            .into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn transfer(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(shopper): Extension<ShopperContext>,
    Path(product): Path<String>,
    Query(query): Query<dto::VariantQuery>,
    Json(body): Json<dto::TransferBody>,
) -> axum::response::Response {
    if let Err(resp) = authz::require_merchant(&shopper) {
        return resp;
    }
    let from = match dto::parse_product_ref(&product, query.variant.as_deref()) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let to = match dto::parse_product_ref(&body.to_product_id, body.to_variant_id.as_deref()) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.transfer_stock(tenant.tenant_id(), from, to, body.quantity, body.reason) {
        Ok(entries) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "entries": entries })),
        )
            .into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}
