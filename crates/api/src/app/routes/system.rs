use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::context::{ShopperContext, TenantContext};

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn whoami(
    Extension(tenant): Extension<TenantContext>,
    Extension(shopper): Extension<ShopperContext>,
) -> impl IntoResponse {
    Json(serde_json::json!({
        "tenant_id": tenant.tenant_id().to_string(),
        "owner_key": shopper.owner_key().to_string(),
        "guest": shopper.is_guest(),
        "roles": shopper.roles().iter().map(|r| r.as_str()).collect::<Vec<_>>(),
    }))
}
