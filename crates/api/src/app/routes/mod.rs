use axum::{routing::get, Router};

pub mod cart;
pub mod reservations;
pub mod stock;
pub mod system;

/// Router for all authenticated (tenant-scoped) endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .nest("/reservations", reservations::router())
        .nest("/cart", cart::router())
        .nest("/stock", stock::router())
}
