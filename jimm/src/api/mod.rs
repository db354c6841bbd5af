pub mod discharge;
pub mod jwks;
pub mod status;
pub mod ws;

use crate::JimmState;

pub fn make_router(state: JimmState) -> axum::Router {
    axum::Router::new()
        .route("/api", axum::routing::get(ws::api_handler))
        .route("/model/{uuid}/{*rest}", axum::routing::get(ws::model_handler))
        .route("/.well-known/jwks.json", axum::routing::get(jwks::get_jwks))
        .route(
            "/.well-known/openid-configuration",
            axum::routing::get(jwks::get_openid_configuration),
        )
        .route("/debug/status", axum::routing::get(status::get_status))
        .nest("/macaroons", discharge::make_router(state.clone()))
        .with_state(state)
}
