//! Cross-cutting HTTP layers.
use axum::http::{header, Method};
use tower_http::cors::CorsLayer;

/// Allows the verbs and headers the `/v1` routes use.
pub fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .expose_headers([header::LOCATION])
}
