//! CORS configuration
//!
//! Only whitelisted origins are allowed. With no configuration the local
//! development front-ends are let through.

use axum::http::header;
use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::CorsLayer;
use tracing::debug;

use crate::api::websocket::CONNECTION_ID_HEADER;

const DEFAULT_ORIGINS: &[&str] = &["http://localhost:3000", "http://127.0.0.1:3000"];

/// Create a CORS layer with the specified allowed origins
pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = if allowed_origins.is_empty() {
        debug!("CORS: No origins specified, allowing localhost only");
        DEFAULT_ORIGINS
            .iter()
            .map(|o| HeaderValue::from_static(o))
            .collect()
    } else {
        debug!("CORS: Allowing origins: {:?}", allowed_origins);
        allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect()
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static(CONNECTION_ID_HEADER),
        ])
        .allow_credentials(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::get;
    use tower::ServiceExt;

    fn app(origins: &[String]) -> axum::Router {
        axum::Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(cors_layer(origins))
    }

    #[tokio::test]
    async fn test_cors_defaults_to_localhost() {
        let allowed = app(&[])
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("Origin", "http://localhost:3000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            allowed.headers().get("access-control-allow-origin").unwrap(),
            "http://localhost:3000"
        );

        let blocked = app(&[])
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("Origin", "https://example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(blocked.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn test_cors_preflight_allows_connection_id_header() {
        let origins = vec!["https://feed.example".to_string()];

        let response = app(&origins)
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/")
                    .header("Origin", "https://feed.example")
                    .header("Access-Control-Request-Method", "POST")
                    .header("Access-Control-Request-Headers", CONNECTION_ID_HEADER)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "https://feed.example"
        );
        let allowed_headers = response
            .headers()
            .get("access-control-allow-headers")
            .unwrap()
            .to_str()
            .unwrap()
            .to_lowercase();
        assert!(allowed_headers.contains(CONNECTION_ID_HEADER));
    }
}
