//! Axum router construction.
//!
//! The [`app`] function wires every endpoint to its handler and returns a
//! ready-to-serve [`axum::Router`].  Everything under `/api/` except the
//! ping probe requires an identity; the auth middleware resolves it once
//! and hands it to handlers as an [`Owner`] extension.

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{HeaderName, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;
use utoipa::OpenApi;

use crate::errors::{generate_request_id, UploadError};
use crate::handlers::{files, uploads};
use crate::identity::Owner;
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

// -- OpenAPI specification ----------------------------------------------------

/// OpenAPI documentation for the fydf HTTP API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "fydf Upload API",
        version = "0.1.0",
        description = "Resumable chunked file uploads"
    ),
    paths(
        health_check,
        uploads::begin_upload,
        uploads::upload_status,
        uploads::upload_chunk,
        uploads::complete_upload,
        files::upload_file,
        files::download_file,
        files::ping,
    ),
    components(schemas(
        uploads::BeginUploadRequest,
        crate::upload::BeginOutcome,
        crate::upload::SessionStatus,
        crate::upload::ChunkOutcome,
        files::UploadReceipt,
    )),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Upload", description = "Resumable chunked uploads"),
        (name = "Files", description = "Whole-file transfer"),
    )
)]
struct ApiDoc;

/// Build the axum [`Router`] with every route.
pub fn app(state: Arc<AppState>) -> Router {
    let chunk_limit = body_limit(state.config.uploads.max_chunk_size);

    let mut router = Router::new()
        .route("/openapi.json", get(openapi_json))
        .route("/api/upload-init", post(uploads::begin_upload))
        .route("/api/upload-status", get(uploads::upload_status))
        .route(
            "/api/upload-resumable",
            post(uploads::upload_chunk).layer(DefaultBodyLimit::max(chunk_limit)),
        )
        .route("/api/upload-complete", post(uploads::complete_upload))
        // Streamed; the handler enforces `server.max_file_size` itself.
        .route("/api/upload", post(files::upload_file))
        .route("/api/download", get(files::download_file))
        .route(
            "/api/ping",
            get(files::ping)
                .head(files::ping)
                .post(files::ping)
                .layer(DefaultBodyLimit::max(chunk_limit)),
        );
    if state.config.observability.health_check {
        router = router.route("/health", get(health_check));
    }
    if state.config.observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .with_state(state.clone())
        // Layer ordering: inner layers run first, outer layers wrap them.
        .layer(middleware::from_fn_with_state(state, auth_middleware))
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        // Limits are applied per route above.
        .layer(DefaultBodyLimit::disable())
}

fn body_limit(bytes: u64) -> usize {
    usize::try_from(bytes).unwrap_or(usize::MAX)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static("x-request-id"),
            HeaderName::from_static("x-received-bytes"),
        ])
}

// -- Common headers middleware -----------------------------------------------

/// Adds `x-request-id`, `date` and `server` to every response.
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    // Error responses already carry the id they logged under.
    if !headers.contains_key("x-request-id") {
        if let Ok(value) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-request-id", value);
        }
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(value) = HeaderValue::from_str(&date) {
        headers.insert("date", value);
    }
    headers.insert("server", HeaderValue::from_static("fydf"));

    response
}

// -- Auth middleware ---------------------------------------------------------

/// Routes under `/api/` reachable without an identity.
const AUTH_SKIP_PATHS: &[&str] = &["/api/ping"];

fn requires_identity(path: &str) -> bool {
    path.starts_with("/api/") && !AUTH_SKIP_PATHS.contains(&path)
}

/// Resolve the request's owner and insert it into request extensions.
///
/// Returns `Unauthorized` for `/api/*` requests without a known identity.
/// CORS preflights never reach this layer.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, UploadError> {
    if !requires_identity(req.uri().path()) {
        return Ok(next.run(req).await);
    }

    let Some(owner) = state.identity.current_owner(req.headers()) else {
        debug!(path = %req.uri().path(), "request without a valid identity");
        return Err(UploadError::Unauthorized);
    };
    req.extensions_mut().insert::<Owner>(owner);
    Ok(next.run(req).await)
}

// -- Health check ------------------------------------------------------------

/// `GET /health` -- Returns `{"status": "ok"}` with 200 OK.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses(
        (status = 200, description = "Health check OK")
    )
)]
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::identity::StaticTokens;
    use crate::storage::memory::MemoryBackend;
    use axum::body::Body;
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn test_app() -> Router {
        let mut config = Config::default();
        config.uploads.chunk_size = 4;
        config.server.max_file_size = 64;
        let mut tokens = HashMap::new();
        tokens.insert("alice-token".to_string(), "alice".to_string());
        tokens.insert("bob-token".to_string(), "bob".to_string());

        let state = AppState::new(
            config,
            Arc::new(MemoryBackend::new()),
            Arc::new(StaticTokens::new(&tokens)),
        );
        app(Arc::new(state))
    }

    fn request(method: &str, uri: &str, token: Option<&str>, body: impl Into<Body>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(body.into()).unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    async fn begin(app: &Router, token: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method("POST")
            .uri("/api/upload-init")
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        send(app, req).await
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app();
        let response = app
            .oneshot(request("GET", "/health", None, Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["server"], "fydf");
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_api_requires_identity() {
        let app = test_app();
        let (status, json) = send(
            &app,
            request("GET", "/api/upload-status?sessionId=x", None, Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"], "Unauthorized");

        let (status, _) = send(
            &app,
            request("GET", "/api/upload-status?sessionId=x", Some("wrong"), Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_ping_is_public_and_echoes_length() {
        let app = test_app();
        let response = app
            .clone()
            .oneshot(request("POST", "/api/ping", None, vec![0u8; 1234]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-received-bytes"], "1234");

        let response = app
            .oneshot(request("HEAD", "/api/ping", None, Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key("x-received-bytes"));
    }

    #[tokio::test]
    async fn test_resumable_upload_round_trip() {
        let app = test_app();
        let (status, begun) = begin(&app, "alice-token", r#"{"filename":"notes.txt","fileSize":10}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(begun["totalChunks"], 3);
        assert_eq!(begun["chunkSize"], 4);
        assert_eq!(begun["uploadedChunks"], serde_json::json!([]));
        let id = begun["sessionId"].as_str().unwrap().to_string();

        let chunks: [(u64, &[u8]); 3] = [(2, b"ij"), (0, b"abcd"), (1, b"efgh")];
        let mut last = serde_json::Value::Null;
        for (index, data) in chunks {
            let uri = format!("/api/upload-resumable?sessionId={id}&chunkIndex={index}");
            let (status, json) = send(&app, request("POST", &uri, Some("alice-token"), data.to_vec())).await;
            assert_eq!(status, StatusCode::OK, "chunk {index}: {json}");
            assert_eq!(json["success"], true);
            last = json;
        }
        assert_eq!(last["complete"], true);
        assert_eq!(last["progress"], 100.0);

        let response = app
            .clone()
            .oneshot(request("GET", "/api/download?filename=notes.txt", Some("alice-token"), Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-disposition"],
            "attachment; filename=\"notes.txt\""
        );
        assert_eq!(response.headers()["content-length"], "10");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"abcdefghij");

        let (status, json) = send(
            &app,
            request("GET", &format!("/api/upload-status?sessionId={id}"), Some("alice-token"), Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "NotFound");
    }

    #[tokio::test]
    async fn test_status_is_scoped_to_owner() {
        let app = test_app();
        let (_, begun) = begin(&app, "alice-token", r#"{"filename":"a.bin","fileSize":8,"chunkSize":4}"#).await;
        let id = begun["sessionId"].as_str().unwrap();

        let uri = format!("/api/upload-status?sessionId={id}");
        let (status, json) = send(&app, request("GET", &uri, Some("alice-token"), Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["filename"], "a.bin");
        assert_eq!(json["progress"], 0.0);

        let (status, _) = send(&app, request("GET", &uri, Some("bob-token"), Body::empty())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let chunk_uri = format!("/api/upload-resumable?sessionId={id}&chunkIndex=0");
        let (status, _) = send(&app, request("POST", &chunk_uri, Some("bob-token"), b"abcd".to_vec())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_chunk_requests() {
        let app = test_app();
        let (_, begun) = begin(&app, "alice-token", r#"{"filename":"one.bin","fileSize":1,"chunkSize":5000000}"#).await;
        let id = begun["sessionId"].as_str().unwrap();

        let uri = format!("/api/upload-resumable?sessionId={id}&chunkIndex=1");
        let (status, json) = send(&app, request("POST", &uri, Some("alice-token"), b"x".to_vec())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "InvalidChunk");

        let uri = format!("/api/upload-resumable?sessionId={id}&chunkIndex=abc");
        let (status, json) = send(&app, request("POST", &uri, Some("alice-token"), b"x".to_vec())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "BadRequest");

        let (status, json) = begin(&app, "alice-token", r#"{"filename":"z.bin","fileSize":0}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "InvalidChunk");

        let (status, _) = begin(&app, "alice-token", "not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_begin_conflict_and_rejoin() {
        let app = test_app();
        let body = r#"{"filename":"c.bin","fileSize":8,"chunkSize":4}"#;
        let (_, first) = begin(&app, "alice-token", body).await;
        let (status, again) = begin(&app, "alice-token", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again["sessionId"], first["sessionId"]);

        let (status, json) = begin(&app, "alice-token", r#"{"filename":"c.bin","fileSize":9,"chunkSize":4}"#).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["error"], "SessionConflict");
    }

    #[tokio::test]
    async fn test_complete_requires_all_chunks() {
        let app = test_app();
        let (_, begun) = begin(&app, "alice-token", r#"{"filename":"p.bin","fileSize":8,"chunkSize":4}"#).await;
        let id = begun["sessionId"].as_str().unwrap();

        let uri = format!("/api/upload-complete?sessionId={id}");
        let (status, json) = send(&app, request("POST", &uri, Some("alice-token"), Body::empty())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "InvalidChunk");
    }

    #[tokio::test]
    async fn test_whole_file_upload_and_download() {
        let app = test_app();
        let (status, json) = send(
            &app,
            request("POST", "/api/upload?filename=whole.txt", Some("bob-token"), b"hello".to_vec()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["size"], 5);

        let (status, _) = send(
            &app,
            request("GET", "/api/download?filename=whole.txt", Some("alice-token"), Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, json) = send(
            &app,
            request("POST", "/api/upload?filename=..", Some("bob-token"), b"x".to_vec()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "BadRequest");
    }

    #[tokio::test]
    async fn test_whole_file_upload_enforces_size_limit() {
        let app = test_app();

        // No content-length: the limit trips while streaming.
        let (status, json) = send(
            &app,
            request("POST", "/api/upload?filename=big.bin", Some("bob-token"), vec![0u8; 65]),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE, "{json}");

        let mut declared = request("POST", "/api/upload?filename=big.bin", Some("bob-token"), vec![0u8; 65]);
        declared
            .headers_mut()
            .insert("content-length", HeaderValue::from_static("65"));
        let (status, _) = send(&app, declared).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

        let (status, _) = send(
            &app,
            request("GET", "/api/download?filename=big.bin", Some("bob-token"), Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, json) = send(
            &app,
            request("POST", "/api/upload?filename=big.bin", Some("bob-token"), vec![0u8; 64]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["size"], 64);
    }

    #[tokio::test]
    async fn test_openapi_lists_upload_routes() {
        let app = test_app();
        let (status, json) = send(&app, request("GET", "/openapi.json", None, Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["paths"]["/api/upload-init"].is_object());
        assert!(json["paths"]["/api/upload-resumable"].is_object());
    }

    #[test]
    fn test_requires_identity() {
        assert!(requires_identity("/api/upload-init"));
        assert!(requires_identity("/api/download"));
        assert!(!requires_identity("/api/ping"));
        assert!(!requires_identity("/health"));
        assert!(!requires_identity("/openapi.json"));
    }
}
