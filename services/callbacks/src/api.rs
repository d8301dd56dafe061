use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::models::{HarvestStatus, RecordingSlice};
use crate::signature::SignatureValidator;
use crate::store::UploadStore;
use crate::update_state::{UpdateStateRequest, UploadStateUpdater};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Header carrying the callback signature
pub const SIGNATURE_HEADER: &str = "x-signature";
/// Header used by older deployments of the pipeline
pub const LEGACY_SIGNATURE_HEADER: &str = "x-marsha-signature";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub updater: Arc<UploadStateUpdater>,
    pub store: Arc<dyn UploadStore>,
    pub validator: Arc<SignatureValidator>,
}

/// Acknowledgement returned by the callback endpoints
#[derive(Debug, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Recording slice manifest callback payload
#[derive(Debug, Deserialize)]
pub struct RecordingSliceManifestRequest {
    pub video_id: Uuid,
    pub harvest_job_id: String,
    pub manifest_key: String,
}

/// Recording slices state callback payload
#[derive(Debug, Deserialize)]
pub struct RecordingSlicesStateRequest {
    pub video_id: Uuid,
}

/// Harvest status of one recording slice
#[derive(Debug, Serialize, Deserialize)]
pub struct RecordingSliceState {
    pub harvest_job_id: Option<String>,
    pub status: HarvestStatus,
    pub manifest_key: Option<String>,
}

impl From<RecordingSlice> for RecordingSliceState {
    fn from(slice: RecordingSlice) -> Self {
        Self {
            harvest_job_id: slice.harvest_job_id,
            status: slice.status,
            manifest_key: slice.manifest_key,
        }
    }
}

/// Harvest status of every recording slice of a video
#[derive(Debug, Serialize, Deserialize)]
pub struct RecordingSlicesStateResponse {
    pub video_id: Uuid,
    pub recording_slices: Vec<RecordingSliceState>,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<HeaderValue> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/update-state", post(update_state))
        .route("/api/recording-slices-manifest", post(recording_slices_manifest))
        .route("/api/recording-slices-state", post(recording_slices_state))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "marsha-callbacks"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Check the signature of the raw body, then decode it
fn signed_payload<T: DeserializeOwned>(
    state: &AppState,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<T, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .or_else(|| headers.get(LEGACY_SIGNATURE_HEADER))
        .and_then(|value| value.to_str().ok());

    if !state.validator.validate(signature, body) {
        warn!("Rejected callback with invalid signature");
        metrics::counter!("callbacks.signature.rejected").increment(1);
        return Err(ApiError::Forbidden);
    }

    serde_json::from_slice(body).map_err(|e| ApiError::Validation(e.to_string()))
}

/// Update the upload state of an object from its key
#[instrument(skip_all)]
async fn update_state(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SuccessResponse>, ApiError> {
    let request: UpdateStateRequest = signed_payload(&state, &headers, &body)?;

    state.updater.apply(request).await?;

    Ok(Json(SuccessResponse { success: true }))
}

/// Set the manifest key of the recording slices of a harvest job
#[instrument(skip_all)]
async fn recording_slices_manifest(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SuccessResponse>, ApiError> {
    let request: RecordingSliceManifestRequest = signed_payload(&state, &headers, &body)?;

    let found = state
        .store
        .set_recording_slice_manifest_key(
            request.video_id,
            &request.harvest_job_id,
            &request.manifest_key,
        )
        .await?;

    if !found {
        return Err(ApiError::NotFound);
    }

    info!(
        video_id = %request.video_id,
        harvest_job_id = %request.harvest_job_id,
        "Recording slice manifest set"
    );

    Ok(Json(SuccessResponse { success: true }))
}

/// Report the harvest status of every recording slice of a video
#[instrument(skip_all)]
async fn recording_slices_state(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<RecordingSlicesStateResponse>, ApiError> {
    let request: RecordingSlicesStateRequest = signed_payload(&state, &headers, &body)?;

    let recording_slices = state
        .store
        .recording_slices(request.video_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(RecordingSlicesStateResponse {
        video_id: request.video_id,
        recording_slices: recording_slices.into_iter().map(Into::into).collect(),
    }))
}

/// Start the callback API server, serving until `shutdown` is cancelled
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting callback API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{UploadState, UploadableModel};
    use crate::notifier::{self, UploadEvent};
    use crate::object_key::KeyParser;
    use crate::store::memory::{InMemoryUploadStore, Row};
    use crate::store::MockUploadStore;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    const SECRET: &str = "shared secret";
    const OWNER: &str = "11111111-1111-1111-1111-111111111111";
    const OBJECT: &str = "22222222-2222-2222-2222-222222222222";

    fn router(store: Arc<dyn UploadStore>) -> (Router, mpsc::Receiver<UploadEvent>) {
        let (sender, receiver) = notifier::channel(16);
        let parser = KeyParser::new(&["st", "ts", "cc"]).unwrap();
        let state = AppState {
            updater: Arc::new(UploadStateUpdater::new(parser, store.clone(), sender)),
            store,
            validator: Arc::new(SignatureValidator::new(["previous secret", SECRET])),
        };
        (create_router(state, &ApiConfig::default()), receiver)
    }

    fn signed_request(uri: &str, body: &Value, header: &str) -> Request<Body> {
        let body = serde_json::to_vec(body).unwrap();
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header(header, SignatureValidator::sign(SECRET, &body))
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn video_store() -> Arc<InMemoryUploadStore> {
        Arc::new(InMemoryUploadStore::default().with_row(
            UploadableModel::Video,
            Uuid::parse_str(OBJECT).unwrap(),
            Row::pending(),
        ))
    }

    fn update_body(state: &str) -> Value {
        json!({
            "key": format!("{OWNER}/video/{OBJECT}/1620000000"),
            "state": state,
            "extraParameters": {}
        })
    }

    #[tokio::test]
    async fn test_update_state_ready() {
        let store = video_store();
        let (router, mut events) = router(store.clone());

        let (status, body) = send(
            &router,
            signed_request("/api/update-state", &update_body("ready"), SIGNATURE_HEADER),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true}));
        let row = store
            .row(UploadableModel::Video, Uuid::parse_str(OBJECT).unwrap())
            .unwrap();
        assert_eq!(row.upload_state, UploadState::Ready);
        assert_eq!(row.uploaded_on.map(|d| d.timestamp()), Some(1620000000));
        assert!(events.try_recv().is_ok());

        // Redelivery acknowledges without a second event
        let (status, _) = send(
            &router,
            signed_request("/api/update-state", &update_body("ready"), SIGNATURE_HEADER),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_update_state_error() {
        let store = video_store();
        let (router, mut events) = router(store.clone());

        let (status, _) = send(
            &router,
            signed_request("/api/update-state", &update_body("error"), SIGNATURE_HEADER),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let row = store
            .row(UploadableModel::Video, Uuid::parse_str(OBJECT).unwrap())
            .unwrap();
        assert_eq!(row.upload_state, UploadState::Error);
        assert_eq!(row.uploaded_on, None);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_legacy_signature_header_accepted() {
        let (router, _events) = router(video_store());

        let (status, _) = send(
            &router,
            signed_request(
                "/api/update-state",
                &update_body("processing"),
                LEGACY_SIGNATURE_HEADER,
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_bad_signature_is_forbidden() {
        let mut store = MockUploadStore::new();
        store.expect_apply_upload_state().never();
        let (router, _events) = router(Arc::new(store));

        let request = Request::builder()
            .method("POST")
            .uri("/api/update-state")
            .header(SIGNATURE_HEADER, "0".repeat(64))
            .body(Body::from(serde_json::to_vec(&update_body("ready")).unwrap()))
            .unwrap();
        let (status, body) = send(&router, request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, json!("Forbidden"));

        let request = Request::builder()
            .method("POST")
            .uri("/api/update-state")
            .body(Body::from(serde_json::to_vec(&update_body("ready")).unwrap()))
            .unwrap();
        let (status, _) = send(&router, request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_signature_checked_before_payload() {
        let (router, _events) = router(video_store());

        let request = Request::builder()
            .method("POST")
            .uri("/api/update-state")
            .header(SIGNATURE_HEADER, SignatureValidator::sign("wrong secret", b"{not json"))
            .body(Body::from("{not json"))
            .unwrap();
        let (status, _) = send(&router, request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_malformed_payloads_are_bad_requests() {
        let (router, _events) = router(video_store());

        let bodies = [
            json!({"key": "bad-key", "state": "ready"}),
            json!({"key": format!("{OWNER}/video/{OBJECT}/1620000000"), "state": "done"}),
            json!({"key": format!("{OWNER}/video/{OBJECT}/1620000000"), "state": "pending"}),
            json!({"state": "ready"}),
        ];

        for body in bodies {
            let (status, response) = send(
                &router,
                signed_request("/api/update-state", &body, SIGNATURE_HEADER),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
            assert_eq!(response["code"], "VALIDATION_ERROR");
        }
    }

    #[tokio::test]
    async fn test_unknown_object_is_not_found() {
        let (router, _events) = router(Arc::new(InMemoryUploadStore::default()));

        let (status, body) = send(
            &router,
            signed_request("/api/update-state", &update_body("ready"), SIGNATURE_HEADER),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"success": false}));
    }

    #[tokio::test]
    async fn test_store_failure_is_server_error() {
        let mut store = MockUploadStore::new();
        store
            .expect_apply_upload_state()
            .returning(|_, _, _| Err(anyhow::anyhow!("database is down")));
        let (router, _events) = router(Arc::new(store));

        let (status, body) = send(
            &router,
            signed_request("/api/update-state", &update_body("ready"), SIGNATURE_HEADER),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "INTERNAL_ERROR");
    }

    #[tokio::test]
    async fn test_recording_slices_manifest_and_state() {
        let video_id = Uuid::parse_str(OBJECT).unwrap();
        let mut row = Row::pending();
        row.recording_slices = serde_json::from_value(json!([
            {"start": 1620000000, "stop": 1620000600, "harvest_job_id": "job-1"},
            {"start": 1620000700, "harvest_job_id": "job-2"}
        ]))
        .unwrap();
        let store = Arc::new(InMemoryUploadStore::default().with_row(
            UploadableModel::Video,
            video_id,
            row,
        ));
        let (router, _events) = router(store.clone());

        let (status, body) = send(
            &router,
            signed_request(
                "/api/recording-slices-manifest",
                &json!({
                    "video_id": video_id,
                    "harvest_job_id": "job-1",
                    "manifest_key": "manifests/job-1.m3u8"
                }),
                SIGNATURE_HEADER,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true}));

        let (status, body) = send(
            &router,
            signed_request(
                "/api/recording-slices-state",
                &json!({"video_id": video_id}),
                SIGNATURE_HEADER,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "video_id": OBJECT,
                "recording_slices": [
                    {
                        "harvest_job_id": "job-1",
                        "status": "harvested",
                        "manifest_key": "manifests/job-1.m3u8"
                    },
                    {
                        "harvest_job_id": "job-2",
                        "status": "pending",
                        "manifest_key": null
                    }
                ]
            })
        );
    }

    #[tokio::test]
    async fn test_recording_slices_unknown_video() {
        let (router, _events) = router(Arc::new(InMemoryUploadStore::default()));

        let (status, _) = send(
            &router,
            signed_request(
                "/api/recording-slices-state",
                &json!({"video_id": Uuid::new_v4()}),
                SIGNATURE_HEADER,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &router,
            signed_request(
                "/api/recording-slices-manifest",
                &json!({"video_id": Uuid::new_v4(), "harvest_job_id": "j", "manifest_key": "m"}),
                SIGNATURE_HEADER,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_and_readiness() {
        let (router, _events) = router(video_store());

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        let request = Request::builder().uri("/ready").body(Body::empty()).unwrap();
        let (status, body) = send(&router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["database"], "connected");
    }
}
