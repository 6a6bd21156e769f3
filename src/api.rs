//! HTTP API for the certsync cloud report store

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::db::Database;
use crate::models::{
    AcceptedResponse, ConflictResponse, DeleteReportRequest, RemoteReport, StoreWrite,
    WriteReportRequest,
};

/// Application state shared across handlers
pub struct AppState {
    pub db: Database,
    pub config: Config,
}

impl AppState {
    pub fn new(db: Database, config: Config) -> Arc<Self> {
        Arc::new(Self { db, config })
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route(
            "/api/v1/reports/{id}",
            get(get_report).put(put_report).delete(delete_report),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint (no auth required)
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "certsync",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Auth middleware - validates Bearer token
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    // Skip auth for health check
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let Some(token) = token else {
        return error_response(
            StatusCode::UNAUTHORIZED,
            "Missing or invalid Authorization header",
        );
    };

    if !state.config.validate_token(token) {
        return error_response(StatusCode::UNAUTHORIZED, "Invalid API token");
    }

    next.run(request).await
}

async fn get_report(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    Ok(match state.db.get_report(&id)? {
        Some(report) => Json::<RemoteReport>(report).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Report not found"),
    })
}

/// Versioned create/update
async fn put_report(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<WriteReportRequest>,
) -> Result<Response, ApiError> {
    if let Some(response) = check_idempotency_key(&headers, &request.op_id) {
        return Ok(response);
    }

    tracing::debug!(
        report_id = %id,
        op_id = %request.op_id,
        base_version = ?request.base_version,
        "Write request received"
    );

    let outcome = state.db.write_report(&id, &request)?;
    Ok(write_response(&id, outcome))
}

/// Versioned delete
async fn delete_report(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<DeleteReportRequest>,
) -> Result<Response, ApiError> {
    if let Some(response) = check_idempotency_key(&headers, &request.op_id) {
        return Ok(response);
    }

    let outcome = state.db.delete_report(&id, &request)?;
    Ok(write_response(&id, outcome))
}

/// The header, when sent, must name the same operation as the body
fn check_idempotency_key(headers: &HeaderMap, op_id: &str) -> Option<Response> {
    let key = headers.get("Idempotency-Key")?;
    if key.to_str().ok() == Some(op_id) {
        None
    } else {
        Some(error_response(
            StatusCode::BAD_REQUEST,
            "Idempotency-Key does not match op_id",
        ))
    }
}

fn write_response(id: &str, outcome: StoreWrite) -> Response {
    match outcome {
        StoreWrite::Accepted {
            version,
            updated_at,
        } => Json(AcceptedResponse {
            version,
            updated_at,
        })
        .into_response(),
        StoreWrite::Conflict {
            current_version,
            current_payload,
        } => {
            tracing::info!(report_id = %id, current_version, "Version conflict");
            (
                StatusCode::CONFLICT,
                Json(ConflictResponse {
                    current_version,
                    current_payload,
                }),
            )
                .into_response()
        }
        StoreWrite::NotFound => error_response(StatusCode::NOT_FOUND, "Report not found"),
        StoreWrite::ReplayMismatch => error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Operation id already used for a different write",
        ),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// API error type
#[derive(Debug)]
pub struct ApiError(anyhow::Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "API error");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudClient, HttpCloudClient, WriteOutcome};
    use crate::config::TokenConfig;
    use crate::models::ReportType;
    use crate::orchestrator::{ReportStatus, SyncOrchestrator};
    use crate::payload::Payload;
    use crate::store::DraftStore;
    use crate::testing::test_settings;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    const TOKEN: &str = "tks_integration";

    async fn spawn_server() -> String {
        let config = Config {
            tokens: vec![TokenConfig {
                name: "tests".into(),
                token_hash: crate::config::hash_token(TOKEN).unwrap(),
            }],
            ..Config::default()
        };
        let state = AppState::new(Database::open_in_memory().unwrap(), config);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, create_router(state)).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(endpoint: &str, token: Option<&str>) -> HttpCloudClient {
        HttpCloudClient::new(
            endpoint,
            token.map(str::to_string),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn write(op_id: &str, base: Option<i64>, revision: i64, value: i64) -> WriteReportRequest {
        WriteReportRequest {
            op_id: op_id.into(),
            base_version: base,
            revision,
            report_type: ReportType::Eicr,
            payload: [("readings", json!(value))].into_iter().collect(),
        }
    }

    #[tokio::test]
    async fn versioned_writes_over_http() {
        let endpoint = spawn_server().await;
        let cloud = client(&endpoint, Some(TOKEN));

        assert!(matches!(
            cloud.write_versioned("r1", &write("a", None, 1, 1)).await,
            WriteOutcome::Accepted { version: 1, .. }
        ));
        assert!(matches!(
            cloud.write_versioned("r1", &write("b", Some(1), 2, 2)).await,
            WriteOutcome::Accepted { version: 2, .. }
        ));

        let stale = cloud.write_versioned("r1", &write("c", Some(1), 2, 3)).await;
        assert_eq!(
            stale,
            WriteOutcome::Conflict {
                current_version: 2,
                current_payload: [("readings", json!(2))].into_iter().collect(),
            }
        );

        let report = cloud.fetch("r1").await.unwrap().unwrap();
        assert_eq!(report.version, 2);
        assert_eq!(cloud.fetch("missing").await.unwrap(), None);

        let delete = DeleteReportRequest {
            op_id: "d".into(),
            base_version: Some(2),
        };
        assert!(matches!(
            cloud.delete_versioned("r1", &delete).await,
            WriteOutcome::Accepted { version: 3, .. }
        ));
        assert_eq!(
            cloud.write_versioned("r1", &write("e", Some(3), 4, 4)).await,
            WriteOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn reserved_characters_stay_inside_the_report_id() {
        let endpoint = spawn_server().await;
        let cloud = client(&endpoint, Some(TOKEN));

        for id in ["site?draft", "board/1", "unit#3", "50%"] {
            assert!(
                matches!(
                    cloud.write_versioned(id, &write(id, None, 1, 1)).await,
                    WriteOutcome::Accepted { version: 1, .. }
                ),
                "write of {id}"
            );
            assert_eq!(cloud.fetch(id).await.unwrap().unwrap().id, id);
        }
        assert_eq!(cloud.fetch("site").await.unwrap(), None);
        assert_eq!(cloud.fetch("board").await.unwrap(), None);
    }

    #[tokio::test]
    async fn replayed_write_with_other_content_is_rejected() {
        let endpoint = spawn_server().await;
        let cloud = client(&endpoint, Some(TOKEN));
        cloud.write_versioned("r1", &write("a", None, 1, 1)).await;

        let outcome = cloud.write_versioned("r1", &write("a", None, 2, 9)).await;

        assert_eq!(
            outcome,
            WriteOutcome::TransientError(
                "Operation id already used for a different write (422)".into()
            )
        );
        assert_eq!(
            cloud.fetch("r1").await.unwrap().unwrap().payload.get("readings"),
            Some(&json!(1))
        );
    }

    #[tokio::test]
    async fn replayed_write_returns_recorded_version() {
        let endpoint = spawn_server().await;
        let cloud = client(&endpoint, Some(TOKEN));
        let request = write("a", None, 1, 1);

        let first = cloud.write_versioned("r1", &request).await;
        let second = cloud.write_versioned("r1", &request).await;

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn bad_token_is_transient_and_health_is_open() {
        let endpoint = spawn_server().await;
        let cloud = client(&endpoint, Some("tks_wrong"));

        let outcome = cloud.write_versioned("r1", &write("a", None, 1, 1)).await;
        assert_eq!(
            outcome,
            WriteOutcome::TransientError("Invalid API token (401)".into())
        );

        let health = reqwest::get(format!("{endpoint}/health")).await.unwrap();
        assert_eq!(health.status(), reqwest::StatusCode::OK);
    }

    #[tokio::test]
    async fn mismatched_idempotency_key_is_rejected() {
        let endpoint = spawn_server().await;
        let response = reqwest::Client::new()
            .put(format!("{endpoint}/api/v1/reports/r1"))
            .bearer_auth(TOKEN)
            .header("Idempotency-Key", "other")
            .json(&write("a", None, 1, 1))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unreachable_server_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let outcome = client(&endpoint, Some(TOKEN))
            .write_versioned("r1", &write("a", None, 1, 1))
            .await;

        assert!(matches!(outcome, WriteOutcome::TransientError(_)));
    }

    #[tokio::test]
    async fn engine_syncs_through_http() {
        let endpoint = spawn_server().await;
        let cloud: Arc<dyn CloudClient> = Arc::new(client(&endpoint, Some(TOKEN)));
        let store = Arc::new(DraftStore::open_in_memory().unwrap());
        let engine = SyncOrchestrator::new(store, Arc::clone(&cloud), test_settings()).unwrap();

        let mut delta = Payload::new();
        delta.insert("installation", json!({"earthing": "TN-C-S"}));
        let doc = engine.create_report(ReportType::Eicr, delta).unwrap();
        engine.flush_edits().await.unwrap();
        engine.sync_now().await.unwrap();

        assert_eq!(engine.status(&doc.id).unwrap(), ReportStatus::Clean);
        let remote = cloud.fetch(&doc.id).await.unwrap().unwrap();
        assert_eq!(remote.version, 1);
        assert_eq!(
            remote.payload.get("installation"),
            Some(&json!({"earthing": "TN-C-S"}))
        );
    }
}
