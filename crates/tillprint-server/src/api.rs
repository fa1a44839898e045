// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// HTTP API for the upstream order system.
//
// Every `/api/v1` route sits behind the bearer-credential check, which runs
// before the request body is read or the queue is touched.  Failures of a
// job are never errors here: they are part of the job record, explained in
// plain language by an operator notice.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use tillprint_core::error::{Result, TillprintError};
use tillprint_core::human_errors::{OperatorNotice, describe_failure};
use tillprint_core::types::{AttemptRecord, JobId, JobStatus, PrintJob};
use tillprint_print::EnqueueRequest;
use tillprint_security::Principal;

use crate::state::AppState;

/// Listing size when the caller gives none.
const DEFAULT_LIST_LIMIT: u32 = 50;

pub fn router(state: Arc<AppState>, cors: CorsLayer) -> Router {
    let api = Router::new()
        .route("/jobs", get(list_jobs).post(enqueue))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/attempts", get(job_attempts))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api/v1", api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// CORS limited to `origins`; an empty list allows no cross-origin calls.
pub fn cors_layer(origins: &[String]) -> Result<CorsLayer> {
    let origins = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin)
                .map_err(|_| TillprintError::Config(format!("invalid CORS origin {origin:?}")))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]))
}

// -- Errors ------------------------------------------------------------------

/// A `TillprintError` on its way to becoming an HTTP response.
#[derive(Debug)]
pub struct ApiError(TillprintError);

impl From<TillprintError> for ApiError {
    fn from(err: TillprintError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            TillprintError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            TillprintError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            TillprintError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            TillprintError::InvalidTransition { .. } | TillprintError::LeaseExpired { .. } => {
                (StatusCode::CONFLICT, "conflict")
            }
            TillprintError::Store(_) | TillprintError::PoolExhausted { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        let body = Json(json!({ "error": code, "message": self.0.to_string() }));
        (status, body).into_response()
    }
}

// -- Auth --------------------------------------------------------------------

async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> std::result::Result<Response, ApiError> {
    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    let principal = state.auth.verify_header(header).map_err(|e| {
        warn!(path = %request.uri().path(), "rejected unauthenticated request");
        ApiError(e)
    })?;
    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

// -- Handlers ----------------------------------------------------------------

#[derive(Debug, Serialize)]
struct Accepted {
    job_id: JobId,
    status: JobStatus,
}

async fn enqueue(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    body: std::result::Result<Json<EnqueueRequest>, JsonRejection>,
) -> std::result::Result<(StatusCode, Json<Accepted>), ApiError> {
    let Json(mut request) = body.map_err(|e| TillprintError::Validation(e.body_text()))?;
    if request.target.is_none() {
        request.target = state.default_target.clone();
    }

    let job_id = state.queue.enqueue(request).await?;
    info!(job_id = %job_id, caller = %principal.subject, "print job accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            job_id,
            status: JobStatus::Pending,
        }),
    ))
}

/// A job as shown to API callers.
#[derive(Debug, Serialize)]
struct JobView {
    #[serde(flatten)]
    job: PrintJob,
    #[serde(skip_serializing_if = "Option::is_none")]
    notice: Option<OperatorNotice>,
}

impl From<PrintJob> for JobView {
    fn from(mut job: PrintJob) -> Self {
        // Lease tokens are internal to the dispatchers.
        job.lease_token = None;
        let notice = match job.status {
            JobStatus::Failed | JobStatus::Dead | JobStatus::Pending => {
                job.last_error.as_ref().map(|e| describe_failure(e, job.status))
            }
            JobStatus::InFlight | JobStatus::Succeeded => None,
        };
        Self { job, notice }
    }
}

fn parse_id(raw: &str) -> std::result::Result<JobId, ApiError> {
    Ok(raw.parse::<JobId>()?)
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> std::result::Result<Json<JobView>, ApiError> {
    let job = state.queue.get(parse_id(&id)?).await?;
    Ok(Json(job.into()))
}

async fn job_attempts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> std::result::Result<Json<Vec<AttemptRecord>>, ApiError> {
    Ok(Json(state.queue.history(parse_id(&id)?).await?))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    limit: Option<u32>,
}

async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> std::result::Result<Json<Vec<JobView>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()?;
    let jobs = state
        .queue
        .list(status, query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await?;
    Ok(Json(jobs.into_iter().map(JobView::from).collect()))
}

async fn healthz(State(state): State<Arc<AppState>>) -> std::result::Result<Response, ApiError> {
    let counts: BTreeMap<&'static str, u64> = state
        .queue
        .status_counts()
        .await?
        .into_iter()
        .map(|(status, count)| (status.as_str(), count))
        .collect();

    Ok(Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "jobs": counts,
    }))
    .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request as HttpRequest;
    use serde_json::Value;
    use tower::ServiceExt;

    use tillprint_core::config::AuthSettings;
    use tillprint_core::types::{FailureKind, JobError, PrinterProtocol, PrinterTarget};
    use tillprint_print::{JobQueue, Outcome, RetryConfig, RetryScheduler, SqliteStore};
    use tillprint_security::Authenticator;

    const API_KEY: &str = "till-7-key";

    fn state(default_target: Option<PrinterTarget>) -> Arc<AppState> {
        state_with(default_target, RetryScheduler::default())
    }

    fn state_with(default_target: Option<PrinterTarget>, retry: RetryScheduler) -> Arc<AppState> {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let queue = JobQueue::new(store, retry);
        let auth = Authenticator::new(&AuthSettings {
            secret: "0123456789abcdef0123456789abcdef".into(),
            api_keys: vec![API_KEY.into()],
        })
        .expect("auth");
        Arc::new(AppState::new(queue, auth, default_target))
    }

    fn app(state: Arc<AppState>) -> Router {
        router(state, cors_layer(&[]).expect("cors"))
    }

    fn receipt() -> Value {
        json!({
            "merchant": { "name": "Corner Cafe", "address": ["12 High Street"] },
            "order_reference": "ORD-1001",
            "items": [
                { "name": "Flat white", "quantity": 1, "unit_price": 999 },
                { "name": "Croissant", "quantity": 1, "unit_price": 999 }
            ],
            "subtotal": 1998,
            "total": 1998,
            "currency": "USD"
        })
    }

    fn post_job(body: Value, credential: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder()
            .method(Method::POST)
            .uri("/api/v1/jobs")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(credential) = credential {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {credential}"));
        }
        builder.body(Body::from(body.to_string())).expect("request")
    }

    fn get(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {API_KEY}"))
            .body(Body::empty())
            .expect("request")
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), 1 << 20).await.expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn enqueue_returns_accepted_with_pending_status() {
        let state = state(None);
        let body = json!({
            "payload": receipt(),
            "target": { "host": "10.0.0.5", "port": 9100, "protocol": "escpos" }
        });

        let response = app(state.clone())
            .oneshot(post_job(body, Some(API_KEY)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let json = json_body(response).await;
        assert_eq!(json["status"], "pending");
        let id: JobId = json["job_id"].as_str().expect("job id").parse().expect("uuid");
        assert_eq!(state.queue.get(id).await.expect("job").status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn missing_credentials_never_reach_the_queue() {
        let state = state(None);
        let body = json!({ "payload": receipt(), "target": { "host": "10.0.0.5" } });

        let response = app(state.clone())
            .oneshot(post_job(body.clone(), None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app(state.clone())
            .oneshot(post_job(body, Some("not-a-key")))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"], "unauthorized");

        assert_eq!(state.queue.len(None).await.expect("len"), 0);
    }

    #[tokio::test]
    async fn missing_target_uses_the_default_printer() {
        let default = PrinterTarget::new("192.168.1.40", 9100, PrinterProtocol::StarPrnt);
        let state = state(Some(default.clone()));

        let response = app(state.clone())
            .oneshot(post_job(json!({ "payload": receipt() }), Some(API_KEY)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let json = json_body(response).await;
        let id: JobId = json["job_id"].as_str().expect("job id").parse().expect("uuid");
        assert_eq!(state.queue.get(id).await.expect("job").target, default);
    }

    #[tokio::test]
    async fn missing_target_without_default_is_a_validation_error() {
        let response = app(state(None))
            .oneshot(post_job(json!({ "payload": receipt() }), Some(API_KEY)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "validation_error");
    }

    #[tokio::test]
    async fn malformed_body_is_a_validation_error() {
        let response = app(state(None))
            .oneshot(post_job(json!({ "payload": { "merchant": 7 } }), Some(API_KEY)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let uri = format!("/api/v1/jobs/{}", JobId::new());
        let response = app(state(None)).oneshot(get(&uri)).await.expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app(state(None))
            .oneshot(get("/api/v1/jobs/not-a-uuid"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn dead_job_notice_is_not_retriable() {
        let state = state_with(
            None,
            RetryScheduler::new(RetryConfig {
                max_attempts: 1,
                ..RetryConfig::default()
            }),
        );
        let id = state
            .queue
            .enqueue(EnqueueRequest {
                payload: serde_json::from_value(receipt()).expect("payload"),
                target: Some(PrinterTarget::new("10.0.0.5", 9100, PrinterProtocol::EscPos)),
            })
            .await
            .expect("enqueue");
        let claim = state
            .queue
            .claim(std::time::Duration::from_secs(30))
            .await
            .expect("claim")
            .expect("job");
        let status = state
            .queue
            .complete(
                &claim,
                Outcome::Failed(JobError::new(
                    FailureKind::TransientDispatch,
                    "send to 10.0.0.5:9100 timed out after 10000ms",
                )),
                std::time::Duration::from_millis(10),
            )
            .await
            .expect("complete");
        assert_eq!(status, JobStatus::Dead);

        let response = app(state)
            .oneshot(get(&format!("/api/v1/jobs/{id}")))
            .await
            .expect("response");
        let json = json_body(response).await;
        assert_eq!(json["status"], "dead");
        assert_eq!(json["notice"]["retriable"], false);
        assert_eq!(json["notice"]["severity"], "action_required");
    }

    #[tokio::test]
    async fn job_view_hides_the_lease_and_history_starts_empty() {
        let state = state(None);
        let id = state
            .queue
            .enqueue(EnqueueRequest {
                payload: serde_json::from_value(receipt()).expect("payload"),
                target: Some(PrinterTarget::new("10.0.0.5", 9100, PrinterProtocol::EscPos)),
            })
            .await
            .expect("enqueue");
        state
            .queue
            .claim(std::time::Duration::from_secs(30))
            .await
            .expect("claim")
            .expect("job");

        let response = app(state.clone())
            .oneshot(get(&format!("/api/v1/jobs/{id}")))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "in_flight");
        assert!(json.get("lease_token").is_none());
        assert!(json.get("notice").is_none());

        let response = app(state)
            .oneshot(get(&format!("/api/v1/jobs/{id}/attempts")))
            .await
            .expect("response");
        assert_eq!(json_body(response).await, json!([]));
    }

    #[tokio::test]
    async fn listing_filters_by_status() {
        let state = state(None);
        for _ in 0..3 {
            state
                .queue
                .enqueue(EnqueueRequest {
                    payload: serde_json::from_value(receipt()).expect("payload"),
                    target: Some(PrinterTarget::new("10.0.0.5", 9100, PrinterProtocol::EscPos)),
                })
                .await
                .expect("enqueue");
        }

        let response = app(state.clone())
            .oneshot(get("/api/v1/jobs?status=pending&limit=2"))
            .await
            .expect("response");
        assert_eq!(json_body(response).await.as_array().map(Vec::len), Some(2));

        let response = app(state.clone())
            .oneshot(get("/api/v1/jobs?status=dead"))
            .await
            .expect("response");
        assert_eq!(json_body(response).await, json!([]));

        let response = app(state)
            .oneshot(get("/api/v1/jobs?status=lost"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn healthz_needs_no_credentials() {
        let response = app(state(None))
            .oneshot(HttpRequest::builder().uri("/healthz").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["jobs"]["pending"], 0);
        assert_eq!(json["jobs"]["dead"], 0);
    }

    #[test]
    fn invalid_cors_origin_is_a_config_error() {
        assert!(cors_layer(&["https://cms.example.com".into()]).is_ok());
        assert!(matches!(
            cors_layer(&["bad\norigin".into()]),
            Err(TillprintError::Config(_))
        ));
    }
}
