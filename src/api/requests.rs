//! 请求相关的 HTTP 处理函数

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::models::{
    FailureReason, RequestRecord, RequestStatus, ReviewOutcome, Stage, TraceEntry,
};
use crate::orchestrator::{App, Stats};

type ApiResult<T> = Result<T, ApiError>;

/// 对外返回的请求视图
///
/// 不包含恢复句柄：句柄只通过审核通知交给审核方。
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestView {
    pub request_id: String,
    pub status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<Stage>,
    pub document_ref: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspended_at: Option<DateTime<Utc>>,
    pub permit_held: bool,
    pub cancel_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    pub trace: Vec<TraceEntry>,
}

impl From<RequestRecord> for RequestView {
    fn from(record: RequestRecord) -> Self {
        Self {
            request_id: record.request_id,
            status: record.status,
            current_stage: record.current_stage,
            document_ref: record.document_ref,
            created_at: record.created_at,
            updated_at: record.updated_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
            retry_count: record.retry_count,
            suspended_at: record.suspended_at,
            permit_held: record.permit_held,
            cancel_requested: record.cancel_requested,
            failure: record.failure,
            trace: record.trace,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitBody {
    #[serde(default)]
    pub request_id: Option<String>,
    pub document_ref: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<RequestStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeBody {
    pub handle: String,
    pub outcome: ReviewOutcome,
    #[serde(default)]
    pub reviewer_note: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResumeResponse {
    pub accepted: bool,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

pub async fn submit(
    State(app): State<Arc<App>>,
    Json(body): Json<SubmitBody>,
) -> ApiResult<(StatusCode, Json<RequestView>)> {
    let record = app.submit(body.request_id, body.document_ref)?;
    Ok((StatusCode::ACCEPTED, Json(record.into())))
}

pub async fn get_request(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
) -> ApiResult<Json<RequestView>> {
    Ok(Json(app.get(&id)?.into()))
}

pub async fn list(
    State(app): State<Arc<App>>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<RequestView>> {
    Json(app.list(query.status).into_iter().map(RequestView::from).collect())
}

pub async fn cancel(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let cancelled = app.cancel(&id)?;
    Ok(Json(CancelResponse { cancelled }))
}

/// 未知或已使用的句柄返回 `accepted = false`，状态码仍为 200
pub async fn resume(
    State(app): State<Arc<App>>,
    Json(body): Json<ResumeBody>,
) -> ApiResult<Json<ResumeResponse>> {
    let accepted = app.resume(&body.handle, body.outcome, body.reviewer_note)?;
    Ok(Json(ResumeResponse { accepted }))
}

pub async fn stats(State(app): State<Arc<App>>) -> ApiResult<Json<Stats>> {
    Ok(Json(app.stats()?))
}

pub async fn health() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use crate::api::router;
    use crate::config::{Config, StageConfig};
    use crate::infrastructure::StateStore;
    use crate::models::Stage;
    use crate::orchestrator::App;
    use crate::services::{ChannelSink, LogSink, StageExecutor, StageResult};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    struct AlwaysSucceeds;

    #[async_trait]
    impl StageExecutor for AlwaysSucceeds {
        async fn execute(
            &self,
            _request_id: &str,
            stage: Stage,
            document_ref: &str,
            _config: &StageConfig,
        ) -> StageResult {
            StageResult::success(format!("{}/{}", document_ref, stage)).with_confidence(1.0)
        }
    }

    /// Assess 置信度过低，总是进入人工审核
    struct NeedsReview;

    #[async_trait]
    impl StageExecutor for NeedsReview {
        async fn execute(
            &self,
            _request_id: &str,
            stage: Stage,
            document_ref: &str,
            _config: &StageConfig,
        ) -> StageResult {
            StageResult::success(format!("{}/{}", document_ref, stage)).with_confidence(0.1)
        }
    }

    fn test_app() -> Arc<App> {
        let app = App::with_components(
            Config::default(),
            Arc::new(StateStore::in_memory()),
            Arc::new(AlwaysSucceeds),
            Arc::new(LogSink),
        )
        .unwrap();
        Arc::new(app)
    }

    async fn send(
        router: &Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(payload) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&payload).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_submit_then_get() {
        let router = router(test_app());

        let (status, created) = send(
            &router,
            Method::POST,
            "/requests",
            Some(json!({ "requestId": "doc-1", "documentRef": "s3://in/doc-1.pdf" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(created["status"], "Queued");
        assert_eq!(created["documentRef"], "s3://in/doc-1.pdf");

        let (status, fetched) = send(&router, Method::GET, "/requests/doc-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["requestId"], "doc-1");

        let (status, listed) = send(&router, Method::GET, "/requests?status=Queued", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_duplicate_submit_conflicts() {
        let router = router(test_app());
        let body = json!({ "requestId": "doc-1", "documentRef": "s3://in/doc-1.pdf" });

        send(&router, Method::POST, "/requests", Some(body.clone())).await;
        let (status, error) = send(&router, Method::POST, "/requests", Some(body)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error["error"], "duplicate_request");
    }

    #[tokio::test]
    async fn test_empty_document_ref_is_bad_request() {
        let router = router(test_app());
        let (status, _) = send(
            &router,
            Method::POST,
            "/requests",
            Some(json!({ "documentRef": "  " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_request_is_not_found() {
        let router = router(test_app());
        let (status, error) = send(&router, Method::GET, "/requests/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error["error"], "request_not_found");
    }

    #[tokio::test]
    async fn test_resume_with_unknown_handle_is_not_accepted() {
        let router = router(test_app());
        let (status, body) = send(
            &router,
            Method::POST,
            "/resume",
            Some(json!({ "handle": "nope", "outcome": "Approved", "reviewerNote": "lgtm" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "accepted": false }));
    }

    #[tokio::test]
    async fn test_cancel_queued_request() {
        let router = router(test_app());
        send(
            &router,
            Method::POST,
            "/requests",
            Some(json!({ "requestId": "doc-1", "documentRef": "s3://in/doc-1.pdf" })),
        )
        .await;

        let (status, body) = send(&router, Method::POST, "/requests/doc-1/cancel", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "cancelled": true }));

        let (_, body) = send(&router, Method::POST, "/requests/doc-1/cancel", None).await;
        assert_eq!(body, json!({ "cancelled": false }));
    }

    #[tokio::test]
    async fn test_stats_after_start() {
        let app = test_app();
        app.start().unwrap();
        let router = router(app.clone());

        let (status, body) = send(&router, Method::GET, "/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["permits"]["maxPermits"], 100);
        assert_eq!(body["statuses"]["Queued"], 0);
        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_resumption_handle_only_reaches_reviewer() {
        let (sink, _notifications, mut reviews) = ChannelSink::with_reviews();
        let app = Arc::new(
            App::with_components(
                Config::default(),
                Arc::new(StateStore::in_memory()),
                Arc::new(NeedsReview),
                Arc::new(sink),
            )
            .unwrap(),
        );
        app.start().unwrap();
        let router = router(app.clone());

        send(
            &router,
            Method::POST,
            "/requests",
            Some(json!({ "requestId": "doc-1", "documentRef": "s3://in/doc-1.pdf" })),
        )
        .await;
        let review = tokio::time::timeout(std::time::Duration::from_secs(5), reviews.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(review.request_id, "doc-1");

        let (_, fetched) = send(&router, Method::GET, "/requests/doc-1", None).await;
        assert_eq!(fetched["status"], "Suspended");
        assert!(fetched.get("resumptionHandle").is_none());
        assert!(fetched.get("suspendedAt").is_some());

        let (_, listed) = send(&router, Method::GET, "/requests?status=Suspended", None).await;
        assert!(listed[0].get("resumptionHandle").is_none());
        assert!(!listed.to_string().contains(&review.resumption_handle));

        let (_, body) = send(
            &router,
            Method::POST,
            "/resume",
            Some(json!({ "handle": review.resumption_handle, "outcome": "Approved" })),
        )
        .await;
        assert_eq!(body, json!({ "accepted": true }));
        app.shutdown().await;
    }
}
