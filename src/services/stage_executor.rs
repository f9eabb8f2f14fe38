//! 阶段执行服务 - 业务能力层
//!
//! 只负责"调用外部协作方执行一个阶段"，不关心流程顺序、重试预算和审核策略。
//!
//! 协作方自行判断失败是瞬时的还是永久的，这里只做协议层面的映射：
//! - 传输错误、5xx、429 → `TransientFailure`
//! - 其他 4xx → `PermanentFailure`

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::StageConfig;
use crate::models::Stage;
use crate::utils::logging::truncate_text;

/// 错误响应体写入轨迹前的最大长度
const MAX_ERROR_BODY_CHARS: usize = 500;

/// 阶段执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    Success,
    TransientFailure,
    PermanentFailure,
}

/// 阶段执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub status: StageStatus,
    /// 更新后的文档引用（仅成功时有意义）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// Assess 阶段报告的置信度
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// 协作方显式要求人工审核
    #[serde(default)]
    pub review_required: bool,
}

impl StageResult {
    pub fn success(document_ref: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Success,
            document_ref: Some(document_ref.into()),
            error_detail: None,
            confidence: None,
            review_required: false,
        }
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self::failure(StageStatus::TransientFailure, detail)
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        Self::failure(StageStatus::PermanentFailure, detail)
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_review_required(mut self) -> Self {
        self.review_required = true;
        self
    }

    fn failure(status: StageStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            document_ref: None,
            error_detail: Some(detail.into()),
            confidence: None,
            review_required: false,
        }
    }
}

/// 阶段执行能力
///
/// 实现方不返回 Rust 错误：所有失败都要分类为瞬时或永久。
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(
        &self,
        request_id: &str,
        stage: Stage,
        document_ref: &str,
        config: &StageConfig,
    ) -> StageResult;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StageRequestBody<'a> {
    request_id: &'a str,
    document_ref: &'a str,
    stage_config: &'a StageConfig,
}

/// 通过 HTTP 调用阶段协作方
///
/// `POST {base_url}/stages/{stage}`，响应体为 [`StageResult`]
pub struct HttpStageExecutor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStageExecutor {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn stage_url(&self, stage: Stage) -> String {
        format!("{}/stages/{}", self.base_url, stage)
    }
}

#[async_trait]
impl StageExecutor for HttpStageExecutor {
    async fn execute(
        &self,
        request_id: &str,
        stage: Stage,
        document_ref: &str,
        config: &StageConfig,
    ) -> StageResult {
        let url = self.stage_url(stage);
        debug!("[请求 {}] 调用阶段协作方: {}", request_id, url);

        let body = StageRequestBody {
            request_id,
            document_ref,
            stage_config: config,
        };
        let response = match self.client.post(&url).json(&body).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("[请求 {}] 阶段 {} 请求失败: {}", request_id, stage, e);
                return StageResult::transient(format!("transport error: {}", e));
            }
        };

        let status = response.status();
        if let Some(failure) = classify_http_status(status) {
            let text = response.text().await.unwrap_or_default();
            let detail = format!(
                "HTTP {}: {}",
                status.as_u16(),
                truncate_text(text.trim(), MAX_ERROR_BODY_CHARS)
            );
            return match failure {
                StageStatus::TransientFailure => StageResult::transient(detail),
                _ => StageResult::permanent(detail),
            };
        }

        match response.json::<StageResult>().await {
            Ok(result) => result,
            Err(e) => {
                warn!("[请求 {}] 阶段 {} 响应无法解析: {}", request_id, stage, e);
                StageResult::permanent(format!("invalid stage response: {}", e))
            }
        }
    }
}

/// 非成功状态码的分类；成功时返回 `None`
fn classify_http_status(status: reqwest::StatusCode) -> Option<StageStatus> {
    if status.is_success() {
        None
    } else if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Some(StageStatus::TransientFailure)
    } else if status.is_client_error() {
        Some(StageStatus::PermanentFailure)
    } else {
        Some(StageStatus::TransientFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_http_status_classification() {
        assert_eq!(classify_http_status(StatusCode::OK), None);
        assert_eq!(
            classify_http_status(StatusCode::SERVICE_UNAVAILABLE),
            Some(StageStatus::TransientFailure)
        );
        assert_eq!(
            classify_http_status(StatusCode::TOO_MANY_REQUESTS),
            Some(StageStatus::TransientFailure)
        );
        assert_eq!(
            classify_http_status(StatusCode::UNPROCESSABLE_ENTITY),
            Some(StageStatus::PermanentFailure)
        );
    }

    #[test]
    fn test_stage_result_wire_format() {
        let result: StageResult = serde_json::from_str(
            r#"{"status":"Success","documentRef":"s3://out/doc.json","confidence":0.42}"#,
        )
        .unwrap();
        assert_eq!(result.status, StageStatus::Success);
        assert_eq!(result.document_ref.as_deref(), Some("s3://out/doc.json"));
        assert_eq!(result.confidence, Some(0.42));
        assert!(!result.review_required);
    }

    #[test]
    fn test_stage_url_trims_trailing_slash() {
        let executor =
            HttpStageExecutor::new("http://stages.local/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            executor.stage_url(Stage::Extract),
            "http://stages.local/stages/extract"
        );
    }

    #[tokio::test]
    async fn test_unreachable_collaborator_is_transient() {
        let executor =
            HttpStageExecutor::new("http://127.0.0.1:1", Duration::from_millis(500)).unwrap();
        let config = StageConfig::Ingest(Default::default());
        let result = executor
            .execute("r-1", Stage::Ingest, "s3://in/doc.pdf", &config)
            .await;
        assert_eq!(result.status, StageStatus::TransientFailure);
    }
}
