//! API 模块
//!
//! 对外的 HTTP 接口：提交与查询请求、取消、人工审核恢复、统计

pub mod error;
pub mod requests;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::orchestrator::App;

pub use error::ApiError;

/// 构建路由
pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/requests", post(requests::submit).get(requests::list))
        .route("/requests/{id}", get(requests::get_request))
        .route("/requests/{id}/cancel", post(requests::cancel))
        .route("/resume", post(requests::resume))
        .route("/stats", get(requests::stats))
        .route("/health", get(requests::health))
        .with_state(app)
}
