//! 请求处理上下文
//!
//! 封装"我正在处理哪个请求"这一信息，统一日志前缀

use std::fmt::Display;

/// 请求处理上下文
#[derive(Debug, Clone)]
pub struct RequestCtx {
    pub request_id: String,
}

impl RequestCtx {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.request_id
    }
}

impl Display for RequestCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[请求 {}]", self.request_id)
    }
}
