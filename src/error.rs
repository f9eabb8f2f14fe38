use thiserror::Error;

use crate::models::RequestStatus;

/// 应用程序错误类型
///
/// 请求本身的业务失败（容量耗尽、阶段重试耗尽等）不走这里，
/// 而是作为 `FailureReason` 记录在请求记录上。
#[derive(Debug, Error)]
pub enum AppError {
    /// 持久化存储错误
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),
    /// 启动流水线失败
    #[error("启动错误: {0}")]
    Launch(#[from] LaunchError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 请求参数错误
    #[error("参数错误: {0}")]
    InvalidInput(String),
}

/// 持久化存储错误
#[derive(Debug, Error)]
pub enum StoreError {
    /// 请求不存在
    #[error("请求不存在: {request_id}")]
    RequestNotFound { request_id: String },
    /// 请求已存在
    #[error("请求已存在: {request_id}")]
    DuplicateRequest { request_id: String },
    /// 许可计数器不存在
    #[error("许可计数器不存在: {counter_id}")]
    CounterNotFound { counter_id: String },
    /// 非法状态迁移
    #[error("请求 {request_id} 无法从 {from} 迁移到 {to}")]
    InvalidTransition {
        request_id: String,
        from: RequestStatus,
        to: RequestStatus,
    },
    /// 快照写入失败
    #[error("快照写入失败 ({path}): {source}")]
    PersistFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 快照读取失败
    #[error("快照读取失败 ({path}): {source}")]
    LoadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 快照序列化/反序列化失败
    #[error("快照格式错误: {0}")]
    Serde(#[from] serde_json::Error),
}

/// 启动流水线失败
#[derive(Debug, Error)]
pub enum LaunchError {
    /// 流水线调度器已关闭
    #[error("流水线调度器已关闭，无法启动请求 {request_id}")]
    DispatcherClosed { request_id: String },
}

/// 完成通知投递失败
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("webhook 请求失败: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook 返回状态码 {0}")]
    Status(u16),
    #[error("通知通道已关闭")]
    ChannelClosed,
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
    /// 配置文件读取失败
    #[error("读取配置文件失败 ({path}): {source}")]
    FileReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 配置文件解析失败
    #[error("解析配置文件失败 ({path}): {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    /// 配置项取值非法
    #[error("配置项 {field} 非法: {message}")]
    Invalid { field: String, message: String },
}

// ========== 便捷构造函数 ==========

impl StoreError {
    pub fn not_found(request_id: impl Into<String>) -> Self {
        StoreError::RequestNotFound {
            request_id: request_id.into(),
        }
    }
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl AppError {
    /// 是否为"请求不存在"
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::Store(StoreError::RequestNotFound { .. }))
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;

/// 存储层结果类型
pub type StoreResult<T> = Result<T, StoreError>;
