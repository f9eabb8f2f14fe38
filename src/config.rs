//! 程序配置
//!
//! 所有配置项都有显式默认值；可以通过环境变量或 TOML 文件覆盖。

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::models::Stage;

/// 以秒为单位的时长配置上限（约 10 年）
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 3600;

/// 程序配置
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 许可计数器 ID
    pub counter_id: String,
    /// 全局并发上限
    pub max_permits: u32,
    /// 准入最大重试次数
    pub admission_max_retries: u32,
    pub admission_backoff_base_ms: u64,
    pub admission_backoff_max_ms: u64,
    /// 每个阶段瞬时失败的重试预算
    pub stage_max_retries: u32,
    pub stage_backoff_base_ms: u64,
    pub stage_backoff_max_ms: u64,
    /// 人工审核最长等待时间
    pub review_timeout_secs: u64,
    /// 已投递未确认消息的不可见窗口
    pub visibility_timeout_secs: u64,
    /// 超过该投递次数的消息视为毒消息
    pub max_delivery_count: u32,
    /// 审核超时扫描间隔
    pub sweep_interval_secs: u64,
    /// 已收尾的请求保留多久后清理
    pub retention_secs: u64,
    /// 准入消费者数量
    pub admission_workers: usize,
    /// 队列为空时的轮询间隔
    pub poll_interval_ms: u64,
    /// 状态快照文件，不设置则仅保存在内存
    pub state_file: Option<String>,
    /// HTTP 监听地址
    pub listen_addr: String,
    /// 阶段协作方服务地址
    pub stage_service_url: String,
    /// 阶段调用超时
    pub stage_timeout_ms: u64,
    /// 完成通知 webhook，不设置则只写日志
    pub completion_webhook_url: Option<String>,
    /// 各阶段配置
    pub stages: StageConfigs,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            counter_id: "workflow_counter".to_string(),
            max_permits: 100,
            admission_max_retries: 10,
            admission_backoff_base_ms: 1_000,
            admission_backoff_max_ms: 60_000,
            stage_max_retries: 3,
            stage_backoff_base_ms: 500,
            stage_backoff_max_ms: 30_000,
            review_timeout_secs: 7 * 24 * 3600,
            visibility_timeout_secs: 300,
            max_delivery_count: 20,
            sweep_interval_secs: 60,
            retention_secs: 7 * 24 * 3600,
            admission_workers: 2,
            poll_interval_ms: 200,
            state_file: None,
            listen_addr: "127.0.0.1:8080".to_string(),
            stage_service_url: "http://127.0.0.1:9000".to_string(),
            stage_timeout_ms: 120_000,
            completion_webhook_url: None,
            stages: StageConfigs::default(),
        }
    }
}

impl Config {
    /// 从环境变量加载配置（未设置的项使用默认值）
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay_env()
    }

    /// 从 TOML 文件加载配置，再用环境变量覆盖
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadFailed {
                path: path.display().to_string(),
                source,
            })?;
        let config: Config =
            toml::from_str(&content).map_err(|source| ConfigError::TomlParseFailed {
                path: path.display().to_string(),
                source,
            })?;
        config.overlay_env()
    }

    fn overlay_env(self) -> Result<Self, ConfigError> {
        let config = Self {
            counter_id: env_string("IDP_COUNTER_ID").unwrap_or(self.counter_id),
            max_permits: env_parse("IDP_MAX_PERMITS", self.max_permits)?,
            admission_max_retries: env_parse("IDP_ADMISSION_MAX_RETRIES", self.admission_max_retries)?,
            admission_backoff_base_ms: env_parse("IDP_ADMISSION_BACKOFF_BASE_MS", self.admission_backoff_base_ms)?,
            admission_backoff_max_ms: env_parse("IDP_ADMISSION_BACKOFF_MAX_MS", self.admission_backoff_max_ms)?,
            stage_max_retries: env_parse("IDP_STAGE_MAX_RETRIES", self.stage_max_retries)?,
            stage_backoff_base_ms: env_parse("IDP_STAGE_BACKOFF_BASE_MS", self.stage_backoff_base_ms)?,
            stage_backoff_max_ms: env_parse("IDP_STAGE_BACKOFF_MAX_MS", self.stage_backoff_max_ms)?,
            review_timeout_secs: env_parse("IDP_REVIEW_TIMEOUT_SECS", self.review_timeout_secs)?,
            visibility_timeout_secs: env_parse("IDP_VISIBILITY_TIMEOUT_SECS", self.visibility_timeout_secs)?,
            max_delivery_count: env_parse("IDP_MAX_DELIVERY_COUNT", self.max_delivery_count)?,
            sweep_interval_secs: env_parse("IDP_SWEEP_INTERVAL_SECS", self.sweep_interval_secs)?,
            retention_secs: env_parse("IDP_RETENTION_SECS", self.retention_secs)?,
            admission_workers: env_parse("IDP_ADMISSION_WORKERS", self.admission_workers)?,
            poll_interval_ms: env_parse("IDP_POLL_INTERVAL_MS", self.poll_interval_ms)?,
            state_file: env_string("IDP_STATE_FILE").or(self.state_file),
            listen_addr: env_string("IDP_LISTEN_ADDR").unwrap_or(self.listen_addr),
            stage_service_url: env_string("IDP_STAGE_SERVICE_URL").unwrap_or(self.stage_service_url),
            stage_timeout_ms: env_parse("IDP_STAGE_TIMEOUT_MS", self.stage_timeout_ms)?,
            completion_webhook_url: env_string("IDP_COMPLETION_WEBHOOK_URL")
                .or(self.completion_webhook_url),
            stages: self.stages,
        };
        config.validate()?;
        Ok(config)
    }

    /// 启动时校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.counter_id.trim().is_empty() {
            return Err(ConfigError::invalid("counter_id", "不能为空"));
        }
        if self.max_permits == 0 {
            return Err(ConfigError::invalid("max_permits", "必须大于 0"));
        }
        if self.admission_backoff_base_ms > self.admission_backoff_max_ms {
            return Err(ConfigError::invalid(
                "admission_backoff_base_ms",
                "不能大于 admission_backoff_max_ms",
            ));
        }
        if self.stage_backoff_base_ms > self.stage_backoff_max_ms {
            return Err(ConfigError::invalid(
                "stage_backoff_base_ms",
                "不能大于 stage_backoff_max_ms",
            ));
        }
        // 每次准入重试都会产生一次投递，投递上限必须留出余量
        if self.max_delivery_count <= self.admission_max_retries + 1 {
            return Err(ConfigError::invalid(
                "max_delivery_count",
                format!(
                    "必须大于 admission_max_retries + 1 (= {})",
                    self.admission_max_retries + 1
                ),
            ));
        }
        if self.admission_workers == 0 {
            return Err(ConfigError::invalid("admission_workers", "必须大于 0"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::invalid("sweep_interval_secs", "必须大于 0"));
        }
        if self.retention_secs == 0 {
            return Err(ConfigError::invalid("retention_secs", "必须大于 0"));
        }
        let durations = [
            ("review_timeout_secs", self.review_timeout_secs),
            ("visibility_timeout_secs", self.visibility_timeout_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("retention_secs", self.retention_secs),
        ];
        for (field, secs) in durations {
            if secs > MAX_DURATION_SECS {
                return Err(ConfigError::invalid(
                    field,
                    format!("不能超过 {} 秒", MAX_DURATION_SECS),
                ));
            }
        }
        self.stages.validate()
    }

    pub fn admission_backoff_base(&self) -> Duration {
        Duration::from_millis(self.admission_backoff_base_ms)
    }

    pub fn admission_backoff_max(&self) -> Duration {
        Duration::from_millis(self.admission_backoff_max_ms)
    }

    pub fn stage_backoff_base(&self) -> Duration {
        Duration::from_millis(self.stage_backoff_base_ms)
    }

    pub fn stage_backoff_max(&self) -> Duration {
        Duration::from_millis(self.stage_backoff_max_ms)
    }

    pub fn review_timeout(&self) -> chrono::Duration {
        bounded_secs(self.review_timeout_secs)
    }

    pub fn visibility_timeout(&self) -> chrono::Duration {
        bounded_secs(self.visibility_timeout_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        bounded_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }
}

fn bounded_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

fn env_string(var_name: &str) -> Option<String> {
    std::env::var(var_name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(var_name: &str, default: T) -> Result<T, ConfigError> {
    match env_string(var_name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::EnvVarParseFailed {
                var_name: var_name.to_string(),
                value,
                expected_type: std::any::type_name::<T>().to_string(),
            }),
        None => Ok(default),
    }
}

// ========== 阶段配置 ==========

/// 单个阶段的类型化配置
///
/// 闭集：每个协作方阶段对应一种配置记录，Review 没有协作方配置。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "camelCase")]
pub enum StageConfig {
    Ingest(IngestConfig),
    Classify(ClassifyConfig),
    Extract(ExtractConfig),
    Assess(AssessConfig),
    Summarize(SummarizeConfig),
    Finalize(FinalizeConfig),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// OCR 特性，例如 LAYOUT / TABLES
    pub ocr_features: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            ocr_features: vec!["LAYOUT".to_string()],
        }
    }
}

/// 分类方式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClassificationMethod {
    MultimodalPageLevel,
    TextbasedHolistic,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifyConfig {
    pub method: ClassificationMethod,
    pub model_id: String,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            method: ClassificationMethod::MultimodalPageLevel,
            model_id: "default-classifier".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    pub model_id: String,
    pub temperature: f32,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            model_id: "default-extractor".to_string(),
            temperature: 0.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssessConfig {
    pub model_id: String,
    /// 是否启用人工审核
    pub hitl_enabled: bool,
    /// 置信度低于该阈值时进入人工审核
    pub confidence_threshold: f64,
}

impl Default for AssessConfig {
    fn default() -> Self {
        Self {
            model_id: "default-assessor".to_string(),
            hitl_enabled: true,
            confidence_threshold: 0.8,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizeConfig {
    pub model_id: String,
}

impl Default for SummarizeConfig {
    fn default() -> Self {
        Self {
            model_id: "default-summarizer".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizeConfig {
    pub output_prefix: String,
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self {
            output_prefix: "output/".to_string(),
        }
    }
}

/// 全部阶段配置
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfigs {
    pub ingest: IngestConfig,
    pub classify: ClassifyConfig,
    pub extract: ExtractConfig,
    pub assess: AssessConfig,
    pub summarize: SummarizeConfig,
    pub finalize: FinalizeConfig,
}

impl StageConfigs {
    /// 获取某个阶段的配置，Review 返回 `None`
    pub fn for_stage(&self, stage: Stage) -> Option<StageConfig> {
        match stage {
            Stage::Ingest => Some(StageConfig::Ingest(self.ingest.clone())),
            Stage::Classify => Some(StageConfig::Classify(self.classify.clone())),
            Stage::Extract => Some(StageConfig::Extract(self.extract.clone())),
            Stage::Assess => Some(StageConfig::Assess(self.assess.clone())),
            Stage::Review => None,
            Stage::Summarize => Some(StageConfig::Summarize(self.summarize.clone())),
            Stage::Finalize => Some(StageConfig::Finalize(self.finalize.clone())),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let model_ids = [
            ("stages.classify.model_id", &self.classify.model_id),
            ("stages.extract.model_id", &self.extract.model_id),
            ("stages.assess.model_id", &self.assess.model_id),
            ("stages.summarize.model_id", &self.summarize.model_id),
        ];
        for (field, value) in model_ids {
            if value.trim().is_empty() {
                return Err(ConfigError::invalid(field, "不能为空"));
            }
        }
        if !(0.0..=1.0).contains(&self.extract.temperature) {
            return Err(ConfigError::invalid(
                "stages.extract.temperature",
                "必须在 [0, 1] 范围内",
            ));
        }
        if !(0.0..=1.0).contains(&self.assess.confidence_threshold) {
            return Err(ConfigError::invalid(
                "stages.assess.confidence_threshold",
                "必须在 [0, 1] 范围内",
            ));
        }
        Ok(())
    }
}
