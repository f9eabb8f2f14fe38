//! 日志工具模块
//!
//! 提供日志初始化以及启动/统计信息的格式化输出

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::models::{PermitCounter, RequestStatus};

/// 初始化日志
///
/// 默认级别为 info，可以通过 `RUST_LOG` 覆盖。重复调用是安全的。
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 记录程序启动信息
pub fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 文档处理编排服务启动");
    info!("📊 最大并发数: {}", config.max_permits);
    info!(
        "🔁 准入重试: {} 次 | 阶段重试: {} 次",
        config.admission_max_retries, config.stage_max_retries
    );
    info!("⏳ 审核超时: {} 秒", config.review_timeout_secs);
    match &config.state_file {
        Some(path) => info!("💾 状态快照: {}", path),
        None => info!("💾 状态快照: 未配置（仅内存）"),
    }
    info!("{}", "=".repeat(60));
}

/// 打印状态统计
pub fn log_stats(counts: &[(RequestStatus, usize)], counter: &PermitCounter) {
    info!("\n{}", "=".repeat(60));
    info!("📊 请求状态统计");
    info!("{}", "=".repeat(60));
    for (status, count) in counts {
        info!("{:<10} {}", status.as_str(), count);
    }
    info!(
        "🎫 许可: 占用 {}/{}，可用 {}",
        counter.in_use(),
        counter.max_permits,
        counter.available_permits
    );
    info!("{}", "=".repeat(60));
}

/// 截断长文本用于日志显示
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("abc", 5), "abc");
        assert_eq!(truncate_text("abcdef", 3), "abc...");
        assert_eq!(truncate_text("文档处理服务", 2), "文档...");
    }
}
