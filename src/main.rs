use anyhow::{Context, Result};
use idp_orchestrator::utils::logging;
use idp_orchestrator::{App, Config};
use std::path::Path;

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    logging::init();

    // 加载配置：IDP_CONFIG 指向 TOML 文件时从文件加载，否则只用环境变量
    let config = match std::env::var("IDP_CONFIG") {
        Ok(path) => Config::from_toml_file(Path::new(&path))
            .with_context(|| format!("加载配置文件失败: {}", path))?,
        Err(_) => Config::from_env().context("加载环境变量配置失败")?,
    };

    // 初始化并运行应用
    App::initialize(config).await?.run().await?;

    Ok(())
}
