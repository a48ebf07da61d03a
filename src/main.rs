use anyhow::Result;
use log::{error, info};
use rust_filesender::bootstrap::{bootstrap, create_directories};
use rust_filesender::config::{ensure_env_file, Config};
use rust_filesender::constants::DEFAULT_LOG_CHECK_INTERVAL;
use rust_filesender::logger::init_logger;
use std::path::Path;

#[tokio::main]
async fn main() -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    let env_path = Path::new(".env");

    // 日志系统依赖配置中的目录，在此之前的错误只能输出到stderr
    let added = match ensure_env_file(env_path) {
        Ok(added) => added,
        Err(e) => {
            eprintln!("配置文件错误: {:#}", e);
            std::process::exit(1);
        }
    };
    let config = match Config::load(env_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("加载配置失败: {:#}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = create_directories(&config) {
        eprintln!("创建目录失败: {:#}", e);
        std::process::exit(1);
    }

    // 初始化日志
    let log_handle = match init_logger(&config.log_dir, &config.log_file) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("初始化日志失败: {:#}", e);
            std::process::exit(1);
        }
    };
    log_handle.start_periodic_check(*DEFAULT_LOG_CHECK_INTERVAL);

    if !added.is_empty() {
        info!("配置文件 {} 中写入了默认配置项: {}", env_path.display(), added.join(", "));
    }

    if let Err(e) = bootstrap(version, config).await {
        error!("启动错误: {:#}", e);
        drop(log_handle);
        std::process::exit(1);
    }

    drop(log_handle);
    Ok(())
}
