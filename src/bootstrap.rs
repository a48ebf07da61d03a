use anyhow::{Context, Result};
use colored::Colorize;
use log::info;
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::signal;

use crate::archive::ArchiveMover;
use crate::config::Config;
use crate::constants::{DEFAULT_POLL_INTERVAL, DEFAULT_STABILITY_WINDOW, DISPATCH_QUEUE_CAPACITY};
use crate::dispatcher::{dispatch_queue, Courier, WorkerPool};
use crate::tracker::StabilityTracker;
use crate::types::TransferStats;
use crate::uploader::Uploader;
use crate::watcher::Watcher;

/// 创建发送、归档和日志目录，任何一个失败都无法继续运行
pub fn create_directories(config: &Config) -> Result<()> {
    for dir in [&config.send_dir, &config.archive_dir, &config.log_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("无法创建目录 {}", dir.display()))?;
    }
    Ok(())
}

pub async fn bootstrap(version: &str, config: Config) -> Result<()> {
    // 打印启动信息
    info!("{}", format!("启动文件发送程序 rust-filesender {}", version).green());

    let stats = Arc::new(TransferStats::new());
    let uploader = Uploader::from_config(&config, stats.clone())?;
    info!("使用的服务器地址: {}", uploader.endpoint());

    let tracker = Arc::new(StabilityTracker::new(*DEFAULT_STABILITY_WINDOW));
    let courier = Arc::new(Courier::new(
        uploader,
        ArchiveMover::new(config.archive_dir.clone()),
    ));

    let (queue_tx, queue_rx) = dispatch_queue(DISPATCH_QUEUE_CAPACITY);
    let pool = WorkerPool::start(config.num_workers, queue_rx, courier, tracker.clone());

    let watcher = Watcher::new(
        config.send_dir.clone(),
        tracker,
        queue_tx,
        *DEFAULT_POLL_INTERVAL,
    );
    let watcher_handle = tokio::spawn(watcher.run());

    // 处理终止信号；文件系统保存了待发送的文件，不等待正在进行的上传
    let signal = wait_for_shutdown(signal::ctrl_c()).await;

    watcher_handle.abort();
    pool.abort();
    info!("停止 {} 个发送任务，传输统计: {}", pool.len(), stats.snapshot());

    signal
}

/// 等待终止信号；无法监听信号时返回错误，让进程以失败状态退出
pub async fn wait_for_shutdown<F>(signal: F) -> Result<()>
where
    F: Future<Output = io::Result<()>>,
{
    signal.await.context("无法监听Ctrl+C信号")?;
    info!("收到终止信号，正在结束文件发送程序...");
    Ok(())
}
