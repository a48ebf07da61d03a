use anyhow::{anyhow, Context, Result};
use log::{debug, error, info};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::mpsc;

use crate::tracker::{Fingerprint, Observation, StabilityTracker};

/// 一轮扫描的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub seen: usize,
    pub new: usize,
    pub enqueued: usize,
    pub removed: usize,
}

/// 定时扫描发送目录，把稳定下来的文件放入发送队列
pub struct Watcher {
    source_dir: PathBuf,
    tracker: Arc<StabilityTracker>,
    queue: mpsc::Sender<PathBuf>,
    poll_interval: Duration,
}

impl Watcher {
    pub fn new(
        source_dir: PathBuf,
        tracker: Arc<StabilityTracker>,
        queue: mpsc::Sender<PathBuf>,
        poll_interval: Duration,
    ) -> Self {
        // 跟踪表的键使用绝对路径
        let source_dir = std::fs::canonicalize(&source_dir).unwrap_or(source_dir);
        Watcher {
            source_dir,
            tracker,
            queue,
            poll_interval,
        }
    }

    pub fn source_dir(&self) -> &std::path::Path {
        &self.source_dir
    }

    /// 一直扫描，直到发送队列被关闭
    pub async fn run(self) {
        info!("开始监控目录: {}", self.source_dir.display());
        loop {
            if let Err(e) = self.poll_once().await {
                if self.queue.is_closed() {
                    info!("发送队列已关闭，停止监控目录");
                    break;
                }
                error!("扫描目录错误: {:#}", e);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub async fn poll_once(&self) -> Result<PollSummary> {
        let mut entries = fs::read_dir(&self.source_dir)
            .await
            .with_context(|| format!("无法读取目录 {}", self.source_dir.display()))?;

        let mut summary = PollSummary::default();
        let mut present = HashSet::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("无法读取目录 {}", self.source_dir.display()))?
        {
            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) => {
                    // 文件在列目录和读取属性之间被移走
                    debug!("无法读取文件属性 {}: {}", path.display(), e);
                    continue;
                }
            };
            if metadata.is_dir() {
                continue;
            }
            // 队列满时send会等待，所以每个文件读取属性后重新取时间
            let now = Instant::now();

            summary.seen += 1;
            present.insert(path.clone());

            match self.tracker.observe(&path, Fingerprint::from(&metadata), now) {
                Observation::New => {
                    summary.new += 1;
                    info!("发现新文件: {}", path.display());
                }
                Observation::Changed => debug!("文件仍在变化: {}", path.display()),
                Observation::Unchanged => {}
            }

            if self.tracker.claim_if_ready(&path, now) {
                let waited = self
                    .tracker
                    .first_seen(&path)
                    .map(|seen| now.saturating_duration_since(seen))
                    .unwrap_or_default();
                info!(
                    "文件 {} 已超过 {:?} 未变化，开始发送 (发现后等待 {:.1}s)",
                    path.display(),
                    self.tracker.window(),
                    waited.as_secs_f64()
                );
                if self.queue.send(path.clone()).await.is_err() {
                    self.tracker.release(&path);
                    return Err(anyhow!("发送队列已关闭"));
                }
                summary.enqueued += 1;
            } else if !self.tracker.is_in_flight(&path) {
                debug!("文件 {} 尚未准备好发送", path.display());
            }
        }

        for path in self.tracker.retain_present(&present) {
            summary.removed += 1;
            info!("文件已从跟踪中移除: {}", path.display());
        }

        Ok(summary)
    }
}
