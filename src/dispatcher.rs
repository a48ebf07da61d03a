use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::archive::ArchiveMover;
use crate::tracker::StabilityTracker;
use crate::uploader::Uploader;

/// 工作线程对每个就绪文件执行的操作
#[async_trait]
pub trait FileHandler: Send + Sync {
    async fn handle(&self, path: &Path) -> Result<()>;
}

/// 发送文件，成功后移动到归档目录
pub struct Courier {
    uploader: Uploader,
    archiver: ArchiveMover,
}

impl Courier {
    pub fn new(uploader: Uploader, archiver: ArchiveMover) -> Self {
        Self { uploader, archiver }
    }
}

#[async_trait]
impl FileHandler for Courier {
    async fn handle(&self, path: &Path) -> Result<()> {
        let receipt = self.uploader.upload(path).await?;
        let archived = self
            .archiver
            .archive(path)
            .await
            .with_context(|| format!("文件已发送但归档失败: {}", path.display()))?;
        info!(
            "{} ({}) 已归档到 {}",
            receipt.file_name,
            bytesize::ByteSize(receipt.bytes),
            archived.display()
        );
        Ok(())
    }
}

pub fn dispatch_queue(capacity: usize) -> (mpsc::Sender<PathBuf>, mpsc::Receiver<PathBuf>) {
    mpsc::channel(capacity.max(1))
}

/// 固定数量的工作任务，共享同一个队列
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        workers: usize,
        queue: mpsc::Receiver<PathBuf>,
        handler: Arc<dyn FileHandler>,
        tracker: Arc<StabilityTracker>,
    ) -> Self {
        let workers = workers.max(1);
        info!("启动 {} 个发送任务", workers);

        let queue = Arc::new(Mutex::new(queue));
        let handles = (0..workers)
            .map(|id| {
                let queue = queue.clone();
                let handler = handler.clone();
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    worker_loop(id, queue, handler, tracker).await;
                })
            })
            .collect();

        WorkerPool { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// 等待所有工作任务退出（队列的发送端全部关闭后）
    pub async fn join(self) {
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                error!("发送任务异常退出: {}", e);
            }
        }
    }

    /// 放弃所有工作任务，正在进行的上传不会被等待
    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

async fn worker_loop(
    id: usize,
    queue: Arc<Mutex<mpsc::Receiver<PathBuf>>>,
    handler: Arc<dyn FileHandler>,
    tracker: Arc<StabilityTracker>,
) {
    loop {
        let next = {
            let mut queue = queue.lock().await;
            queue.recv().await
        };
        let Some(path) = next else {
            debug!("发送任务 {} 退出", id);
            break;
        };

        if let Err(e) = handler.handle(&path).await {
            error!("发送文件错误 {}: {:#}", path.display(), e);
        }
        tracker.release(&path);
    }
}
