use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::fmt;

#[derive(Debug, Clone, Default)]
pub struct TransferSnapshot {
    pub total_files_sent: u64,
    pub total_bytes_sent: u64,
    pub last_file_name: Option<String>,
    pub last_sent_at: Option<DateTime<Local>>,
}

impl fmt::Display for TransferSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "已发送文件数: {} | 总大小: {}",
            self.total_files_sent,
            bytesize::ByteSize(self.total_bytes_sent)
        )?;
        if let (Some(name), Some(at)) = (&self.last_file_name, &self.last_sent_at) {
            write!(f, " | 最后文件: {} 于 {}", name, at.to_rfc3339())?;
        }
        Ok(())
    }
}

/// 进程内的传输统计，只在上传成功后更新
#[derive(Debug, Default)]
pub struct TransferStats {
    inner: Mutex<TransferSnapshot>,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次成功的上传，返回更新后的快照
    pub fn record(&self, file_name: &str, bytes: u64) -> TransferSnapshot {
        let mut stats = self.inner.lock();
        stats.total_files_sent += 1;
        stats.total_bytes_sent += bytes;
        stats.last_file_name = Some(file_name.to_string());
        stats.last_sent_at = Some(Local::now());
        stats.clone()
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        self.inner.lock().clone()
    }
}
