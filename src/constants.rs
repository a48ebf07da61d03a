use lazy_static::lazy_static;
use std::time::Duration;

pub const DEFAULT_WORKERS: usize = 8;
pub const MAX_LOG_SIZE: u64 = 2 * 1024 * 1024; // 2 MB
pub const DISPATCH_QUEUE_CAPACITY: usize = 1;
pub const ARCHIVE_DATE_FORMAT: &str = "%Y-%m-%d";

lazy_static! {
    pub static ref DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
    pub static ref DEFAULT_STABILITY_WINDOW: Duration = Duration::from_secs(2);
    pub static ref DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub static ref DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
    pub static ref DEFAULT_LOG_CHECK_INTERVAL: Duration = Duration::from_secs(60);
}
