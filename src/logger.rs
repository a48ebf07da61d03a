use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime};
use flate2::write::GzEncoder;
use flate2::Compression;
use log::LevelFilter;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_appender::non_blocking::{NonBlocking, NonBlockingBuilder, WorkerGuard};

use crate::constants::{ARCHIVE_DATE_FORMAT, MAX_LOG_SIZE};

const LINE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const TAIL_BYTES: u64 = 8 * 1024;

// 用于控制定时检查线程只启动一次
static CHECKER_STARTED: AtomicBool = AtomicBool::new(false);

/// 负责活动日志文件的轮转：移动到日期目录、压缩、删除未压缩副本
#[derive(Debug, Clone)]
pub struct LogRotator {
    log_dir: PathBuf,
    file_name: String,
    max_size: u64,
}

impl LogRotator {
    pub fn new(log_dir: PathBuf, file_name: impl Into<String>, max_size: u64) -> Self {
        Self {
            log_dir,
            file_name: file_name.into(),
            max_size,
        }
    }

    pub fn active_path(&self) -> PathBuf {
        self.log_dir.join(&self.file_name)
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn active_size(&self) -> u64 {
        fs::metadata(self.active_path()).map(|m| m.len()).unwrap_or(0)
    }

    pub fn open_active(&self) -> io::Result<(File, u64)> {
        fs::create_dir_all(&self.log_dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.active_path())?;
        let size = file.metadata()?.len();
        Ok((file, size))
    }

    /// 读取活动日志最后两行，返回其中最后一个可解析的日期
    pub fn last_logged_date(&self) -> Option<NaiveDate> {
        let mut file = File::open(self.active_path()).ok()?;
        let len = file.metadata().ok()?.len();
        file.seek(SeekFrom::Start(len.saturating_sub(TAIL_BYTES))).ok()?;
        let mut tail = Vec::new();
        file.read_to_end(&mut tail).ok()?;

        let tail = String::from_utf8_lossy(&tail);
        tail.lines()
            .rev()
            .filter(|line| !line.trim().is_empty())
            .take(2)
            .find_map(line_date)
    }

    /// 需要轮转时返回归档使用的日期：跨天时用日志内容所属的日期，超过大小时用今天
    pub fn due(&self, today: NaiveDate) -> Option<NaiveDate> {
        if let Some(date) = self.last_logged_date() {
            if date < today {
                return Some(date);
            }
        }
        if self.active_size() > self.max_size {
            return Some(today);
        }
        None
    }

    pub fn check(&self, today: NaiveDate) -> Result<Option<PathBuf>> {
        match self.due(today) {
            Some(date) => self.rotate(date).map(Some),
            None => Ok(None),
        }
    }

    /// 把活动日志移动到 <log_dir>/<date>/ 并压缩为 <date>-<n>.tar.gz
    pub fn rotate(&self, date: NaiveDate) -> Result<PathBuf> {
        let day = date.format(ARCHIVE_DATE_FORMAT).to_string();
        let day_dir = self.log_dir.join(&day);
        fs::create_dir_all(&day_dir)
            .with_context(|| format!("无法创建日志归档目录 {}", day_dir.display()))?;

        let active = self.active_path();
        let moved = day_dir.join(&self.file_name);
        fs::rename(&active, &moved)
            .with_context(|| format!("移动日志文件失败 {}", active.display()))?;

        let archive = next_archive_path(&day_dir, &day);
        if let Err(e) = self.compress(&moved, &archive) {
            let _ = fs::remove_file(&archive);
            // 压缩失败时把日志放回原处，等下一次检查重试
            if !active.exists() {
                let _ = fs::rename(&moved, &active);
            }
            return Err(e.context(format!("归档日志失败 {}", archive.display())));
        }

        fs::remove_file(&moved)
            .with_context(|| format!("无法删除已压缩的日志 {}", moved.display()))?;
        Ok(archive)
    }

    fn compress(&self, source: &Path, archive: &Path) -> Result<()> {
        let file = File::create(archive)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_path_with_name(source, &self.file_name)?;
        builder.into_inner()?.finish()?.sync_all()?;
        Ok(())
    }
}

fn next_archive_path(day_dir: &Path, day: &str) -> PathBuf {
    (1u32..)
        .map(|n| day_dir.join(format!("{}-{}.tar.gz", day, n)))
        .find(|path| !path.exists())
        .unwrap_or_else(|| day_dir.join(format!("{}.tar.gz", day)))
}

/// 解析日志行开头的时间戳，例如 "[2024-03-15 10:00:00.123 INFO ...]"
fn line_date(line: &str) -> Option<NaiveDate> {
    let trimmed = line.trim_start_matches(|c: char| c == '[' || c.is_whitespace());
    let stamp = trimmed.get(..19)?;
    NaiveDateTime::parse_from_str(stamp, LINE_TIMESTAMP_FORMAT)
        .ok()
        .map(|dt| dt.date())
}

/// 当前打开的活动日志以及它的大小和最后一行的日期
struct ActiveLog {
    rotator: LogRotator,
    file: Option<File>,
    size: u64,
    last_date: Option<NaiveDate>,
    // 写入时触发的轮转失败后暂停，交给定时检查重试
    rotation_blocked: bool,
}

impl ActiveLog {
    fn open(rotator: LogRotator) -> io::Result<Self> {
        let last_date = rotator.last_logged_date();
        let (file, size) = rotator.open_active()?;
        Ok(Self {
            rotator,
            file: Some(file),
            size,
            last_date,
            rotation_blocked: false,
        })
    }

    fn write_line(&mut self, buf: &[u8], today: NaiveDate) -> io::Result<usize> {
        self.rotate_if_due(today);

        if self.file.is_none() {
            let (file, size) = self.rotator.open_active()?;
            self.file = Some(file);
            self.size = size;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "日志文件不可用"))?;
        file.write_all(buf)?;
        self.size += buf.len() as u64;
        self.last_date = std::str::from_utf8(buf)
            .ok()
            .and_then(line_date)
            .or(Some(today));

        if !self.rotation_blocked && self.size > self.rotator.max_size() {
            self.rotate_logged(today);
        }
        Ok(buf.len())
    }

    fn rotate_if_due(&mut self, today: NaiveDate) {
        if self.rotation_blocked {
            return;
        }
        let last_date = self.last_date;
        match last_date {
            Some(date) if date < today => self.rotate_logged(date),
            _ if self.size > self.rotator.max_size() => self.rotate_logged(today),
            _ => {}
        }
    }

    fn rotate_logged(&mut self, date: NaiveDate) {
        match self.rotate(date) {
            Ok(archive) => log::info!("日志已归档到: {}", archive.display()),
            Err(e) => {
                self.rotation_blocked = true;
                log::error!("日志轮转失败: {:#}", e);
            }
        }
    }

    fn rotate(&mut self, date: NaiveDate) -> Result<PathBuf> {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
        let result = self.rotator.rotate(date);

        let (file, size) = self
            .rotator
            .open_active()
            .context("无法重新打开日志文件")?;
        self.file = Some(file);
        self.size = size;
        if result.is_ok() {
            self.last_date = None;
        }
        result
    }

    /// 定时检查：重新读取日志文件的大小和最后两行
    fn check(&mut self, today: NaiveDate) -> Result<Option<PathBuf>> {
        let result = match self.rotator.due(today) {
            Some(date) => self.rotate(date).map(Some),
            None => Ok(None),
        };
        self.rotation_blocked = result.is_err();
        result
    }
}

/// 可以在多个线程之间共享的日志文件写入器
#[derive(Clone)]
pub struct SharedLogWriter {
    inner: Arc<Mutex<ActiveLog>>,
}

impl SharedLogWriter {
    pub fn open(rotator: LogRotator) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(ActiveLog::open(rotator)?)),
        })
    }

    pub fn write_line_on(&self, buf: &[u8], today: NaiveDate) -> io::Result<usize> {
        self.inner.lock().write_line(buf, today)
    }

    pub fn check_on(&self, today: NaiveDate) -> Result<Option<PathBuf>> {
        self.inner.lock().check(today)
    }

    pub fn check(&self) -> Result<Option<PathBuf>> {
        self.check_on(Local::now().date_naive())
    }
}

impl Write for SharedLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_line_on(buf, Local::now().date_naive())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.lock().file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// 日志系统的句柄，需要在程序运行期间保持存活
pub struct LogHandle {
    writer: SharedLogWriter,
    _guard: WorkerGuard,
}

impl LogHandle {
    /// 启动后台线程，定期检查日志是否需要轮转
    pub fn start_periodic_check(&self, interval: Duration) {
        if CHECKER_STARTED.swap(true, Ordering::SeqCst) {
            return;
        }
        let writer = self.writer.clone();
        thread::spawn(move || loop {
            thread::sleep(interval);
            match writer.check() {
                Ok(Some(archive)) => log::info!("日志已归档到: {}", archive.display()),
                Ok(None) => log::debug!("日志无需轮转"),
                Err(e) => log::error!("日志轮转失败: {:#}", e),
            }
        });
    }
}

/// 文件一侧的非阻塞写入器；缓冲区满时等待而不是丢弃日志
fn file_sink(writer: SharedLogWriter) -> (NonBlocking, WorkerGuard) {
    NonBlockingBuilder::default().lossy(false).finish(writer)
}

pub fn init_logger(log_dir: &Path, file_name: &str) -> Result<LogHandle> {
    // 默认日志级别为INFO，但可以通过RUST_LOG环境变量覆盖
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }

    fs::create_dir_all(log_dir)
        .with_context(|| format!("无法创建日志目录 {}", log_dir.display()))?;

    // 启动时先检查一次遗留的日志文件
    let rotator = LogRotator::new(log_dir.to_path_buf(), file_name, MAX_LOG_SIZE);
    let startup_rotation = rotator.check(Local::now().date_naive());

    let writer = SharedLogWriter::open(rotator)
        .with_context(|| format!("无法打开日志文件 {}", log_dir.join(file_name).display()))?;

    // 设置非阻塞写入
    let (non_blocking, guard) = file_sink(writer.clone());

    // 同时写入标准输出和文件的自定义Writer
    struct DualWriter {
        console: io::Stdout,
        file: Box<dyn Write + Send>,
    }

    impl Write for DualWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let console_result = self.console.write(buf);
            let _ = self.file.write(buf);
            console_result
        }

        fn flush(&mut self) -> io::Result<()> {
            let _ = self.console.flush();
            let _ = self.file.flush();
            Ok(())
        }
    }

    let dual_writer = DualWriter {
        console: io::stdout(),
        file: Box::new(non_blocking),
    };

    env_logger::Builder::new()
        .format(|buf, record| {
            let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            writeln!(
                buf,
                "[{} {:<5} {}] {}",
                timestamp,
                record.level(),
                record.target(),
                record.args()
            )
        })
        .filter(None, LevelFilter::Info)
        .parse_env("RUST_LOG")
        .target(env_logger::Target::Pipe(Box::new(dual_writer)))
        .try_init()
        .map_err(|e| anyhow!("初始化日志系统失败: {}", e))?;

    match startup_rotation {
        Ok(Some(archive)) => log::info!("启动时已归档旧日志: {}", archive.display()),
        Ok(None) => {}
        Err(e) => log::error!("启动时日志轮转失败: {:#}", e),
    }
    log::info!(
        "日志系统启动，日志文件: {}，超过 {} 或跨天时自动归档",
        log_dir.join(file_name).display(),
        bytesize::ByteSize(MAX_LOG_SIZE)
    );

    Ok(LogHandle {
        writer,
        _guard: guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    fn line(date: &str, msg: &str) -> Vec<u8> {
        format!("[{} 10:00:00.000 INFO  test] {}\n", date, msg).into_bytes()
    }

    fn archive_entries(path: &Path) -> Vec<(String, String)> {
        let mut archive = tar::Archive::new(GzDecoder::new(File::open(path).unwrap()));
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let name = entry.path().unwrap().to_string_lossy().into_owned();
                let mut body = String::new();
                entry.read_to_string(&mut body).unwrap();
                (name, body)
            })
            .collect()
    }

    #[test]
    fn parses_leading_timestamp() {
        assert_eq!(
            line_date("[2024-03-14 23:59:59.999 INFO  x] done"),
            NaiveDate::from_ymd_opt(2024, 3, 14)
        );
        assert_eq!(line_date("2024-03-14 08:00:00 plain"), NaiveDate::from_ymd_opt(2024, 3, 14));
        assert_eq!(line_date("garbage"), None);
        assert_eq!(line_date("日志"), None);
    }

    #[test]
    fn rotate_compresses_into_dated_archive() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = LogRotator::new(dir.path().to_path_buf(), "app.log", 1024);
        fs::write(rotator.active_path(), line("2024-03-15", "hello")).unwrap();

        let archive = rotator.rotate(today()).unwrap();
        let day_dir = dir.path().join("2024-03-15");
        assert_eq!(archive, day_dir.join("2024-03-15-1.tar.gz"));
        assert!(!rotator.active_path().exists());
        assert!(!day_dir.join("app.log").exists());

        let entries = archive_entries(&archive);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "app.log");
        assert!(entries[0].1.contains("hello"));
    }

    #[test]
    fn sequence_number_picks_lowest_free() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = LogRotator::new(dir.path().to_path_buf(), "app.log", 1024);
        let day_dir = dir.path().join("2024-03-15");
        fs::create_dir_all(&day_dir).unwrap();
        fs::write(day_dir.join("2024-03-15-1.tar.gz"), b"old").unwrap();

        fs::write(rotator.active_path(), b"x\n").unwrap();
        assert_eq!(
            rotator.rotate(today()).unwrap(),
            day_dir.join("2024-03-15-2.tar.gz")
        );
        fs::write(rotator.active_path(), b"y\n").unwrap();
        assert_eq!(
            rotator.rotate(today()).unwrap(),
            day_dir.join("2024-03-15-3.tar.gz")
        );
    }

    #[test]
    fn rotating_missing_log_fails_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = LogRotator::new(dir.path().to_path_buf(), "app.log", 1024);
        assert!(rotator.rotate(today()).is_err());
        assert!(!dir.path().join("2024-03-15").join("2024-03-15-1.tar.gz").exists());
    }

    #[test]
    fn due_prefers_date_of_old_content() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = LogRotator::new(dir.path().to_path_buf(), "app.log", 16);
        assert_eq!(rotator.due(today()), None);

        let mut content = line("2024-03-13", "first");
        content.extend(line("2024-03-14", "second"));
        fs::write(rotator.active_path(), content).unwrap();
        assert_eq!(rotator.due(today()), NaiveDate::from_ymd_opt(2024, 3, 14));

        fs::write(rotator.active_path(), line("2024-03-15", "big enough to pass sixteen")).unwrap();
        assert_eq!(rotator.due(today()), Some(today()));
    }

    #[test]
    fn size_threshold_rotates_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = LogRotator::new(dir.path().to_path_buf(), "app.log", 100);
        let writer = SharedLogWriter::open(rotator.clone()).unwrap();

        for i in 0..3 {
            writer
                .write_line_on(&line("2024-03-15", &format!("line {:02}", i)), today())
                .unwrap();
        }
        writer.write_line_on(&line("2024-03-15", "after"), today()).unwrap();

        let day_dir = dir.path().join("2024-03-15");
        assert!(day_dir.join("2024-03-15-1.tar.gz").exists());
        assert!(!day_dir.join("2024-03-15-2.tar.gz").exists());

        let active = fs::read_to_string(rotator.active_path()).unwrap();
        assert_eq!(active.lines().count(), 1);
        assert!(active.contains("after"));

        let archived = archive_entries(&day_dir.join("2024-03-15-1.tar.gz"));
        assert_eq!(archived[0].1.lines().count(), 3);
    }

    #[test]
    fn day_change_rotates_under_previous_date() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = LogRotator::new(dir.path().to_path_buf(), "app.log", 1024 * 1024);
        fs::write(rotator.active_path(), line("2024-03-14", "yesterday")).unwrap();

        let writer = SharedLogWriter::open(rotator.clone()).unwrap();
        writer.write_line_on(&line("2024-03-15", "today"), today()).unwrap();

        let archive = dir.path().join("2024-03-14").join("2024-03-14-1.tar.gz");
        assert!(archive.exists());
        assert!(archive_entries(&archive)[0].1.contains("yesterday"));
        assert!(fs::read_to_string(rotator.active_path()).unwrap().contains("today"));
        assert!(!dir.path().join("2024-03-15").exists());
    }

    #[test]
    fn periodic_check_rotates_stale_log() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = LogRotator::new(dir.path().to_path_buf(), "app.log", 1024 * 1024);
        let writer = SharedLogWriter::open(rotator.clone()).unwrap();
        writer.write_line_on(&line("2024-03-15", "evening"), today()).unwrap();

        assert_eq!(writer.check_on(today()).unwrap(), None);

        let tomorrow = today().succ_opt().unwrap();
        let archive = writer.check_on(tomorrow).unwrap().unwrap();
        assert_eq!(archive, dir.path().join("2024-03-15").join("2024-03-15-1.tar.gz"));
        assert_eq!(fs::metadata(rotator.active_path()).unwrap().len(), 0);
    }

    #[test]
    fn burst_of_lines_is_not_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = LogRotator::new(dir.path().to_path_buf(), "app.log", u64::MAX);
        let writer = SharedLogWriter::open(rotator.clone()).unwrap();

        // 超过默认缓冲区的128000行
        let total = 150_000;
        let (mut sink, guard) = file_sink(writer);
        for i in 0..total {
            sink.write_all(format!("line {}\n", i).as_bytes()).unwrap();
        }
        drop(sink);
        drop(guard);

        // 后台线程可能还在写入剩余的行
        let mut content = String::new();
        for _ in 0..200 {
            content = fs::read_to_string(rotator.active_path()).unwrap();
            if content.ends_with('\n') && content.lines().count() >= total {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(content.lines().count(), total);
        assert_eq!(content.lines().last(), Some("line 149999"));
    }
}
