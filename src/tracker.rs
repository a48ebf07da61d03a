use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

/// 文件的大小和修改时间，用于判断文件是否仍在被写入
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub len: u64,
    pub modified: Option<SystemTime>,
}

impl Fingerprint {
    pub fn new(len: u64, modified: Option<SystemTime>) -> Self {
        Self { len, modified }
    }
}

impl From<&Metadata> for Fingerprint {
    fn from(metadata: &Metadata) -> Self {
        Self::new(metadata.len(), metadata.modified().ok())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// 第一次看到这个路径
    New,
    /// 大小或修改时间和上次不同，稳定窗口重新计时
    Changed,
    Unchanged,
}

#[derive(Debug, Clone)]
struct TrackedFile {
    first_seen: Instant,
    stable_since: Instant,
    fingerprint: Fingerprint,
    in_flight: bool,
}

/// 记录每个待发送文件第一次出现的时间和最近一次变化的时间
#[derive(Debug)]
pub struct StabilityTracker {
    window: Duration,
    files: Mutex<HashMap<PathBuf, TrackedFile>>,
}

impl StabilityTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn observe(&self, path: &Path, fingerprint: Fingerprint, now: Instant) -> Observation {
        let mut files = self.files.lock();
        match files.get_mut(path) {
            None => {
                files.insert(
                    path.to_path_buf(),
                    TrackedFile {
                        first_seen: now,
                        stable_since: now,
                        fingerprint,
                        in_flight: false,
                    },
                );
                Observation::New
            }
            Some(tracked) if tracked.fingerprint != fingerprint => {
                tracked.fingerprint = fingerprint;
                tracked.stable_since = now;
                Observation::Changed
            }
            Some(_) => Observation::Unchanged,
        }
    }

    pub fn is_ready(&self, path: &Path, now: Instant) -> bool {
        self.files
            .lock()
            .get(path)
            .map(|tracked| now.saturating_duration_since(tracked.stable_since) >= self.window)
            .unwrap_or(false)
    }

    /// 文件已稳定且没有在发送中时标记为发送中并返回true
    pub fn claim_if_ready(&self, path: &Path, now: Instant) -> bool {
        let mut files = self.files.lock();
        match files.get_mut(path) {
            Some(tracked)
                if !tracked.in_flight
                    && now.saturating_duration_since(tracked.stable_since) >= self.window =>
            {
                tracked.in_flight = true;
                true
            }
            _ => false,
        }
    }

    /// 一次发送尝试结束后调用；成功归档的文件会在下一轮扫描时被移除
    pub fn release(&self, path: &Path) {
        if let Some(tracked) = self.files.lock().get_mut(path) {
            tracked.in_flight = false;
        }
    }

    pub fn is_in_flight(&self, path: &Path) -> bool {
        self.files
            .lock()
            .get(path)
            .map(|tracked| tracked.in_flight)
            .unwrap_or(false)
    }

    pub fn first_seen(&self, path: &Path) -> Option<Instant> {
        self.files.lock().get(path).map(|tracked| tracked.first_seen)
    }

    /// 删除本轮扫描中已不存在的路径，返回被删除的路径
    pub fn retain_present(&self, present: &HashSet<PathBuf>) -> Vec<PathBuf> {
        let mut files = self.files.lock();
        let removed: Vec<PathBuf> = files
            .keys()
            .filter(|path| !present.contains(*path))
            .cloned()
            .collect();
        for path in &removed {
            files.remove(path);
        }
        removed
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.lock().contains_key(path)
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.files.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(2);

    fn fp(len: u64) -> Fingerprint {
        Fingerprint::new(len, None)
    }

    #[test]
    fn new_file_is_not_ready_until_window_elapses() {
        let tracker = StabilityTracker::new(WINDOW);
        let path = Path::new("/send/report.csv");
        let start = Instant::now();

        assert_eq!(tracker.observe(path, fp(10), start), Observation::New);
        assert!(!tracker.is_ready(path, start + Duration::from_secs(1)));
        assert!(tracker.is_ready(path, start + WINDOW));
    }

    #[test]
    fn change_restarts_window_but_keeps_first_seen() {
        let tracker = StabilityTracker::new(WINDOW);
        let path = Path::new("/send/growing.bin");
        let start = Instant::now();

        tracker.observe(path, fp(10), start);
        let later = start + Duration::from_secs(3);
        assert_eq!(tracker.observe(path, fp(20), later), Observation::Changed);

        assert!(!tracker.is_ready(path, later + Duration::from_secs(1)));
        assert!(tracker.is_ready(path, later + WINDOW));
        assert_eq!(tracker.first_seen(path), Some(start));
    }

    #[test]
    fn claim_marks_in_flight_until_released() {
        let tracker = StabilityTracker::new(WINDOW);
        let path = Path::new("/send/a.txt");
        let start = Instant::now();
        tracker.observe(path, fp(1), start);

        let ready_at = start + WINDOW;
        assert!(tracker.claim_if_ready(path, ready_at));
        assert!(tracker.is_in_flight(path));
        assert!(!tracker.claim_if_ready(path, ready_at + Duration::from_secs(1)));

        tracker.release(path);
        assert!(tracker.claim_if_ready(path, ready_at + Duration::from_secs(2)));
    }

    #[test]
    fn unknown_path_is_never_ready() {
        let tracker = StabilityTracker::new(WINDOW);
        let path = Path::new("/send/missing");
        assert!(!tracker.is_ready(path, Instant::now() + WINDOW));
        assert!(!tracker.claim_if_ready(path, Instant::now() + WINDOW));
    }

    #[test]
    fn removed_paths_are_dropped_exactly_once() {
        let tracker = StabilityTracker::new(WINDOW);
        let now = Instant::now();
        let kept = PathBuf::from("/send/kept");
        let gone = PathBuf::from("/send/gone");
        tracker.observe(&kept, fp(1), now);
        tracker.observe(&gone, fp(1), now);

        let present: HashSet<PathBuf> = [kept.clone()].into_iter().collect();
        assert_eq!(tracker.retain_present(&present), vec![gone.clone()]);
        assert!(tracker.retain_present(&present).is_empty());
        assert!(tracker.contains(&kept));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn recreated_file_starts_fresh() {
        let tracker = StabilityTracker::new(WINDOW);
        let path = PathBuf::from("/send/again.csv");
        let start = Instant::now();
        tracker.observe(&path, fp(5), start);
        tracker.retain_present(&HashSet::new());

        let later = start + Duration::from_secs(10);
        assert_eq!(tracker.observe(&path, fp(5), later), Observation::New);
        assert!(!tracker.is_ready(&path, later + Duration::from_secs(1)));
    }
}
