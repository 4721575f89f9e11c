use crate::artifacts::{CRASH_SUFFIX, FILE_PREFIX};
use crate::config::{CleanupConfig, PathsConfig};
use crate::state::SharedState;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const DAY: Duration = Duration::from_secs(86_400);
const MB: u64 = 1024 * 1024;

/// 清理时需要避让的流
#[derive(Debug, Default, Clone)]
pub struct Exemptions {
    /// 有存活进程的流，其文件不参与容量淘汰
    pub active: HashSet<String>,
    /// 不限时的流 (活跃或已持久化)，其 pid/status 文件不按时间清理
    pub unlimited: HashSet<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub files_removed: usize,
    pub bytes_freed: u64,
}

impl CleanupReport {
    fn record(&mut self, bytes: u64) {
        self.files_removed += 1;
        self.bytes_freed += bytes;
    }
}

struct Entry {
    path: PathBuf,
    name: String,
    size: u64,
    modified: SystemTime,
}

fn list_files(dir: &Path) -> Vec<Entry> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let meta = e.metadata().ok()?;
            Some(Entry {
                name: e.file_name().to_string_lossy().into_owned(),
                path: e.into_path(),
                size: meta.len(),
                modified: meta.modified().ok()?,
            })
        })
        .collect()
}

/// 日志、pid、status 文件名对应的流名，如 `ffmpeg_cam1.err`、`ffmpeg_cam1.log.2`
pub fn owning_stream(file_name: &str) -> Option<&str> {
    let rest = file_name.strip_prefix(FILE_PREFIX)?;
    rest.split('.').next()
}

/// 崩溃报告 `ffmpeg_<name>_crash.log` 对应的流名
pub fn crash_owner(file_name: &str) -> Option<&str> {
    file_name
        .strip_prefix(FILE_PREFIX)?
        .strip_suffix(CRASH_SUFFIX)
}

fn older_than(entry: &Entry, now: SystemTime, days: u64) -> bool {
    let limit = DAY.saturating_mul(u32::try_from(days).unwrap_or(u32::MAX));
    now.duration_since(entry.modified)
        .map_or(false, |age| age > limit)
}

fn delete(entry: &Entry, report: &mut CleanupReport) {
    match fs::remove_file(&entry.path) {
        Ok(()) => {
            debug!("Removed {}", entry.path.display());
            report.record(entry.size);
        }
        Err(e) => warn!("Could not remove {}: {}", entry.path.display(), e),
    }
}

/// 一次完整清理：先按时间，再按目录容量
pub fn run_cleanup(
    cfg: &CleanupConfig,
    paths: &PathsConfig,
    exempt: &Exemptions,
    now: SystemTime,
) -> CleanupReport {
    let mut report = CleanupReport::default();

    let log_dir = paths.log_dir();
    for entry in list_files(&log_dir) {
        let ours = owning_stream(&entry.name).is_some();
        let relay_log = entry.name.starts_with("mediamtx.log");
        if (ours || relay_log) && older_than(&entry, now, cfg.log_retention_days) {
            delete(&entry, &mut report);
        }
    }

    let crash_dir = paths.crash_dir();
    for entry in list_files(&crash_dir) {
        if entry.name.ends_with(".log") && older_than(&entry, now, cfg.crash_retention_days) {
            delete(&entry, &mut report);
        }
    }

    for (dir, suffixes) in [
        (paths.pid_dir(), &[".pid"][..]),
        (paths.status_dir(), &[".status", ".error"][..]),
    ] {
        for entry in list_files(&dir) {
            if !suffixes.iter().any(|s| entry.name.ends_with(s)) {
                continue;
            }
            let Some(stream) = owning_stream(&entry.name) else {
                continue;
            };
            if exempt.unlimited.contains(stream) {
                continue;
            }
            if older_than(&entry, now, cfg.pid_status_retention_days) {
                delete(&entry, &mut report);
            }
        }
    }

    enforce_size_cap(&log_dir, cfg.max_log_dir_mb, owning_stream, exempt, &mut report);
    enforce_size_cap(&crash_dir, cfg.max_crash_dir_mb, crash_owner, exempt, &mut report);

    report
}

/// 从最旧的文件开始删除直到目录不超过 `cap_mb`，活跃流的文件跳过
fn enforce_size_cap(
    dir: &Path,
    cap_mb: u64,
    owner: fn(&str) -> Option<&str>,
    exempt: &Exemptions,
    report: &mut CleanupReport,
) {
    if cap_mb == 0 {
        return;
    }
    let cap = cap_mb * MB;
    let mut files = list_files(dir);
    let mut total: u64 = files.iter().map(|f| f.size).sum();
    if total <= cap {
        return;
    }
    info!(
        "{} holds {} MB, over the {} MB cap",
        dir.display(),
        total / MB,
        cap_mb
    );

    files.sort_by_key(|f| f.modified);
    for entry in &files {
        if total <= cap {
            break;
        }
        if owner(&entry.name).map_or(false, |s| exempt.active.contains(s)) {
            continue;
        }
        let before = report.files_removed;
        delete(entry, report);
        if report.files_removed > before {
            total = total.saturating_sub(entry.size);
        }
    }
}

/// 周期清理任务
pub async fn run_cleanup_loop(state: SharedState, shutdown: CancellationToken) {
    let cfg = state.config().cleanup.clone();
    if !cfg.enabled {
        info!("Periodic cleanup disabled");
        return;
    }
    let mut interval =
        tokio::time::interval(Duration::from_secs(cfg.interval_hours.max(1) * 3600));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let exempt = exemptions(&state);
        let paths = state.config().paths.clone();
        let cfg = cfg.clone();
        let swept =
            tokio::task::spawn_blocking(move || run_cleanup(&cfg, &paths, &exempt, SystemTime::now()))
                .await;
        match swept {
            Ok(report) => info!(
                "Cleanup removed {} file(s), freed {} KB",
                report.files_removed,
                report.bytes_freed / 1024
            ),
            Err(e) => warn!("Cleanup task failed: {}", e),
        }
    }
}

/// 注册表加持久化快照。上一轮进程启动的流可能只出现在后者
pub fn exemptions(state: &SharedState) -> Exemptions {
    let mut exempt = Exemptions::default();
    for stream in state.snapshot() {
        exempt.active.insert(stream.name().to_string());
        if stream.spec.is_unlimited() {
            exempt.unlimited.insert(stream.name().to_string());
        }
    }
    for (name, entry) in state.store().load() {
        if entry.config.is_unlimited() {
            exempt.unlimited.insert(name);
        }
    }
    exempt
}
