use crate::config::PathsConfig;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

pub const FILE_PREFIX: &str = "ffmpeg_";
pub const CRASH_SUFFIX: &str = "_crash.log";

/// 流的最后状态，注册表移除后仍保留在磁盘上
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Starting,
    Running,
    Stopped,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Starting => "starting",
            Status::Running => "running",
            Status::Stopped => "stopped",
            Status::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "starting" => Some(Status::Starting),
            "running" => Some(Status::Running),
            "stopped" => Some(Status::Stopped),
            "error" => Some(Status::Error),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单路流的工作文件。路径只由流名决定，重启后的进程据此找到上一轮的遗留
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPaths {
    /// 监管侧日志
    pub log: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub pid: PathBuf,
    pub status: PathBuf,
    pub error: PathBuf,
    pub crash: PathBuf,
}

impl StreamPaths {
    pub fn for_stream(paths: &PathsConfig, name: &str) -> Self {
        let stem = format!("{}{}", FILE_PREFIX, name);
        let log_dir = paths.log_dir();
        let status_dir = paths.status_dir();
        Self {
            log: log_dir.join(format!("{}.log", stem)),
            stdout: log_dir.join(format!("{}.out", stem)),
            stderr: log_dir.join(format!("{}.err", stem)),
            pid: paths.pid_dir().join(format!("{}.pid", stem)),
            status: status_dir.join(format!("{}.status", stem)),
            error: status_dir.join(format!("{}.error", stem)),
            crash: paths.crash_dir().join(format!("{}{}", stem, CRASH_SUFFIX)),
        }
    }

    /// 清除同名流上一轮的遗留文件，监管日志和崩溃报告保留
    pub fn remove_stale(&self) {
        for path in [&self.stdout, &self.stderr, &self.pid, &self.status, &self.error] {
            remove_quietly(path);
        }
    }

    /// 写入状态。附带说明时一并写入，不带说明的 `running`/`stopped` 清除旧说明
    pub fn write_status(&self, status: Status, error: Option<&str>) -> io::Result<()> {
        fs::write(&self.status, status.as_str())?;
        match error {
            Some(detail) => fs::write(&self.error, detail)?,
            None if matches!(status, Status::Running | Status::Stopped) => {
                remove_quietly(&self.error)
            }
            None => {}
        }
        Ok(())
    }

    pub fn read_status(&self) -> Option<Status> {
        fs::read_to_string(&self.status)
            .ok()
            .and_then(|s| Status::parse(&s))
    }

    pub fn read_error(&self) -> Option<String> {
        fs::read_to_string(&self.error)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn write_pid(&self, pid: u32) -> io::Result<()> {
        fs::write(&self.pid, pid.to_string())
    }

    pub fn read_pid(&self) -> Option<u32> {
        fs::read_to_string(&self.pid)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn remove_pid(&self) {
        remove_quietly(&self.pid);
    }

    pub fn has_crash_report(&self) -> bool {
        self.crash.is_file()
    }
}

/// 从 status 文件路径取流名
pub fn stream_name_from_status(path: &Path) -> Option<String> {
    let file = path.file_name()?.to_str()?;
    let stem = file.strip_suffix(".status")?;
    stem.strip_prefix(FILE_PREFIX).map(str::to_string)
}

pub fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::debug!("Could not remove {}: {}", path.display(), e);
        }
    }
}

/// 文件末尾 `max` 字节
pub fn read_tail_bytes(path: &Path, max: u64) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(max)))?;
    let mut buf = Vec::with_capacity(max.min(len) as usize);
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// 文件末尾 `lines` 行，文件不存在时返回占位文本
pub fn read_tail_lines(path: &Path, lines: usize) -> String {
    // 日志有轮转上限，几百行 256 KiB 足够
    match read_tail_bytes(path, 256 * 1024) {
        Ok(text) => {
            let all: Vec<&str> = text.lines().collect();
            let start = all.len().saturating_sub(lines);
            all[start..].join("\n")
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => "<file not found>".to_string(),
        Err(e) => format!("<unreadable: {}>", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, StreamPaths) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PathsConfig {
            base_dir: dir.path().to_path_buf(),
        };
        cfg.ensure_dirs().unwrap();
        let paths = StreamPaths::for_stream(&cfg, "cam1");
        (dir, paths)
    }

    #[test]
    fn names_are_deterministic() {
        let (dir, paths) = setup();
        assert_eq!(
            paths.status,
            dir.path().join("status").join("ffmpeg_cam1.status")
        );
        assert_eq!(
            paths.crash,
            dir.path().join("ffmpeg_crash_logs").join("ffmpeg_cam1_crash.log")
        );
        assert_eq!(stream_name_from_status(&paths.status).as_deref(), Some("cam1"));
        assert_eq!(stream_name_from_status(&paths.error), None);
    }

    #[test]
    fn status_transitions_manage_error_file() {
        let (_dir, paths) = setup();

        paths.write_status(Status::Error, Some("boom")).unwrap();
        assert_eq!(paths.read_status(), Some(Status::Error));
        assert_eq!(paths.read_error().as_deref(), Some("boom"));

        // 带说明的 stopped 保留说明
        paths.write_status(Status::Stopped, Some("boom")).unwrap();
        assert_eq!(paths.read_error().as_deref(), Some("boom"));

        paths.write_status(Status::Running, None).unwrap();
        assert_eq!(paths.read_status(), Some(Status::Running));
        assert_eq!(paths.read_error(), None);
    }

    #[test]
    fn remove_stale_keeps_history() {
        let (_dir, paths) = setup();
        for p in [&paths.log, &paths.stdout, &paths.pid, &paths.crash] {
            fs::write(p, "x").unwrap();
        }
        paths.remove_stale();

        assert!(paths.log.exists());
        assert!(paths.crash.exists());
        assert!(!paths.stdout.exists());
        assert!(!paths.pid.exists());
    }

    #[test]
    fn tails() {
        let (_dir, paths) = setup();
        let body: String = (1..=10).map(|i| format!("line {}\n", i)).collect();
        fs::write(&paths.stderr, &body).unwrap();

        assert_eq!(read_tail_lines(&paths.stderr, 2), "line 9\nline 10");
        assert_eq!(read_tail_bytes(&paths.stderr, 8).unwrap(), "line 10\n");
        assert_eq!(read_tail_lines(&paths.stdout, 5), "<file not found>");
    }

    #[test]
    fn pid_round_trip_tolerates_whitespace() {
        let (_dir, paths) = setup();
        fs::write(&paths.pid, "4242\n").unwrap();
        assert_eq!(paths.read_pid(), Some(4242));
        paths.remove_pid();
        assert_eq!(paths.read_pid(), None);
    }
}
