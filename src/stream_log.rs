use crate::config::StreamLogConfig;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }
}

/// 单路流的包装日志
///
/// 每行带时间戳追加写入，超过 `max_bytes` 时按 `.1`、`.2` 轮转，
/// 同时转发到 tracing 并附带 `stream` 字段。
pub struct StreamLog {
    name: String,
    path: PathBuf,
    max_bytes: u64,
    backups: u32,
    lock: Mutex<()>,
}

impl StreamLog {
    pub fn new(name: &str, path: &Path, cfg: &StreamLogConfig) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            max_bytes: cfg.max_bytes,
            backups: cfg.backups,
            lock: Mutex::new(()),
        }
    }

    pub fn info(&self, msg: &str) {
        self.write(LogLevel::Info, msg);
    }

    pub fn warn(&self, msg: &str) {
        self.write(LogLevel::Warn, msg);
    }

    pub fn error(&self, msg: &str) {
        self.write(LogLevel::Error, msg);
    }

    pub fn write(&self, level: LogLevel, msg: &str) {
        match level {
            LogLevel::Info => tracing::info!(stream = %self.name, "{}", msg),
            LogLevel::Warn => tracing::warn!(stream = %self.name, "{}", msg),
            LogLevel::Error => tracing::error!(stream = %self.name, "{}", msg),
        }

        let line = format!(
            "{} - {} - {}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            level.as_str(),
            msg
        );
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = self.append(&line) {
            tracing::debug!(stream = %self.name, "Wrapper log write failed: {}", e);
        }
    }

    fn append(&self, line: &str) -> io::Result<()> {
        if self.max_bytes > 0 {
            let current = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
            if current > 0 && current + line.len() as u64 > self.max_bytes {
                self.rotate()?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())
    }

    fn rotate(&self) -> io::Result<()> {
        if self.backups == 0 {
            return fs::remove_file(&self.path);
        }
        for n in (1..self.backups).rev() {
            let from = backup_path(&self.path, n);
            if from.exists() {
                fs::rename(&from, backup_path(&self.path, n + 1))?;
            }
        }
        fs::rename(&self.path, backup_path(&self.path, 1))
    }
}

fn backup_path(path: &Path, n: u32) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(format!(".{}", n));
    PathBuf::from(s)
}
