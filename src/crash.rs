use crate::artifacts::{read_tail_lines, StreamPaths};
use chrono::{DateTime, Local};
use std::fmt;
use std::io;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

const WRAPPER_TAIL: usize = 50;
const STDOUT_TAIL: usize = 50;
const STDERR_TAIL: usize = 100;

/// 崩溃时的主机状态，各字段尽力采集
#[derive(Debug, Clone, Default)]
pub struct HostSnapshot {
    pub kernel: Option<String>,
    pub transcoder_version: Option<String>,
    pub gpu: Option<String>,
    pub load_average: Option<(f64, f64, f64)>,
    /// (总量, 可用)，单位 MiB
    pub memory_mb: Option<(u64, u64)>,
}

impl HostSnapshot {
    pub async fn capture(transcoder: &str) -> Self {
        let kernel = match (sys_info::os_type(), sys_info::os_release()) {
            (Ok(os), Ok(release)) => Some(format!("{} {}", os, release)),
            _ => None,
        };
        let transcoder_version = first_line(transcoder, &["-version"]).await;
        let gpu = if which::which("nvidia-smi").is_ok() {
            first_line(
                "nvidia-smi",
                &[
                    "--query-gpu=name,utilization.gpu,memory.used,memory.total",
                    "--format=csv,noheader",
                ],
            )
            .await
        } else {
            None
        };

        Self {
            kernel,
            transcoder_version,
            gpu,
            load_average: sys_info::loadavg().ok().map(|l| (l.one, l.five, l.fifteen)),
            memory_mb: sys_info::mem_info()
                .ok()
                .map(|m| (m.total / 1024, m.avail / 1024)),
        }
    }
}

async fn first_line(program: &str, args: &[&str]) -> Option<String> {
    let out = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    if !out.status.success() {
        return None;
    }
    String::from_utf8_lossy(&out.stdout)
        .lines()
        .next()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
}

/// 进程异常退出时保存的诊断报告
#[derive(Debug, Clone)]
pub struct CrashReport {
    pub stream: String,
    pub timestamp: DateTime<Local>,
    pub exit_code: Option<i32>,
    pub reason: String,
    pub command: String,
    pub wrapper_tail: String,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub host: HostSnapshot,
}

impl CrashReport {
    /// 收集日志尾部。主机快照要启动外部程序，单独填充
    pub fn collect(
        stream: &str,
        paths: &StreamPaths,
        exit_code: Option<i32>,
        reason: &str,
        command: &str,
    ) -> Self {
        Self {
            stream: stream.to_string(),
            timestamp: Local::now(),
            exit_code,
            reason: reason.to_string(),
            command: command.to_string(),
            wrapper_tail: read_tail_lines(&paths.log, WRAPPER_TAIL),
            stdout_tail: read_tail_lines(&paths.stdout, STDOUT_TAIL),
            stderr_tail: read_tail_lines(&paths.stderr, STDERR_TAIL),
            host: HostSnapshot::default(),
        }
    }

    pub fn with_host(mut self, host: HostSnapshot) -> Self {
        self.host = host;
        self
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        std::fs::write(path, self.to_string())
    }
}

fn or_unknown(v: &Option<String>) -> &str {
    v.as_deref().unwrap_or("unavailable")
}

impl fmt::Display for CrashReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(60);
        writeln!(
            f,
            "FFmpeg Crash: {} @ {}",
            self.stream,
            self.timestamp.format("%Y-%m-%d %H:%M:%S")
        )?;
        writeln!(f, "{}", rule)?;
        let code = self
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        writeln!(f, "Code: {}, Reason: {}", code, self.reason)?;
        writeln!(f, "Cmd: {}", self.command)?;

        for (title, body) in [
            ("Wrapper Log (last 50 lines)", &self.wrapper_tail),
            ("STDOUT (last 50 lines)", &self.stdout_tail),
            ("STDERR (last 100 lines)", &self.stderr_tail),
        ] {
            writeln!(f, "\n--- {} ---", title)?;
            writeln!(f, "{}", body)?;
        }

        writeln!(f, "\n--- System Info ---")?;
        writeln!(f, "Kernel: {}", or_unknown(&self.host.kernel))?;
        writeln!(f, "FFmpeg: {}", or_unknown(&self.host.transcoder_version))?;
        writeln!(f, "NVIDIA: {}", or_unknown(&self.host.gpu))?;
        match self.host.load_average {
            Some((one, five, fifteen)) => {
                writeln!(f, "Load: {:.2} {:.2} {:.2}", one, five, fifteen)?
            }
            None => writeln!(f, "Load: unavailable")?,
        }
        match self.host.memory_mb {
            Some((total, avail)) => {
                writeln!(f, "Memory: {} MB total, {} MB available", total, avail)?
            }
            None => writeln!(f, "Memory: unavailable")?,
        }
        Ok(())
    }
}
