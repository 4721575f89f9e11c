use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

const EXIT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSignal {
    /// SIGTERM
    Graceful,
    /// SIGKILL
    Forceful,
}

/// 向进程及其派生的全部子进程发送信号
pub trait ProcessGroup: Send + Sync {
    /// 向 `pgid` 进程组发信号，进程组已不存在时返回 [`io::ErrorKind::NotFound`]
    fn signal(&self, pgid: u32, signal: GroupSignal) -> io::Result<()>;

    fn is_alive(&self, pid: u32) -> bool;
}

pub type SharedProcessGroup = Arc<dyn ProcessGroup>;

/// 操作系统实现
pub struct HostProcessGroup;

pub fn host() -> SharedProcessGroup {
    Arc::new(HostProcessGroup)
}

#[cfg(unix)]
impl ProcessGroup for HostProcessGroup {
    fn signal(&self, pgid: u32, signal: GroupSignal) -> io::Result<()> {
        let pgid = libc::pid_t::try_from(pgid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        if pgid <= 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "refusing to signal pgid <= 0"));
        }
        let sig = match signal {
            GroupSignal::Graceful => libc::SIGTERM,
            GroupSignal::Forceful => libc::SIGKILL,
        };
        // SAFETY: killpg 没有内存安全前提
        let rc = unsafe { libc::killpg(pgid, sig) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Err(io::Error::new(io::ErrorKind::NotFound, err))
        } else {
            Err(err)
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // SAFETY: 信号 0 只做存在与权限检查
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

#[cfg(windows)]
impl ProcessGroup for HostProcessGroup {
    fn signal(&self, pgid: u32, signal: GroupSignal) -> io::Result<()> {
        let mut cmd = std::process::Command::new("taskkill");
        cmd.args(["/PID", &pgid.to_string(), "/T"]);
        if signal == GroupSignal::Forceful {
            cmd.arg("/F");
        }
        let status = cmd.stdout(Stdio::null()).stderr(Stdio::null()).status()?;
        if status.success() {
            Ok(())
        } else if !self.is_alive(pgid) {
            Err(io::Error::new(io::ErrorKind::NotFound, "no such process"))
        } else {
            Err(io::Error::new(io::ErrorKind::Other, format!("taskkill exited {}", status)))
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid), "/NH"])
            .stderr(Stdio::null())
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }
}

/// 让子进程成为新进程组的组长
pub fn isolate_group(cmd: &mut Command) {
    #[cfg(unix)]
    cmd.process_group(0);
    #[cfg(windows)]
    cmd.creation_flags(0x0000_0200);
}

/// 先温和后强制地终止只知道 PID 的进程组 (如上一轮遗留的孤儿)，组长退出时返回 true
pub async fn terminate_group(group: &dyn ProcessGroup, pid: u32, grace: Duration) -> bool {
    match group.signal(pid, GroupSignal::Graceful) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return true,
        Err(e) => warn!("SIGTERM to process group {} failed: {}", pid, e),
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !group.is_alive(pid) {
            return true;
        }
        tokio::time::sleep(EXIT_POLL).await;
    }

    if group.is_alive(pid) {
        debug!("Process group {} survived grace period, sending SIGKILL", pid);
        if let Err(e) = group.signal(pid, GroupSignal::Forceful) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("SIGKILL to process group {} failed: {}", pid, e);
            }
        }
        tokio::time::sleep(EXIT_POLL).await;
    }
    !group.is_alive(pid)
}

/// 终止自己的子进程组并回收，持有句柄可准确判断退出，不会把僵尸进程当成存活
pub async fn terminate_child(
    group: &dyn ProcessGroup,
    child: &mut Child,
    grace: Duration,
) -> io::Result<std::process::ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }
    let Some(pid) = child.id() else {
        return child.wait().await;
    };

    if let Err(e) = group.signal(pid, GroupSignal::Graceful) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("SIGTERM to process group {} failed: {}", pid, e);
        }
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if child.try_wait()?.is_some() {
            break;
        }
        tokio::time::sleep(EXIT_POLL).await;
    }

    // 组长已退出时强制信号仍能清理残余子进程
    if let Err(e) = group.signal(pid, GroupSignal::Forceful) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("SIGKILL to process group {} failed: {}", pid, e);
        }
    }
    child.wait().await
}

/// 单个进程的 CPU 与常驻内存
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

/// 基于 `sysinfo` 的资源采样，读不到进程表时回退到 `ps`
pub struct ProcessSampler {
    system: Mutex<sysinfo::System>,
}

impl ProcessSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new()),
        }
    }

    pub async fn sample(&self, pid: u32) -> Option<ResourceSample> {
        // CPU 占用取两次刷新之差
        if !self.refresh(pid) {
            return ps_sample(pid).await;
        }
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        if !self.refresh(pid) {
            return ps_sample(pid).await;
        }

        let system = self.system.lock().ok()?;
        let process = system.process(sysinfo::Pid::from_u32(pid))?;
        Some(ResourceSample {
            cpu_percent: process.cpu_usage(),
            memory_mb: process.memory() as f64 / (1024.0 * 1024.0),
        })
    }

    fn refresh(&self, pid: u32) -> bool {
        let Ok(mut system) = self.system.lock() else {
            return false;
        };
        let target = [sysinfo::Pid::from_u32(pid)];
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&target));
        system.process(target[0]).is_some()
    }
}

async fn ps_sample(pid: u32) -> Option<ResourceSample> {
    let out = Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "%cpu=,rss="])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    if !out.status.success() {
        return None;
    }
    parse_ps_line(&String::from_utf8_lossy(&out.stdout))
}

/// 解析 `%cpu rss`，rss 单位 KiB
fn parse_ps_line(line: &str) -> Option<ResourceSample> {
    let mut fields = line.split_whitespace();
    let cpu_percent = fields.next()?.parse::<f32>().ok()?;
    let rss_kb = fields.next()?.parse::<f64>().ok()?;
    Some(ResourceSample {
        cpu_percent,
        memory_mb: rss_kb / 1024.0,
    })
}
