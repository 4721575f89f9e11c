use crate::artifacts::{stream_name_from_status, Status, StreamPaths};
use crate::capability::{EncoderDiscovery, EncoderProfile};
use crate::command::{build_invocation, BuildContext, Invocation};
use crate::config::AppConfig;
use crate::crash::{CrashReport, HostSnapshot};
use crate::error::SupervisorError;
use crate::monitor;
use crate::persistence::PersistenceStore;
use crate::process::{self, ProcessGroup, SharedProcessGroup};
use crate::state::{ActiveStream, Registry, StopReason, StopSignal, StreamRecord};
use crate::stream::{validate_name, StreamSpec};
use crate::stream_log::StreamLog;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fs::File;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{error, info, warn};

const RESOLVER_TIMEOUT: Duration = Duration::from_secs(60);
pub const USER_STOP_MESSAGE: &str = "Stream stopped by user.";
pub const SHUTDOWN_MESSAGE: &str = "Stream stopped due to server shutdown.";
pub const ORPHAN_STOP_MESSAGE: &str = "Orphaned stream stopped.";

/// 启动成功后返回给调用方的信息
#[derive(Debug, Clone, Serialize)]
pub struct StartedStream {
    pub name: String,
    pub rtsp_url: String,
    pub pid: u32,
    pub encoder: EncoderProfile,
    pub command: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// 注册表中的流已停止
    Stopped,
    /// 通过 PID 文件停止了上一代进程遗留的流
    OrphanStopped,
}

/// `list()` 中的一条流视图
#[derive(Debug, Clone, Serialize)]
pub struct StreamView {
    pub name: String,
    pub pid: Option<u32>,
    pub status: Status,
    pub error: Option<String>,
    pub config: Option<StreamSpec>,
    pub encoder: Option<EncoderProfile>,
    pub rtsp_url: String,
    pub started_at: Option<DateTime<Local>>,
    pub elapsed: String,
    pub remaining: String,
    pub crash_report: Option<PathBuf>,
    pub orphaned: bool,
}

/// 启动窗口内对流名的占用，未提交时自动释放
struct Reservation<'a> {
    registry: &'a Mutex<Registry>,
    name: String,
    armed: bool,
}

impl Reservation<'_> {
    /// 持有注册表锁时登记
    fn commit(mut self, registry: &mut Registry, record: StreamRecord) {
        registry.insert(record);
        self.armed = false;
    }

    /// 持有注册表锁时放弃占用，避免 Drop 再次加锁
    fn abandon(mut self, registry: &mut Registry) {
        registry.release(&self.name);
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(self.registry).release(&self.name);
        }
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

/// 进程监管核心
///
/// 持有活跃流注册表，负责启动、停止、列举以及关停流程。
/// 每路流由独立的监控任务负责收尾。
pub struct Engine {
    config: AppConfig,
    ctx: BuildContext,
    discovery: EncoderDiscovery,
    store: PersistenceStore,
    group: SharedProcessGroup,
    registry: Mutex<Registry>,
    shutting_down: AtomicBool,
    generation: AtomicU64,
}

impl Engine {
    pub fn new(
        config: AppConfig,
        ctx: BuildContext,
        discovery: EncoderDiscovery,
        group: SharedProcessGroup,
    ) -> Arc<Self> {
        let store = PersistenceStore::new(&config.persistence);
        Arc::new(Self {
            config,
            ctx,
            discovery,
            store,
            group,
            registry: Mutex::new(Registry::default()),
            shutting_down: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn discovery(&self) -> &EncoderDiscovery {
        &self.discovery
    }

    pub fn store(&self) -> &PersistenceStore {
        &self.store
    }

    pub(crate) fn process_group(&self) -> &SharedProcessGroup {
        &self.group
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn is_active(&self, name: &str) -> bool {
        lock(&self.registry).contains(name)
    }

    /// 活跃流快照，遍历时不持有注册表锁
    pub fn snapshot(&self) -> Vec<Arc<ActiveStream>> {
        lock(&self.registry).snapshot()
    }

    pub fn paths_for(&self, name: &str) -> StreamPaths {
        StreamPaths::for_stream(&self.config.paths, name)
    }

    /// 启动一路流
    ///
    /// # 流程
    /// - 校验名称并占用，重名直接拒绝
    /// - 选择编码器、构建命令、必要时解析视频站点直链
    /// - 以新进程组启动，等待宽限期确认存活后登记并持久化
    pub async fn start(self: &Arc<Self>, spec: StreamSpec) -> Result<StartedStream, SupervisorError> {
        let reservation = self.reserve(&spec.name)?;

        let prefer_hw = spec.hardware_accel && self.config.server.hardware_accel;
        let profile = self.discovery.select_backend(spec.video_codec, prefer_hw).await?;
        info!(
            "Stream [{}]: {} via {} ({})",
            spec.name,
            spec.video_codec,
            profile.encoder,
            profile.backend.accel_label()
        );

        let mut invocation = build_invocation(&spec, &profile, &self.ctx);
        if let Some(url) = invocation.hosted_source.clone() {
            let direct = self.resolve_hosted(&url).await?;
            invocation = invocation.with_resolved_input(&direct);
        }

        self.launch(reservation, spec, profile, invocation).await
    }

    /// 以给定命令启动，跳过编码器选择和命令构建
    #[cfg(test)]
    pub(crate) async fn start_with_invocation(
        self: &Arc<Self>,
        spec: StreamSpec,
        profile: EncoderProfile,
        invocation: Invocation,
    ) -> Result<StartedStream, SupervisorError> {
        let reservation = self.reserve(&spec.name)?;
        self.launch(reservation, spec, profile, invocation).await
    }

    fn reserve(&self, name: &str) -> Result<Reservation<'_>, SupervisorError> {
        if self.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }
        validate_name(name)?;
        if !lock(&self.registry).reserve(name) {
            return Err(SupervisorError::AlreadyActive(name.to_string()));
        }
        Ok(Reservation {
            registry: &self.registry,
            name: name.to_string(),
            armed: true,
        })
    }

    async fn resolve_hosted(&self, url: &str) -> Result<String, SupervisorError> {
        let failure = |reason: String| SupervisorError::SourceResolution {
            url: url.to_string(),
            reason,
        };
        let output = Command::new(&self.config.server.resolver_binary)
            .args(["-f", "best", "-g", url])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(RESOLVER_TIMEOUT, output)
            .await
            .map_err(|_| failure("resolver timed out".to_string()))?
            .map_err(|e| failure(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failure(stderr.trim().to_string()));
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .ok_or_else(|| failure("resolver returned no URL".to_string()))
    }

    async fn launch(
        self: &Arc<Self>,
        reservation: Reservation<'_>,
        spec: StreamSpec,
        profile: EncoderProfile,
        invocation: Invocation,
    ) -> Result<StartedStream, SupervisorError> {
        let name = spec.name.clone();
        let paths = self.paths_for(&name);
        paths.remove_stale();

        let log = StreamLog::new(&name, &paths.log, &self.config.stream_log);
        let command = invocation.render();
        log.info(&format!("Starting stream with command: {}", command));

        let start_failure = |message: String| {
            log.error(&message);
            if let Err(e) = paths.write_status(Status::Stopped, Some(&message)) {
                warn!("Stream [{}]: could not record start failure: {}", name, e);
            }
            SupervisorError::StartFailure {
                message,
                command: command.clone(),
            }
        };

        if let Err(e) = paths.write_status(Status::Starting, None) {
            return Err(start_failure(format!("Could not write status file: {}", e)));
        }
        let open = |path: &PathBuf| {
            File::create(path)
                .map_err(|e| start_failure(format!("Could not open {}: {}", path.display(), e)))
        };
        let stdout = open(&paths.stdout)?;
        let stderr = open(&paths.stderr)?;
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        process::isolate_group(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return Err(start_failure(format!("Failed to start FFmpeg: {}", e))),
        };
        let Some(pid) = child.id() else {
            return Err(start_failure("FFmpeg exited before a PID was assigned".to_string()));
        };
        if let Err(e) = paths.write_pid(pid) {
            warn!("Stream [{}]: could not write PID file: {}", name, e);
        }

        tokio::time::sleep(self.config.timing.start_grace()).await;

        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                paths.remove_pid();
                let code = status.code();
                let report = CrashReport::collect(
                    &name,
                    &paths,
                    code,
                    "FFmpeg died immediately",
                    &command,
                )
                .with_host(HostSnapshot::capture(&self.ctx.transcoder).await);
                if let Err(e) = report.save(&paths.crash) {
                    warn!("Stream [{}]: could not save crash report: {}", name, e);
                }
                let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                return Err(start_failure(format!(
                    "FFmpeg failed to start (exit code {}). Check logs.",
                    code
                )));
            }
            Err(e) => {
                paths.remove_pid();
                return Err(start_failure(format!("Could not poll FFmpeg: {}", e)));
            }
        }

        let stream = Arc::new(ActiveStream {
            spec,
            profile: profile.clone(),
            pid,
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
            started_at: Instant::now(),
            started_wall: Local::now(),
            stop: StopSignal::new(),
            paths,
            log,
            command: command.clone(),
        });
        if let Err(e) = stream.paths.write_status(Status::Running, None) {
            warn!("Stream [{}]: could not write status: {}", name, e);
        }

        // 先持久化再登记，监控任务的删除总发生在保存之后
        self.store.save(&stream.spec, Some(&profile));

        // 关停标志在锁内复查，关停开始后不再登记新流
        let abandoned = {
            let mut registry = lock(&self.registry);
            if self.is_shutting_down() {
                reservation.abandon(&mut registry);
                Some(child)
            } else {
                let handle = tokio::spawn(monitor::run(self.clone(), stream.clone(), child));
                reservation.commit(
                    &mut registry,
                    StreamRecord {
                        stream: stream.clone(),
                        monitor: Some(handle),
                    },
                );
                None
            }
        };
        if let Some(mut child) = abandoned {
            warn!("Stream [{}] came up during shutdown, terminating it", name);
            if let Err(e) =
                process::terminate_child(self.group.as_ref(), &mut child, self.config.timing.stop_grace())
                    .await
            {
                warn!("Stream [{}]: termination failed: {}", name, e);
            }
            stream.paths.remove_pid();
            if let Err(e) = stream
                .paths
                .write_status(Status::Stopped, Some(SHUTDOWN_MESSAGE))
            {
                warn!("Stream [{}]: could not write final status: {}", name, e);
            }
            // 与关停时的其它流一样保留持久化条目
            return Err(SupervisorError::ShuttingDown);
        }

        stream
            .log
            .info(&format!("Stream started successfully with PID {}", pid));

        Ok(StartedStream {
            rtsp_url: self.ctx.rtsp_url(&name),
            name,
            pid,
            encoder: profile,
            command,
        })
    }

    /// 停止一路流
    ///
    /// 注册表中的流：置停止标志，由监控任务完成分组终止，有界等待后强制写入
    /// `stopped` 并删除持久化条目。不在注册表中时按 PID 文件处理孤儿进程。
    pub async fn stop(&self, name: &str) -> Result<StopOutcome, SupervisorError> {
        let found = {
            let mut registry = lock(&self.registry);
            registry
                .get(name)
                .map(|stream| (stream, registry.take_monitor(name)))
        };

        let Some((stream, monitor)) = found else {
            return self.stop_orphan(name).await;
        };

        let by_user = stream.stop.request(StopReason::UserRequested);
        if by_user {
            stream.log.info("Stop requested by user");
        }

        let joined = match monitor {
            Some(handle) => tokio::time::timeout(self.config.timing.join_timeout(), handle)
                .await
                .is_ok(),
            // 另一个 stop 已取走句柄
            None => true,
        };
        if !joined {
            warn!(
                "Stream [{}] monitor did not finish in time, killing group {}",
                name, stream.pid
            );
            process::terminate_group(
                self.group.as_ref(),
                stream.pid,
                self.config.timing.stop_grace(),
            )
            .await;
        }

        // 更早的停止原因 (如健康检查) 由监控任务记录，只在监控超时时补写
        if by_user || !joined {
            let detail = stop_detail(stream.stop.reason());
            if let Err(e) = stream.paths.write_status(Status::Stopped, Some(&detail)) {
                warn!("Stream [{}]: could not write final status: {}", name, e);
            }
        }
        self.store.remove(name);
        lock(&self.registry).remove_if(name, stream.generation);
        info!("Stream [{}] stopped.", name);
        Ok(StopOutcome::Stopped)
    }

    async fn stop_orphan(&self, name: &str) -> Result<StopOutcome, SupervisorError> {
        validate_name(name)?;
        let paths = self.paths_for(name);
        let Some(pid) = paths.read_pid() else {
            if matches!(paths.read_status(), Some(s) if s != Status::Stopped) {
                paths.write_status(Status::Stopped, paths.read_error().as_deref())?;
            }
            self.store.remove(name);
            return Err(SupervisorError::NotActive(name.to_string()));
        };

        info!("Stream [{}] not managed, terminating orphan PID {}", name, pid);
        let gone =
            process::terminate_group(self.group.as_ref(), pid, self.config.timing.stop_grace())
                .await;
        if !gone {
            warn!("Orphan PID {} of stream [{}] may still be alive", pid, name);
        }
        paths.remove_pid();
        paths.write_status(Status::Stopped, Some(ORPHAN_STOP_MESSAGE))?;
        self.store.remove(name);
        Ok(StopOutcome::OrphanStopped)
    }

    /// 健康检查触发的终止，最终状态记为 `error`
    pub fn terminate_for_health(&self, name: &str, generation: u64, reason: &str) -> bool {
        let Some(stream) = lock(&self.registry).get(name) else {
            return false;
        };
        if stream.generation != generation {
            return false;
        }
        stream
            .stop
            .request(StopReason::HealthViolation(reason.to_string()))
    }

    /// 监控任务收尾时调用，代次不符时不做任何事
    pub(crate) fn forget(&self, name: &str, generation: u64) -> bool {
        lock(&self.registry)
            .remove_if(name, generation)
            .is_some()
    }

    /// 列出活跃流以及磁盘上未处于 `stopped` 的孤儿流，按启动时间倒序
    pub fn list(&self) -> Vec<StreamView> {
        let active = self.snapshot();
        let mut views: Vec<StreamView> = active.iter().map(|s| self.active_view(s)).collect();

        let persisted = self.store.load();
        for path in self.status_files() {
            let Some(name) = stream_name_from_status(&path) else {
                continue;
            };
            if active.iter().any(|s| s.name() == name) {
                continue;
            }
            let paths = self.paths_for(&name);
            let status = match paths.read_status() {
                Some(Status::Stopped) | None => continue,
                Some(status) => status,
            };

            let pid = paths.read_pid();
            let mut error = paths.read_error();
            let mut status = status;
            if let Some(pid) = pid {
                if !self.group.is_alive(pid) {
                    status = Status::Error;
                    let detail = format!("{} (Stale PID)", error.unwrap_or_default());
                    error = Some(detail.trim().to_string());
                }
            }

            let started_at = std::fs::metadata(&paths.status)
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Local>::from);
            let entry = persisted.get(&name);
            let config = entry.map(|e| e.config.clone());
            let elapsed = started_at
                .map(|t| (Local::now() - t).to_std().unwrap_or_default())
                .unwrap_or_default();

            views.push(StreamView {
                pid,
                status,
                error,
                remaining: config
                    .as_ref()
                    .map(|c| remaining_text(c, elapsed))
                    .unwrap_or_else(|| "Unknown".to_string()),
                encoder: entry.and_then(|e| e.encoder.clone()),
                config,
                rtsp_url: self.ctx.rtsp_url(&name),
                started_at,
                elapsed: format_span(elapsed),
                crash_report: paths.has_crash_report().then(|| paths.crash.clone()),
                orphaned: true,
                name,
            });
        }

        views.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        views
    }

    fn active_view(&self, stream: &ActiveStream) -> StreamView {
        let elapsed = stream.elapsed();
        StreamView {
            name: stream.name().to_string(),
            pid: Some(stream.pid),
            status: stream.paths.read_status().unwrap_or(Status::Running),
            error: stream.paths.read_error(),
            config: Some(stream.spec.clone()),
            encoder: Some(stream.profile.clone()),
            rtsp_url: self.ctx.rtsp_url(stream.name()),
            started_at: Some(stream.started_wall),
            elapsed: format_span(elapsed),
            remaining: remaining_text(&stream.spec, elapsed),
            crash_report: stream
                .paths
                .has_crash_report()
                .then(|| stream.paths.crash.clone()),
            orphaned: false,
        }
    }

    fn status_files(&self) -> Vec<PathBuf> {
        walkdir::WalkDir::new(self.config.paths.status_dir())
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| p.extension().map_or(false, |ext| ext == "status"))
            .collect()
    }

    /// 将孤儿 `error` 流标记为 `stopped` 并删除其持久化条目
    pub fn cleanup_stale(&self) -> usize {
        let active = self.snapshot();
        let mut cleaned = 0;
        for path in self.status_files() {
            let Some(name) = stream_name_from_status(&path) else {
                continue;
            };
            if active.iter().any(|s| s.name() == name) {
                continue;
            }
            let paths = self.paths_for(&name);
            if paths.read_status() != Some(Status::Error) {
                continue;
            }
            let detail = paths.read_error();
            if let Err(e) = paths.write_status(Status::Stopped, detail.as_deref()) {
                warn!("Stream [{}]: could not normalize status: {}", name, e);
                continue;
            }
            paths.remove_pid();
            self.store.remove(&name);
            info!("Stale stream [{}] marked stopped", name);
            cleaned += 1;
        }
        cleaned
    }

    /// 关停所有流，保留持久化条目以便下次启动时恢复
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let targets: Vec<_> = {
            let mut registry = lock(&self.registry);
            registry
                .snapshot()
                .into_iter()
                .map(|s| {
                    let handle = registry.take_monitor(s.name());
                    (s, handle)
                })
                .collect()
        };
        if targets.is_empty() {
            return;
        }
        info!("Shutting down {} stream(s)", targets.len());

        for (stream, _) in &targets {
            stream.stop.request(StopReason::Shutdown);
        }

        let deadline = tokio::time::Instant::now() + self.config.timing.shutdown_join_timeout();
        for (stream, handle) in targets {
            if let Some(handle) = handle {
                if tokio::time::timeout_at(deadline, handle).await.is_err() {
                    warn!("Stream [{}] did not stop before the shutdown deadline", stream.name());
                    process::terminate_group(self.group.as_ref(), stream.pid, Duration::ZERO)
                        .await;
                }
            }
            if let Err(e) = stream
                .paths
                .write_status(Status::Stopped, Some(SHUTDOWN_MESSAGE))
            {
                error!("Stream [{}]: could not write final status: {}", stream.name(), e);
            }
            lock(&self.registry).remove_if(stream.name(), stream.generation);
        }
    }
}

/// 停止原因对应的状态说明
fn stop_detail(reason: Option<StopReason>) -> String {
    match reason {
        Some(StopReason::HealthViolation(why)) => monitor::health_detail(&why),
        Some(StopReason::Shutdown) => SHUTDOWN_MESSAGE.to_string(),
        Some(StopReason::UserRequested) | None => USER_STOP_MESSAGE.to_string(),
    }
}

/// `Xd HHh MMm`
pub fn format_span(d: Duration) -> String {
    let secs = d.as_secs();
    format!(
        "{}d {:02}h {:02}m",
        secs / 86_400,
        (secs % 86_400) / 3600,
        (secs % 3600) / 60
    )
}

pub fn remaining_text(spec: &StreamSpec, elapsed: Duration) -> String {
    match spec.duration() {
        None => "Unlimited".to_string(),
        Some(limit) if elapsed >= limit => "Expired".to_string(),
        Some(limit) => format_span(limit - elapsed),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capability::{Backend, Capabilities};
    use crate::config::{PathsConfig, PersistenceConfig};
    use crate::process::HostProcessGroup;
    use crate::stream::{SourceKind, VideoCodec};

    pub(crate) fn test_config(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.paths = PathsConfig {
            base_dir: dir.join("run"),
        };
        config.persistence = PersistenceConfig {
            enabled: true,
            dir: dir.join("data"),
        };
        config.timing.start_grace_ms = 150;
        config.timing.stop_grace_ms = 500;
        config.timing.monitor_poll_ms = 50;
        config.timing.join_timeout_ms = 3000;
        config.timing.shutdown_join_timeout_ms = 3000;
        config.timing.duration_tolerance_secs = 0;
        config.paths.ensure_dirs().unwrap();
        config
    }

    pub(crate) fn test_engine(config: AppConfig) -> Arc<Engine> {
        test_engine_with(config, "/nonexistent/ffmpeg")
    }

    pub(crate) fn test_engine_with(config: AppConfig, transcoder: &str) -> Arc<Engine> {
        let ctx = BuildContext {
            transcoder: transcoder.to_string(),
            time_limiter: None,
            rtsp_host: "localhost".to_string(),
            rtsp_port: 8554,
            render_node: "/dev/null".to_string(),
        };
        let discovery = EncoderDiscovery::with_capabilities(Capabilities::from_backends([(
            VideoCodec::H264,
            vec![Backend::Software],
        )]));
        Engine::new(config, ctx, discovery, Arc::new(HostProcessGroup))
    }

    pub(crate) fn spec(name: &str) -> StreamSpec {
        StreamSpec {
            name: name.to_string(),
            source_kind: SourceKind::Network,
            source: "rtsp://camera.local/live".to_string(),
            video_codec: VideoCodec::H264,
            resolution: "720".to_string(),
            target_fps: "15".to_string(),
            audio_enabled: false,
            audio_codec: "aac".to_string(),
            hardware_accel: false,
            duration_hours: 0.0,
        }
    }

    /// 写一个忽略全部参数的可执行脚本充当转码器
    #[cfg(unix)]
    pub(crate) fn fake_transcoder(dir: &std::path::Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-ffmpeg");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn profile() -> EncoderProfile {
        EncoderProfile::new(VideoCodec::H264, Backend::Software).unwrap()
    }

    fn shell(script: &str) -> Invocation {
        Invocation {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            input_slot: 1,
            hosted_source: None,
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn span_and_remaining_text() {
        assert_eq!(format_span(Duration::from_secs(90_061)), "1d 01h 01m");
        let mut s = spec("a");
        assert_eq!(remaining_text(&s, Duration::from_secs(5)), "Unlimited");
        s.duration_hours = 1.0;
        assert_eq!(remaining_text(&s, Duration::from_secs(1800)), "0d 00h 30m");
        assert_eq!(remaining_text(&s, Duration::from_secs(3600)), "Expired");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_then_stop_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(test_config(dir.path()));

        let started = engine
            .start_with_invocation(spec("cam1"), profile(), shell("exec sleep 30"))
            .await
            .unwrap();
        assert_eq!(started.rtsp_url, "rtsp://localhost:8554/cam1");
        assert!(engine.is_active("cam1"));
        assert!(engine.store().load().contains_key("cam1"));

        let paths = engine.paths_for("cam1");
        assert_eq!(paths.read_status(), Some(Status::Running));
        assert_eq!(paths.read_pid(), Some(started.pid));

        assert_eq!(engine.stop("cam1").await.unwrap(), StopOutcome::Stopped);
        assert!(!engine.is_active("cam1"));
        assert_eq!(paths.read_status(), Some(Status::Stopped));
        assert!(!HostProcessGroup.is_alive(started.pid));
        assert!(!engine.store().load().contains_key("cam1"));
        assert!(!paths.has_crash_report());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn duplicate_name_is_rejected_while_first_runs() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(test_config(dir.path()));

        engine
            .start_with_invocation(spec("cam1"), profile(), shell("exec sleep 30"))
            .await
            .unwrap();
        let second = engine
            .start_with_invocation(spec("cam1"), profile(), shell("exec sleep 30"))
            .await;

        assert!(matches!(second, Err(SupervisorError::AlreadyActive(_))));
        assert!(engine.is_active("cam1"));
        engine.stop("cam1").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn immediate_death_is_a_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(test_config(dir.path()));

        let err = engine
            .start_with_invocation(spec("cam1"), profile(), shell("echo nope >&2; exit 2"))
            .await
            .unwrap_err();

        match &err {
            SupervisorError::StartFailure { message, command } => {
                assert!(message.contains("exit code 2"));
                assert!(command.starts_with("sh -c"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.command().is_some());
        assert!(!engine.is_active("cam1"));
        assert!(!engine.store().load().contains_key("cam1"));

        let paths = engine.paths_for("cam1");
        assert_eq!(paths.read_status(), Some(Status::Stopped));
        let report = std::fs::read_to_string(&paths.crash).unwrap();
        assert!(report.contains("FFmpeg died immediately"));
        assert!(report.contains("nope"));

        // 名字已释放
        assert!(lock(&engine.registry).reserve("cam1"));
    }

    #[tokio::test]
    async fn spawn_error_is_a_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(test_config(dir.path()));

        let err = engine.start(spec("cam1")).await.unwrap_err();
        match err {
            SupervisorError::StartFailure { command, .. } => {
                assert!(command.starts_with("/nonexistent/ffmpeg -hide_banner"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!engine.is_active("cam1"));
    }

    #[tokio::test]
    async fn missing_encoder_and_bad_name_fail_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(test_config(dir.path()));

        let mut s = spec("cam1");
        s.video_codec = VideoCodec::H265;
        assert!(matches!(
            engine.start(s).await,
            Err(SupervisorError::Capability(_))
        ));
        assert!(matches!(
            engine.start(spec("bad name")).await,
            Err(SupervisorError::Validation(_))
        ));
        assert!(!engine.paths_for("cam1").status.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn clean_exit_is_normal() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(test_config(dir.path()));

        engine
            .start_with_invocation(spec("cam1"), profile(), shell("sleep 0.4; exit 0"))
            .await
            .unwrap();
        wait_until(|| !engine.is_active("cam1")).await;

        let paths = engine.paths_for("cam1");
        assert_eq!(paths.read_status(), Some(Status::Stopped));
        assert_eq!(paths.read_error(), None);
        assert!(!paths.has_crash_report());
        assert!(!engine.store().load().contains_key("cam1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_produces_crash_report() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(test_config(dir.path()));

        let started = engine
            .start_with_invocation(
                spec("cam1"),
                profile(),
                shell("echo 'Connection refused' >&2; sleep 0.4; exit 3"),
            )
            .await
            .unwrap();
        wait_until(|| !engine.is_active("cam1")).await;

        let paths = engine.paths_for("cam1");
        assert_eq!(paths.read_status(), Some(Status::Stopped));
        assert!(paths.read_error().unwrap().contains("exit code 3"));
        let report = std::fs::read_to_string(&paths.crash).unwrap();
        assert!(report.contains(&format!("Cmd: {}", started.command)));
        assert!(report.contains("Connection refused"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bounded_stream_is_stopped_at_its_duration() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(test_config(dir.path()));

        let bounded = spec("cam1").with_duration_hours(0.4 / 3600.0);
        let started = engine
            .start_with_invocation(bounded, profile(), shell("exec sleep 30"))
            .await
            .unwrap();
        wait_until(|| !engine.is_active("cam1")).await;

        let paths = engine.paths_for("cam1");
        assert_eq!(paths.read_status(), Some(Status::Stopped));
        assert!(!paths.has_crash_report());
        assert!(!HostProcessGroup.is_alive(started.pid));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unlimited_stream_outlives_short_polls() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(test_config(dir.path()));

        engine
            .start_with_invocation(spec("cam1"), profile(), shell("exec sleep 30"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(engine.is_active("cam1"));
        engine.stop("cam1").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn health_termination_records_error_detail() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(test_config(dir.path()));

        engine
            .start_with_invocation(spec("cam1"), profile(), shell("exec sleep 30"))
            .await
            .unwrap();
        let generation = engine.snapshot()[0].generation;
        assert!(!engine.terminate_for_health("cam1", generation + 1, "stale"));
        assert!(engine.terminate_for_health("cam1", generation, "CPU usage too high"));
        wait_until(|| !engine.is_active("cam1")).await;

        let paths = engine.paths_for("cam1");
        assert_eq!(paths.read_status(), Some(Status::Stopped));
        let detail = paths.read_error().unwrap();
        assert!(detail.contains("health check failure"));
        assert!(detail.contains("CPU usage too high"));
        assert!(!engine.store().load().contains_key("cam1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn user_stop_keeps_earlier_health_detail() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(test_config(dir.path()));

        engine
            .start_with_invocation(spec("cam1"), profile(), shell("exec sleep 30"))
            .await
            .unwrap();
        let generation = engine.snapshot()[0].generation;
        assert!(engine.terminate_for_health("cam1", generation, "Memory usage too high"));
        assert_eq!(engine.stop("cam1").await.unwrap(), StopOutcome::Stopped);

        assert!(!engine.is_active("cam1"));
        let paths = engine.paths_for("cam1");
        assert_eq!(paths.read_status(), Some(Status::Stopped));
        let detail = paths.read_error().unwrap();
        assert!(detail.contains("health check failure: Memory usage too high"));
        assert!(!engine.store().load().contains_key("cam1"));
    }

    #[test]
    fn stop_detail_follows_first_reason() {
        assert_eq!(stop_detail(Some(StopReason::UserRequested)), USER_STOP_MESSAGE);
        assert_eq!(stop_detail(Some(StopReason::Shutdown)), SHUTDOWN_MESSAGE);
        assert!(stop_detail(Some(StopReason::HealthViolation("cpu".into())))
            .contains("health check failure: cpu"));
    }

    #[tokio::test]
    async fn unwritable_output_is_a_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(test_config(dir.path()));
        let paths = engine.paths_for("cam1");
        // 目录占住 stdout 文件的位置
        std::fs::create_dir_all(&paths.stdout).unwrap();

        let err = engine
            .start_with_invocation(spec("cam1"), profile(), shell("exec sleep 30"))
            .await
            .unwrap_err();
        match &err {
            SupervisorError::StartFailure { message, command } => {
                assert!(message.contains("Could not open"));
                assert!(command.starts_with("sh -c"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(paths.read_status(), Some(Status::Stopped));
        assert!(paths.read_error().unwrap().contains("Could not open"));
        assert!(!engine.is_active("cam1"));
        assert!(lock(&engine.registry).reserve("cam1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_racing_shutdown_is_abandoned() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(test_config(dir.path()));
        let pid_file = dir.path().join("worker.pid");
        let script = format!("echo $$ > {}; exec sleep 30", pid_file.display());

        let starting = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .start_with_invocation(spec("cam1"), profile(), shell(&script))
                    .await
            })
        };
        // 启动任务此时停在存活确认的等待中
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.shutdown().await;

        let result = starting.await.unwrap();
        assert!(matches!(result, Err(SupervisorError::ShuttingDown)));
        assert!(!engine.is_active("cam1"));
        let paths = engine.paths_for("cam1");
        assert_eq!(paths.read_status(), Some(Status::Stopped));
        assert_eq!(paths.read_error().as_deref(), Some(SHUTDOWN_MESSAGE));
        assert!(paths.read_pid().is_none());
        assert!(engine.store().load().contains_key("cam1"));

        let pid: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(!HostProcessGroup.is_alive(pid));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn early_exit_never_leaves_a_persisted_entry() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(test_config(dir.path()));

        engine
            .start_with_invocation(spec("cam1"), profile(), shell("sleep 0.3; exit 0"))
            .await
            .unwrap();
        wait_until(|| !engine.is_active("cam1")).await;
        // 监控任务在别的线程收尾，保存必须先于它的删除
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!engine.store().load().contains_key("cam1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_keeps_persisted_entries() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(test_config(dir.path()));

        engine
            .start_with_invocation(spec("cam1"), profile(), shell("exec sleep 30"))
            .await
            .unwrap();
        engine.shutdown().await;

        assert!(!engine.is_active("cam1"));
        let paths = engine.paths_for("cam1");
        assert_eq!(paths.read_status(), Some(Status::Stopped));
        assert_eq!(paths.read_error().as_deref(), Some(SHUTDOWN_MESSAGE));
        assert!(engine.store().load().contains_key("cam1"));
        assert!(matches!(
            engine.start(spec("cam2")).await,
            Err(SupervisorError::ShuttingDown)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn orphan_is_stopped_through_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(test_config(dir.path()));

        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        process::isolate_group(&mut cmd);
        let mut orphan = cmd.spawn().unwrap();
        let pid = orphan.id().unwrap();

        let paths = engine.paths_for("ghost");
        paths.write_pid(pid).unwrap();
        paths.write_status(Status::Running, None).unwrap();

        let views = engine.list();
        assert_eq!(views.len(), 1);
        assert!(views[0].orphaned);
        assert_eq!(views[0].status, Status::Running);

        assert_eq!(engine.stop("ghost").await.unwrap(), StopOutcome::OrphanStopped);
        assert!(orphan.wait().await.is_ok());
        assert_eq!(paths.read_status(), Some(Status::Stopped));
        assert!(engine.list().is_empty());

        assert!(matches!(
            engine.stop("nobody").await,
            Err(SupervisorError::NotActive(_))
        ));
    }

    #[test]
    fn stale_pid_orphans_are_listed_then_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(test_config(dir.path()));

        let paths = engine.paths_for("ghost");
        // 远超默认 pid_max 的 PID
        paths.write_pid(999_999_999).unwrap();
        paths.write_status(Status::Error, Some("died")).unwrap();
        engine.store().save(&spec("ghost"), None);

        let views = engine.list();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].status, Status::Error);
        assert_eq!(views[0].error.as_deref(), Some("died (Stale PID)"));
        assert_eq!(views[0].remaining, "Unlimited");

        assert_eq!(engine.cleanup_stale(), 1);
        assert_eq!(paths.read_status(), Some(Status::Stopped));
        assert_eq!(paths.read_error().as_deref(), Some("died"));
        assert!(engine.store().load().is_empty());
        assert!(engine.list().is_empty());
    }
}
