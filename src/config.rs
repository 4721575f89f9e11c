use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 应用配置根节点
///
/// 所有字段均带有默认值，空文件或缺失的段落都会回落到文档化的默认配置。
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub timing: TimingConfig,
    pub health: HealthConfig,
    pub persistence: PersistenceConfig,
    pub cleanup: CleanupConfig,
    pub stream_log: StreamLogConfig,
    pub defaults: StreamDefaults,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub transcoder_binary: String,
    /// 视频站点直链解析器 (yt-dlp)
    pub resolver_binary: String,
    pub rtsp_host: String,
    pub rtsp_port: u16,
    /// 全局硬件加速开关
    pub hardware_accel: bool,
    pub render_node: String,
    /// 有时长限制时是否使用宿主 timeout 包装
    pub use_time_limiter: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5000".to_string(),
            transcoder_binary: "ffmpeg".to_string(),
            resolver_binary: "yt-dlp".to_string(),
            rtsp_host: "localhost".to_string(),
            rtsp_port: 8554,
            hardware_accel: true,
            render_node: "/dev/dri/renderD128".to_string(),
            use_time_limiter: true,
        }
    }
}

/// 运行时目录布局
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PathsConfig {
    pub base_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
        }
    }
}

impl PathsConfig {
    pub fn log_dir(&self) -> PathBuf {
        self.base_dir.join("ffmpeg_logs")
    }

    pub fn crash_dir(&self) -> PathBuf {
        self.base_dir.join("ffmpeg_crash_logs")
    }

    pub fn pid_dir(&self) -> PathBuf {
        self.base_dir.join("pids")
    }

    pub fn status_dir(&self) -> PathBuf {
        self.base_dir.join("status")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.log_dir(),
            self.crash_dir(),
            self.pid_dir(),
            self.status_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

fn default_base_dir() -> PathBuf {
    if cfg!(windows) {
        env::temp_dir().join("stream_warden")
    } else {
        PathBuf::from("/tmp/stream_warden")
    }
}

/// 轮询与宽限期 (毫秒)
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TimingConfig {
    /// 启动后判定 "立即失败" 的等待时间
    pub start_grace_ms: u64,
    /// SIGTERM 与 SIGKILL 之间的宽限期
    pub stop_grace_ms: u64,
    pub monitor_poll_ms: u64,
    /// Stop 等待监控任务结束的上限
    pub join_timeout_ms: u64,
    pub shutdown_join_timeout_ms: u64,
    /// 时长边界附近的退出视为正常的容差
    pub duration_tolerance_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            start_grace_ms: 500,
            stop_grace_ms: 2000,
            monitor_poll_ms: 10_000,
            join_timeout_ms: 7000,
            shutdown_join_timeout_ms: 5000,
            duration_tolerance_secs: 20,
        }
    }
}

impl TimingConfig {
    pub fn start_grace(&self) -> Duration {
        Duration::from_millis(self.start_grace_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn monitor_poll(&self) -> Duration {
        Duration::from_millis(self.monitor_poll_ms.max(1))
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn shutdown_join_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_join_timeout_ms)
    }

    pub fn duration_tolerance(&self) -> Duration {
        Duration::from_secs(self.duration_tolerance_secs)
    }
}

/// 健康检查策略
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub max_cpu_percent: f32,
    pub max_memory_mb: u64,
    /// 有限时长流的全局安全上限，与流自身声明的时长无关
    pub max_stream_duration_secs: u64,
    pub error_tail_bytes: u64,
    pub error_keyword_threshold: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            max_cpu_percent: 90.0,
            max_memory_mb: 2048,
            max_stream_duration_secs: 48 * 3600,
            error_tail_bytes: 1000,
            error_keyword_threshold: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub dir: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("./data"),
        }
    }
}

impl PersistenceConfig {
    pub fn snapshot_file(&self) -> PathBuf {
        self.dir.join("active_streams.json")
    }
}

/// 磁盘产物保留策略
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    pub interval_hours: u64,
    pub log_retention_days: u64,
    pub pid_status_retention_days: u64,
    pub crash_retention_days: u64,
    /// 0 表示不限制
    pub max_log_dir_mb: u64,
    pub max_crash_dir_mb: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: 24,
            log_retention_days: 7,
            pid_status_retention_days: 2,
            crash_retention_days: 30,
            max_log_dir_mb: 512,
            max_crash_dir_mb: 256,
        }
    }
}

/// 每路流的包装日志轮转
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StreamLogConfig {
    pub max_bytes: u64,
    pub backups: u32,
}

impl Default for StreamLogConfig {
    fn default() -> Self {
        Self {
            max_bytes: 5 * 1024 * 1024,
            backups: 2,
        }
    }
}

/// 请求中未给出时使用的流参数
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StreamDefaults {
    pub video_codec: String,
    pub audio_codec: String,
    pub resolution: String,
    pub fps: String,
    pub duration_hours: f64,
}

impl Default for StreamDefaults {
    fn default() -> Self {
        Self {
            video_codec: "h264".to_string(),
            audio_codec: "aac".to_string(),
            resolution: "1080".to_string(),
            fps: "15".to_string(),
            duration_hours: 0.0,
        }
    }
}

impl AppConfig {
    /// 从 YAML 文件加载配置，文件不存在时使用默认值
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::parse_yaml(&content)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn parse_yaml(content: &str) -> anyhow::Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// 应用环境变量覆盖
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("STREAM_WARDEN_TMP_DIR") {
            self.paths.base_dir = PathBuf::from(val);
        }
        if let Ok(val) = env::var("STREAM_WARDEN_LISTEN") {
            self.server.listen = val;
        }
        if let Ok(val) = env::var("RTSP_HOST") {
            self.server.rtsp_host = val;
        }
        override_parsed("RTSP_PORT", &mut self.server.rtsp_port);
        override_flag("ENABLE_HARDWARE_ACCEL", &mut self.server.hardware_accel);

        override_parsed("MAX_CPU_USAGE", &mut self.health.max_cpu_percent);
        override_parsed("MAX_MEMORY_USAGE", &mut self.health.max_memory_mb);
        override_parsed(
            "MAX_STREAM_DURATION",
            &mut self.health.max_stream_duration_secs,
        );
        override_parsed("HEALTH_CHECK_INTERVAL", &mut self.health.interval_secs);
        override_flag("ENABLE_HEALTH_MONITORING", &mut self.health.enabled);

        override_flag("ENABLE_STREAM_PERSISTENCE", &mut self.persistence.enabled);
        if let Ok(val) = env::var("STREAM_PERSISTENCE_DIR") {
            self.persistence.dir = PathBuf::from(val);
        }

        override_flag("ENABLE_PERIODIC_CLEANUP", &mut self.cleanup.enabled);
        override_parsed("CLEANUP_INTERVAL_HOURS", &mut self.cleanup.interval_hours);
        override_parsed("LOG_RETENTION_DAYS", &mut self.cleanup.log_retention_days);
        override_parsed(
            "PID_STATUS_RETENTION_DAYS",
            &mut self.cleanup.pid_status_retention_days,
        );
        override_parsed(
            "CRASH_LOG_RETENTION_DAYS",
            &mut self.cleanup.crash_retention_days,
        );
        override_parsed("MAX_LOG_DIR_SIZE_MB", &mut self.cleanup.max_log_dir_mb);
        override_parsed(
            "MAX_CRASH_LOG_DIR_SIZE_MB",
            &mut self.cleanup.max_crash_dir_mb,
        );
    }

    /// 校验配置，返回所有问题的可读描述
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.health.max_cpu_percent <= 0.0 || self.health.max_cpu_percent > 100.0 {
            errors.push(format!(
                "max_cpu_percent must be between 0 and 100, got {}",
                self.health.max_cpu_percent
            ));
        }
        if self.health.max_memory_mb == 0 {
            errors.push("max_memory_mb must be positive, got 0".to_string());
        }
        if self.health.enabled && self.health.interval_secs == 0 {
            errors.push("health interval_secs must be positive".to_string());
        }
        if self.cleanup.enabled && self.cleanup.interval_hours == 0 {
            errors.push("cleanup interval_hours must be positive".to_string());
        }
        if self.server.rtsp_port == 0 {
            errors.push("rtsp_port must be between 1 and 65535, got 0".to_string());
        }

        errors
    }
}

fn override_parsed<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(val) = env::var(key) {
        if let Ok(parsed) = val.trim().parse::<T>() {
            *target = parsed;
        }
    }
}

fn override_flag(key: &str, target: &mut bool) {
    if let Ok(val) = env::var(key) {
        // Accept "true", "1", "yes" as true; "false", "0", "no" as false
        match val.to_lowercase().as_str() {
            "true" | "1" | "yes" => *target = true,
            "false" | "0" | "no" => *target = false,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn empty_config_uses_defaults() {
        let config = AppConfig::parse_yaml("").expect("empty yaml should parse");

        assert_eq!(config.server.transcoder_binary, "ffmpeg");
        assert_eq!(config.server.rtsp_port, 8554);
        assert_eq!(config.timing.start_grace_ms, 500);
        assert_eq!(config.timing.duration_tolerance_secs, 20);
        assert_eq!(config.health.max_memory_mb, 2048);
        assert_eq!(config.health.max_stream_duration_secs, 172_800);
        assert_eq!(config.cleanup.max_crash_dir_mb, 256);
        assert!(config.persistence.enabled);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let yaml = r#"
health:
  max_cpu_percent: 75.0
timing:
  monitor_poll_ms: 250
"#;
        let config = AppConfig::parse_yaml(yaml).expect("partial yaml should parse");

        assert!((config.health.max_cpu_percent - 75.0).abs() < f32::EPSILON);
        assert_eq!(config.health.interval_secs, 60);
        assert_eq!(config.timing.monitor_poll(), Duration::from_millis(250));
        assert_eq!(config.timing.stop_grace_ms, 2000);
    }

    #[test]
    fn validate_reports_out_of_range_ceilings() {
        let mut config = AppConfig::default();
        config.health.max_cpu_percent = 150.0;
        config.health.max_memory_mb = 0;

        let errors = config.validate();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("max_cpu_percent"));
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let _guard = ENV_MUTEX.lock().unwrap();
        env::set_var("MAX_MEMORY_USAGE", "512");
        env::set_var("ENABLE_STREAM_PERSISTENCE", "no");
        env::set_var("RTSP_PORT", "not-a-port");

        let mut config = AppConfig::default();
        config.apply_env_overrides();

        env::remove_var("MAX_MEMORY_USAGE");
        env::remove_var("ENABLE_STREAM_PERSISTENCE");
        env::remove_var("RTSP_PORT");

        assert_eq!(config.health.max_memory_mb, 512);
        assert!(!config.persistence.enabled);
        // unparsable values keep the existing setting
        assert_eq!(config.server.rtsp_port, 8554);
    }

    #[test]
    fn derived_directories_sit_under_base_dir() {
        let paths = PathsConfig {
            base_dir: PathBuf::from("/srv/warden"),
        };
        assert_eq!(paths.log_dir(), PathBuf::from("/srv/warden/ffmpeg_logs"));
        assert_eq!(paths.status_dir(), PathBuf::from("/srv/warden/status"));
    }
}
