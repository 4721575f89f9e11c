use crate::capability::EncoderProfile;
use crate::config::PersistenceConfig;
use crate::error::SupervisorError;
use crate::state::SharedState;
use crate::stream::StreamSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

pub const ACTIVE_STATUS: &str = "active";

/// 持久化文件中的一条流记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceEntry {
    pub config: StreamSpec,
    /// Unix 时间戳 (秒)
    pub saved_at: f64,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoder: Option<EncoderProfile>,
}

impl PersistenceEntry {
    /// 距保存时刻的时长。手工改坏的 `saved_at` 不会导致 panic，
    /// 远古时间戳按最大时长处理
    pub fn age(&self, now: SystemTime) -> Duration {
        let now = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Duration::try_from_secs_f64((now - self.saved_at).max(0.0)).unwrap_or(Duration::MAX)
    }
}

pub type Snapshot = BTreeMap<String, PersistenceEntry>;

pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// 期望运行状态的单文件快照
///
/// 每次修改都整体重写，先把上一版复制为备份文件。
pub struct PersistenceStore {
    enabled: bool,
    path: PathBuf,
    backup: PathBuf,
    /// 串行化 读-改-写 过程
    lock: Mutex<()>,
}

impl PersistenceStore {
    pub fn new(cfg: &PersistenceConfig) -> Self {
        let path = cfg.snapshot_file();
        let mut backup = path.clone().into_os_string();
        backup.push(".backup");
        Self {
            enabled: cfg.enabled,
            path,
            backup: PathBuf::from(backup),
            lock: Mutex::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 依次尝试主文件、备份文件，都不可用时视为空，损坏不会导致致命错误
    pub fn load(&self) -> Snapshot {
        if !self.enabled {
            return Snapshot::new();
        }
        match read_snapshot(&self.path) {
            Ok(Some(snapshot)) => return snapshot,
            Ok(None) => {}
            Err(e) => warn!("Persistence file {} unusable: {}", self.path.display(), e),
        }
        match read_snapshot(&self.backup) {
            Ok(Some(snapshot)) => {
                warn!("Recovered stream state from backup {}", self.backup.display());
                snapshot
            }
            Ok(None) => Snapshot::new(),
            Err(e) => {
                error!("Persistence backup {} unusable: {}", self.backup.display(), e);
                Snapshot::new()
            }
        }
    }

    pub fn save(&self, spec: &StreamSpec, encoder: Option<&EncoderProfile>) {
        let entry = PersistenceEntry {
            config: spec.clone(),
            saved_at: unix_now(),
            status: ACTIVE_STATUS.to_string(),
            encoder: encoder.cloned(),
        };
        self.mutate(|snapshot| {
            snapshot.insert(spec.name.clone(), entry);
            true
        });
    }

    /// 幂等，确实删除了条目时返回 true
    pub fn remove(&self, name: &str) -> bool {
        self.mutate(|snapshot| snapshot.remove(name).is_some())
    }

    pub fn clear(&self) -> io::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.write(&Snapshot::new())
    }

    fn mutate(&self, change: impl FnOnce(&mut Snapshot) -> bool) -> bool {
        if !self.enabled {
            return false;
        }
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut snapshot = self.load();
        if !change(&mut snapshot) {
            return false;
        }
        if let Err(e) = self.write(&snapshot) {
            error!("Failed to persist stream state: {}", e);
        }
        true
    }

    fn write(&self, snapshot: &Snapshot) -> io::Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        // 主文件已损坏时不覆盖备份
        if matches!(read_snapshot(&self.path), Ok(Some(_))) {
            fs::copy(&self.path, &self.backup)?;
        }
        let body = serde_json::to_string_pretty(snapshot)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)
    }
}

fn read_snapshot(path: &Path) -> io::Result<Option<Snapshot>> {
    let body = match fs::read_to_string(path) {
        Ok(body) => body,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if body.trim().is_empty() {
        return Ok(Some(Snapshot::new()));
    }
    serde_json::from_str(&body)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RestoreSummary {
    pub restored: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// 启动时恢复持久化的流
///
/// # 跳过规则
/// - 有限时长流已经过期：删除条目
/// - 源文件已不存在：保留条目，继续恢复其他流
/// - 所需编码器不可用
///
/// 其余条目按剩余时长重新启动，启动失败时删除条目。
pub async fn restore_all(engine: &SharedState) -> RestoreSummary {
    let mut summary = RestoreSummary::default();
    let store = engine.store();
    if !store.is_enabled() {
        return summary;
    }

    let snapshot = store.load();
    if snapshot.is_empty() {
        return summary;
    }
    info!("Restoring {} persisted stream(s)", snapshot.len());
    let now = SystemTime::now();

    for (name, entry) in snapshot {
        if engine.is_active(&name) {
            summary.skipped += 1;
            continue;
        }

        let age = entry.age(now);
        let spec = entry.config;
        let mut remaining_hours = 0.0;
        if let Some(limit) = spec.duration() {
            if age >= limit {
                info!("Stream [{}] expired while offline, dropping it", name);
                store.remove(&name);
                summary.skipped += 1;
                continue;
            }
            remaining_hours = (limit - age).as_secs_f64() / 3600.0;
        }

        if spec.source_missing() {
            warn!(
                "Stream [{}] source file {} is gone, skipping restore",
                name, spec.source
            );
            summary.skipped += 1;
            continue;
        }

        if engine.discovery().query(spec.video_codec).await.is_empty() {
            warn!(
                "Stream [{}] needs {} but no encoder is available, skipping restore",
                name, spec.video_codec
            );
            summary.skipped += 1;
            continue;
        }

        let spec = spec.with_duration_hours(remaining_hours);
        match engine.start(spec).await {
            Ok(started) => {
                info!("Restored stream [{}] at {}", name, started.rtsp_url);
                summary.restored += 1;
            }
            Err(SupervisorError::ShuttingDown) => {
                info!("Shutdown began, leaving remaining entries for the next start");
                break;
            }
            Err(e) => {
                error!("Failed to restore stream [{}]: {}", name, e);
                store.remove(&name);
                summary.failed += 1;
            }
        }
    }

    info!(
        "Restore finished: {} restored, {} failed, {} skipped",
        summary.restored, summary.failed, summary.skipped
    );
    summary
}
