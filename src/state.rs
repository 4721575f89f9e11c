use crate::artifacts::StreamPaths;
use crate::capability::EncoderProfile;
use crate::engine::Engine;
use crate::stream::StreamSpec;
use crate::stream_log::StreamLog;
use chrono::{DateTime, Local};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 停止原因，先到者生效
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    UserRequested,
    HealthViolation(String),
    Shutdown,
}

/// 单路流的停止信号
pub struct StopSignal {
    token: CancellationToken,
    reason: Mutex<Option<StopReason>>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Mutex::new(None),
        }
    }

    /// 记录停止原因并唤醒监控循环。返回 false 表示已有更早的请求。
    pub fn request(&self, reason: StopReason) -> bool {
        let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
        let first = slot.is_none();
        if first {
            *slot = Some(reason);
        }
        drop(slot);
        self.token.cancel();
        first
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// 运行中流的不可变部分，可在注册表外安全共享
pub struct ActiveStream {
    pub spec: StreamSpec,
    pub profile: EncoderProfile,
    pub pid: u32,
    /// 同名流的代次，防止旧监控任务误删新记录
    pub generation: u64,
    pub started_at: Instant,
    pub started_wall: DateTime<Local>,
    pub stop: StopSignal,
    pub paths: StreamPaths,
    pub log: StreamLog,
    /// 渲染后的命令行，仅用于日志和崩溃报告
    pub command: String,
}

impl ActiveStream {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// 注册表中的一条记录
pub struct StreamRecord {
    pub stream: Arc<ActiveStream>,
    pub monitor: Option<JoinHandle<()>>,
}

/// 活跃流注册表
///
/// `reserved` 覆盖 "已通过检查但尚未确认存活" 的启动窗口，
/// 保证同名流同一时刻最多一个。
#[derive(Default)]
pub struct Registry {
    streams: HashMap<String, StreamRecord>,
    reserved: HashSet<String>,
}

impl Registry {
    pub fn reserve(&mut self, name: &str) -> bool {
        if self.streams.contains_key(name) || self.reserved.contains(name) {
            return false;
        }
        self.reserved.insert(name.to_string());
        true
    }

    pub fn release(&mut self, name: &str) {
        self.reserved.remove(name);
    }

    pub fn insert(&mut self, record: StreamRecord) {
        let name = record.stream.name().to_string();
        self.reserved.remove(&name);
        self.streams.insert(name, record);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.streams.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ActiveStream>> {
        self.streams.get(name).map(|r| r.stream.clone())
    }

    /// 取出监控任务句柄，用于有界等待
    pub fn take_monitor(&mut self, name: &str) -> Option<JoinHandle<()>> {
        self.streams.get_mut(name).and_then(|r| r.monitor.take())
    }

    /// 仅当代次匹配时移除
    pub fn remove_if(&mut self, name: &str, generation: u64) -> Option<StreamRecord> {
        match self.streams.get(name) {
            Some(rec) if rec.stream.generation == generation => self.streams.remove(name),
            _ => None,
        }
    }

    /// 当前活跃流的快照，遍历时不持有锁
    pub fn snapshot(&self) -> Vec<Arc<ActiveStream>> {
        self.streams.values().map(|r| r.stream.clone()).collect()
    }
}

pub type SharedState = Arc<Engine>;
