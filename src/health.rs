use crate::artifacts::read_tail_bytes;
use crate::config::HealthConfig;
use crate::process::{ProcessSampler, ResourceSample};
use crate::state::{ActiveStream, SharedState};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 错误输出中视为故障的关键字
const ERROR_KEYWORDS: &[&str] = &["error", "failed", "invalid", "cannot", "unable"];

const UPTIME_LOG_EVERY: Duration = Duration::from_secs(3600);

/// 启动健康检查任务，按固定间隔对注册表快照逐一检查
///
/// # 检查项：
/// - 有限时长流的运行时间是否超过全局上限 (与流自身时长无关)
/// - 进程 CPU / 内存是否超过阈值
/// - 错误输出尾部的故障关键字数量是否超过阈值
///
/// 任一项违规都会按健康失败终止该流，最终状态记为 `error`。
pub async fn run_health_monitor(state: SharedState, shutdown: CancellationToken) {
    let cfg = state.config().health.clone();
    if !cfg.enabled {
        info!("Health monitoring disabled");
        return;
    }
    let sampler = ProcessSampler::new();
    let mut interval = tokio::time::interval(Duration::from_secs(cfg.interval_secs.max(1)));
    info!("Health monitor running every {}s", cfg.interval_secs);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        if state.is_shutting_down() {
            break;
        }
        sweep(&state, &sampler, &cfg).await;
    }
    debug!("Health monitor stopped");
}

/// 单轮检查，返回被终止的流名
pub async fn sweep(state: &SharedState, sampler: &ProcessSampler, cfg: &HealthConfig) -> Vec<String> {
    let mut terminated = Vec::new();

    for stream in state.snapshot() {
        if stream.stop.is_requested() {
            continue;
        }
        let sample = sampler.sample(stream.pid).await;
        if let Some(s) = sample {
            stream.log.info(&format!(
                "Health: CPU {:.1}%, memory {:.1} MB",
                s.cpu_percent, s.memory_mb
            ));
        }
        log_uptime(&stream, cfg);

        let Some(reason) = evaluate(&stream, sample, cfg) else {
            continue;
        };
        warn!("Stream [{}] failed health check: {}", stream.name(), reason);
        stream.log.error(&format!("Health check failed: {}", reason));
        if state.terminate_for_health(stream.name(), stream.generation, &reason) {
            terminated.push(stream.name().to_string());
        }
    }

    terminated
}

fn log_uptime(stream: &ActiveStream, cfg: &HealthConfig) {
    if !stream.spec.is_unlimited() {
        return;
    }
    // 大约每小时一次：跨过整点后的第一轮
    let elapsed = stream.elapsed().as_secs();
    let window = cfg.interval_secs.max(1);
    if elapsed >= UPTIME_LOG_EVERY.as_secs() && elapsed % UPTIME_LOG_EVERY.as_secs() < window {
        stream
            .log
            .info(&format!("Unlimited stream uptime: {:.1} hours", elapsed as f64 / 3600.0));
    }
}

fn evaluate(stream: &ActiveStream, sample: Option<ResourceSample>, cfg: &HealthConfig) -> Option<String> {
    if let Some(reason) = check_duration_ceiling(stream.spec.is_unlimited(), stream.elapsed(), cfg) {
        return Some(reason);
    }
    if let Some(reason) = sample.and_then(|s| check_resources(&s, cfg)) {
        return Some(reason);
    }
    let tail = read_tail_bytes(&stream.paths.stderr, cfg.error_tail_bytes).unwrap_or_default();
    let hits = count_error_keywords(&tail);
    if hits > cfg.error_keyword_threshold {
        return Some(format!("Too many errors in output ({} keyword hits)", hits));
    }
    None
}

/// 全局时长上限只约束有限时长流
pub fn check_duration_ceiling(unlimited: bool, elapsed: Duration, cfg: &HealthConfig) -> Option<String> {
    if unlimited {
        return None;
    }
    let ceiling = Duration::from_secs(cfg.max_stream_duration_secs);
    (elapsed > ceiling).then(|| {
        format!(
            "Exceeded maximum duration ({:.1}h > {:.1}h)",
            elapsed.as_secs_f64() / 3600.0,
            ceiling.as_secs_f64() / 3600.0
        )
    })
}

pub fn check_resources(sample: &ResourceSample, cfg: &HealthConfig) -> Option<String> {
    if sample.cpu_percent > cfg.max_cpu_percent {
        return Some(format!(
            "CPU usage too high ({:.1}% > {:.1}%)",
            sample.cpu_percent, cfg.max_cpu_percent
        ));
    }
    if sample.memory_mb > cfg.max_memory_mb as f64 {
        return Some(format!(
            "Memory usage too high ({:.1} MB > {} MB)",
            sample.memory_mb, cfg.max_memory_mb
        ));
    }
    None
}

/// 关键字出现总次数 (不区分大小写)
pub fn count_error_keywords(text: &str) -> usize {
    let lower = text.to_lowercase();
    ERROR_KEYWORDS
        .iter()
        .map(|kw| lower.matches(kw).count())
        .sum()
}
