use crate::artifacts::Status;
use crate::crash::{CrashReport, HostSnapshot};
use crate::engine::{Engine, SHUTDOWN_MESSAGE, USER_STOP_MESSAGE};
use crate::process;
use crate::state::{ActiveStream, StopReason};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;

/// 进程退出时可用的事实
#[derive(Debug, Clone, Copy)]
pub struct ExitFacts {
    pub code: Option<i32>,
    pub success: bool,
    pub elapsed: Duration,
    pub limit: Option<Duration>,
    pub tolerance: Duration,
    pub stop_requested: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitClass {
    /// 正常结束，附带的说明写在状态旁
    Normal(Option<String>),
    Crash(String),
    HealthViolation(String),
}

/// 退出码 0、接近时长上限的退出、停止请求期间的退出均算正常，其余为崩溃
pub fn classify_exit(facts: &ExitFacts) -> ExitClass {
    if facts.success || facts.stop_requested {
        return ExitClass::Normal(None);
    }
    if let Some(limit) = facts.limit {
        if facts.elapsed + facts.tolerance >= limit {
            return ExitClass::Normal(None);
        }
    }
    let code = facts
        .code
        .map_or_else(|| "signal".to_string(), |c| c.to_string());
    ExitClass::Crash(format!("FFmpeg exited unexpectedly (exit code {})", code))
}

/// 健康检查终止时的状态说明
pub(crate) fn health_detail(why: &str) -> String {
    format!("Stream stopped due to health check failure: {}", why)
}

fn from_stop_reason(reason: Option<StopReason>) -> ExitClass {
    match reason {
        Some(StopReason::HealthViolation(why)) => ExitClass::HealthViolation(why),
        Some(StopReason::Shutdown) => ExitClass::Normal(Some(SHUTDOWN_MESSAGE.to_string())),
        Some(StopReason::UserRequested) | None => {
            ExitClass::Normal(Some(USER_STOP_MESSAGE.to_string()))
        }
    }
}

struct Outcome {
    class: ExitClass,
    code: Option<i32>,
}

/// 监控任务持有子进程直到其退出，然后写入终态
pub(crate) async fn run(engine: Arc<Engine>, stream: Arc<ActiveStream>, mut child: Child) {
    let outcome = watch(&engine, &stream, &mut child).await;
    finalize(&engine, &stream, outcome).await;
}

async fn watch(engine: &Engine, stream: &ActiveStream, child: &mut Child) -> Outcome {
    let timing = &engine.config().timing;
    let group = engine.process_group().as_ref();
    let limit = stream.spec.duration();

    loop {
        // 停止请求优先于其它分类
        if stream.stop.is_requested() {
            let code = match process::terminate_child(group, child, timing.stop_grace()).await {
                Ok(status) => status.code(),
                Err(e) => {
                    stream.log.warn(&format!("Termination after stop request failed: {}", e));
                    None
                }
            };
            return Outcome {
                class: from_stop_reason(stream.stop.reason()),
                code,
            };
        }

        match child.try_wait() {
            Ok(Some(status)) => {
                let facts = ExitFacts {
                    code: status.code(),
                    success: status.success(),
                    elapsed: stream.elapsed(),
                    limit,
                    tolerance: timing.duration_tolerance(),
                    stop_requested: stream.stop.is_requested(),
                };
                let class = if facts.stop_requested {
                    from_stop_reason(stream.stop.reason())
                } else {
                    classify_exit(&facts)
                };
                stream.log.info(&format!("FFmpeg exited with status {}", status));
                return Outcome {
                    class,
                    code: status.code(),
                };
            }
            Ok(None) => {}
            Err(e) => {
                stream.log.error(&format!("Could not poll FFmpeg: {}", e));
                let _ = process::terminate_child(group, child, timing.stop_grace()).await;
                return Outcome {
                    class: ExitClass::Crash(format!("Monitor lost track of FFmpeg: {}", e)),
                    code: None,
                };
            }
        }

        if let Some(limit) = limit {
            if stream.elapsed() > limit {
                stream.log.info(&format!(
                    "Stream reached its duration of {:.2} hours, stopping",
                    stream.spec.duration_hours
                ));
                let code = process::terminate_child(group, child, timing.stop_grace())
                    .await
                    .ok()
                    .and_then(|s| s.code());
                return Outcome {
                    class: ExitClass::Normal(None),
                    code,
                };
            }
        }

        tokio::select! {
            _ = stream.stop.cancelled() => {}
            _ = tokio::time::sleep(timing.monitor_poll()) => {}
        }
    }
}

async fn finalize(engine: &Engine, stream: &ActiveStream, outcome: Outcome) {
    let paths = &stream.paths;
    paths.remove_pid();

    let written = match &outcome.class {
        ExitClass::Normal(detail) => {
            stream.log.info("Stream finished normally");
            paths.write_status(Status::Stopped, detail.as_deref())
        }
        ExitClass::Crash(reason) => {
            stream.log.error(reason);
            let report = CrashReport::collect(
                stream.name(),
                paths,
                outcome.code,
                reason,
                &stream.command,
            )
            .with_host(HostSnapshot::capture(&engine.config().server.transcoder_binary).await);
            match report.save(&paths.crash) {
                Ok(()) => stream
                    .log
                    .error(&format!("Crash report saved to {}", paths.crash.display())),
                Err(e) => stream.log.error(&format!("Could not save crash report: {}", e)),
            }
            paths
                .write_status(Status::Error, Some(reason))
                .and_then(|_| paths.write_status(Status::Stopped, Some(reason)))
        }
        ExitClass::HealthViolation(why) => {
            let detail = health_detail(why);
            stream.log.error(&detail);
            paths
                .write_status(Status::Error, Some(&detail))
                .and_then(|_| paths.write_status(Status::Stopped, Some(&detail)))
        }
    };
    if let Err(e) = written {
        stream.log.error(&format!("Could not write final status: {}", e));
    }

    engine.forget(stream.name(), stream.generation);
    if !engine.is_shutting_down() {
        engine.store().remove(stream.name());
    }
    stream.log.info("Monitor finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts() -> ExitFacts {
        ExitFacts {
            code: Some(1),
            success: false,
            elapsed: Duration::from_secs(60),
            limit: None,
            tolerance: Duration::from_secs(20),
            stop_requested: false,
        }
    }

    #[test]
    fn success_code_is_always_normal() {
        let f = ExitFacts {
            code: Some(0),
            success: true,
            ..facts()
        };
        assert_eq!(classify_exit(&f), ExitClass::Normal(None));
    }

    #[test]
    fn nonzero_exit_without_limit_is_crash() {
        match classify_exit(&facts()) {
            ExitClass::Crash(reason) => assert!(reason.contains("exit code 1")),
            other => panic!("expected crash, got {:?}", other),
        }
        let killed = ExitFacts { code: None, ..facts() };
        assert!(matches!(classify_exit(&killed), ExitClass::Crash(r) if r.contains("signal")));
    }

    #[test]
    fn exit_within_tolerance_of_duration_is_normal() {
        let near = ExitFacts {
            code: Some(124),
            limit: Some(Duration::from_secs(70)),
            ..facts()
        };
        assert_eq!(classify_exit(&near), ExitClass::Normal(None));

        let early = ExitFacts {
            limit: Some(Duration::from_secs(3600)),
            ..facts()
        };
        assert!(matches!(classify_exit(&early), ExitClass::Crash(_)));
    }

    #[test]
    fn stop_in_flight_overrides_crash() {
        let f = ExitFacts {
            code: None,
            stop_requested: true,
            ..facts()
        };
        assert_eq!(classify_exit(&f), ExitClass::Normal(None));
    }

    #[test]
    fn stop_reasons_map_to_outcomes() {
        assert_eq!(
            from_stop_reason(Some(StopReason::HealthViolation("cpu".into()))),
            ExitClass::HealthViolation("cpu".into())
        );
        assert_eq!(
            from_stop_reason(Some(StopReason::Shutdown)),
            ExitClass::Normal(Some(SHUTDOWN_MESSAGE.to_string()))
        );
        assert!(health_detail("cpu").ends_with("health check failure: cpu"));
    }
}
