use crate::engine::StopOutcome;
use crate::error::SupervisorError;
use crate::persistence;
use crate::state::SharedState;
use crate::stream::StreamRequest;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

type Reply = (StatusCode, Json<Value>);

fn ok(body: Value) -> Reply {
    (StatusCode::OK, Json(body))
}

/// 将监管错误映射为 HTTP 状态码和统一的 JSON 结构
fn failure(err: &SupervisorError) -> Reply {
    let status = match err {
        SupervisorError::Validation(_) => StatusCode::BAD_REQUEST,
        SupervisorError::Capability(_) => StatusCode::BAD_REQUEST,
        SupervisorError::AlreadyActive(_) => StatusCode::CONFLICT,
        SupervisorError::NotActive(_) => StatusCode::NOT_FOUND,
        SupervisorError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        SupervisorError::SourceResolution { .. } => StatusCode::BAD_GATEWAY,
        SupervisorError::StartFailure { .. } | SupervisorError::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let mut body = json!({ "success": false, "message": err.to_string() });
    if let Some(command) = err.command() {
        body["ffmpeg_command"] = json!(command);
    }
    (status, Json(body))
}

/// 获取系统状态 API
/// 返回内存、负载以及当前活跃流数量
pub async fn sys_status(State(state): State<SharedState>) -> Json<Value> {
    let mem = sys_info::mem_info()
        .map(|m| (m.total, m.avail))
        .unwrap_or((0, 0));
    let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);

    Json(json!({
        "mem_total": mem.0 / 1024, // 转换为MB
        "mem_avail": mem.1 / 1024,
        "load_avg": load,
        "active_streams": state.snapshot().len(),
        "shutting_down": state.is_shutting_down(),
    }))
}

/// 启动流 API
pub async fn handle_start(
    State(state): State<SharedState>,
    Json(request): Json<StreamRequest>,
) -> Reply {
    let spec = match request.into_spec(&state.config().defaults) {
        Ok(spec) => spec,
        Err(e) => return failure(&SupervisorError::from(e)),
    };
    match state.start(spec).await {
        Ok(started) => ok(json!({
            "success": true,
            "message": format!("Stream '{}' started", started.name),
            "stream_name": started.name,
            "rtsp_url": started.rtsp_url,
            "pid": started.pid,
            "encoder": started.encoder,
            "ffmpeg_command": started.command,
        })),
        Err(e) => failure(&e),
    }
}

/// 停止流 API
pub async fn handle_stop(State(state): State<SharedState>, Path(name): Path<String>) -> Reply {
    match state.stop(&name).await {
        Ok(StopOutcome::Stopped) => ok(json!({
            "success": true,
            "message": format!("Stream '{}' stopped", name),
        })),
        Ok(StopOutcome::OrphanStopped) => ok(json!({
            "success": true,
            "message": format!("Orphaned stream '{}' stopped", name),
        })),
        Err(e) => failure(&e),
    }
}

/// 获取流列表 API，包含孤儿流
pub async fn list_streams(State(state): State<SharedState>) -> Json<Value> {
    let streams = state.list();
    Json(json!({ "success": true, "streams": streams }))
}

pub async fn list_persistent(State(state): State<SharedState>) -> Json<Value> {
    let snapshot = state.store().load();
    Json(json!({
        "success": true,
        "enabled": state.store().is_enabled(),
        "streams": snapshot,
    }))
}

pub async fn restore_persistent(State(state): State<SharedState>) -> Json<Value> {
    let summary = persistence::restore_all(&state).await;
    Json(json!({
        "success": true,
        "message": format!(
            "Restored {} stream(s), {} failed, {} skipped",
            summary.restored, summary.failed, summary.skipped
        ),
        "summary": summary,
    }))
}

pub async fn clear_persistent(State(state): State<SharedState>) -> Reply {
    match state.store().clear() {
        Ok(()) => ok(json!({ "success": true, "message": "Persistent streams cleared" })),
        Err(e) => failure(&SupervisorError::from(e)),
    }
}

pub async fn cleanup_stale(State(state): State<SharedState>) -> Json<Value> {
    let cleaned = state.cleanup_stale();
    Json(json!({
        "success": true,
        "message": format!("Cleaned up {} stale stream(s)", cleaned),
        "cleaned": cleaned,
    }))
}

pub async fn encoders(State(state): State<SharedState>) -> Json<Value> {
    let caps = state.discovery().capabilities().await;
    Json(json!({ "success": true, "encoders": caps }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;

    #[test]
    fn start_failures_carry_the_command() {
        let err = SupervisorError::StartFailure {
            message: "FFmpeg failed to start (exit code 1). Check logs.".to_string(),
            command: "ffmpeg -i x".to_string(),
        };
        let (status, Json(body)) = failure(&err);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert_eq!(body["ffmpeg_command"], "ffmpeg -i x");
    }

    #[test]
    fn client_errors_map_to_4xx() {
        let (status, Json(body)) = failure(&SupervisorError::from(ValidationError::MissingUrl));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.get("ffmpeg_command").is_none());

        let (status, _) = failure(&SupervisorError::AlreadyActive("a".into()));
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn persistent_streams_round_trip_through_handlers() {
        use crate::engine::tests::{spec, test_config, test_engine};

        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(test_config(dir.path()));
        engine.store().save(&spec("a"), None);

        let Json(listed) = list_persistent(State(engine.clone())).await;
        assert!(listed["streams"]["a"].is_object());

        let (status, _) = clear_persistent(State(engine.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert!(engine.store().load().is_empty());
    }
}
