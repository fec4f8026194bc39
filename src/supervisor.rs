use crate::engine::Engine;
use crate::session::SessionPhase;
use crate::state::{lock, AppState, CameraRecoveryState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// 启动后台监控任务，定期检查相机会话并进行故障恢复
///
/// # 任务流程：
/// - 清理已结束的调度任务
/// - 用户主动停止后不做任何恢复
/// - 会话失败或监控超时的 `auto_start` 相机按退避策略重启
/// - 进入录制阶段的相机清零失败计数
pub async fn start_supervisor(state: Arc<AppState>, interval_ms: u64) {
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));

    loop {
        interval.tick().await;
        for name in plan_restarts(&state, Instant::now()) {
            info!("Supervisor: Attempting to restart camera [{}]", name);
            if let Err(e) = Engine::start_camera(&state, &name).await {
                error!("Restart failed [{}]: {}", name, e);
            }
        }
    }
}

/// 更新恢复状态并返回本轮应重启的相机
fn plan_restarts(state: &Arc<AppState>, now: Instant) -> Vec<String> {
    Engine::reap(state);
    if lock(&state.control).halted {
        return Vec::new();
    }

    // --- 阶段 1: 读取会话状态 ---
    let phases: HashMap<String, SessionPhase> = lock(&state.sessions)
        .iter()
        .map(|(name, session)| (name.clone(), session.status().phase))
        .collect();

    // --- 阶段 2: 故障恢复 (Backoff) ---
    let mut restarts = Vec::new();
    let mut recovery_map = lock(&state.recovery_states);

    for cfg in &state.config.cameras {
        if !cfg.auto_start {
            continue;
        }

        match phases.get(&cfg.name) {
            Some(SessionPhase::Recording) => {
                // 已正常进入录制，清零失败计数
                recovery_map.remove(&cfg.name);
            }
            Some(SessionPhase::Failed) | Some(SessionPhase::TimedOut) => {
                let recovery = recovery_map
                    .entry(cfg.name.clone())
                    .or_insert(CameraRecoveryState {
                        crash_count: 0,
                        next_retry_at: None,
                        exhausted: false,
                    });
                if recovery.exhausted {
                    continue;
                }

                match recovery.next_retry_at {
                    None => {
                        // 检查最大重试次数
                        if cfg.retry.max_attempts > 0 && recovery.crash_count >= cfg.retry.max_attempts {
                            error!(
                                "Camera [{}] reached max retry attempts ({}). Giving up.",
                                cfg.name, cfg.retry.max_attempts
                            );
                            recovery.exhausted = true;
                            continue;
                        }

                        let backoff = cfg.retry.backoff(recovery.crash_count);
                        recovery.crash_count += 1;
                        recovery.next_retry_at = Some(now + backoff);

                        warn!(
                            "Camera [{}] session ended ({:?}). Retry {}/{}. Backing off for {}s.",
                            cfg.name,
                            phases[&cfg.name],
                            recovery.crash_count,
                            cfg.retry.max_attempts,
                            backoff.as_secs()
                        );
                    }
                    Some(next_retry) if now >= next_retry => {
                        recovery.next_retry_at = None;
                        restarts.push(cfg.name.clone());
                    }
                    Some(_) => {} // 冷却中
                }
            }
            // 未启动、运行中或被用户停止的相机不处理
            _ => {}
        }
    }

    restarts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::fake::FakeCapture;
    use crate::config::AppConfig;

    fn app(base: &std::path::Path, capture: FakeCapture) -> Arc<AppState> {
        let yaml = format!(
            r#"
server:
  listen: "127.0.0.1:0"
  base_dir: "{}"
cameras:
  - name: roof
    url: rtsp://roof
    retry:
      max_attempts: 2
      initial_backoff_sec: 2
      max_backoff_sec: 60
"#,
            base.display()
        );
        let config: AppConfig = serde_yaml::from_str(&yaml).unwrap();
        Arc::new(AppState::new(config, Arc::new(capture)))
    }

    async fn fail_once(state: &Arc<AppState>) {
        Engine::start_camera(state, "roof").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let phase = lock(&state.sessions).get("roof").map(|s| s.status().phase);
        assert_eq!(phase, Some(SessionPhase::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_camera_is_restarted_with_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(dir.path(), FakeCapture::new().fatal("rtsp://roof"));
        fail_once(&state).await;

        let now = Instant::now();
        // 第一次发现失败只安排重试
        assert!(plan_restarts(&state, now).is_empty());
        assert!(plan_restarts(&state, now + Duration::from_secs(1)).is_empty());
        assert_eq!(plan_restarts(&state, now + Duration::from_secs(2)), vec!["roof"]);

        fail_once(&state).await;
        let now = Instant::now();
        assert!(plan_restarts(&state, now).is_empty());
        assert!(plan_restarts(&state, now + Duration::from_secs(3)).is_empty());
        assert_eq!(plan_restarts(&state, now + Duration::from_secs(4)), vec!["roof"]);

        // 达到最大重试次数后放弃
        fail_once(&state).await;
        let later = Instant::now() + Duration::from_secs(600);
        assert!(plan_restarts(&state, later).is_empty());
        assert!(lock(&state.recovery_states)["roof"].exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_is_restarted_after_user_stop() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(dir.path(), FakeCapture::new().fatal("rtsp://roof"));
        fail_once(&state).await;

        Engine::stop(&state);
        let later = Instant::now() + Duration::from_secs(600);
        assert!(plan_restarts(&state, Instant::now()).is_empty());
        assert!(plan_restarts(&state, later).is_empty());
        assert!(lock(&state.recovery_states).is_empty());
    }
}
