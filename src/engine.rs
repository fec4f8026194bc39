use crate::fleet::FleetCoordinator;
use crate::session::CameraDescriptor;
use crate::state::{lock, AppState, FleetRun};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct Engine;

impl Engine {
    /// 启动指定名称的相机
    ///
    /// # 错误处理
    /// - 内存不足时返回错误
    /// - 配置未找到时返回错误
    pub async fn start_camera(state: &Arc<AppState>, name: &str) -> anyhow::Result<Vec<String>> {
        Self::start_cameras(state, vec![name.to_string()]).await
    }

    /// 启动配置中的全部相机
    pub async fn start_all(state: &Arc<AppState>) -> anyhow::Result<Vec<String>> {
        let names = state.config.cameras.iter().map(|c| c.name.clone()).collect();
        Self::start_cameras(state, names).await
    }

    /// 启动配置了 `auto_start` 的相机
    pub async fn start_auto(state: &Arc<AppState>) -> anyhow::Result<Vec<String>> {
        let names = state
            .config
            .cameras
            .iter()
            .filter(|c| c.auto_start)
            .map(|c| c.name.clone())
            .collect();
        Self::start_cameras(state, names).await
    }

    /// 以一个调度任务启动一批相机，已在运行的相机会被跳过
    ///
    /// 返回实际启动的相机名
    pub async fn start_cameras(state: &Arc<AppState>, names: Vec<String>) -> anyhow::Result<Vec<String>> {
        // 1. 检查系统内存是否足够
        match sys_info::mem_info() {
            Ok(mem) => {
                // 可用内存小于 5MB 时拒绝启动
                if mem.avail < 5120 {
                    return Err(anyhow::anyhow!(
                        "Insufficient system memory ({} KB available)",
                        mem.avail
                    ));
                }
            }
            Err(e) => {
                // 无法获取内存信息时仅记录警告
                warn!("Failed to check memory usage: {}", e);
            }
        }

        // 2. 准备工作根目录
        let server = &state.config.server;
        let temp_root = server.temp_root();
        let records_root = server.records_root();
        fs::create_dir_all(&temp_root).await?;
        fs::create_dir_all(&records_root).await?;

        // 3. 在控制锁内完成筛选与启动，避免重复启动
        let mut control = lock(&state.control);

        let mut descriptors = Vec::new();
        for name in &names {
            let cfg = state
                .config
                .camera(name)
                .ok_or_else(|| anyhow::anyhow!("Camera [{}] configuration not found", name))?;

            if Self::is_running_locked(state, &control.runs, name) {
                info!("Camera [{}] is already running", name);
                continue;
            }
            descriptors.push(CameraDescriptor::under(
                &cfg.name,
                &cfg.url,
                &temp_root,
                &records_root,
            ));
        }

        if descriptors.is_empty() {
            return Ok(Vec::new());
        }

        // 停止之后的第一次启动使用新的全局令牌
        if control.global.is_cancelled() {
            control.global = CancellationToken::new();
        }
        control.halted = false;

        let started: Vec<String> = descriptors.iter().map(|d| d.name.clone()).collect();
        {
            // 旧会话的记录由新会话替换
            let mut sessions = lock(&state.sessions);
            for name in &started {
                sessions.remove(name);
            }
        }

        let fleet = FleetCoordinator::new(
            descriptors,
            Arc::clone(&state.capture),
            state.config.detection.clone(),
            state.config.session.clone(),
            control.global.clone(),
        )?
        .with_registry(Arc::clone(&state.sessions));

        info!(
            "Starting camera(s) {:?} with {} detection",
            started,
            state.config.detection.name()
        );
        let handle = tokio::spawn(async move { fleet.run().await });

        let global = control.global.clone();
        control.runs.push(FleetRun {
            cameras: started.clone(),
            started_at: Instant::now(),
            global,
            handle,
        });

        Ok(started)
    }

    /// 相机是否在运行：已登记的会话以其状态为准，尚未登记的以所属任务是否结束为准
    ///
    /// 已收到停止请求的会话不算运行中，停止后可以立即重新启动
    pub fn is_running(state: &Arc<AppState>, name: &str) -> bool {
        let control = lock(&state.control);
        Self::is_running_locked(state, &control.runs, name)
    }

    fn is_running_locked(state: &Arc<AppState>, runs: &[FleetRun], name: &str) -> bool {
        if let Some(session) = lock(&state.sessions).get(name) {
            return !session.is_stopping() && session.status().phase.is_active();
        }
        runs.iter().any(|run| {
            !run.handle.is_finished()
                && !run.global.is_cancelled()
                && run.cameras.iter().any(|c| c == name)
        })
    }

    /// 停止单个相机，不影响其它相机
    pub fn stop_camera(state: &Arc<AppState>, name: &str) -> bool {
        let session = lock(&state.sessions).get(name).cloned();
        match session {
            Some(session) => {
                session.stop();
                info!("Camera [{}] stopped.", name);
                true
            }
            None => false,
        }
    }

    /// 停止全部相机，没有运行中的相机时调用也是安全的
    pub fn stop(state: &Arc<AppState>) {
        let mut control = lock(&state.control);
        control.halted = true;
        if !control.global.is_cancelled() {
            info!("Stopping all cameras");
        }
        control.global.cancel();
    }

    /// 清理已结束的调度任务
    pub fn reap(state: &Arc<AppState>) {
        lock(&state.control)
            .runs
            .retain(|run| !run.handle.is_finished());
    }

    /// 等待全部调度任务结束
    pub async fn join(state: &Arc<AppState>) {
        let runs = std::mem::take(&mut lock(&state.control).runs);
        for run in runs {
            match run.handle.await {
                Ok(reports) => {
                    for report in reports {
                        if let Err(e) = report.outcome {
                            warn!("Camera [{}] ended with error: {}", report.name, e);
                        }
                    }
                    info!(
                        "Camera run {:?} finished after {}s",
                        run.cameras,
                        run.started_at.elapsed().as_secs()
                    );
                }
                Err(e) => error!("Camera run {:?} aborted: {}", run.cameras, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::fake::FakeCapture;
    use crate::config::AppConfig;
    use crate::session::SessionPhase;
    use std::time::Duration;

    fn app(base: &std::path::Path) -> (Arc<AppState>, Arc<FakeCapture>) {
        let yaml = format!(
            r#"
server:
  listen: "127.0.0.1:0"
  base_dir: "{}"
cameras:
  - name: gate
    url: rtsp://gate
  - name: yard
    url: rtsp://yard
    auto_start: false
"#,
            base.display()
        );
        let config: AppConfig = serde_yaml::from_str(&yaml).unwrap();
        let capture = Arc::new(FakeCapture::new());
        (Arc::new(AppState::new(config, capture.clone())), capture)
    }

    #[tokio::test(start_paused = true)]
    async fn starting_twice_runs_one_session() {
        let dir = tempfile::tempdir().unwrap();
        let (state, capture) = app(dir.path());

        assert_eq!(Engine::start_auto(&state).await.unwrap(), vec!["gate"]);
        assert!(Engine::start_camera(&state, "gate").await.unwrap().is_empty());
        assert!(Engine::is_running(&state, "gate"));
        assert!(!Engine::is_running(&state, "yard"));

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(capture.probes("rtsp://gate"), 4);
        assert_eq!(capture.probes("rtsp://yard"), 0);

        Engine::stop(&state);
        Engine::stop(&state);
        Engine::join(&state).await;
        assert!(!Engine::is_running(&state, "gate"));
        let phase = lock(&state.sessions).get("gate").map(|s| s.status().phase);
        assert_eq!(phase, Some(SessionPhase::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop_uses_a_fresh_token() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = app(dir.path());

        Engine::stop(&state);
        Engine::start_all(&state).await.unwrap();
        assert!(!lock(&state.control).global.is_cancelled());
        assert!(!lock(&state.control).halted);

        Engine::stop(&state);
        Engine::join(&state).await;
        assert!(lock(&state.control).runs.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn start_right_after_stop_restarts_cameras() {
        let dir = tempfile::tempdir().unwrap();
        let (state, capture) = app(dir.path());

        Engine::start_all(&state).await.unwrap();
        tokio::time::sleep(Duration::from_secs(15)).await;

        // 停止后会话仍在退出中，此时再次启动不能被当作"已在运行"
        Engine::stop(&state);
        let mut restarted = Engine::start_all(&state).await.unwrap();
        restarted.sort();
        assert_eq!(restarted, vec!["gate", "yard"]);
        assert!(!lock(&state.control).halted);

        let probes_before = capture.probes("rtsp://gate");
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(Engine::is_running(&state, "gate"));
        assert!(Engine::is_running(&state, "yard"));
        assert!(capture.probes("rtsp://gate") > probes_before);

        Engine::stop(&state);
        Engine::join(&state).await;
        assert!(!Engine::is_running(&state, "gate"));
    }

    #[tokio::test]
    async fn unknown_camera_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = app(dir.path());
        assert!(Engine::start_camera(&state, "roof").await.is_err());
        assert!(!Engine::stop_camera(&state, "roof"));
    }
}
