//! 多路相机调度
//!
//! 每个相机一个独立任务，共享同一个全局取消令牌。单个相机的错误或 panic 只记录日志，
//! 不影响其它相机；只有 [`FleetCoordinator::stop`] 会结束全部会话。

use crate::capture::StreamCapture;
use crate::config::SessionConfig;
use crate::error::{RecorderError, Result};
use crate::motion::MotionStrategy;
use crate::session::{CameraDescriptor, RecordingSession, SessionOutcome};
use crate::state::lock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 运行中 (及最近结束) 的会话表 (Camera Name -> Session)
pub type SessionRegistry = Arc<Mutex<HashMap<String, Arc<RecordingSession>>>>;

/// 单个相机的运行结果
#[derive(Debug)]
pub struct CameraReport {
    pub name: String,
    pub outcome: std::result::Result<SessionOutcome, String>,
}

pub struct FleetCoordinator {
    cameras: Vec<CameraDescriptor>,
    capture: Arc<dyn StreamCapture>,
    strategy: MotionStrategy,
    settings: SessionConfig,
    global: CancellationToken,
    registry: SessionRegistry,
}

impl FleetCoordinator {
    /// 相机列表不能为空，且各相机目录的上级 (Temp/ 与 Records/ 根目录) 必须已存在
    pub fn new(
        cameras: Vec<CameraDescriptor>,
        capture: Arc<dyn StreamCapture>,
        strategy: MotionStrategy,
        settings: SessionConfig,
        global: CancellationToken,
    ) -> Result<Self> {
        if cameras.is_empty() {
            return Err(RecorderError::validation("camera set must not be empty"));
        }

        for camera in &cameras {
            for dir in [&camera.temp_dir, &camera.archive_dir] {
                let root = dir.parent().filter(|p| p.is_dir());
                if root.is_none() {
                    return Err(RecorderError::validation(format!(
                        "working directory for [{}] does not exist: {:?}",
                        camera.name,
                        dir.parent()
                    )));
                }
            }
        }

        Ok(Self {
            cameras,
            capture,
            strategy,
            settings,
            global,
            registry: SessionRegistry::default(),
        })
    }

    /// 将会话登记到外部共享的表中 (供管理接口查询)
    pub fn with_registry(mut self, registry: SessionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> SessionRegistry {
        Arc::clone(&self.registry)
    }

    /// 启动全部相机并等待它们结束
    pub async fn run(&self) -> Vec<CameraReport> {
        let mut tasks = JoinSet::new();

        for camera in &self.cameras {
            if camera.name.trim().is_empty() || camera.url.trim().is_empty() {
                warn!("Skipping camera [{}]: empty name or url", camera.name);
                continue;
            }

            tasks.spawn(run_camera(
                camera.clone(),
                Arc::clone(&self.capture),
                self.strategy.clone(),
                self.settings.clone(),
                self.global.clone(),
                Arc::clone(&self.registry),
            ));
        }

        info!("Fleet started with {} camera(s)", tasks.len());

        let mut reports = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!("Camera task aborted: {}", e),
            }
        }

        info!("Fleet finished");
        reports
    }

    /// 取消全局令牌，重复调用无副作用
    pub fn stop(&self) {
        if !self.global.is_cancelled() {
            info!("Stopping fleet");
        }
        self.global.cancel();
    }
}

/// 单个相机的完整生命周期：打开会话 → 监控 → 录制
pub async fn run_camera(
    camera: CameraDescriptor,
    capture: Arc<dyn StreamCapture>,
    strategy: MotionStrategy,
    settings: SessionConfig,
    global: CancellationToken,
    registry: SessionRegistry,
) -> CameraReport {
    let name = camera.name.clone();

    let session = match RecordingSession::open(camera, capture, strategy, settings, &global).await {
        Ok(session) => Arc::new(session),
        Err(e) => {
            error!("[{}] Failed to open session: {}", name, e);
            return CameraReport {
                name,
                outcome: Err(e.to_string()),
            };
        }
    };

    // 结束后保留在表中，以便查询最终状态
    lock(&registry).insert(name.clone(), Arc::clone(&session));

    let outcome = session.run().await;
    match &outcome {
        Ok(result) => info!("[{}] Session finished: {:?}", name, result),
        Err(e) => error!("[{}] Session failed: {}", name, e),
    }

    CameraReport {
        name,
        outcome: outcome.map_err(|e| e.to_string()),
    }
}
