use crate::capture::StreamCapture;
use crate::config::AppConfig;
use crate::fleet::{CameraReport, SessionRegistry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 获取互斥锁，持锁线程 panic 后仍继续使用其中的数据
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 一次启动 (单个相机或一批相机) 对应的后台任务
pub struct FleetRun {
    pub cameras: Vec<String>,
    pub started_at: Instant,
    /// 启动时的全局令牌
    pub global: CancellationToken,
    pub handle: JoinHandle<Vec<CameraReport>>,
}

/// 启停控制
pub struct Control {
    /// 当前的全局取消令牌，停止后替换为新令牌
    pub global: CancellationToken,
    pub runs: Vec<FleetRun>,
    /// 用户主动停止后不再自动重启
    pub halted: bool,
}

impl Default for Control {
    fn default() -> Self {
        Self {
            global: CancellationToken::new(),
            runs: Vec::new(),
            halted: false,
        }
    }
}

/// 故障恢复状态
pub struct CameraRecoveryState {
    /// 连续失败次数
    pub crash_count: u32,
    /// 下次允许尝试重启的最早时间点
    pub next_retry_at: Option<Instant>,
    /// 已达到最大重试次数
    pub exhausted: bool,
}

/// 全局应用上下文
pub struct AppState {
    pub config: AppConfig,
    pub capture: Arc<dyn StreamCapture>,
    /// 会话表 (Camera Name -> Session)
    pub sessions: SessionRegistry,
    pub control: Mutex<Control>,
    /// 恢复状态表 (Camera Name -> Recovery State)
    pub recovery_states: Mutex<HashMap<String, CameraRecoveryState>>,
}

impl AppState {
    pub fn new(config: AppConfig, capture: Arc<dyn StreamCapture>) -> Self {
        Self {
            config,
            capture,
            sessions: SessionRegistry::default(),
            control: Mutex::new(Control::default()),
            recovery_states: Mutex::new(HashMap::new()),
        }
    }
}

pub type SharedState = Arc<AppState>;
