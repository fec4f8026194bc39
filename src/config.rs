use crate::motion::MotionStrategy;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// 运动检测算法及参数
    #[serde(default)]
    pub detection: MotionStrategy,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen: String,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_binary: String,
    #[serde(default = "default_ffprobe")]
    pub ffprobe_binary: String,
    #[serde(default = "default_supervisor_interval")]
    pub supervisor_interval_ms: u64,

    /// 工作根目录，其下为 Temp/ 与 Records/
    #[serde(default = "default_base_dir")]
    pub base_dir: String,

    /// 启动时清空 Temp/ 中上次运行遗留的片段
    #[serde(default = "default_true")]
    pub clean_temp_on_start: bool,
}

impl ServerConfig {
    pub fn temp_root(&self) -> PathBuf {
        Path::new(&self.base_dir).join("Temp")
    }

    pub fn records_root(&self) -> PathBuf {
        Path::new(&self.base_dir).join("Records")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CameraConfig {
    pub name: String,
    /// rtsp://login:password@ip:port/...
    pub url: String,
    #[serde(default = "default_true")]
    pub auto_start: bool,

    /// 会话失败或等待超时后的重启策略
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryPolicy {
    /// 最大重试次数 (0 表示无限重试)
    pub max_attempts: u32,
    /// 初始退避时间 (秒)
    pub initial_backoff_sec: u64,
    /// 最大退避时间 (秒)
    pub max_backoff_sec: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff_sec: 2,
            max_backoff_sec: 60,
        }
    }
}

impl RetryPolicy {
    /// 第 `attempt` 次失败后的退避时间 (指数增长，封顶)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let secs = self
            .initial_backoff_sec
            .saturating_mul(factor)
            .min(self.max_backoff_sec);
        Duration::from_secs(secs)
    }
}

/// 会话的时间参数
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    /// 采集失败后的退避时间
    pub loop_delay_sec: u64,
    /// 监控阶段每次探测录制的片段长度
    pub probe_segment_sec: u64,
    /// 监控阶段等待运动的上限 (分钟)，0 表示不限
    pub monitor_timeout_min: u64,
    /// 确认无运动的窗口，按 retry_budget 均分为运动循环周期
    pub confirmation_window_sec: u64,
    /// 判定网络卡死的窗口，按 retry_budget 均分为网络循环周期
    pub stall_window_sec: u64,
    pub retry_budget: u32,
    /// 定长采集在片段时长之外额外允许的时间
    pub capture_grace_sec: u64,
    pub probe_timeout_sec: u64,
    pub snapshot_timeout_sec: u64,
    pub compare_timeout_sec: u64,
    pub snapshot_width: u32,
    pub snapshot_height: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            loop_delay_sec: 5,
            probe_segment_sec: 10,
            monitor_timeout_min: 0,
            confirmation_window_sec: 15,
            stall_window_sec: 60,
            retry_budget: 3,
            capture_grace_sec: 5,
            probe_timeout_sec: 10,
            snapshot_timeout_sec: 7,
            compare_timeout_sec: 30,
            snapshot_width: 1920,
            snapshot_height: 1080,
        }
    }
}

impl SessionConfig {
    pub fn monitor_timeout(&self) -> Option<Duration> {
        (self.monitor_timeout_min > 0).then(|| Duration::from_secs(self.monitor_timeout_min * 60))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.retry_budget > 0, "session.retry_budget must be > 0");
        anyhow::ensure!(
            self.confirmation_window_sec > 0,
            "session.confirmation_window_sec must be > 0"
        );
        anyhow::ensure!(self.stall_window_sec > 0, "session.stall_window_sec must be > 0");
        anyhow::ensure!(self.probe_segment_sec > 0, "session.probe_segment_sec must be > 0");
        anyhow::ensure!(
            self.snapshot_timeout_sec > 0 && self.compare_timeout_sec > 0 && self.probe_timeout_sec > 0,
            "session timeouts must be > 0"
        );
        Ok(())
    }
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

fn default_supervisor_interval() -> u64 {
    1000
}

fn default_base_dir() -> String {
    "./data".to_string()
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.session.validate()?;

        let mut names = HashSet::new();
        for cam in &self.cameras {
            anyhow::ensure!(!cam.name.trim().is_empty(), "camera name must not be empty");
            anyhow::ensure!(
                !cam.url.trim().is_empty(),
                "camera [{}] url must not be empty",
                cam.name
            );
            anyhow::ensure!(
                !cam.name.contains(|c: char| c == '/' || c == '\\') && cam.name != ".." && cam.name != ".",
                "camera name [{}] is not a valid directory name",
                cam.name
            );
            anyhow::ensure!(names.insert(cam.name.as_str()), "duplicate camera name [{}]", cam.name);
        }
        Ok(())
    }

    pub fn camera(&self, name: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.name == name)
    }
}
