//! 单路相机的录制会话
//!
//! 会话分两个阶段：
//! 1. 监控阶段：反复录制短片段并截图比较，直到第一次检测到运动；
//! 2. 录制阶段：录制循环、运动循环、网络检测循环并发运行，直到会话被取消。
//!
//! 取消分三层：外部注入的全局令牌 → 会话令牌 (全局的子令牌) → 片段令牌 (会话的子令牌，
//! 每次重新开始采集时重建)。取消片段令牌只会让录制循环轮转到新片段，会话继续运行。

use crate::capture::{CaptureEnd, ProgressFn, StreamCapture, StreamInfo};
use crate::config::SessionConfig;
use crate::deadline::{bounded, bounded_value};
use crate::error::{RecorderError, Result};
use crate::motion::{self, MotionStrategy, Verdict};
use crate::policy::{loop_period, FlushDecision, FlushPolicy, ProgressMark, StallWatch};
use crate::state::lock;
use chrono::{DateTime, Local, TimeZone};
use serde::Serialize;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const VIDEO_EXTENSION: &str = "mp4";
// 只能使用 png，bmp 会导致 ffmpeg 不释放图片文件
const IMAGE_EXTENSION: &str = "png";
const RECORD_TIME_FORMAT: &str = "%d.%m.%Y %H-%M-%S";

/// 相机描述，会话创建后不可变
#[derive(Debug, Clone)]
pub struct CameraDescriptor {
    pub name: String,
    pub url: String,
    pub temp_dir: PathBuf,
    pub archive_dir: PathBuf,
}

impl CameraDescriptor {
    /// 在公共根目录下为相机分配 `<temp_root>/<name>` 与 `<records_root>/<name>`
    pub fn under(name: &str, url: &str, temp_root: &Path, records_root: &Path) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            temp_dir: temp_root.join(name),
            archive_dir: records_root.join(name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Idle,
    Monitoring,
    Recording,
    /// 监控阶段等待超时
    TimedOut,
    /// 出现不可恢复的错误
    Failed,
    Stopped,
}

impl SessionPhase {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Idle | Self::Monitoring | Self::Recording)
    }
}

/// 监控阶段的结束状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    MotionSeen,
    TimedOut,
    Cancelled,
}

/// 整个会话的结束状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Stopped,
    TimedOut,
}

/// 三个循环共享的可变状态，只通过 `RecordingSession::state` 的互斥锁访问
#[derive(Debug, Default)]
struct SessionState {
    phase: SessionPhase,
    reference_ready: bool,
    motion_active: bool,
    segment_flushed: bool,
    /// 已开始的采集次数
    generation: u64,
    last_progress: ProgressMark,
    records_flushed: u64,
    last_record: Option<PathBuf>,
}

/// 对外展示的会话状态快照
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub motion_active: bool,
    pub segment_flushed: bool,
    pub records_flushed: u64,
    pub last_record: Option<String>,
}

pub struct RecordingSession {
    camera: CameraDescriptor,
    capture: Arc<dyn StreamCapture>,
    strategy: MotionStrategy,
    settings: SessionConfig,
    /// 会话令牌，全局令牌的子令牌
    scope: CancellationToken,
    /// 当前片段令牌
    segment: Mutex<CancellationToken>,
    state: Arc<Mutex<SessionState>>,
    segment_path: PathBuf,
    reference_path: PathBuf,
    candidate_path: PathBuf,
}

impl RecordingSession {
    /// 校验参数并创建相机目录
    pub async fn open(
        camera: CameraDescriptor,
        capture: Arc<dyn StreamCapture>,
        strategy: MotionStrategy,
        settings: SessionConfig,
        global: &CancellationToken,
    ) -> Result<Self> {
        if camera.name.trim().is_empty() {
            return Err(RecorderError::validation("camera name must not be empty"));
        }
        if camera.url.trim().is_empty() {
            return Err(RecorderError::validation(format!(
                "camera [{}] url must not be empty",
                camera.name
            )));
        }
        if settings.retry_budget == 0
            || settings.confirmation_window_sec == 0
            || settings.stall_window_sec == 0
        {
            return Err(RecorderError::validation(
                "retry budget and detection windows must be positive",
            ));
        }

        tokio::fs::create_dir_all(&camera.temp_dir).await?;
        tokio::fs::create_dir_all(&camera.archive_dir).await?;

        let segment_path = camera
            .temp_dir
            .join(format!("Video_{}.{}", Uuid::new_v4(), VIDEO_EXTENSION));
        let reference_path = camera
            .temp_dir
            .join(format!("Etalon_{}.{}", Uuid::new_v4(), IMAGE_EXTENSION));
        let candidate_path = camera
            .temp_dir
            .join(format!("New_{}.{}", Uuid::new_v4(), IMAGE_EXTENSION));

        let scope = global.child_token();
        let segment = scope.child_token();

        Ok(Self {
            camera,
            capture,
            strategy,
            settings,
            scope,
            segment: Mutex::new(segment),
            state: Arc::new(Mutex::new(SessionState::default())),
            segment_path,
            reference_path,
            candidate_path,
        })
    }

    pub fn camera(&self) -> &CameraDescriptor {
        &self.camera
    }

    pub fn status(&self) -> SessionStatus {
        let state = lock(&self.state);
        SessionStatus {
            phase: state.phase,
            motion_active: state.motion_active,
            segment_flushed: state.segment_flushed,
            records_flushed: state.records_flushed,
            last_record: state
                .last_record
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
        }
    }

    /// 已收到停止请求，循环可能仍在退出中
    pub fn is_stopping(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// 停止本会话，重复调用无副作用
    pub fn stop(&self) {
        self.scope.cancel();
        lock(&self.segment).cancel();
    }

    /// 读取视频流参数 (带超时)
    pub async fn describe_stream(&self) -> Result<StreamInfo> {
        bounded(
            Duration::from_secs(self.settings.probe_timeout_sec),
            self.capture.probe(&self.camera.url),
        )
        .await
    }

    /// 监控阶段 + 录制阶段
    pub async fn run(&self) -> Result<SessionOutcome> {
        match self.describe_stream().await {
            Ok(info) => info!(
                "[{}] Stream: {}x{} @ {:.2} fps, {} ({})",
                self.camera.name,
                info.width,
                info.height,
                info.frame_rate,
                info.codec_name,
                info.pixel_format
            ),
            Err(e) => warn!("[{}] Unable to analyse stream: {}", self.camera.name, e),
        }

        let outcome = match self.monitor(self.settings.monitor_timeout()).await {
            Ok(MonitorOutcome::MotionSeen) => self.record().await.map(|_| SessionOutcome::Stopped),
            Ok(MonitorOutcome::TimedOut) => Ok(SessionOutcome::TimedOut),
            Ok(MonitorOutcome::Cancelled) => Ok(SessionOutcome::Stopped),
            Err(e) => Err(e),
        };

        self.set_phase(match &outcome {
            Ok(SessionOutcome::Stopped) => SessionPhase::Stopped,
            Ok(SessionOutcome::TimedOut) => SessionPhase::TimedOut,
            Err(_) => SessionPhase::Failed,
        });
        outcome
    }

    /// 监控阶段：录制短片段并比较截图，直到检测到运动、超时或被取消
    pub async fn monitor(&self, timeout: Option<Duration>) -> Result<MonitorOutcome> {
        self.set_phase(SessionPhase::Monitoring);
        info!("[{}] Monitoring for motion", self.camera.name);

        let started = Instant::now();
        let mut probes = 0u64;

        loop {
            if self.scope.is_cancelled() {
                return Ok(MonitorOutcome::Cancelled);
            }

            match self.probe_segment().await {
                Ok(CaptureEnd::Finished) => {
                    probes += 1;
                    if let Some(verdict) = self.sample().await {
                        if verdict.motion {
                            info!(
                                "[{}] Motion detected after {} probe segments",
                                self.camera.name, probes
                            );
                            return Ok(MonitorOutcome::MotionSeen);
                        }
                    }
                }
                Ok(CaptureEnd::Cancelled) => return Ok(MonitorOutcome::Cancelled),
                Err(e) if e.is_recoverable() => {
                    warn!("[{}] Probe capture failed: {}", self.camera.name, e);
                    if !self.pause(self.loop_delay()).await {
                        return Ok(MonitorOutcome::Cancelled);
                    }
                }
                Err(e) => return Err(e),
            }

            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    info!(
                        "[{}] No motion within {:?}, giving up",
                        self.camera.name, limit
                    );
                    return Ok(MonitorOutcome::TimedOut);
                }
            }
        }
    }

    /// 录制阶段：三个循环全部退出后返回，录制循环的错误在此时返回
    pub async fn record(&self) -> Result<()> {
        self.set_phase(SessionPhase::Recording);
        info!("[{}] Recording started", self.camera.name);

        let (recording, _, _) = tokio::join!(
            self.recording_loop(),
            self.motion_loop(),
            self.network_loop()
        );

        info!("[{}] Recording stopped", self.camera.name);
        recording
    }

    /// 持续录制到片段文件，片段令牌被取消时立即重新开始
    async fn recording_loop(&self) -> Result<()> {
        while !self.scope.is_cancelled() {
            let segment = self.scope.child_token();
            *lock(&self.segment) = segment.clone();
            let generation = self.next_generation();
            debug!("[{}] Capture #{} started", self.camera.name, generation);

            let result = self
                .capture
                .capture_segment(
                    &self.camera.url,
                    &self.segment_path,
                    None,
                    segment,
                    self.progress_sink(generation),
                )
                .await;

            if self.scope.is_cancelled() {
                break;
            }

            match result {
                Ok(CaptureEnd::Cancelled) => {
                    debug!("[{}] Segment rotated", self.camera.name);
                    continue;
                }
                Ok(CaptureEnd::Finished) => {
                    warn!("[{}] Stream ended, restarting capture", self.camera.name)
                }
                Err(e) if e.is_recoverable() => {
                    warn!("[{}] Capture failed: {}", self.camera.name, e)
                }
                Err(e) => {
                    error!("[{}] Capture cannot continue: {}", self.camera.name, e);
                    self.scope.cancel();
                    return Err(e);
                }
            }

            if !self.pause(self.loop_delay()).await {
                break;
            }
        }

        debug!("[{}] Recording loop exited", self.camera.name);
        Ok(())
    }

    /// 周期性比较截图，连续无运动达到上限时落盘并轮转片段
    async fn motion_loop(&self) {
        let budget = self.settings.retry_budget;
        let period = loop_period(
            Duration::from_secs(self.settings.confirmation_window_sec),
            budget,
        );
        let mut policy = FlushPolicy::new(budget);
        // 区间时间 = 录制开始时的墙钟 + 单调时钟经过的时间
        let anchor = (Local::now(), Instant::now());
        let wall_now = || {
            let elapsed = chrono::Duration::from_std(anchor.1.elapsed())
                .unwrap_or_else(|_| chrono::Duration::zero());
            anchor.0 + elapsed
        };
        let mut interval_start = wall_now();

        while !self.scope.is_cancelled() {
            self.sample().await;

            let (flushed, motion) = {
                let state = lock(&self.state);
                (state.segment_flushed, state.motion_active)
            };

            match policy.observe(flushed, motion) {
                FlushDecision::Flush => match self.flush(interval_start, wall_now()).await {
                    Ok(path) => {
                        policy.flushed();
                        {
                            let mut state = lock(&self.state);
                            state.segment_flushed = true;
                            state.reference_ready = false;
                            state.records_flushed += 1;
                            state.last_record = Some(path.clone());
                        }
                        info!("[{}] Segment saved: {:?}", self.camera.name, path);
                        self.rotate_segment();
                    }
                    Err(e) => warn!(
                        "[{}] Failed to save segment, retrying next round: {}",
                        self.camera.name, e
                    ),
                },
                FlushDecision::NewInterval => {
                    lock(&self.state).segment_flushed = false;
                    interval_start = wall_now();
                    info!("[{}] Motion resumed, new recording interval", self.camera.name);
                }
                FlushDecision::Hold => debug!(
                    "[{}] No motion ({}/{})",
                    self.camera.name,
                    policy.misses(),
                    budget
                ),
                FlushDecision::Reset => {}
            }

            if !self.pause(period).await {
                break;
            }
        }

        debug!("[{}] Motion loop exited", self.camera.name);
    }

    /// 进度长时间不前进时视为网络卡死，轮转片段以重新连接
    async fn network_loop(&self) {
        let budget = self.settings.retry_budget;
        let period = loop_period(Duration::from_secs(self.settings.stall_window_sec), budget);
        let mut watch = StallWatch::new(budget, lock(&self.state).last_progress);

        while !self.scope.is_cancelled() {
            let latest = lock(&self.state).last_progress;
            if watch.observe(latest) {
                warn!(
                    "[{}] Network stall detected, restarting capture",
                    self.camera.name
                );
                self.rotate_segment();
            }

            if !self.pause(period).await {
                break;
            }
        }

        debug!("[{}] Network loop exited", self.camera.name);
    }

    /// 录制一个定长探测片段
    async fn probe_segment(&self) -> Result<CaptureEnd> {
        let duration = Duration::from_secs(self.settings.probe_segment_sec);
        let deadline = duration + Duration::from_secs(self.settings.capture_grace_sec);
        let cancel = self.scope.child_token();
        let generation = self.next_generation();

        let result = bounded(
            deadline,
            self.capture.capture_segment(
                &self.camera.url,
                &self.segment_path,
                Some(duration),
                cancel.clone(),
                self.progress_sink(generation),
            ),
        )
        .await;

        // 超时被放弃的采集通过关联令牌收尾
        cancel.cancel();
        result
    }

    /// 没有参考帧时截取参考帧并返回 `None`；否则截取候选帧并比较
    async fn sample(&self) -> Option<Verdict> {
        let reference_ready = lock(&self.state).reference_ready;
        if !reference_ready {
            let ready = self.snapshot(&self.reference_path).await;
            lock(&self.state).reference_ready = ready;
            if ready {
                debug!("[{}] Reference frame captured", self.camera.name);
            }
            return None;
        }

        if !self.snapshot(&self.candidate_path).await {
            return None;
        }

        let verdict = self.compare().await;
        if verdict.motion {
            // 候选帧成为新的参考帧
            if let Err(e) = tokio::fs::rename(&self.candidate_path, &self.reference_path).await {
                warn!("[{}] Failed to replace reference frame: {}", self.camera.name, e);
            }
        }
        lock(&self.state).motion_active = verdict.motion;
        Some(verdict)
    }

    async fn snapshot(&self, dest: &Path) -> bool {
        let resolution = (self.settings.snapshot_width, self.settings.snapshot_height);
        let result = bounded_value(
            Duration::from_secs(self.settings.snapshot_timeout_sec),
            self.capture.snapshot(&self.segment_path, dest, resolution),
        )
        .await;

        match result {
            Ok(true) => true,
            Ok(false) => {
                // 片段文件可能正被写入，下一轮再试
                debug!("[{}] Snapshot not available", self.camera.name);
                false
            }
            Err(e) => {
                warn!("[{}] Snapshot failed: {}", self.camera.name, e);
                false
            }
        }
    }

    /// 在阻塞线程池中比较两帧，任何失败都视为无运动
    async fn compare(&self) -> Verdict {
        let camera = self.camera.name.clone();
        let reference = self.reference_path.clone();
        let candidate = self.candidate_path.clone();
        let strategy = self.strategy.clone();

        let job = tokio::task::spawn_blocking(move || {
            motion::compare_files(&camera, &reference, &candidate, &strategy)
        });

        match bounded_value(Duration::from_secs(self.settings.compare_timeout_sec), job).await {
            Ok(Ok(Ok(verdict))) => verdict,
            Ok(Ok(Err(e))) => {
                warn!("[{}] Failed to compare frames: {}", self.camera.name, e);
                Verdict::still()
            }
            Ok(Err(e)) => {
                error!("[{}] Frame comparison task failed: {}", self.camera.name, e);
                Verdict::still()
            }
            Err(e) => {
                warn!("[{}] Frame comparison abandoned: {}", self.camera.name, e);
                Verdict::still()
            }
        }
    }

    /// 将当前片段复制到归档目录，已有的归档文件不会被覆盖
    async fn flush(&self, start: DateTime<Local>, end: DateTime<Local>) -> Result<PathBuf> {
        let name = record_file_name(&start, &end);
        let dest = unique_record_path(&self.camera.archive_dir, &name).await?;
        if !dest.ends_with(&name) {
            warn!(
                "[{}] Record {} already exists, saving as {:?}",
                self.camera.name, name, dest
            );
        }
        tokio::fs::copy(&self.segment_path, &dest).await?;
        Ok(dest)
    }

    fn rotate_segment(&self) {
        lock(&self.segment).cancel();
    }

    fn next_generation(&self) -> u64 {
        let mut state = lock(&self.state);
        state.generation += 1;
        state.generation
    }

    fn progress_sink(&self, generation: u64) -> ProgressFn {
        let state = Arc::clone(&self.state);
        Arc::new(move |micros: u64| {
            let mark = ProgressMark { generation, micros };
            let mut state = lock(&state);
            if mark > state.last_progress {
                state.last_progress = mark;
            }
        })
    }

    fn set_phase(&self, phase: SessionPhase) {
        lock(&self.state).phase = phase;
    }

    fn loop_delay(&self) -> Duration {
        Duration::from_secs(self.settings.loop_delay_sec)
    }

    /// 可被取消的等待，返回 `false` 表示会话已取消
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.scope.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// 归档文件名：`[开始时间]_[结束时间].mp4`
pub fn record_file_name<Tz>(start: &DateTime<Tz>, end: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    format!(
        "[{}]_[{}].{}",
        start.format(RECORD_TIME_FORMAT),
        end.format(RECORD_TIME_FORMAT),
        VIDEO_EXTENSION
    )
}

/// 在 `dir` 下为 `name` 找一个尚未存在的路径，重名时追加 ` (n)`
async fn unique_record_path(dir: &Path, name: &str) -> Result<PathBuf> {
    let first = dir.join(name);
    if !tokio::fs::try_exists(&first).await? {
        return Ok(first);
    }

    let (stem, ext) = name.rsplit_once('.').unwrap_or((name, ""));
    let mut n = 1u32;
    loop {
        let candidate = if ext.is_empty() {
            dir.join(format!("{} ({})", stem, n))
        } else {
            dir.join(format!("{} ({}).{}", stem, n, ext))
        };
        if !tokio::fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::fake::FakeCapture;
    use crate::motion::testing::{solid, with_rect};
    use crate::motion::{Frame, PixelConfig};
    use chrono::Utc;

    const URL: &str = "rtsp://10.0.0.10/stream1";

    fn still() -> Frame {
        solid(32, 32, 0)
    }

    fn moved() -> Frame {
        with_rect(solid(32, 32, 0), 0, 0, 16, 16, 255)
    }

    async fn open(dir: &Path, capture: Arc<FakeCapture>, global: &CancellationToken) -> RecordingSession {
        let camera = CameraDescriptor::under("cam", URL, &dir.join("Temp"), &dir.join("Records"));
        RecordingSession::open(
            camera,
            capture,
            MotionStrategy::Pixel(PixelConfig::default()),
            SessionConfig::default(),
            global,
        )
        .await
        .unwrap()
    }

    fn records(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir.join("Records").join("cam"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn record_names_cover_the_interval() {
        let start = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 5, 7, 12, 0).unwrap();
        assert_eq!(
            record_file_name(&start, &end),
            "[05.03.2024 07-08-09]_[05.03.2024 07-12-00].mp4"
        );
    }

    #[tokio::test]
    async fn open_rejects_empty_fields() {
        let dir = tempfile::tempdir().unwrap();
        let global = CancellationToken::new();
        for (name, url) in [("", URL), ("cam", " ")] {
            let camera = CameraDescriptor::under(name, url, dir.path(), dir.path());
            let result = RecordingSession::open(
                camera,
                Arc::new(FakeCapture::new()),
                MotionStrategy::default(),
                SessionConfig::default(),
                &global,
            )
            .await;
            assert!(matches!(result, Err(RecorderError::Validation(_))));
        }
    }

    #[tokio::test]
    async fn open_creates_camera_directories() {
        let dir = tempfile::tempdir().unwrap();
        let session = open(dir.path(), Arc::new(FakeCapture::new()), &CancellationToken::new()).await;
        assert!(session.camera().temp_dir.is_dir());
        assert!(session.camera().archive_dir.is_dir());
        assert_eq!(session.status().phase, SessionPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn monitoring_succeeds_on_first_moving_candidate() {
        for n in 1..=4 {
            let dir = tempfile::tempdir().unwrap();
            let mut frames = vec![still(); n];
            frames.push(moved());
            let capture = Arc::new(FakeCapture::new().with_frames("cam", frames));
            let session = open(dir.path(), capture.clone(), &CancellationToken::new()).await;

            let outcome = session.monitor(None).await.unwrap();
            assert_eq!(outcome, MonitorOutcome::MotionSeen);
            // 第一次探测建立参考帧，之后第 n 个候选帧触发运动
            assert_eq!(capture.probes(URL), n + 1);
            assert!(lock(&session.state).reference_ready);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn monitoring_times_out_without_motion() {
        let dir = tempfile::tempdir().unwrap();
        let capture = Arc::new(FakeCapture::new().with_frames("cam", vec![still()]));
        let session = open(dir.path(), capture.clone(), &CancellationToken::new()).await;

        let outcome = session.monitor(Some(Duration::from_secs(60))).await.unwrap();
        assert_eq!(outcome, MonitorOutcome::TimedOut);
        assert_eq!(capture.probes(URL), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn monitoring_backs_off_after_capture_failures() {
        let dir = tempfile::tempdir().unwrap();
        let capture = Arc::new(
            FakeCapture::new()
                .with_frames("cam", vec![still(), moved()])
                .with_failing_probes(URL, 2),
        );
        let session = open(dir.path(), capture.clone(), &CancellationToken::new()).await;

        let started = Instant::now();
        let outcome = session.monitor(None).await.unwrap();
        assert_eq!(outcome, MonitorOutcome::MotionSeen);
        assert_eq!(capture.probes(URL), 4);
        // 两次 5 秒退避 + 两个 10 秒片段
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn monitoring_stops_on_global_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let capture = Arc::new(FakeCapture::new());
        let global = CancellationToken::new();
        let session = open(dir.path(), capture.clone(), &global).await;

        global.cancel();
        assert_eq!(session.monitor(None).await.unwrap(), MonitorOutcome::Cancelled);
        assert_eq!(capture.probes(URL), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_capture_error_ends_monitoring() {
        let dir = tempfile::tempdir().unwrap();
        let capture = Arc::new(FakeCapture::new().fatal(URL));
        let session = open(dir.path(), capture, &CancellationToken::new()).await;

        assert!(matches!(session.run().await, Err(RecorderError::Validation(_))));
        assert_eq!(session.status().phase, SessionPhase::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_once_after_budget_still_rounds() {
        let dir = tempfile::tempdir().unwrap();
        let capture = Arc::new(FakeCapture::new().with_frames("cam", vec![still(), moved()]));
        let session = Arc::new(open(dir.path(), capture.clone(), &CancellationToken::new()).await);

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.run().await }
        });

        // 监控阶段 20 秒，之后每 5 秒比较一次，第 3 次无运动时落盘
        tokio::time::sleep(Duration::from_secs(100)).await;

        assert_eq!(records(dir.path()).len(), 1);
        assert_eq!(capture.cancelled_segments(URL), 1);
        assert_eq!(capture.segments(URL), 2);

        let status = session.status();
        assert_eq!(status.phase, SessionPhase::Recording);
        assert_eq!(status.records_flushed, 1);
        assert!(status.segment_flushed);

        session.stop();
        assert_eq!(task.await.unwrap().unwrap(), SessionOutcome::Stopped);
        assert_eq!(session.status().phase, SessionPhase::Stopped);
        assert_eq!(records(dir.path()).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_again_after_motion_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let mut frames = vec![still()];
        frames.extend(std::iter::repeat_with(moved).take(5));
        frames.extend(std::iter::repeat_with(still).take(50));
        let capture = Arc::new(FakeCapture::new().with_frames("cam", frames));
        let session = Arc::new(open(dir.path(), capture.clone(), &CancellationToken::new()).await);

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.run().await }
        });

        // 第 30 秒第一次落盘，第 40 秒画面变化开始新区间，第 55 秒第二次落盘
        tokio::time::sleep(Duration::from_secs(200)).await;

        let status = session.status();
        assert_eq!(status.records_flushed, 2);
        assert!(status.segment_flushed);
        assert_eq!(capture.cancelled_segments(URL), 2);
        assert_eq!(capture.segments(URL), 3);

        // 两个区间的文件名不同，第一份归档没有被覆盖
        let mut names = records(dir.path());
        names.sort();
        assert_eq!(names.len(), 2);
        assert_ne!(names[0], names[1]);

        session.stop();
        task.await.unwrap().unwrap();
        assert_eq!(session.status().records_flushed, 2);
    }

    #[tokio::test]
    async fn existing_records_are_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let name = "[05.03.2024 07-08-09]_[05.03.2024 07-12-00].mp4";

        let first = unique_record_path(dir.path(), name).await.unwrap();
        assert_eq!(first, dir.path().join(name));
        std::fs::write(&first, b"first").unwrap();

        let second = unique_record_path(dir.path(), name).await.unwrap();
        assert_eq!(
            second,
            dir.path().join("[05.03.2024 07-08-09]_[05.03.2024 07-12-00] (1).mp4")
        );
        std::fs::write(&second, b"second").unwrap();

        let third = unique_record_path(dir.path(), name).await.unwrap();
        assert!(third.ends_with("[05.03.2024 07-08-09]_[05.03.2024 07-12-00] (2).mp4"));
        assert_eq!(std::fs::read(&first).unwrap(), b"first");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stream_rotates_segment() {
        let dir = tempfile::tempdir().unwrap();
        // 画面不断变化，运动循环不会落盘
        let frames = (0..200).map(|i| if i % 2 == 0 { still() } else { moved() }).collect();
        let capture = Arc::new(FakeCapture::new().with_frames("cam", frames).stalled(URL));
        let session = Arc::new(open(dir.path(), capture.clone(), &CancellationToken::new()).await);

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.run().await }
        });

        // 录制阶段从第 20 秒开始，网络循环每 20 秒检查一次，第 3 次未前进时重启采集
        tokio::time::sleep(Duration::from_secs(70)).await;

        assert_eq!(capture.cancelled_segments(URL), 1);
        assert_eq!(capture.segments(URL), 2);
        assert!(records(dir.path()).is_empty());
        assert!(session.status().motion_active);

        session.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn live_stream_is_not_treated_as_stalled() {
        let dir = tempfile::tempdir().unwrap();
        let frames = (0..200).map(|i| if i % 2 == 0 { still() } else { moved() }).collect();
        let capture = Arc::new(FakeCapture::new().with_frames("cam", frames));
        let session = Arc::new(open(dir.path(), capture.clone(), &CancellationToken::new()).await);

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.run().await }
        });

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(capture.segments(URL), 1);
        assert_eq!(capture.cancelled_segments(URL), 0);

        session.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let session = open(dir.path(), Arc::new(FakeCapture::new()), &CancellationToken::new()).await;
        assert!(!session.is_stopping());
        session.stop();
        session.stop();
        assert!(session.is_stopping());
        assert_eq!(session.run().await.unwrap(), SessionOutcome::Stopped);
        session.stop();
        assert_eq!(session.status().phase, SessionPhase::Stopped);
    }
}
