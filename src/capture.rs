//! 视频流采集服务
//!
//! 会话只依赖 [`StreamCapture`]；[`FfmpegCapture`] 以子进程方式驱动 ffmpeg / ffprobe。

use crate::error::{RecorderError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 保留的 stderr 尾部长度
const STDERR_TAIL: usize = 512;

/// 视频流参数
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub pixel_format: String,
    pub codec_name: String,
}

/// 一次采集的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEnd {
    /// 达到指定时长或源流结束
    Finished,
    /// 取消令牌触发
    Cancelled,
}

/// 进度回调，参数为流时间 (微秒)，单次采集内单调不减
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

#[async_trait]
pub trait StreamCapture: Send + Sync {
    /// 读取视频流参数
    async fn probe(&self, url: &str) -> Result<StreamInfo>;

    /// 将视频流写入 `dest`；`duration` 为空时一直录制到取消
    async fn capture_segment(
        &self,
        url: &str,
        dest: &Path,
        duration: Option<Duration>,
        cancel: CancellationToken,
        progress: ProgressFn,
    ) -> Result<CaptureEnd>;

    /// 从视频文件截取最新一帧保存为图片
    async fn snapshot(&self, source: &Path, dest: &Path, resolution: (u32, u32)) -> bool;
}

/// 基于 ffmpeg 命令行的采集实现
pub struct FfmpegCapture {
    ffmpeg: String,
    ffprobe: String,
}

impl FfmpegCapture {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    fn spawn_error(&self, binary: &str, e: std::io::Error) -> RecorderError {
        if e.kind() == std::io::ErrorKind::NotFound {
            // 找不到可执行文件无法通过重试恢复
            RecorderError::validation(format!("binary not found: {}", binary))
        } else {
            RecorderError::capture(format!("failed to spawn {}: {}", binary, e))
        }
    }
}

#[async_trait]
impl StreamCapture for FfmpegCapture {
    async fn probe(&self, url: &str) -> Result<StreamInfo> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "quiet", "-print_format", "json", "-show_streams"])
            .arg(url)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.spawn_error(&self.ffprobe, e))?;

        if !output.status.success() {
            return Err(RecorderError::capture(format!(
                "ffprobe exited with {}: {}",
                output.status,
                tail(&String::from_utf8_lossy(&output.stderr))
            )));
        }

        parse_probe(&String::from_utf8_lossy(&output.stdout))
    }

    async fn capture_segment(
        &self,
        url: &str,
        dest: &Path,
        duration: Option<Duration>,
        cancel: CancellationToken,
        progress: ProgressFn,
    ) -> Result<CaptureEnd> {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-hide_banner", "-nostats", "-loglevel", "error", "-y"]);
        // 使用系统时间戳，忽略流内可能错乱的时间戳
        cmd.args(["-use_wallclock_as_timestamps", "1"]);
        cmd.arg("-i").arg(url);
        // 视频直接复制不转码，音频统一为 AAC
        cmd.args(["-c:v", "copy", "-c:a", "aac"]);
        // 分片 MP4：进程被杀掉时已写入的部分仍然可以播放
        cmd.args(["-movflags", "frag_keyframe+empty_moov+faststart"]);
        cmd.args(["-reset_timestamps", "1"]);
        if let Some(duration) = duration.filter(|d| !d.is_zero()) {
            cmd.arg("-t").arg(format!("{:.3}", duration.as_secs_f64()));
        }
        cmd.args(["-progress", "pipe:1"]);
        cmd.arg(dest);

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| self.spawn_error(&self.ffmpeg, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RecorderError::capture("ffmpeg stdout not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| RecorderError::capture("ffmpeg stderr not captured"))?;

        // 持续读取 stderr，防止管道写满阻塞 ffmpeg
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    stderr_task.abort();
                    return Ok(CaptureEnd::Cancelled);
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(micros) = parse_progress(&line) {
                            progress(micros);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("ffmpeg progress pipe closed: {}", e);
                        break;
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                stderr_task.abort();
                return Ok(CaptureEnd::Cancelled);
            }
            status = child.wait() => status?,
        };

        let stderr = stderr_task.await.unwrap_or_default();
        if status.success() {
            Ok(CaptureEnd::Finished)
        } else {
            Err(RecorderError::capture(format!(
                "ffmpeg exited with {}: {}",
                status,
                tail(&stderr)
            )))
        }
    }

    async fn snapshot(&self, source: &Path, dest: &Path, resolution: (u32, u32)) -> bool {
        // 录制中的文件在不断增长，从尾部取最新的画面
        let output = Command::new(&self.ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-y", "-sseof", "-1"])
            .arg("-i")
            .arg(source)
            .args(["-frames:v", "1", "-update", "1"])
            .arg("-s")
            .arg(format!("{}x{}", resolution.0, resolution.1))
            .arg(dest)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() && dest.exists() => true,
            Ok(out) => {
                debug!(
                    "Snapshot of {:?} failed ({}): {}",
                    source,
                    out.status,
                    tail(&String::from_utf8_lossy(&out.stderr))
                );
                false
            }
            Err(e) => {
                warn!("Failed to spawn {} for snapshot: {}", self.ffmpeg, e);
                false
            }
        }
    }
}

/// 解析 `-progress` 输出中的时间行
///
/// ffmpeg 的 `out_time_ms` 实际单位也是微秒。
fn parse_progress(line: &str) -> Option<u64> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time_us" | "out_time_ms" => value.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    pix_fmt: Option<String>,
    /// 形如 "25/1" 或 "30000/1001"
    r_frame_rate: Option<String>,
}

fn parse_probe(json: &str) -> Result<StreamInfo> {
    let output: ProbeOutput = serde_json::from_str(json)
        .map_err(|e| RecorderError::capture(format!("invalid ffprobe output: {}", e)))?;

    let video = output
        .streams
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| RecorderError::capture("stream has no video track"))?;

    Ok(StreamInfo {
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        frame_rate: video.r_frame_rate.as_deref().map(parse_rate).unwrap_or(0.0),
        pixel_format: video.pix_fmt.unwrap_or_default(),
        codec_name: video.codec_name.unwrap_or_default(),
    })
}

fn parse_rate(rate: &str) -> f64 {
    match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().unwrap_or(0.0);
            let den: f64 = den.parse().unwrap_or(0.0);
            if den > 0.0 {
                num / den
            } else {
                0.0
            }
        }
        None => rate.parse().unwrap_or(0.0),
    }
}

fn tail(text: &str) -> &str {
    let text = text.trim();
    if text.len() <= STDERR_TAIL {
        return text;
    }
    let mut start = text.len() - STDERR_TAIL;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
