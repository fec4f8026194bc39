use std::time::Duration;

/// 录制核心的错误分类
///
/// 取消不属于错误：循环在令牌触发时直接返回，采集以 `CaptureEnd::Cancelled` 结束。
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    /// 参数或目录校验失败，构造阶段直接返回给调用方
    #[error("validation failed: {0}")]
    Validation(String),

    /// 探测 / 录制 / 截图失败，循环内记录日志后退避重试
    #[error("capture failed: {0}")]
    Capture(String),

    /// 外部调用超过截止时间
    #[error("operation timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("frame size mismatch: {left:?} vs {right:?}")]
    ShapeMismatch { left: (u32, u32), right: (u32, u32) },

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RecorderError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn capture(msg: impl Into<String>) -> Self {
        Self::Capture(msg.into())
    }

    /// 循环内可恢复的错误 (记录日志 + 退避)
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Capture(_) | Self::Timeout { .. } | Self::Io(_))
    }
}

pub type Result<T, E = RecorderError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_and_timeout_are_recoverable() {
        assert!(RecorderError::capture("rtsp reset").is_recoverable());
        assert!(RecorderError::Timeout {
            after: Duration::from_secs(7)
        }
        .is_recoverable());
        assert!(!RecorderError::validation("empty name").is_recoverable());
    }
}
