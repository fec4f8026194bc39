use super::{Frame, Verdict};
use crate::error::{RecorderError, Result};
use serde::Deserialize;

/// 像素采样算法参数
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PixelConfig {
    /// 采样步长 (每 N 个像素取一个，两个方向相同)
    pub step: i32,
    /// 灵敏度阈值: 0.01 适合小目标，0.025 适合大目标
    ///
    /// 得分大于或等于该值即判定为运动 (含等号)
    pub sensitivity: f64,
}

impl Default for PixelConfig {
    fn default() -> Self {
        Self {
            step: 2,
            sensitivity: 0.01,
        }
    }
}

pub fn evaluate(reference: &Frame, candidate: &Frame, cfg: &PixelConfig) -> Result<Verdict> {
    let score = round3(difference(reference, candidate, cfg.step)?);
    Ok(Verdict {
        motion: score >= cfg.sensitivity,
        score: Some(score),
        region: None,
    })
}

/// 按步长比较两帧，返回 [0, 1] 区间的平均通道差
///
/// 0 表示完全相同。一个像素都没有采样到时返回 0。
pub fn difference(reference: &Frame, candidate: &Frame, step: i32) -> Result<f64> {
    if reference.dimensions() != candidate.dimensions() {
        return Err(RecorderError::ShapeMismatch {
            left: reference.dimensions(),
            right: candidate.dimensions(),
        });
    }
    if step <= 0 {
        return Err(RecorderError::validation(format!(
            "sampling step must be positive, got {}",
            step
        )));
    }

    let (width, height) = reference.dimensions();
    let step = step as usize;
    let mut total = 0f64;
    let mut sampled = 0u64;

    for y in (0..height).step_by(step) {
        for x in (0..width).step_by(step) {
            let a = reference.get_pixel(x, y);
            let b = candidate.get_pixel(x, y);
            for channel in 0..3 {
                total += a[channel].abs_diff(b[channel]) as f64 / 255.0;
            }
            sampled += 1;
        }
    }

    if sampled == 0 {
        return Ok(0.0);
    }
    Ok(total / (sampled as f64 * 3.0))
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
