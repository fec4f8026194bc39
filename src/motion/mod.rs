//! 运动检测
//!
//! 两种可互换的比较算法，通过 [`MotionStrategy`] 选择，统一由 [`evaluate`] 调度。

pub mod pixel;
pub mod region;

use crate::error::{RecorderError, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

pub use pixel::PixelConfig;
pub use region::RegionConfig;

/// 一帧静态画面 (RGB8)
pub type Frame = RgbImage;

/// 运动区域的外接矩形
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    /// 判断 `other` 是否完全落在本矩形内
    pub fn contains(&self, other: &BoundingBox) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.x + other.width <= self.x + self.width
            && other.y + other.height <= self.y + self.height
    }
}

/// 一次比较的结果
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub motion: bool,
    /// 像素采样得分 (仅像素算法)
    pub score: Option<f64>,
    /// 最大运动区域 (仅区域算法，且检测到运动时)
    pub region: Option<BoundingBox>,
}

impl Verdict {
    pub fn still() -> Self {
        Self {
            motion: false,
            score: None,
            region: None,
        }
    }
}

/// 检测算法，同一时刻只有一种生效
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum MotionStrategy {
    /// 按固定步长采样像素，计算平均通道差
    Pixel(PixelConfig),
    /// 模糊 + 二值化 + 形态学 + 连通区域面积
    Region(RegionConfig),
}

impl Default for MotionStrategy {
    fn default() -> Self {
        Self::Region(RegionConfig::default())
    }
}

impl MotionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pixel(_) => "pixel",
            Self::Region(_) => "region",
        }
    }
}

/// 比较两帧，尺寸不一致时返回 `ShapeMismatch`
pub fn evaluate(reference: &Frame, candidate: &Frame, strategy: &MotionStrategy) -> Result<Verdict> {
    if reference.dimensions() != candidate.dimensions() {
        return Err(RecorderError::ShapeMismatch {
            left: reference.dimensions(),
            right: candidate.dimensions(),
        });
    }

    match strategy {
        MotionStrategy::Pixel(cfg) => pixel::evaluate(reference, candidate, cfg),
        MotionStrategy::Region(cfg) => region::evaluate(reference, candidate, cfg),
    }
}

/// 会话使用的入口：任何内部错误都视为"无运动"，不会中断会话
pub fn detect(camera: &str, reference: &Frame, candidate: &Frame, strategy: &MotionStrategy) -> Verdict {
    match evaluate(reference, candidate, strategy) {
        Ok(verdict) => {
            debug!(
                "[{}] {} motion detector: {} (score: {:?}, region: {:?})",
                camera,
                strategy.name(),
                if verdict.motion { "motion" } else { "no motion" },
                verdict.score,
                verdict.region
            );
            verdict
        }
        Err(e) => {
            warn!("[{}] Motion evaluation failed, assuming no motion: {}", camera, e);
            Verdict::still()
        }
    }
}

/// 从磁盘读取截图并转换为 RGB8
pub fn load_frame(path: &Path) -> Result<Frame> {
    Ok(image::open(path)?.to_rgb8())
}

/// 读取参考帧与候选帧文件并比较 (阻塞，需在 blocking 线程池中调用)
pub fn compare_files(
    camera: &str,
    reference: &Path,
    candidate: &Path,
    strategy: &MotionStrategy,
) -> Result<Verdict> {
    let reference = load_frame(reference)?;
    let candidate = load_frame(candidate)?;
    Ok(detect(camera, &reference, &candidate, strategy))
}
