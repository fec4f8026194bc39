use super::{BoundingBox, Frame, Verdict};
use crate::error::Result;
use image::{imageops, GrayImage};
use serde::Deserialize;
use std::collections::VecDeque;

/// 形态学结构元素半径 (5x5 矩形)
const KERNEL_RADIUS: usize = 2;

/// 区域算法参数
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegionConfig {
    /// 高斯模糊核大小，越小越精确，越大越抗噪
    pub blur_size: u32,
    /// 二值化阈值，越高越不灵敏
    pub threshold: u8,
    pub dilate_iterations: u32,
    pub erode_iterations: u32,
    /// 最小区域面积 (px²)，越大误报越少
    pub min_area: u32,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            blur_size: 15,
            threshold: 30,
            dilate_iterations: 2,
            erode_iterations: 1,
            min_area: 1000,
        }
    }
}

/// 二值掩码
struct Mask {
    width: usize,
    height: usize,
    bits: Vec<bool>,
}

/// 一个 8 连通区域
#[derive(Debug, Clone, Copy)]
struct Region {
    area: u32,
    bounds: BoundingBox,
}

pub fn evaluate(reference: &Frame, candidate: &Frame, cfg: &RegionConfig) -> Result<Verdict> {
    let a = prepare(reference, cfg.blur_size);
    let b = prepare(candidate, cfg.blur_size);

    let mut mask = threshold_diff(&a, &b, cfg.threshold);
    for _ in 0..cfg.dilate_iterations {
        mask = morph(&mask, true);
    }
    for _ in 0..cfg.erode_iterations {
        mask = morph(&mask, false);
    }

    let largest = regions(&mask).into_iter().max_by_key(|r| r.area);
    Ok(match largest {
        Some(region) if region.area > cfg.min_area => Verdict {
            motion: true,
            score: Some(region.area as f64),
            region: Some(region.bounds),
        },
        Some(region) => Verdict {
            motion: false,
            score: Some(region.area as f64),
            region: None,
        },
        None => Verdict {
            motion: false,
            score: Some(0.0),
            region: None,
        },
    })
}

/// 灰度化并模糊
fn prepare(frame: &Frame, blur_size: u32) -> GrayImage {
    let gray = imageops::grayscale(frame);
    if blur_size <= 1 {
        return gray;
    }
    imageops::blur(&gray, gaussian_sigma(blur_size))
}

/// 由核大小推导标准差 (与 OpenCV 在 sigma=0 时的约定一致)
fn gaussian_sigma(kernel: u32) -> f32 {
    0.3 * ((kernel as f32 - 1.0) * 0.5 - 1.0) + 0.8
}

fn threshold_diff(a: &GrayImage, b: &GrayImage, threshold: u8) -> Mask {
    let bits = a
        .pixels()
        .zip(b.pixels())
        .map(|(p, q)| p[0].abs_diff(q[0]) > threshold)
        .collect();
    Mask {
        width: a.width() as usize,
        height: a.height() as usize,
        bits,
    }
}

/// 5x5 矩形核的膨胀 (`dilate = true`) 或腐蚀，按行列分离计算
///
/// 腐蚀时图像外部视为前景，边界不会被侵蚀。
fn morph(mask: &Mask, dilate: bool) -> Mask {
    let (w, h) = (mask.width, mask.height);
    let pass = |src: &[bool], horizontal: bool| -> Vec<bool> {
        let mut out = vec![false; src.len()];
        for y in 0..h {
            for x in 0..w {
                let (pos, len) = if horizontal { (x, w) } else { (y, h) };
                // 窗口裁剪到图像内，越界部分对两种运算都不起作用
                let lo = pos.saturating_sub(KERNEL_RADIUS);
                let hi = (pos + KERNEL_RADIUS).min(len - 1);
                let mut window = (lo..=hi).map(|i| {
                    if horizontal {
                        src[y * w + i]
                    } else {
                        src[i * w + x]
                    }
                });
                out[y * w + x] = if dilate {
                    window.any(|v| v)
                } else {
                    window.all(|v| v)
                };
            }
        }
        out
    };

    let rows = pass(&mask.bits, true);
    Mask {
        width: w,
        height: h,
        bits: pass(&rows, false),
    }
}

/// 提取所有 8 连通前景区域
fn regions(mask: &Mask) -> Vec<Region> {
    let (w, h) = (mask.width, mask.height);
    let mut seen = vec![false; mask.bits.len()];
    let mut found = Vec::new();
    let mut queue = VecDeque::new();

    for start in 0..mask.bits.len() {
        if !mask.bits[start] || seen[start] {
            continue;
        }
        seen[start] = true;
        queue.push_back(start);

        let (mut min_x, mut min_y, mut max_x, mut max_y) = (w, h, 0, 0);
        let mut area = 0u32;

        while let Some(idx) = queue.pop_front() {
            let (x, y) = (idx % w, idx / w);
            area += 1;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);

            for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                    let n = ny * w + nx;
                    if mask.bits[n] && !seen[n] {
                        seen[n] = true;
                        queue.push_back(n);
                    }
                }
            }
        }

        found.push(Region {
            area,
            bounds: BoundingBox {
                x: min_x as u32,
                y: min_y as u32,
                width: (max_x - min_x + 1) as u32,
                height: (max_y - min_y + 1) as u32,
            },
        });
    }

    found
}
