//! 录制阶段的两条判定规则：何时落盘当前片段，何时判定网络卡死。
//!
//! 两者都只依赖调用方传入的观测值，本身不做 IO。

use std::time::Duration;

/// 计算循环周期：窗口时长按重试次数均分，向上取整到秒
///
/// 例如 15 秒确认窗口、3 次重试 → 5 秒。
pub fn loop_period(window: Duration, budget: u32) -> Duration {
    let secs = window.as_secs();
    let budget = u64::from(budget.max(1));
    Duration::from_secs(secs.div_ceil(budget))
}

/// 片段落盘规则的输出
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDecision {
    /// 未落盘且无运动，继续计数
    Hold,
    /// 连续无运动次数已达上限，落盘并轮转片段
    Flush,
    /// 已落盘后再次出现运动，开始新的录制区间
    NewInterval,
    /// 其它情况，仅清零计数
    Reset,
}

/// 运动循环的落盘计数器
#[derive(Debug)]
pub struct FlushPolicy {
    budget: u32,
    misses: u32,
}

impl FlushPolicy {
    pub fn new(budget: u32) -> Self {
        Self { budget, misses: 0 }
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }

    /// 根据当前是否已落盘、是否有运动给出下一步动作
    ///
    /// 返回 `Flush` 后计数保持在上限，直到调用 [`FlushPolicy::flushed`]；
    /// 落盘失败时下一轮会再次返回 `Flush`。
    pub fn observe(&mut self, flushed: bool, motion: bool) -> FlushDecision {
        match (flushed, motion) {
            (false, false) => {
                self.misses = (self.misses + 1).min(self.budget);
                if self.misses >= self.budget {
                    FlushDecision::Flush
                } else {
                    FlushDecision::Hold
                }
            }
            (true, true) => {
                self.misses = 0;
                FlushDecision::NewInterval
            }
            _ => {
                self.misses = 0;
                FlushDecision::Reset
            }
        }
    }

    /// 落盘成功
    pub fn flushed(&mut self) {
        self.misses = 0;
    }
}

/// 录制进度标记
///
/// `generation` 在每次重新开始采集时递增，`micros` 为该次采集内的流时间。
/// 按字典序比较，因此跨越重启仍然单调不减。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProgressMark {
    pub generation: u64,
    pub micros: u64,
}

/// 网络卡死检测
#[derive(Debug)]
pub struct StallWatch {
    budget: u32,
    misses: u32,
    baseline: ProgressMark,
}

impl StallWatch {
    pub fn new(budget: u32, baseline: ProgressMark) -> Self {
        Self {
            budget,
            misses: 0,
            baseline,
        }
    }

    /// 返回 `true` 表示进度已连续 `budget` 次未前进，应重启采集
    pub fn observe(&mut self, latest: ProgressMark) -> bool {
        if latest == self.baseline {
            self.misses += 1;
            if self.misses >= self.budget {
                self.misses = 0;
                return true;
            }
        } else {
            self.misses = 0;
            self.baseline = latest;
        }
        false
    }
}
