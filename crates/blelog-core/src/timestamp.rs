//! 时间源与可选的时间同步。
//!
//! # 设计背景（Why）
//! - 普通写入在负载前拼接 4 字节毫秒时间戳，需要一个单调时间源；
//! - 离线工具要把日志流与外部抓包（逻辑分析仪、空口嗅探器）对齐：派发器周期性翻转一根同步输出，
//!   同时采集链路层时钟、高精度定时器与 OS tick 三个读数写成时间同步帧，
//!   分析时以翻转沿为锚点即可换算各时钟域。
//!
//! # 使用方式（How）
//! - 宿主实现 [`TimestampSource`] 与 [`SyncOutput`]，或使用 [`SystemTimestamp`]；
//! - [`TimestampSync::info_update`] 只在派发器的管理路径上调用，不需要跨生产者的重入保护。

use std::{sync::Arc, time::Instant};

use crate::{
    source::InternalCode,
    sync::{AtomicBool, Ordering},
};

/// 时间同步帧负载长度。
pub const TIMESTAMP_SYNC_PAYLOAD_LEN: usize = 2 + 4 * 3;

/// 单调时间源。
pub trait TimestampSource: Send + Sync + 'static {
    /// 普通帧前缀使用的毫秒时间戳，允许在 `u32` 处回绕。
    fn os_millis(&self) -> u32;

    /// 链路层（低层硬件）时钟读数。
    fn low_level_ticks(&self) -> u32;

    /// 高精度定时器读数（微秒）。
    fn hr_timer_us(&self) -> u64;

    /// 操作系统 tick 计数。
    fn os_ticks(&self) -> u32;
}

/// 基于 [`Instant`] 的默认时间源。
///
/// 链路层时钟以微秒计，OS tick 频率可配置（默认 1000 Hz）。
#[derive(Clone, Debug)]
pub struct SystemTimestamp {
    origin: Instant,
    tick_hz: u32,
}

impl SystemTimestamp {
    /// 以当前时刻为零点创建时间源。
    pub fn new() -> Self {
        Self::with_tick_rate(1000)
    }

    /// 指定 OS tick 频率。
    pub fn with_tick_rate(tick_hz: u32) -> Self {
        Self {
            origin: Instant::now(),
            tick_hz: tick_hz.max(1),
        }
    }
}

impl Default for SystemTimestamp {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampSource for SystemTimestamp {
    fn os_millis(&self) -> u32 {
        self.origin.elapsed().as_millis() as u32
    }

    fn low_level_ticks(&self) -> u32 {
        self.origin.elapsed().as_micros() as u32
    }

    fn hr_timer_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    fn os_ticks(&self) -> u32 {
        let elapsed = self.origin.elapsed();
        (elapsed.as_micros() * u128::from(self.tick_hz) / 1_000_000) as u32
    }
}

/// 外部同步输出（通常是一根 GPIO）。
pub trait SyncOutput: Send + Sync + 'static {
    /// 设置输出电平。
    fn set_level(&self, high: bool);
}

/// 一次时间同步采样。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimestampInfo {
    /// 翻转后的输出电平。
    pub io_level: bool,
    pub low_level_ticks: u32,
    pub hr_timer_us: u64,
    pub os_ticks: u32,
}

impl TimestampInfo {
    /// 序列化为时间同步帧负载；高精度定时器截断为低 32 位。
    pub fn to_payload(&self) -> [u8; TIMESTAMP_SYNC_PAYLOAD_LEN] {
        let mut out = [0u8; TIMESTAMP_SYNC_PAYLOAD_LEN];
        out[0] = InternalCode::TimestampSync.code();
        out[1] = u8::from(self.io_level);
        out[2..6].copy_from_slice(&self.low_level_ticks.to_ne_bytes());
        out[6..10].copy_from_slice(&(self.hr_timer_us as u32).to_ne_bytes());
        out[10..14].copy_from_slice(&self.os_ticks.to_ne_bytes());
        out
    }
}

/// 时间同步器。
///
/// - **契约 (What)**：`reset(true)` 把输出拉到低电平并开启同步；`reset(false)` 拉低并关闭；
///   `info_update` 翻转电平后立即采集三路时钟，返回的电平即翻转后的电平。
/// - **权衡 (Trade-offs)**：翻转与采样之间没有硬件级原子性，误差等于两次调用之间的指令延迟，
///   对毫秒级对齐足够。
pub struct TimestampSync {
    output: Arc<dyn SyncOutput>,
    clock: Arc<dyn TimestampSource>,
    enabled: AtomicBool,
    level: AtomicBool,
}

impl TimestampSync {
    /// 绑定同步输出与时间源，初始为关闭状态。
    pub fn new(output: Arc<dyn SyncOutput>, clock: Arc<dyn TimestampSource>) -> Self {
        Self {
            output,
            clock,
            enabled: AtomicBool::new(false),
            level: AtomicBool::new(false),
        }
    }

    /// 复位输出电平并设置开关。
    pub fn reset(&self, enable: bool) {
        self.level.store(false, Ordering::Relaxed);
        self.output.set_level(false);
        self.enabled.store(enable, Ordering::Release);
    }

    /// 是否开启。
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// 翻转输出并采样。
    pub fn info_update(&self) -> TimestampInfo {
        let level = !self.level.load(Ordering::Relaxed);
        self.level.store(level, Ordering::Relaxed);
        self.output.set_level(level);
        TimestampInfo {
            io_level: level,
            low_level_ticks: self.clock.low_level_ticks(),
            hr_timer_us: self.clock.hr_timer_us(),
            os_ticks: self.clock.os_ticks(),
        }
    }
}
