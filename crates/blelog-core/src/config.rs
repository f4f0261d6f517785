//! 日志缓冲管理器的静态配置。
//!
//! # 设计目的（Why）
//! - 槽位数量、缓冲尺寸与各类时限在初始化后即固定，集中在一个结构里校验，
//!   避免运行期出现“缓冲放不下最小帧”之类只能靠断言发现的问题；
//! - 通过 `serde` 派生支持从宿主配置文件装载，启用 `toml` Feature 时可直接解析 TOML 文本。
//!
//! # 契约说明（What）
//! - 所有字段都有默认值（`#[serde(default)]`），配置文件只需写出要覆盖的项；
//! - [`LogBufferConfig::validate`] 在 [`crate::BleLogManager::init`] 内部自动调用。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    frame::{ChecksumScope, FRAME_OVERHEAD, TIMESTAMP_LEN, frame_len},
    lock::LockKind,
    source::ExecContext,
    stats::STATISTICS_PAYLOAD_LEN,
};

/// 缓冲池与运行时派发器的配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogBufferConfig {
    /// 任务上下文的原子锁槽位数量，可为 0（此时任务写入全部走自旋锁槽位）。
    pub task_atomic_slots: usize,
    /// 中断上下文的原子锁槽位数量。
    pub isr_atomic_slots: usize,
    /// 通用槽位中每块乒乓缓冲的字节容量。
    pub buffer_size: usize,
    /// 是否为链路层任务 / HCI 来源分配专用无锁槽位。
    pub link_layer_dedicated_slots: bool,
    /// 专用槽位中每块缓冲的字节容量。
    pub dedicated_buffer_size: usize,
    /// 兜底槽位的锁纪律；默认自旋锁。
    ///
    /// 只接受 `Spin` 与 `Mutex`；`Mutex` 只作用于任务上下文，中断兜底槽位始终自旋。
    pub fallback_lock: LockKind,
    /// 校验和覆盖范围。
    pub checksum_scope: ChecksumScope,
    /// 是否维护写入 / 丢失的帧与字节计数并周期性发送统计帧。
    pub enhanced_statistics: bool,
    /// 是否在管理周期内发送时间同步帧（需要提供同步输出）。
    pub timestamp_sync: bool,
    /// 管理周期（毫秒）。
    pub housekeeping_interval_ms: u64,
    /// 冲刷 / 拆卸阶段每一步有界等待的上限（毫秒），超时即致命终止。
    pub flush_timeout_ms: u64,
    /// 有界等待的轮询间隔（微秒）。
    pub flush_poll_interval_us: u64,
    /// 派发线程名称。
    pub dispatcher_thread_name: String,
    /// 派发线程栈大小（字节），`None` 使用平台默认值。
    pub dispatcher_stack_size: Option<usize>,
}

impl Default for LogBufferConfig {
    fn default() -> Self {
        Self {
            task_atomic_slots: 2,
            isr_atomic_slots: 1,
            buffer_size: 1024,
            link_layer_dedicated_slots: true,
            dedicated_buffer_size: 1024,
            fallback_lock: LockKind::Spin,
            checksum_scope: ChecksumScope::HeaderOnly,
            enhanced_statistics: true,
            timestamp_sync: false,
            housekeeping_interval_ms: 1000,
            flush_timeout_ms: 1000,
            flush_poll_interval_us: 100,
            dispatcher_thread_name: String::from("blelog-rt"),
            dispatcher_stack_size: None,
        }
    }
}

impl LogBufferConfig {
    /// 单块缓冲可设置的最大容量：负载长度字段为 `u16`。
    pub const MAX_BUFFER_SIZE: usize = u16::MAX as usize + FRAME_OVERHEAD;

    /// 通用缓冲的最小容量：管理周期写入的最大内部帧（统计帧）。
    pub const MIN_BUFFER_SIZE: usize = frame_len(TIMESTAMP_LEN + STATISTICS_PAYLOAD_LEN);

    /// 专用缓冲的最小容量：一个只含时间戳前缀的普通帧。专用槽位只承载链路层来源。
    pub const MIN_DEDICATED_BUFFER_SIZE: usize = FRAME_OVERHEAD + TIMESTAMP_LEN;

    /// 设置通用槽位数量。
    pub fn with_slots(mut self, task_atomic: usize, isr_atomic: usize) -> Self {
        self.task_atomic_slots = task_atomic;
        self.isr_atomic_slots = isr_atomic;
        self
    }

    /// 设置通用缓冲容量。
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// 开关链路层专用槽位并设置其缓冲容量。
    pub fn with_dedicated_slots(mut self, enabled: bool, size: usize) -> Self {
        self.link_layer_dedicated_slots = enabled;
        self.dedicated_buffer_size = size;
        self
    }

    /// 设置兜底槽位的锁纪律。
    pub fn with_fallback_lock(mut self, kind: LockKind) -> Self {
        self.fallback_lock = kind;
        self
    }

    /// 设置校验和覆盖范围。
    pub fn with_checksum_scope(mut self, scope: ChecksumScope) -> Self {
        self.checksum_scope = scope;
        self
    }

    /// 开关增强统计。
    pub fn with_enhanced_statistics(mut self, enabled: bool) -> Self {
        self.enhanced_statistics = enabled;
        self
    }

    /// 开关时间同步帧。
    pub fn with_timestamp_sync(mut self, enabled: bool) -> Self {
        self.timestamp_sync = enabled;
        self
    }

    /// 设置管理周期。
    pub fn with_housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval_ms = interval.as_millis() as u64;
        self
    }

    /// 设置冲刷超时。
    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// 管理周期。
    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }

    /// 有界等待上限。
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// 有界等待的轮询间隔。
    pub fn flush_poll_interval(&self) -> Duration {
        Duration::from_micros(self.flush_poll_interval_us)
    }

    /// `ctx` 上下文兜底槽位实际使用的锁纪律：只有任务上下文会用到 `Mutex`，其余一律自旋。
    pub fn fallback_lock_for(&self, ctx: ExecContext) -> LockKind {
        match (ctx, self.fallback_lock) {
            (ExecContext::Task, LockKind::Mutex) => LockKind::Mutex,
            _ => LockKind::Spin,
        }
    }

    /// 通用槽位总数：原子槽位加上两个上下文各自的兜底槽位。
    pub fn common_slot_count(&self) -> usize {
        self.task_atomic_slots + self.isr_atomic_slots + 2
    }

    /// 专用槽位数量。
    pub fn dedicated_slot_count(&self) -> usize {
        if self.link_layer_dedicated_slots { 2 } else { 0 }
    }

    /// 全部传输缓冲数量（每个槽位一对乒乓缓冲）。
    pub fn buffer_count(&self) -> usize {
        (self.common_slot_count() + self.dedicated_slot_count()) * 2
    }

    /// 校验配置。
    ///
    /// # 契约 (What)
    /// - 通用缓冲至少能容纳内部统计帧，专用缓冲至少能容纳一个带时间戳前缀的空负载帧；
    /// - 每种缓冲不超过长度字段可表达的最大帧；
    /// - 兜底槽位只能是 `Spin` 或 `Mutex`；
    /// - 管理周期、冲刷超时与轮询间隔均大于零。
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_buffer("buffer_size", self.buffer_size, Self::MIN_BUFFER_SIZE)?;
        if self.link_layer_dedicated_slots {
            check_buffer(
                "dedicated_buffer_size",
                self.dedicated_buffer_size,
                Self::MIN_DEDICATED_BUFFER_SIZE,
            )?;
        }
        if matches!(self.fallback_lock, LockKind::None | LockKind::Atomic) {
            return Err(ConfigError::UnsupportedFallbackLock {
                kind: self.fallback_lock,
            });
        }
        if self.housekeeping_interval_ms == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "housekeeping_interval_ms",
            });
        }
        if self.flush_timeout_ms == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "flush_timeout_ms",
            });
        }
        if self.flush_poll_interval_us == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "flush_poll_interval_us",
            });
        }
        Ok(())
    }

    /// 从 TOML 文本解析配置并校验。
    #[cfg(feature = "toml")]
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

fn check_buffer(field: &'static str, value: usize, minimum: usize) -> Result<(), ConfigError> {
    if value < minimum {
        return Err(ConfigError::BufferTooSmall {
            field,
            value,
            minimum,
        });
    }
    if value > LogBufferConfig::MAX_BUFFER_SIZE {
        return Err(ConfigError::BufferTooLarge {
            field,
            value,
            maximum: LogBufferConfig::MAX_BUFFER_SIZE,
        });
    }
    Ok(())
}
