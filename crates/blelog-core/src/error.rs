//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义初始化、配置、传输与帧编码路径上的错误语义；
//! - 热路径上的拥塞（槽位或缓冲不可用）**不**在这里建模：它是预期行为，
//!   只体现为统计中的丢帧计数，写接口返回 `false`。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，可直接 `?` 传播并兼容 `std::error::Error`；
//! - 拆卸超时属于不可恢复错误，不在此处返回，而是由 [`fatal_teardown_timeout`] 直接终止。

use std::time::Duration;

use thiserror::Error;

use crate::lock::LockKind;

/// 子系统对外暴露的顶层错误。
#[derive(Debug, Error)]
pub enum BleLogError {
    /// 配置未通过校验。
    #[error("invalid log buffer configuration: {0}")]
    Config(#[from] ConfigError),

    /// 外设传输初始化或缓冲分配失败。
    #[error("peripheral transport failure: {0}")]
    Transport(#[from] TransportError),

    /// 无法启动运行时派发线程。
    #[error("failed to spawn runtime dispatcher thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// 配置校验失败的具体原因。
///
/// - **意图 (Why)**：在初始化阶段就拒绝不可能工作的组合，
///   避免运行期才发现缓冲连一个最小帧都放不下。
/// - **契约 (What)**：每个变体携带出错字段名与取值，便于直接写入日志。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// 缓冲容量不足以容纳一个最小帧。
    #[error("`{field}` = {value} cannot hold a single frame (minimum {minimum} bytes)")]
    BufferTooSmall {
        field: &'static str,
        value: usize,
        minimum: usize,
    },

    /// 缓冲容量超过帧长度字段可表示的范围。
    #[error("`{field}` = {value} exceeds the largest encodable frame ({maximum} bytes)")]
    BufferTooLarge {
        field: &'static str,
        value: usize,
        maximum: usize,
    },

    /// 兜底槽位只接受自旋锁或互斥锁；无锁变体会让多个持有者同时写同一对缓冲。
    #[error("`fallback_lock` = {kind:?} is not supported, fallback slots need `Spin` or `Mutex`")]
    UnsupportedFallbackLock { kind: LockKind },

    /// 时间参数必须为正。
    #[error("`{field}` must be greater than zero")]
    ZeroDuration { field: &'static str },

    /// 启用了时间同步却没有提供同步输出。
    #[error("timestamp sync is enabled but no sync output was supplied")]
    MissingSyncOutput,

    /// TOML 文本解析失败。
    #[cfg(feature = "toml")]
    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// 外设传输契约的失败语义。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// 传输尚未初始化或已经拆卸。
    #[error("transport is not initialized")]
    NotInitialized,

    /// 传输暂时无法接收新的发送请求。
    #[error("transport is busy")]
    Busy,

    /// 传输分配的缓冲小于请求容量。
    #[error("transport allocated {actual} bytes, {requested} requested")]
    ShortAllocation { requested: usize, actual: usize },

    /// 底层总线报告的错误。
    #[error("bus error: {0}")]
    Bus(String),
}

/// 帧编码失败。
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// 剩余空间不足以容纳整帧。
    #[error("frame needs {needed} bytes but only {available} are free")]
    InsufficientSpace { needed: usize, available: usize },

    /// 负载长度超过 `u16` 长度字段。
    #[error("payload of {len} bytes exceeds the 16-bit length field")]
    PayloadTooLong { len: usize },
}

/// 拆卸阶段的有界等待超时：继续执行可能在缓冲仍被硬件读取时释放它，只能终止。
#[cold]
#[track_caller]
pub(crate) fn fatal_teardown_timeout(stage: &'static str, waited: Duration) -> ! {
    tracing::error!(stage, waited_ms = waited.as_millis() as u64, "blelog teardown wait timed out");
    panic!("blelog teardown timed out while waiting for {stage} after {waited:?}");
}
