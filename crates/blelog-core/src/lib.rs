#![deny(unsafe_code)]

//! `blelog-core`：BLE 日志子系统的缓冲管理、槽位获取与运行时派发核心。
//!
//! # 模块定位（Why）
//! - 链路层、主机协议栈与 HCI 在任务和中断上下文中并发产生日志，而可用内存只够一小组固定缓冲；
//!   核心负责让这些生产者以近乎无锁的方式把帧追加进缓冲，并由单一后台消费者把写满的缓冲交给
//!   异步完成的外设总线（UART-DMA、SPI-DMA 等）。
//! - 拥塞从不向调用方升级：获取失败只记为丢帧，写接口返回 `false`。
//!
//! # 设计概要（How）
//! - [`frame`]：`header | payload | tail` 的最小线上格式；
//! - [`stats`]：按来源的序列号与写入 / 丢失计数；
//! - [`lock`] + [`buffer`] + [`pool`]：带锁纪律的乒乓缓冲槽位与获取策略；
//! - [`runtime`]：唯一的派发线程与周期性管理帧；
//! - [`transport`]：外设传输契约，缓冲经 [`buffer::TransportLease`] 在核心与驱动之间转移所有权；
//! - [`timestamp`]：时间源与可选的外部时间同步；
//! - [`manager`]：组合根 [`BleLogManager`]，对外提供 `init / write / flush / deinit` 等控制面。
//!
//! # 使用示例
//! ```
//! use std::sync::Arc;
//! use blelog_core::{BleLogManager, ExecContext, LogBufferConfig, LogSource};
//! use blelog_core::test_stubs::transport::RecordingTransport;
//!
//! let transport = RecordingTransport::shared();
//! let mut manager = BleLogManager::new(LogBufferConfig::default(), transport.clone());
//! manager.init().expect("default configuration is valid");
//! assert!(manager.write(LogSource::Host, ExecContext::Task, b"hello"));
//! manager.flush();
//! assert!(!transport.sent_bytes().is_empty());
//! manager.deinit();
//! ```

mod sync;

pub mod buffer;
pub mod config;
pub mod console;
pub mod error;
pub mod frame;
pub mod lock;
pub mod manager;
pub mod pool;
pub mod runtime;
pub mod source;
pub mod stats;
pub mod test_stubs;
pub mod timestamp;
pub mod transport;

pub use buffer::{BufferOwnership, TransportBuffer, TransportLease};
pub use config::LogBufferConfig;
pub use console::{ConsoleSink, TracingConsole};
pub use error::{BleLogError, ConfigError, FrameError, TransportError};
pub use frame::{ChecksumScope, FRAME_OVERHEAD, FrameHeader};
pub use lock::LockKind;
pub use manager::BleLogManager;
pub use pool::{BufferState, SlotKind};
pub use source::{ExecContext, LogSource};
pub use stats::SourceStatistics;
pub use timestamp::{SyncOutput, SystemTimestamp, TimestampInfo, TimestampSource};
pub use transport::PeripheralTransport;
