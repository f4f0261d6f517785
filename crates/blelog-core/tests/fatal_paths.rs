#![cfg(not(loom))]

//! 不可恢复路径：拆卸超时与超大帧。
//!
//! - 传输永不完成时，冲刷的有界等待超时必须终止而不是继续拆卸；
//! - 比缓冲本身还大的帧是调用方的编程错误：调试构建断言失败，发布构建计为丢帧。
//!
//! 这些用例在 panic 展开中析构管理器，同时覆盖了展开期间跳过有界等待的拆卸路径。

use std::time::Duration;

use blelog_core::{
    BleLogManager, ExecContext, LogBufferConfig, LogSource,
    test_stubs::transport::{DeferredTransport, RecordingTransport},
};

fn config() -> LogBufferConfig {
    LogBufferConfig::default()
        .with_housekeeping_interval(Duration::from_secs(3600))
        .with_flush_timeout(Duration::from_millis(50))
}

#[test]
#[should_panic(expected = "blelog teardown timed out")]
fn flush_times_out_when_transport_never_completes() {
    let transport = DeferredTransport::shared();
    let mut manager = BleLogManager::new(config(), transport.clone());
    manager.init().expect("初始化");
    assert!(manager.write(LogSource::Host, ExecContext::Task, b"stuck"));
    manager.flush();
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "exceeds the capacity")]
fn oversized_frame_is_a_programming_error() {
    let config = config().with_buffer_size(64);
    let mut manager = BleLogManager::new(config, RecordingTransport::shared());
    manager.init().expect("初始化");
    manager.write(LogSource::Host, ExecContext::Isr, &[0; 64]);
}

#[cfg(not(debug_assertions))]
#[test]
fn oversized_frame_is_counted_as_lost() {
    let config = config().with_buffer_size(64);
    let mut manager = BleLogManager::new(config, RecordingTransport::shared());
    manager.init().expect("初始化");
    assert!(!manager.write(LogSource::Host, ExecContext::Isr, &[0; 64]));
    let host = manager.statistics()[LogSource::Host.index()];
    assert_eq!(host.lost_frames, 1);
    assert_eq!(host.written_frames, 0);
}
