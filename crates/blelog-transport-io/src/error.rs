use std::io;

use blelog_core::TransportError;
use thiserror::Error;

/// 流式传输自身的错误。
///
/// - **契约 (What)**：`init` 阶段的失败经 [`From`] 折算为核心的 [`TransportError`]；
///   写线程上的失败不会回到调用方，只能经 [`crate::StreamTransport::take_last_error`] 取回。
#[derive(Debug, Error)]
pub enum StreamTransportError {
    /// 波特率为零时节拍器无法换算发送时长。
    #[error("baud rate must be greater than zero")]
    ZeroBaudRate,

    /// 无法启动写线程。
    #[error("failed to spawn stream writer thread: {0}")]
    Spawn(#[source] io::Error),

    /// 写入底层流失败，对应缓冲的内容已丢失。
    #[error("failed to write buffer {buffer_id} ({len} bytes): {source}")]
    Write {
        buffer_id: usize,
        len: usize,
        #[source]
        source: io::Error,
    },
}

impl From<StreamTransportError> for TransportError {
    fn from(err: StreamTransportError) -> Self {
        TransportError::Bus(err.to_string())
    }
}
