//! 缓冲转储输出。
//!
//! 转储只负责把原始字节交出去，文本呈现由 [`ConsoleSink`] 实现决定。
//! 默认实现 [`TracingConsole`] 以十六进制分行写入 `tracing`。

use tracing::info;

use crate::pool::BufferState;

/// 转储输出。
pub trait ConsoleSink: Send + Sync + 'static {
    /// 转储开始，`states` 为全部缓冲的快照。
    fn begin(&self, states: &[BufferState]) {
        let _ = states;
    }

    /// 输出一块缓冲的已写内容。
    fn dump_buffer(&self, state: &BufferState, bytes: &[u8]);

    /// 转储结束。
    fn end(&self) {}
}

/// 以十六进制写入 `tracing` 的默认转储输出。
#[derive(Clone, Debug)]
pub struct TracingConsole {
    bytes_per_line: usize,
}

impl TracingConsole {
    /// 指定每行字节数（至少 1）。
    pub fn with_line_width(bytes_per_line: usize) -> Self {
        Self {
            bytes_per_line: bytes_per_line.max(1),
        }
    }
}

impl Default for TracingConsole {
    fn default() -> Self {
        Self::with_line_width(32)
    }
}

impl ConsoleSink for TracingConsole {
    fn begin(&self, states: &[BufferState]) {
        let pending = states.iter().filter(|state| state.pos > 0).count();
        info!(buffers = states.len(), pending, "blelog dump begin");
    }

    fn dump_buffer(&self, state: &BufferState, bytes: &[u8]) {
        for (line, chunk) in bytes.chunks(self.bytes_per_line).enumerate() {
            info!(
                buffer = state.buffer_id,
                offset = line * self.bytes_per_line,
                "{}",
                hex::encode(chunk)
            );
        }
    }

    fn end(&self) {
        info!("blelog dump end");
    }
}
