#![deny(unsafe_code)]
#![doc = r#"
# blelog-transport-io

## 设计动机（Why）
- **定位**：宿主侧的 [`PeripheralTransport`] 参考实现，把任意 `std::io::Write`
  （串口设备文件、TCP 流、文件、内存缓冲）包装成带异步完成语义的“DMA 通道”。
- **架构角色**：核心只定义传输契约；本 crate 让同一套缓冲管理逻辑在桌面与 CI 环境
  跑通端到端路径，并在真实总线驱动就绪前充当替身。

## 核心契约（What）
- `send` 只把租约投递给写线程，从不阻塞在 IO 上；
- 写线程写完（或写失败）后完成租约，缓冲随之回到空闲态；
- 写失败不会回到派发器：计入 [`StreamStats::write_errors`]，最近一次错误可经
  [`StreamTransport::take_last_error`] 取回。

## 实现策略（How）
- `init(buffer_count)` 创建容量为 `buffer_count` 的有界通道并启动写线程；
  每块缓冲同一时刻至多在途一次，通道因此不会满；
- 可选的 [`BaudPacer`] 在每次写入后按 8N1 帧格式睡眠相应时长，模拟 UART 的线速。

## 风险与考量（Trade-offs）
- 写入发生在缓冲字节锁内，慢速 `Write` 会同步拖慢对同一缓冲的诊断转储；
- 节拍器基于 `thread::sleep`，精度受操作系统调度粒度限制。
"#]

mod error;

use std::{
    io::Write,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use blelog_core::{PeripheralTransport, TransportError, TransportLease};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};

pub use error::StreamTransportError;

/// 写线程默认名称。
pub const DEFAULT_THREAD_NAME: &str = "blelog-stream-tx";

/// 按波特率换算发送时长的节拍器。
///
/// 8N1 帧格式下每字节占 1 个起始位、8 个数据位与 1 个停止位。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BaudPacer {
    baud_rate: u32,
}

impl BaudPacer {
    /// 每字节在线路上占用的位数。
    pub const BITS_PER_BYTE: u64 = 10;

    /// 以给定波特率构造；零波特率无法换算。
    pub fn new(baud_rate: u32) -> Result<Self, StreamTransportError> {
        if baud_rate == 0 {
            return Err(StreamTransportError::ZeroBaudRate);
        }
        Ok(Self { baud_rate })
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// 发送 `len` 字节所需的线路时长。
    pub fn duration_for(&self, len: usize) -> Duration {
        let bits = len as u64 * Self::BITS_PER_BYTE;
        Duration::from_nanos(bits.saturating_mul(1_000_000_000) / u64::from(self.baud_rate))
    }
}

/// 写线程累计的计数快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// 成功写出的缓冲数。
    pub buffers_written: u64,
    /// 成功写出的字节数。
    pub bytes_written: u64,
    /// 写入失败的缓冲数。
    pub write_errors: u64,
}

struct Shared<W> {
    writer: parking_lot::Mutex<W>,
    pacer: Option<BaudPacer>,
    buffers_written: AtomicU64,
    bytes_written: AtomicU64,
    write_errors: AtomicU64,
    last_error: parking_lot::Mutex<Option<StreamTransportError>>,
}

impl<W: Write> Shared<W> {
    fn run(&self, receiver: Receiver<TransportLease>) {
        for lease in receiver.iter() {
            self.transmit(lease);
        }
        debug!("stream writer drained");
    }

    fn transmit(&self, lease: TransportLease) {
        let len = lease.len();
        let result = lease.with_payload(|bytes| {
            let mut writer = self.writer.lock();
            writer.write_all(bytes).and_then(|()| writer.flush())
        });
        match result {
            Ok(()) => {
                self.buffers_written.fetch_add(1, Ordering::Relaxed);
                self.bytes_written.fetch_add(len as u64, Ordering::Relaxed);
            }
            Err(source) => {
                warn!(buffer = lease.buffer_id(), len, error = %source, "stream write failed");
                self.write_errors.fetch_add(1, Ordering::Relaxed);
                *self.last_error.lock() = Some(StreamTransportError::Write {
                    buffer_id: lease.buffer_id(),
                    len,
                    source,
                });
            }
        }
        if let Some(pacer) = &self.pacer {
            thread::sleep(pacer.duration_for(len));
        }
        lease.complete();
    }
}

struct Worker {
    sender: Sender<TransportLease>,
    handle: JoinHandle<()>,
}

/// 以 `std::io::Write` 为线路的外设传输。
///
/// # 教案式说明
/// - **意图 (Why)**：在没有 DMA 的宿主环境复现“启动发送即返回、稍后在别的上下文完成”的时序，
///   让冲刷、拆卸的有界等待路径得到真实的异步完成。
/// - **逻辑 (How)**：`send` 把租约投入有界通道；写线程逐个取出、写入、按需节拍，最后完成租约。
///   `deinit` 关闭发送端，写线程排空通道后退出并被回收。
/// - **契约 (What)**：
///   - `init` 之前或 `deinit` 之后调用 `send` 返回 [`TransportError::NotInitialized`]，租约随错误被丢弃；
///   - 重复 `init` 保持已有写线程；
///   - 写线程退出后仍可经 [`Self::with_writer`] 检查底层写入器。
pub struct StreamTransport<W> {
    shared: Arc<Shared<W>>,
    worker: parking_lot::Mutex<Option<Worker>>,
    thread_name: String,
    invalid_baud: bool,
}

impl<W: Write + Send + 'static> StreamTransport<W> {
    pub fn new(writer: W) -> Self {
        Self {
            shared: Arc::new(Shared {
                writer: parking_lot::Mutex::new(writer),
                pacer: None,
                buffers_written: AtomicU64::new(0),
                bytes_written: AtomicU64::new(0),
                write_errors: AtomicU64::new(0),
                last_error: parking_lot::Mutex::new(None),
            }),
            worker: parking_lot::Mutex::new(None),
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
            invalid_baud: false,
        }
    }

    /// 启用按波特率节拍；零波特率会让随后的 `init` 失败。
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        let pacer = BaudPacer::new(baud_rate).ok();
        self.invalid_baud = pacer.is_none();
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.pacer = pacer;
        }
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn pacer(&self) -> Option<BaudPacer> {
        self.shared.pacer
    }

    /// 写线程是否在运行。
    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            buffers_written: self.shared.buffers_written.load(Ordering::Relaxed),
            bytes_written: self.shared.bytes_written.load(Ordering::Relaxed),
            write_errors: self.shared.write_errors.load(Ordering::Relaxed),
        }
    }

    /// 取走最近一次写入失败。
    pub fn take_last_error(&self) -> Option<StreamTransportError> {
        self.shared.last_error.lock().take()
    }

    /// 在写入器锁内访问底层写入器。
    pub fn with_writer<R>(&self, f: impl FnOnce(&mut W) -> R) -> R {
        f(&mut self.shared.writer.lock())
    }
}

impl<W: Write + Send + 'static> PeripheralTransport for StreamTransport<W> {
    fn init(&self, buffer_count: usize) -> Result<(), TransportError> {
        if self.invalid_baud {
            return Err(StreamTransportError::ZeroBaudRate.into());
        }
        let mut worker = self.worker.lock();
        if worker.is_some() {
            debug!("stream transport already running");
            return Ok(());
        }
        let (sender, receiver) = crossbeam_channel::bounded(buffer_count.max(1));
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || shared.run(receiver))
            .map_err(StreamTransportError::Spawn)?;
        *worker = Some(Worker { sender, handle });
        info!(
            buffer_count,
            baud_rate = self.shared.pacer.map(|pacer| pacer.baud_rate()),
            "stream transport started"
        );
        Ok(())
    }

    fn deinit(&self) {
        let Some(Worker { sender, handle }) = self.worker.lock().take() else {
            return;
        };
        drop(sender);
        if handle.join().is_err() {
            warn!("stream writer thread panicked");
        }
        info!(stats = ?self.stats(), "stream transport stopped");
    }

    fn send(&self, lease: TransportLease) -> Result<(), TransportError> {
        let worker = self.worker.lock();
        let Some(worker) = worker.as_ref() else {
            return Err(TransportError::NotInitialized);
        };
        worker.sender.try_send(lease).map_err(|err| match err {
            TrySendError::Full(_) => TransportError::Busy,
            TrySendError::Disconnected(_) => TransportError::NotInitialized,
        })
    }
}
