//! 外设传输替身。
//!
//! - [`RecordingTransport`]：`send` 内同步完成，记录每次发送的字节；
//! - [`DeferredTransport`]：只收下租约，由测试决定何时完成，用于构造“传输持有”的状态；
//! - [`FailingTransport`]：`send` 永远失败，用于验证丢失记账与缓冲回收。

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    buffer::{TransportBuffer, TransportLease},
    error::TransportError,
    transport::PeripheralTransport,
};

/// `RecordingTransport` 为每块缓冲附加的分配序号。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationTag(pub usize);

/// 同步完成并记录字节的传输。
#[derive(Debug, Default)]
pub struct RecordingTransport {
    initialized: AtomicBool,
    deinitialized: AtomicBool,
    announced: AtomicUsize,
    allocated: AtomicUsize,
    released: AtomicUsize,
    shortfall: usize,
    sends: Mutex<Vec<(usize, Vec<u8>)>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 便于直接交给管理器的共享句柄。
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// 每次分配都比请求少 `bytes` 字节，用于验证分配校验。
    pub fn with_shortfall(bytes: usize) -> Self {
        Self {
            shortfall: bytes,
            ..Self::default()
        }
    }

    /// `init` 时宣告的缓冲数量。
    pub fn announced_buffers(&self) -> usize {
        self.announced.load(Ordering::SeqCst)
    }

    /// 已分配的缓冲数量。
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    /// 已交还的缓冲数量。
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn is_deinitialized(&self) -> bool {
        self.deinitialized.load(Ordering::SeqCst)
    }

    /// 每次发送的 `(缓冲编号, 字节)`。
    pub fn sends(&self) -> Vec<(usize, Vec<u8>)> {
        self.sends.lock().clone()
    }

    /// 按发送顺序拼接的全部字节。
    pub fn sent_bytes(&self) -> Vec<u8> {
        self.sends
            .lock()
            .iter()
            .flat_map(|(_, bytes)| bytes.iter().copied())
            .collect()
    }
}

impl PeripheralTransport for RecordingTransport {
    fn init(&self, buffer_count: usize) -> Result<(), TransportError> {
        self.announced.store(buffer_count, Ordering::SeqCst);
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn deinit(&self) {
        self.deinitialized.store(true, Ordering::SeqCst);
    }

    fn trans_init(&self, size: usize) -> Result<TransportBuffer, TransportError> {
        let tag = AllocationTag(self.allocated.fetch_add(1, Ordering::SeqCst));
        Ok(TransportBuffer::with_context(size.saturating_sub(self.shortfall), tag))
    }

    fn trans_deinit(&self, _buffer: &TransportBuffer) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn send(&self, lease: TransportLease) -> Result<(), TransportError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(TransportError::NotInitialized);
        }
        self.sends.lock().push((lease.buffer_id(), lease.to_vec()));
        lease.complete();
        Ok(())
    }
}

/// 由测试手动完成的传输。
#[derive(Debug, Default)]
pub struct DeferredTransport {
    pending: Mutex<Vec<TransportLease>>,
    completed: Mutex<Vec<(usize, Vec<u8>)>>,
    sends: AtomicUsize,
}

impl DeferredTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// 累计收到的租约数。
    pub fn send_count(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    /// 尚未完成的租约数。
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// 尚未完成租约的缓冲编号。
    pub fn pending_ids(&self) -> Vec<usize> {
        self.pending.lock().iter().map(TransportLease::buffer_id).collect()
    }

    /// 取走全部未完成租约，由调用方自行完成。
    pub fn take_pending(&self) -> Vec<TransportLease> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// 完成最早的一个租约，返回是否有可完成的租约。
    pub fn complete_next(&self) -> bool {
        let lease = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return false;
            }
            pending.remove(0)
        };
        self.record(lease);
        true
    }

    /// 完成全部租约，返回完成数量。
    pub fn complete_all(&self) -> usize {
        let leases = self.take_pending();
        let count = leases.len();
        for lease in leases {
            self.record(lease);
        }
        count
    }

    /// 已完成租约的 `(缓冲编号, 字节)`。
    pub fn completed(&self) -> Vec<(usize, Vec<u8>)> {
        self.completed.lock().clone()
    }

    fn record(&self, lease: TransportLease) {
        self.completed.lock().push((lease.buffer_id(), lease.to_vec()));
        lease.complete();
    }
}

impl PeripheralTransport for DeferredTransport {
    fn init(&self, _buffer_count: usize) -> Result<(), TransportError> {
        Ok(())
    }

    fn deinit(&self) {}

    fn send(&self, lease: TransportLease) -> Result<(), TransportError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().push(lease);
        Ok(())
    }
}

/// `send` 永远失败的传输。
#[derive(Debug, Default)]
pub struct FailingTransport {
    attempts: AtomicUsize,
}

impl FailingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 累计发送尝试次数。
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl PeripheralTransport for FailingTransport {
    fn init(&self, _buffer_count: usize) -> Result<(), TransportError> {
        Ok(())
    }

    fn deinit(&self) {}

    fn send(&self, lease: TransportLease) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        drop(lease);
        Err(TransportError::Bus(String::from("simulated bus fault")))
    }
}
