//! 传输缓冲与发送租约。
//!
//! # 模块定位（Why）
//! - 每块 [`TransportBuffer`] 在任意时刻只属于三方之一：空闲、某个写入者、外设传输；
//!   这份归属决定了谁可以移动写游标，是整个子系统并发正确性的核心不变量。
//! - [`TransportLease`] 把“传输持有缓冲”表达为一个所有权值：传输完成时调用
//!   [`TransportLease::complete`]（或直接丢弃），缓冲被清空并回到空闲态；这是缓冲重新可写的唯一路径。
//!
//! # 设计概要（How）
//! - 归属用 `AtomicU8` 三态表示，所有迁移都经由 CAS，非法迁移在调试构建中触发断言；
//! - 字节存放在 `spin::Mutex<BytesMut>` 中，容量在构造时一次分配，编码前按逻辑容量检查，永不扩容；
//! - 写游标另有一份原子镜像，供获取策略在不碰字节锁的情况下判断剩余空间。

use std::{any::Any, fmt, sync::Arc};

use bytes::{Bytes, BytesMut};
use serde::Serialize;

use crate::{
    error::FrameError,
    frame::{self, ChecksumScope},
    source::LogSource,
    sync::{AtomicU8, AtomicUsize, Ordering},
};

/// 缓冲归属。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum BufferOwnership {
    /// 无人持有，可被持有槽位锁的写入者认领。
    Free = 0,
    /// 某个写入者正在追加帧。
    Writer = 1,
    /// 已移交派发器或外设传输，生产者不可触碰。
    Transport = 2,
}

impl BufferOwnership {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Free,
            1 => Self::Writer,
            _ => Self::Transport,
        }
    }
}

/// 一块固定容量的传输缓冲。
///
/// # 契约 (What)
/// - `pos`（已写字节数）只在归属为 `Writer` 时增长，只在 `Transport -> Free` 迁移时归零；
/// - `context` 是外设传输在 `trans_init` 时附加的私有数据（例如 DMA 描述符），核心从不解读；
/// - 缓冲在子系统生命周期内只分配一次，经由移交反复复用。
pub struct TransportBuffer {
    id: usize,
    capacity: usize,
    state: AtomicU8,
    len: AtomicUsize,
    data: spin::Mutex<BytesMut>,
    context: Option<Box<dyn Any + Send + Sync>>,
}

impl TransportBuffer {
    /// 分配指定容量的空缓冲。
    pub fn new(capacity: usize) -> Self {
        Self {
            id: 0,
            capacity,
            state: AtomicU8::new(BufferOwnership::Free as u8),
            len: AtomicUsize::new(0),
            data: spin::Mutex::new(BytesMut::with_capacity(capacity)),
            context: None,
        }
    }

    /// 分配缓冲并附加传输私有上下文。
    pub fn with_context<C: Any + Send + Sync>(capacity: usize, context: C) -> Self {
        let mut buffer = Self::new(capacity);
        buffer.context = Some(Box::new(context));
        buffer
    }

    /// 池内编号，按分配顺序从 0 开始。
    pub fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: usize) {
        self.id = id;
    }

    /// 逻辑容量（`size`）。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 已写入的字节数（`pos`）。
    pub fn pos(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// 剩余可写字节数。
    pub fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.pos())
    }

    /// 是否没有任何已写入的帧。
    pub fn is_empty(&self) -> bool {
        self.pos() == 0
    }

    /// 当前归属。
    pub fn ownership(&self) -> BufferOwnership {
        BufferOwnership::from_raw(self.state.load(Ordering::Acquire))
    }

    /// 是否由传输独占。
    pub fn is_transport_owned(&self) -> bool {
        self.ownership() == BufferOwnership::Transport
    }

    /// 读取传输私有上下文。
    pub fn context<C: Any>(&self) -> Option<&C> {
        self.context.as_ref().and_then(|ctx| ctx.downcast_ref::<C>())
    }

    /// 复制当前内容，供诊断转储与测试使用。
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data.lock())
    }

    fn transition(&self, from: BufferOwnership, to: BufferOwnership) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 空闲 -> 写入者。
    pub(crate) fn claim_for_writer(&self) -> bool {
        self.transition(BufferOwnership::Free, BufferOwnership::Writer)
    }

    /// 写入者 -> 空闲。
    pub(crate) fn release_writer(&self) {
        let released = self.transition(BufferOwnership::Writer, BufferOwnership::Free);
        debug_assert!(released, "buffer {} released by a writer that did not own it", self.id);
    }

    /// 写入者 -> 传输：写满后就地移交。
    pub(crate) fn writer_to_transport(&self) -> bool {
        let moved = self.transition(BufferOwnership::Writer, BufferOwnership::Transport);
        debug_assert!(moved, "buffer {} handed off by a writer that did not own it", self.id);
        moved
    }

    /// 空闲 -> 传输：获取策略回收非空缓冲或冲刷时使用。
    pub(crate) fn free_to_transport(&self) -> bool {
        self.transition(BufferOwnership::Free, BufferOwnership::Transport)
    }

    /// 在写游标处追加一帧，要求调用方已通过 [`Self::claim_for_writer`] 认领。
    pub(crate) fn append_frame(
        &self,
        source: LogSource,
        sequence: u32,
        parts: &[&[u8]],
        scope: ChecksumScope,
    ) -> Result<usize, FrameError> {
        debug_assert_eq!(self.ownership(), BufferOwnership::Writer);
        let mut data = self.data.lock();
        let cursor = frame::encode(&mut data, self.capacity, source, sequence, parts, scope)?;
        self.len.store(cursor, Ordering::Release);
        Ok(cursor)
    }

    /// 传输完成：清空内容并交还空闲态。
    pub(crate) fn release_from_transport(&self) {
        {
            let mut data = self.data.lock();
            data.clear();
            self.len.store(0, Ordering::Release);
        }
        let released = self.transition(BufferOwnership::Transport, BufferOwnership::Free);
        debug_assert!(released, "buffer {} completed while not owned by the transport", self.id);
    }

    fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.data.lock();
        f(&data)
    }
}

impl fmt::Debug for TransportBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportBuffer")
            .field("id", &self.id)
            .field("pos", &self.pos())
            .field("capacity", &self.capacity)
            .field("ownership", &self.ownership())
            .field("has_context", &self.context.is_some())
            .finish()
    }
}

/// 外设传输对一块缓冲的独占租约。
///
/// # 教案式说明
/// - **意图 (Why)**：把“完成回调必须被调用”编码进所有权：租约被消费或丢弃时缓冲即被释放，
///   发送启动失败的路径也不会把缓冲悬挂在传输态。
/// - **逻辑 (How)**：派发器在调用 `send` 前构造租约；传输在 DMA 完成中断或写线程里调用
///   [`Self::complete`]，`Drop` 负责清空缓冲并把归属迁回 `Free`。
/// - **契约 (What)**：
///   - 租约存活期间缓冲内容不可变，`len()` 恒等于发送开始时的 `pos`；
///   - 永远持有租约而不完成会饿死缓冲池，唯一的防线是冲刷阶段的有界等待。
#[must_use = "dropping a lease completes the transfer immediately"]
pub struct TransportLease {
    buffer: Arc<TransportBuffer>,
}

impl TransportLease {
    pub(crate) fn new(buffer: Arc<TransportBuffer>) -> Self {
        debug_assert!(buffer.is_transport_owned());
        Self { buffer }
    }

    /// 缓冲编号。
    pub fn buffer_id(&self) -> usize {
        self.buffer.id()
    }

    /// 待发送字节数。
    pub fn len(&self) -> usize {
        self.buffer.pos()
    }

    /// 是否没有待发送字节。
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 以只读切片访问待发送内容。
    pub fn with_payload<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.buffer.with_bytes(f)
    }

    /// 复制待发送内容。
    pub fn to_vec(&self) -> Vec<u8> {
        self.with_payload(<[u8]>::to_vec)
    }

    /// 读取传输私有上下文。
    pub fn context<C: Any>(&self) -> Option<&C> {
        self.buffer.context::<C>()
    }

    /// 完成回调：释放缓冲所有权。
    pub fn complete(self) {}
}

impl Drop for TransportLease {
    fn drop(&mut self) {
        self.buffer.release_from_transport();
    }
}

impl fmt::Debug for TransportLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportLease")
            .field("buffer_id", &self.buffer.id())
            .field("len", &self.len())
            .finish()
    }
}
