//! 槽位池与获取策略。
//!
//! # 模块定位（Why）
//! - 生产者数量远多于缓冲，且运行在任务与中断两类上下文中；槽位把“谁能写哪对缓冲”
//!   的争用限制在一把锁上，乒乓缓冲让一块在传输时另一块仍可写；
//! - 获取策略先走无锁专用槽位，再对本上下文的原子槽位做一次非阻塞扫描，最后阻塞在本上下文的兜底槽位上，
//!   因此任务与中断永不争用同一把锁。
//!
//! # 结构（How）
//! ```text
//! SlotPool
//!  ├─ task_atomic[0..n]   LockKind::Atomic
//!  ├─ isr_atomic[0..m]    LockKind::Atomic
//!  ├─ task_fallback       config.fallback_lock：Spin（默认）或 Mutex
//!  ├─ isr_fallback        Spin
//!  └─ dedicated[2]        LockKind::None：LinkLayerTask / LinkLayerHci
//! 每个 BufferSlot = 锁 + [TransportBuffer; 2] + 轮转下标
//! ```
//!
//! # 契约（What）
//! - 持有 [`SlotHandle`] 期间本槽位的轮转下标与缓冲写游标只由持有者修改；
//! - 缓冲归属迁移全部经由 CAS，即使上游违反专用槽位的串行化承诺，也只会表现为丢帧。

use std::sync::Arc;

use serde::Serialize;

use crate::{
    buffer::{BufferOwnership, TransportBuffer},
    config::LogBufferConfig,
    error::TransportError,
    frame::{ChecksumScope, FRAME_OVERHEAD, frame_len},
    lock::{LockKind, SlotGuard, SlotLock},
    runtime::RuntimeQueue,
    source::{ExecContext, LogSource},
    sync::{AtomicUsize, Ordering},
    transport::PeripheralTransport,
};

/// 槽位身份，同时说明一次获取走的是哪条路径。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum SlotKind {
    /// 任务上下文第 `n` 个原子槽位。
    TaskAtomic(usize),
    /// 中断上下文第 `n` 个原子槽位。
    IsrAtomic(usize),
    /// 任务上下文兜底槽位。
    TaskFallback,
    /// 中断上下文兜底槽位。
    IsrFallback,
    /// 上游已串行化来源的无锁专用槽位。
    Dedicated(LogSource),
}

/// 带锁的一对乒乓缓冲。
pub struct BufferSlot {
    kind: SlotKind,
    lock: SlotLock,
    buffers: [Arc<TransportBuffer>; 2],
    cursor: AtomicUsize,
}

impl BufferSlot {
    fn new(kind: SlotKind, lock: LockKind, buffers: [Arc<TransportBuffer>; 2]) -> Self {
        Self {
            kind,
            lock: SlotLock::new(lock),
            buffers,
            cursor: AtomicUsize::new(0),
        }
    }

    /// 槽位身份。
    pub fn kind(&self) -> SlotKind {
        self.kind
    }

    /// 锁纪律。
    pub fn lock_kind(&self) -> LockKind {
        self.lock.kind()
    }

    /// 两块缓冲。
    pub fn buffers(&self) -> &[Arc<TransportBuffer>; 2] {
        &self.buffers
    }

    /// 单帧可用的最大字节数（取两块缓冲中较小者）。
    pub fn frame_capacity(&self) -> usize {
        self.buffers[0].capacity().min(self.buffers[1].capacity())
    }

    fn current(&self) -> usize {
        self.cursor.load(Ordering::Relaxed) & 1
    }

    fn advance(&self) {
        self.cursor.store(self.current() ^ 1, Ordering::Relaxed);
    }
}

/// 一次写入尝试的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    /// 帧已写入。
    Written,
    /// 两块缓冲都不可用，本帧丢失。
    Unavailable,
    /// 帧比缓冲本身还大，属于调用方的编程错误。
    TooLarge,
}

/// 已获取的槽位，析构时释放槽位锁。
pub struct SlotHandle<'a> {
    slot: &'a BufferSlot,
    _guard: SlotGuard<'a>,
}

impl SlotHandle<'_> {
    /// 本次获取命中的槽位。
    pub fn kind(&self) -> SlotKind {
        self.slot.kind
    }

    /// 本槽位可容纳的最大帧。
    pub fn frame_capacity(&self) -> usize {
        self.slot.frame_capacity()
    }

    /// 在槽位内挑选一块缓冲并追加一帧。
    ///
    /// # 教案式说明
    /// - **逻辑 (How)**：从轮转下标开始至多检查两块缓冲：
    ///   1. 未被传输持有且剩余空间容得下整帧：认领并写入；
    ///   2. 未被持有但非空、空间不足：移交派发器，换另一块；
    ///   3. 被传输持有，或为空却依旧放不下：跳过；
    ///
    ///   写入后若剩余空间已放不下任何帧（少于帧开销），立即移交。
    /// - **契约 (What)**：`Unavailable` 时不修改任何缓冲内容；移交过的缓冲即使本帧失败也已在派发队列中。
    pub(crate) fn write_frame(
        &self,
        source: LogSource,
        sequence: u32,
        parts: &[&[u8]],
        scope: ChecksumScope,
        queue: &RuntimeQueue,
    ) -> WriteOutcome {
        let payload_len: usize = parts.iter().map(|part| part.len()).sum();
        let needed = frame_len(payload_len);
        if payload_len > usize::from(u16::MAX) || needed > self.slot.frame_capacity() {
            return WriteOutcome::TooLarge;
        }

        for _ in 0..2 {
            let buffer = &self.slot.buffers[self.slot.current()];
            if !buffer.is_transport_owned() {
                if buffer.free_space() >= needed {
                    if buffer.claim_for_writer() {
                        return self.commit(buffer, source, sequence, parts, scope, queue);
                    }
                } else if !buffer.is_empty() && buffer.free_to_transport() {
                    queue.hand_off(Arc::clone(buffer));
                }
            }
            self.slot.advance();
        }
        WriteOutcome::Unavailable
    }

    fn commit(
        &self,
        buffer: &Arc<TransportBuffer>,
        source: LogSource,
        sequence: u32,
        parts: &[&[u8]],
        scope: ChecksumScope,
        queue: &RuntimeQueue,
    ) -> WriteOutcome {
        let outcome = match buffer.append_frame(source, sequence, parts, scope) {
            Ok(_) => WriteOutcome::Written,
            Err(_) => WriteOutcome::Unavailable,
        };
        if buffer.free_space() < FRAME_OVERHEAD {
            if buffer.writer_to_transport() {
                queue.hand_off(Arc::clone(buffer));
            }
            self.slot.advance();
        } else {
            buffer.release_writer();
        }
        outcome
    }
}

/// 单块缓冲的诊断快照。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BufferState {
    pub slot: SlotKind,
    /// 乒乓下标（0 或 1）。
    pub index: usize,
    pub buffer_id: usize,
    pub ownership: BufferOwnership,
    pub pos: usize,
    pub capacity: usize,
}

/// 固定槽位池。
pub struct SlotPool {
    task_atomic: Box<[BufferSlot]>,
    isr_atomic: Box<[BufferSlot]>,
    task_fallback: BufferSlot,
    isr_fallback: BufferSlot,
    dedicated: Box<[BufferSlot]>,
}

impl SlotPool {
    /// 按配置通过传输分配全部缓冲。
    ///
    /// - **契约 (What)**：调用方已执行 `transport.init(config.buffer_count())`；
    ///   缓冲编号按分配顺序从 0 递增；任一分配失败时已分配的缓冲会先交还给 `trans_deinit`。
    pub fn new(
        config: &LogBufferConfig,
        transport: &dyn PeripheralTransport,
    ) -> Result<Self, TransportError> {
        let mut allocator = Allocator {
            transport,
            allocated: Vec::with_capacity(config.buffer_count()),
        };
        match allocator.build(config) {
            Ok(pool) => Ok(pool),
            Err(err) => {
                for buffer in &allocator.allocated {
                    transport.trans_deinit(buffer);
                }
                Err(err)
            }
        }
    }

    /// 为一次写入获取槽位。
    ///
    /// - **逻辑 (How)**：专用来源直接命中无锁槽位；否则在 `ctx` 对应的原子槽位上逐个 `try_acquire`，
    ///   全部失败后阻塞在该上下文的兜底槽位上。
    /// - **契约 (What)**：总能返回一个槽位；阻塞只发生在兜底槽位，且不跨越上下文。
    pub fn acquire(&self, source: LogSource, ctx: ExecContext) -> SlotHandle<'_> {
        if let Some(slot) = self.dedicated_for(source) {
            return SlotHandle {
                slot,
                _guard: slot.lock.acquire(),
            };
        }
        let (atomic, fallback) = match ctx {
            ExecContext::Task => (&self.task_atomic, &self.task_fallback),
            ExecContext::Isr => (&self.isr_atomic, &self.isr_fallback),
        };
        for slot in atomic.iter() {
            if let Some(guard) = slot.lock.try_acquire() {
                return SlotHandle { slot, _guard: guard };
            }
        }
        SlotHandle {
            slot: fallback,
            _guard: fallback.lock.acquire(),
        }
    }

    fn dedicated_for(&self, source: LogSource) -> Option<&BufferSlot> {
        self.dedicated
            .iter()
            .find(|slot| slot.kind == SlotKind::Dedicated(source))
    }

    /// 全部槽位，顺序固定：任务原子、中断原子、任务兜底、中断兜底、专用。
    pub fn slots(&self) -> impl Iterator<Item = &BufferSlot> {
        self.task_atomic
            .iter()
            .chain(self.isr_atomic.iter())
            .chain(std::iter::once(&self.task_fallback))
            .chain(std::iter::once(&self.isr_fallback))
            .chain(self.dedicated.iter())
    }

    /// 全部缓冲。
    pub fn buffers(&self) -> impl Iterator<Item = &Arc<TransportBuffer>> {
        self.slots().flat_map(|slot| slot.buffers.iter())
    }

    /// 缓冲总数。
    pub fn buffer_count(&self) -> usize {
        self.buffers().count()
    }

    /// 是否仍有缓冲被传输持有。
    pub fn any_transport_owned(&self) -> bool {
        self.buffers().any(|buffer| buffer.is_transport_owned())
    }

    /// 每块缓冲的诊断快照。
    pub fn states(&self) -> Vec<BufferState> {
        self.slots()
            .flat_map(|slot| {
                slot.buffers
                    .iter()
                    .enumerate()
                    .map(move |(index, buffer)| BufferState {
                        slot: slot.kind,
                        index,
                        buffer_id: buffer.id(),
                        ownership: buffer.ownership(),
                        pos: buffer.pos(),
                        capacity: buffer.capacity(),
                    })
            })
            .collect()
    }

    /// 把所有空闲且非空的缓冲移交派发器，返回移交数量。
    pub(crate) fn enqueue_pending(&self, queue: &RuntimeQueue) -> usize {
        let mut queued = 0;
        for buffer in self.buffers() {
            if !buffer.is_empty() && buffer.free_to_transport() {
                queue.hand_off(Arc::clone(buffer));
                queued += 1;
            }
        }
        queued
    }

    /// 把全部缓冲交还传输。
    pub(crate) fn release(&self, transport: &dyn PeripheralTransport) {
        for buffer in self.buffers() {
            transport.trans_deinit(buffer);
        }
    }
}

struct Allocator<'t> {
    transport: &'t dyn PeripheralTransport,
    allocated: Vec<Arc<TransportBuffer>>,
}

impl Allocator<'_> {
    fn build(&mut self, config: &LogBufferConfig) -> Result<SlotPool, TransportError> {
        let size = config.buffer_size;
        let mut task_atomic = Vec::with_capacity(config.task_atomic_slots);
        for idx in 0..config.task_atomic_slots {
            task_atomic.push(self.slot(SlotKind::TaskAtomic(idx), LockKind::Atomic, size)?);
        }
        let mut isr_atomic = Vec::with_capacity(config.isr_atomic_slots);
        for idx in 0..config.isr_atomic_slots {
            isr_atomic.push(self.slot(SlotKind::IsrAtomic(idx), LockKind::Atomic, size)?);
        }
        let task_lock = config.fallback_lock_for(ExecContext::Task);
        let task_fallback = self.slot(SlotKind::TaskFallback, task_lock, size)?;
        let isr_lock = config.fallback_lock_for(ExecContext::Isr);
        let isr_fallback = self.slot(SlotKind::IsrFallback, isr_lock, size)?;
        let mut dedicated = Vec::new();
        if config.link_layer_dedicated_slots {
            for source in [LogSource::LinkLayerTask, LogSource::LinkLayerHci] {
                dedicated.push(self.slot(
                    SlotKind::Dedicated(source),
                    LockKind::None,
                    config.dedicated_buffer_size,
                )?);
            }
        }
        Ok(SlotPool {
            task_atomic: task_atomic.into_boxed_slice(),
            isr_atomic: isr_atomic.into_boxed_slice(),
            task_fallback,
            isr_fallback,
            dedicated: dedicated.into_boxed_slice(),
        })
    }

    fn slot(
        &mut self,
        kind: SlotKind,
        lock: LockKind,
        size: usize,
    ) -> Result<BufferSlot, TransportError> {
        let ping = self.buffer(size)?;
        let pong = self.buffer(size)?;
        Ok(BufferSlot::new(kind, lock, [ping, pong]))
    }

    fn buffer(&mut self, size: usize) -> Result<Arc<TransportBuffer>, TransportError> {
        let mut buffer = self.transport.trans_init(size)?;
        if buffer.capacity() < size {
            self.transport.trans_deinit(&buffer);
            return Err(TransportError::ShortAllocation {
                requested: size,
                actual: buffer.capacity(),
            });
        }
        buffer.set_id(self.allocated.len());
        let buffer = Arc::new(buffer);
        self.allocated.push(Arc::clone(&buffer));
        Ok(buffer)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::test_stubs::transport::RecordingTransport;

    const HEADER_ONLY: ChecksumScope = ChecksumScope::HeaderOnly;

    fn pool(config: &LogBufferConfig) -> (SlotPool, RuntimeQueue) {
        let transport = RecordingTransport::new();
        let pool = SlotPool::new(config, &transport).expect("默认传输总能分配");
        (pool, RuntimeQueue::new(config.buffer_count() + 1))
    }

    #[test]
    fn task_writers_fill_atomic_slots_before_fallback() {
        let config = LogBufferConfig::default().with_slots(2, 1);
        let (pool, _queue) = pool(&config);
        let first = pool.acquire(LogSource::Host, ExecContext::Task);
        let second = pool.acquire(LogSource::Host, ExecContext::Task);
        let third = pool.acquire(LogSource::Host, ExecContext::Task);
        assert_eq!(first.kind(), SlotKind::TaskAtomic(0));
        assert_eq!(second.kind(), SlotKind::TaskAtomic(1));
        assert_eq!(third.kind(), SlotKind::TaskFallback);

        let isr = pool.acquire(LogSource::Host, ExecContext::Isr);
        assert_eq!(isr.kind(), SlotKind::IsrAtomic(0), "中断上下文不与任务争用");
    }

    #[test]
    fn fallback_slots_stay_exclusive_whatever_the_configured_lock() {
        for kind in [LockKind::None, LockKind::Atomic, LockKind::Spin, LockKind::Mutex] {
            let config = LogBufferConfig::default().with_slots(0, 0).with_fallback_lock(kind);
            let (pool, _queue) = pool(&config);
            let held = pool.acquire(LogSource::Host, ExecContext::Task);
            assert_eq!(held.kind(), SlotKind::TaskFallback);

            let fallback = pool
                .slots()
                .find(|slot| slot.kind() == SlotKind::TaskFallback)
                .expect("任务兜底槽位总是存在");
            assert!(
                fallback.lock.try_acquire().is_none(),
                "{kind:?}：兜底槽位被持有时不得再次获取"
            );
            let isr = pool
                .slots()
                .find(|slot| slot.kind() == SlotKind::IsrFallback)
                .expect("中断兜底槽位总是存在");
            assert_eq!(isr.lock_kind(), LockKind::Spin);
        }
    }

    #[test]
    fn dedicated_sources_bypass_context_slots() {
        let config = LogBufferConfig::default();
        let (pool, _queue) = pool(&config);
        let handle = pool.acquire(LogSource::LinkLayerHci, ExecContext::Isr);
        assert_eq!(handle.kind(), SlotKind::Dedicated(LogSource::LinkLayerHci));

        let config = config.with_dedicated_slots(false, 0);
        let (pool, _queue) = self::pool(&config);
        let handle = pool.acquire(LogSource::LinkLayerHci, ExecContext::Isr);
        assert_eq!(handle.kind(), SlotKind::IsrAtomic(0));
    }

    #[test]
    fn buffer_ids_follow_allocation_order() {
        let config = LogBufferConfig::default();
        let (pool, _queue) = pool(&config);
        let ids: Vec<usize> = pool.buffers().map(|buffer| buffer.id()).collect();
        assert_eq!(ids, (0..config.buffer_count()).collect::<Vec<_>>());
    }

    #[test]
    fn selection_hands_off_full_buffer_and_switches() {
        let config = LogBufferConfig::default().with_buffer_size(64);
        let (pool, queue) = pool(&config);
        let handle = pool.acquire(LogSource::Host, ExecContext::Isr);
        let payload = [0u8; 30];

        assert_eq!(
            handle.write_frame(LogSource::Host, 0, &[&payload], ChecksumScope::HeaderOnly, &queue),
            WriteOutcome::Written
        );
        assert_eq!(
            handle.write_frame(LogSource::Host, 1, &[&payload], ChecksumScope::HeaderOnly, &queue),
            WriteOutcome::Written,
            "第一块剩余 24 字节放不下 40 字节的帧，应移交后改写第二块"
        );
        assert_eq!(queue.len(), 1);
        let states = pool.states();
        let isr: Vec<_> = states
            .iter()
            .filter(|state| state.slot == SlotKind::IsrAtomic(0))
            .collect();
        assert_eq!(isr[0].ownership, BufferOwnership::Transport);
        assert_eq!(isr[1].ownership, BufferOwnership::Free);
        assert_eq!(isr[1].pos, 40);
    }

    #[test]
    fn both_buffers_busy_means_unavailable() {
        let config = LogBufferConfig::default().with_buffer_size(64);
        let (pool, queue) = pool(&config);
        let handle = pool.acquire(LogSource::Host, ExecContext::Isr);
        let exact = [0u8; 54];
        for seq in 0..2 {
            assert_eq!(
                handle.write_frame(LogSource::Host, seq, &[&exact], HEADER_ONLY, &queue),
                WriteOutcome::Written
            );
        }
        assert_eq!(queue.len(), 2, "恰好写满的缓冲立即移交");
        assert_eq!(
            handle.write_frame(LogSource::Host, 2, &[&[1]], ChecksumScope::HeaderOnly, &queue),
            WriteOutcome::Unavailable
        );
        assert_eq!(
            handle.write_frame(LogSource::Host, 3, &[&[0u8; 55]], HEADER_ONLY, &queue),
            WriteOutcome::TooLarge
        );
    }
}
