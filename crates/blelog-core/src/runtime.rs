//! 运行时派发器：唯一的消费者。
//!
//! # 设计背景（Why）
//! - 生产者在中断里发现缓冲写满时不能直接驱动总线，只能把缓冲句柄塞进队列；
//!   后台线程串行地把缓冲交给外设传输，并顺带完成周期性管理工作（信息帧、时间同步帧、统计帧）。
//! - 队列接收是派发器唯一的挂起点，超时值即距下个管理周期的剩余时间，因此空闲时不会忙等。
//!
//! # 契约说明（What）
//! - 队列容量为缓冲总数加一：每块缓冲同一时刻至多在队列中出现一次，再为关停消息预留一格，
//!   移交因而永不因队列满而失败；
//! - 派发器线程内不得调用冲刷或拆卸：冲刷要等待的正是本线程的 `send`。

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Instant,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use tracing::{debug, info, warn};

use crate::{
    buffer::{TransportBuffer, TransportLease},
    error::BleLogError,
    manager::LogContext,
    source::{ExecContext, InternalCode, LogSource},
};

/// 信息帧携带的格式版本。
pub const LOG_VERSION: u8 = 3;

pub(crate) enum RuntimeMessage {
    Transmit(Arc<TransportBuffer>),
    Shutdown,
}

/// 生产者到派发器的有界队列。
pub(crate) struct RuntimeQueue {
    sender: Sender<RuntimeMessage>,
    receiver: Receiver<RuntimeMessage>,
}

impl RuntimeQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self { sender, receiver }
    }

    /// 移交一块已处于传输态的缓冲。
    ///
    /// 队列不可用时（仅可能发生在拆卸之后）就地丢弃内容，避免缓冲永久悬挂在传输态。
    pub(crate) fn hand_off(&self, buffer: Arc<TransportBuffer>) -> bool {
        match self.sender.try_send(RuntimeMessage::Transmit(buffer)) {
            Ok(()) => true,
            Err(TrySendError::Full(msg) | TrySendError::Disconnected(msg)) => {
                if let RuntimeMessage::Transmit(buffer) = msg {
                    warn!(
                        buffer = buffer.id(),
                        bytes = buffer.pos(),
                        "runtime queue rejected buffer, dropping its frames"
                    );
                    drop(TransportLease::new(buffer));
                }
                false
            }
        }
    }

    pub(crate) fn shutdown(&self) -> bool {
        self.sender.try_send(RuntimeMessage::Shutdown).is_ok()
    }

    pub(crate) fn len(&self) -> usize {
        self.sender.len()
    }

    fn receiver(&self) -> &Receiver<RuntimeMessage> {
        &self.receiver
    }
}

/// 启动派发线程。
pub(crate) fn spawn(context: Arc<LogContext>) -> Result<JoinHandle<()>, BleLogError> {
    let mut builder = thread::Builder::new().name(context.config.dispatcher_thread_name.clone());
    if let Some(stack) = context.config.dispatcher_stack_size {
        builder = builder.stack_size(stack);
    }
    builder.spawn(move || run(&context)).map_err(BleLogError::Spawn)
}

fn run(context: &LogContext) {
    let interval = context.config.housekeeping_interval();
    let mut next_tick = Instant::now() + interval;
    debug!(?interval, "blelog dispatcher started");
    loop {
        let timeout = next_tick.saturating_duration_since(Instant::now());
        match context.queue.receiver().recv_timeout(timeout) {
            Ok(RuntimeMessage::Transmit(buffer)) => transmit(context, buffer),
            Ok(RuntimeMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if Instant::now() >= next_tick {
            housekeeping(context);
            next_tick = Instant::now() + interval;
        }
    }
    info!("blelog dispatcher stopped");
}

/// 把缓冲交给外设传输；启动失败时租约已被丢弃，整块内容计为内部来源的丢失。
fn transmit(context: &LogContext, buffer: Arc<TransportBuffer>) {
    let id = buffer.id();
    let bytes = buffer.pos();
    if let Err(err) = context.transport.send(TransportLease::new(buffer)) {
        context.stats.record_transport_loss(bytes);
        warn!(buffer = id, bytes, error = %err, "transport refused buffer");
    }
}

/// 一个管理周期：信息帧、可选的时间同步帧、统计帧。
pub(crate) fn housekeeping(context: &LogContext) {
    if !context.is_enabled() {
        return;
    }
    let write =
        |payload: &[u8]| context.write_stamped(LogSource::Internal, ExecContext::Task, payload);
    write(&info_payload());
    if let Some(sync) = context.timestamp_sync.as_ref().filter(|sync| sync.is_enabled()) {
        write(&sync.info_update().to_payload());
    }
    context.stats.emit(write);
}

/// 信息帧负载。
pub(crate) fn info_payload() -> [u8; 2] {
    [InternalCode::Info.code(), LOG_VERSION]
}
