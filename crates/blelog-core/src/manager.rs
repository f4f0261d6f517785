//! 组合根：持有全部运行时状态并对外暴露控制面。
//!
//! # 模块定位（Why）
//! - 槽位池、统计、派发队列与开关都归属同一个 `LogContext`，由 [`BleLogManager`] 独占并以 `Arc`
//!   与派发线程共享，不存在进程级全局状态；同一进程可以并存多个相互隔离的日志实例。
//! - 写入、冲刷与转储都经过 `WriterGate` 计数，拆卸只在计数归零后继续。
//!
//! # 生命周期（How）
//! ```text
//! new ─▶ init ─▶ { enable / write / write_split / flush / dump / statistics }* ─▶ deinit | Drop
//! ```
//! - `init`：校验配置 → `transport.init` → 分配缓冲 → 启动派发线程 → 打开开关 → 写入初始化信息帧；
//! - `deinit`：关开关 → 等待写入者离场 → 冲出剩余数据 → 等待传输完成 → 关停派发线程 → 交还缓冲。
//!
//! # 并发契约（What）
//! - 写路径只在兜底槽位上可能阻塞，且阻塞不跨越任务 / 中断边界；
//! - 冲刷与转储彼此串行；两者都不得在派发线程或传输完成回调中调用。

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Instant,
};

use tracing::{debug, error, info};

use crate::{
    config::LogBufferConfig,
    console::{ConsoleSink, TracingConsole},
    error::{BleLogError, ConfigError, fatal_teardown_timeout},
    frame::frame_len,
    pool::{BufferState, SlotPool, WriteOutcome},
    runtime::{self, RuntimeQueue},
    source::{ExecContext, LogSource},
    stats::{SourceStatistics, StatisticsManager},
    sync::{AtomicBool, AtomicUsize, Ordering},
    timestamp::{SyncOutput, SystemTimestamp, TimestampSource, TimestampSync},
    transport::PeripheralTransport,
};

/// 活跃写入者计数。
pub(crate) struct WriterGate {
    active: AtomicUsize,
}

impl WriterGate {
    fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
        }
    }

    /// 登记一个写入者；返回的守卫析构时注销，错误路径同样覆盖。
    pub(crate) fn enter(&self) -> WriterRef<'_> {
        self.active.fetch_add(1, Ordering::SeqCst);
        WriterRef { gate: self }
    }

    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

pub(crate) struct WriterRef<'a> {
    gate: &'a WriterGate,
}

impl Drop for WriterRef<'_> {
    fn drop(&mut self) {
        self.gate.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 一个已初始化日志实例的全部共享状态。
pub(crate) struct LogContext {
    pub(crate) config: LogBufferConfig,
    pub(crate) transport: Arc<dyn PeripheralTransport>,
    pub(crate) clock: Arc<dyn TimestampSource>,
    pub(crate) timestamp_sync: Option<TimestampSync>,
    pub(crate) pool: SlotPool,
    pub(crate) stats: StatisticsManager,
    pub(crate) queue: RuntimeQueue,
    pub(crate) gate: WriterGate,
    enabled: AtomicBool,
    flush_lock: parking_lot::Mutex<()>,
}

impl LogContext {
    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// 带 4 字节毫秒时间戳前缀的写入。
    pub(crate) fn write_stamped(&self, source: LogSource, ctx: ExecContext, data: &[u8]) -> bool {
        let stamp = self.clock.os_millis().to_ne_bytes();
        self.write_parts(source, ctx, &[&stamp, data])
    }

    /// 写路径本体。
    ///
    /// # 教案式说明
    /// - **逻辑 (How)**：登记写入者 → 检查开关 → 消耗序列号 → 获取槽位 → 选缓冲写帧 → 记账；
    ///   先登记后检查开关，与冲刷“先关开关后数写入者”的顺序配对，保证冲刷不会漏看正在写的生产者。
    /// - **契约 (What)**：
    ///   - 关闭时直接返回 `false`，不触碰槽位与统计；
    ///   - 序列号在持有槽位期间分配，同一缓冲内的帧序号严格递增；丢帧在解码流中表现为序号缺口；
    ///   - 帧比缓冲本身还大属于编程错误：调试构建断言失败，发布构建计为丢帧。
    pub(crate) fn write_parts(&self, source: LogSource, ctx: ExecContext, parts: &[&[u8]]) -> bool {
        let _writer = self.gate.enter();
        if !self.is_enabled() {
            return false;
        }
        let payload_len: usize = parts.iter().map(|part| part.len()).sum();
        let bytes = frame_len(payload_len);
        let slot = self.pool.acquire(source, ctx);
        let sequence = self.stats.next_sequence(source);
        match slot.write_frame(source, sequence, parts, self.config.checksum_scope, &self.queue) {
            WriteOutcome::Written => {
                self.stats.update(source, bytes, false);
                true
            }
            WriteOutcome::Unavailable => {
                self.stats.update(source, bytes, true);
                false
            }
            WriteOutcome::TooLarge => {
                debug_assert!(
                    bytes <= slot.frame_capacity() && payload_len <= usize::from(u16::MAX),
                    "{bytes}-byte frame from {source:?} exceeds the capacity of slot {:?}",
                    slot.kind()
                );
                self.stats.update(source, bytes, true);
                false
            }
        }
    }

    /// 有界轮询，超时即致命终止。
    fn wait_until(&self, stage: &'static str, mut done: impl FnMut() -> bool) {
        let timeout = self.config.flush_timeout();
        let poll = self.config.flush_poll_interval();
        let start = Instant::now();
        while !done() {
            let waited = start.elapsed();
            if waited >= timeout {
                fatal_teardown_timeout(stage, waited);
            }
            thread::sleep(poll);
        }
    }

    /// 进入独占区：关闭开关并等待除自己以外的写入者离场，返回之前的开关状态。
    fn quiesce(&self) -> bool {
        let was_enabled = self.enabled.swap(false, Ordering::SeqCst);
        self.wait_until("active writers", || self.gate.active() <= 1);
        was_enabled
    }
}

/// BLE 日志缓冲管理器。
///
/// # 教案式说明
/// - **意图 (Why)**：把“多上下文生产者 → 固定缓冲池 → 单消费者 → 异步外设”这条链路收敛到一个句柄上，
///   调用方只需关心来源、上下文与字节。
/// - **逻辑 (How)**：构造时只记录协作者；[`Self::init`] 才分配资源并启动派发线程。
///   共享给多个生产者线程时可包在 `Arc` 中或借助 `thread::scope` 借用。
/// - **契约 (What)**：
///   - 未初始化时所有写入返回 `false`，控制面操作为空操作；
///   - `Drop` 等价于 [`Self::deinit`]；若在 panic 展开中析构，则跳过有界等待，只关停线程并交还缓冲。
/// - **权衡 (Trade-offs)**：派发线程使用操作系统默认优先级；需要实时优先级的平台应在
///   传输实现一侧处理。
pub struct BleLogManager {
    config: LogBufferConfig,
    transport: Arc<dyn PeripheralTransport>,
    clock: Arc<dyn TimestampSource>,
    sync_output: Option<Arc<dyn SyncOutput>>,
    console: Arc<dyn ConsoleSink>,
    context: Option<Arc<LogContext>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl BleLogManager {
    /// 以配置与外设传输创建未初始化的管理器。
    pub fn new(config: LogBufferConfig, transport: Arc<dyn PeripheralTransport>) -> Self {
        Self {
            config,
            transport,
            clock: Arc::new(SystemTimestamp::new()),
            sync_output: None,
            console: Arc::new(TracingConsole::default()),
            context: None,
            dispatcher: None,
        }
    }

    /// 替换时间源。
    pub fn with_clock(mut self, clock: Arc<dyn TimestampSource>) -> Self {
        self.clock = clock;
        self
    }

    /// 提供时间同步输出；配置中 `timestamp_sync = true` 时必需。
    pub fn with_sync_output(mut self, output: Arc<dyn SyncOutput>) -> Self {
        self.sync_output = Some(output);
        self
    }

    /// 替换转储输出。
    pub fn with_console(mut self, console: Arc<dyn ConsoleSink>) -> Self {
        self.console = console;
        self
    }

    /// 当前配置。
    pub fn config(&self) -> &LogBufferConfig {
        &self.config
    }

    /// 是否已初始化。
    pub fn is_initialized(&self) -> bool {
        self.context.is_some()
    }

    /// 分配资源、启动派发线程并打开写入开关；重复调用直接返回 `Ok`。
    ///
    /// 失败时已获取的资源按相反顺序交还，管理器保持未初始化。
    pub fn init(&mut self) -> Result<(), BleLogError> {
        if self.context.is_some() {
            return Ok(());
        }
        self.config.validate()?;
        let timestamp_sync = match (&self.sync_output, self.config.timestamp_sync) {
            (Some(output), _) => Some(TimestampSync::new(
                Arc::clone(output),
                Arc::clone(&self.clock),
            )),
            (None, true) => return Err(ConfigError::MissingSyncOutput.into()),
            (None, false) => None,
        };

        let buffer_count = self.config.buffer_count();
        self.transport.init(buffer_count)?;
        let pool = match SlotPool::new(&self.config, self.transport.as_ref()) {
            Ok(pool) => pool,
            Err(err) => {
                self.transport.deinit();
                return Err(err.into());
            }
        };

        let context = Arc::new(LogContext {
            config: self.config.clone(),
            transport: Arc::clone(&self.transport),
            clock: Arc::clone(&self.clock),
            timestamp_sync,
            pool,
            stats: StatisticsManager::new(self.config.enhanced_statistics),
            queue: RuntimeQueue::new(buffer_count + 1),
            gate: WriterGate::new(),
            enabled: AtomicBool::new(false),
            flush_lock: parking_lot::Mutex::new(()),
        });
        if let Some(sync) = &context.timestamp_sync {
            sync.reset(self.config.timestamp_sync);
        }

        let dispatcher = match runtime::spawn(Arc::clone(&context)) {
            Ok(handle) => handle,
            Err(err) => {
                context.pool.release(context.transport.as_ref());
                self.transport.deinit();
                return Err(err);
            }
        };

        context.enabled.store(true, Ordering::SeqCst);
        context.write_stamped(LogSource::Internal, ExecContext::Task, &runtime::info_payload());
        info!(
            buffers = buffer_count,
            buffer_size = self.config.buffer_size,
            timestamp_sync = self.config.timestamp_sync,
            "blelog initialized"
        );
        self.context = Some(context);
        self.dispatcher = Some(dispatcher);
        Ok(())
    }

    /// 有序拆卸：未发送的数据先冲出，再关停派发线程并交还缓冲。
    ///
    /// 有界等待超时为致命错误。
    pub fn deinit(&mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        let Some(context) = self.context.take() else {
            return;
        };
        context.enabled.store(false, Ordering::SeqCst);
        if thread::panicking() {
            error!("blelog torn down during unwinding, pending frames are discarded");
        } else {
            context.wait_until("active writers", || context.gate.active() == 0);
            let pending = context.pool.enqueue_pending(&context.queue);
            context.wait_until("transport completion", || !context.pool.any_transport_owned());
            debug!(pending, "blelog drained before teardown");
        }

        context.queue.shutdown();
        if let Some(handle) = self.dispatcher.take() {
            if handle.join().is_err() {
                error!("blelog dispatcher thread panicked");
            }
        }
        if let Some(sync) = &context.timestamp_sync {
            sync.reset(false);
        }
        context.pool.release(context.transport.as_ref());
        context.transport.deinit();
        info!("blelog deinitialized");
    }

    fn context(&self) -> Option<&LogContext> {
        self.context.as_deref()
    }

    /// 设置写入开关，返回之前的状态；不会中断已在传输中的缓冲。
    pub fn enable(&self, enable: bool) -> bool {
        match self.context() {
            Some(context) => {
                let previous = context.enabled.swap(enable, Ordering::SeqCst);
                debug!(enable, previous, "blelog enable switched");
                previous
            }
            None => false,
        }
    }

    /// 写入开关当前是否打开。
    pub fn is_enabled(&self) -> bool {
        self.context().is_some_and(LogContext::is_enabled)
    }

    /// 普通写入：负载前拼接 4 字节毫秒时间戳。
    ///
    /// 返回 `false` 表示本帧被丢弃（未初始化、已关闭或没有可用缓冲），丢帧计入统计。
    pub fn write(&self, source: LogSource, ctx: ExecContext, data: &[u8]) -> bool {
        self.context()
            .is_some_and(|context| context.write_stamped(source, ctx, data))
    }

    /// 分段写入：把两段字节拼成一帧负载，不加时间戳前缀。
    ///
    /// 供自带时间戳的链路层调用方使用（时间戳通常位于 `part_a`）。
    pub fn write_split(
        &self,
        source: LogSource,
        ctx: ExecContext,
        part_a: &[u8],
        part_b: &[u8],
    ) -> bool {
        self.context()
            .is_some_and(|context| context.write_parts(source, ctx, &[part_a, part_b]))
    }

    /// 冲刷：把所有已写入但未移交的缓冲交给传输，并等待传输全部完成。
    ///
    /// # 教案式说明
    /// - **逻辑 (How)**：记录并关闭开关 → 等待其他写入者离场 → 移交全部空闲非空缓冲 →
    ///   等待没有缓冲被传输持有 → 清零统计 → 恢复开关。
    /// - **契约 (What)**：
    ///   - 两个等待阶段均受 `flush_timeout` 约束，超时致命；
    ///   - 重复冲刷是幂等的：没有待发送数据时只清零统计，开关状态不变；
    ///   - 不得在派发线程或传输完成回调中调用。
    pub fn flush(&self) {
        let Some(context) = self.context() else {
            return;
        };
        let _serial = context.flush_lock.lock();
        let _writer = context.gate.enter();
        let was_enabled = context.quiesce();
        let queued = context.pool.enqueue_pending(&context.queue);
        context.wait_until("transport completion", || !context.pool.any_transport_owned());
        context.stats.reset();
        context.enabled.store(was_enabled, Ordering::SeqCst);
        debug!(queued, "blelog flushed");
    }

    /// 把所有未被传输持有的非空缓冲交给 [`ConsoleSink`] 输出，内容保持不变。
    pub fn dump_to_console(&self) {
        let Some(context) = self.context() else {
            return;
        };
        let _serial = context.flush_lock.lock();
        let _writer = context.gate.enter();
        let was_enabled = context.quiesce();

        let states = context.pool.states();
        self.console.begin(&states);
        for (state, buffer) in states.iter().zip(context.pool.buffers()) {
            if !buffer.is_transport_owned() && !buffer.is_empty() {
                self.console.dump_buffer(state, &buffer.snapshot());
            }
        }
        self.console.end();

        context.enabled.store(was_enabled, Ordering::SeqCst);
    }

    /// 读取并清零全部来源的统计。
    pub fn read_and_clear_statistics(&self) -> Vec<SourceStatistics> {
        self.context()
            .map(|context| context.stats.take())
            .unwrap_or_default()
    }

    /// 非破坏性读取全部来源的统计。
    pub fn statistics(&self) -> Vec<SourceStatistics> {
        self.context()
            .map(|context| context.stats.snapshot())
            .unwrap_or_default()
    }

    /// 每块缓冲的诊断快照。
    pub fn buffer_states(&self) -> Vec<BufferState> {
        self.context()
            .map(|context| context.pool.states())
            .unwrap_or_default()
    }
}

impl Drop for BleLogManager {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use std::time::Duration;

    use tracing_test::traced_test;

    use super::*;
    use crate::buffer::BufferOwnership;
    use crate::frame::TIMESTAMP_LEN;
    use crate::test_stubs::{
        clock::ManualClock,
        decode::decode_frames,
        sync_output::RecordingSyncOutput,
        transport::{FailingTransport, RecordingTransport},
    };

    fn quiet_config() -> LogBufferConfig {
        LogBufferConfig::default().with_housekeeping_interval(Duration::from_secs(3600))
    }

    #[test]
    fn writer_gate_counts_nested_guards() {
        let gate = WriterGate::new();
        {
            let _a = gate.enter();
            let _b = gate.enter();
            assert_eq!(gate.active(), 2);
        }
        assert_eq!(gate.active(), 0);
    }

    #[test]
    fn uninitialized_manager_rejects_everything() {
        let manager = BleLogManager::new(quiet_config(), RecordingTransport::shared());
        assert!(!manager.is_initialized());
        assert!(!manager.write(LogSource::Host, ExecContext::Task, b"x"));
        assert!(!manager.enable(true));
        manager.flush();
        assert!(manager.statistics().is_empty());
        assert!(manager.buffer_states().is_empty());
    }

    #[test]
    fn missing_sync_output_is_a_config_error() {
        let config = quiet_config().with_timestamp_sync(true);
        let mut manager = BleLogManager::new(config, RecordingTransport::shared());
        let err = manager.init().expect_err("缺少同步输出时必须拒绝初始化");
        assert!(matches!(err, BleLogError::Config(ConfigError::MissingSyncOutput)));
        assert!(!manager.is_initialized());
    }

    #[traced_test]
    #[test]
    fn init_writes_info_frame_and_logs() {
        let transport = RecordingTransport::shared();
        let clock = Arc::new(ManualClock::new());
        clock.advance_millis(42);
        let mut manager = BleLogManager::new(quiet_config(), transport.clone()).with_clock(clock);
        manager.init().expect("默认配置必须初始化成功");
        assert!(logs_contain("blelog initialized"));

        manager.flush();
        let frames = decode_frames(&transport.sent_bytes());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].source, LogSource::Internal.code());
        assert_eq!(frames[0].timestamp(), Some(42));
        assert_eq!(&frames[0].payload[TIMESTAMP_LEN..], &runtime::info_payload());

        manager.deinit();
        assert!(transport.is_deinitialized());
        assert!(logs_contain("blelog deinitialized"));
    }

    #[test]
    fn failed_send_is_counted_as_internal_loss() {
        let transport = Arc::new(FailingTransport::new());
        let mut manager = BleLogManager::new(quiet_config(), transport.clone());
        manager.init().expect("初始化不依赖 send");
        assert!(manager.write(LogSource::Host, ExecContext::Task, &[7; 8]));
        manager.flush();
        assert!(transport.attempts() >= 1);
        assert!(
            manager
                .buffer_states()
                .iter()
                .all(|state| state.pos == 0 && state.ownership == BufferOwnership::Free),
            "发送失败的缓冲必须回到空闲态"
        );
    }

    #[test]
    fn housekeeping_emits_sync_and_statistics_frames() {
        let transport = RecordingTransport::shared();
        let output = Arc::new(RecordingSyncOutput::default());
        let config = quiet_config().with_timestamp_sync(true);
        let mut manager =
            BleLogManager::new(config, transport.clone()).with_sync_output(output.clone());
        manager.init().expect("提供同步输出后初始化成功");

        let context = manager.context().expect("已初始化");
        runtime::housekeeping(context);
        manager.flush();

        let frames = decode_frames(&transport.sent_bytes());
        let internal_codes: Vec<u8> = frames
            .iter()
            .filter(|frame| frame.source == LogSource::Internal.code())
            .map(|frame| frame.payload[TIMESTAMP_LEN])
            .collect();
        // 初始化信息帧 + 周期信息帧 + 时间同步帧 + 每个来源一帧统计
        assert_eq!(internal_codes.len(), 3 + LogSource::COUNT);
        assert_eq!(&internal_codes[..3], &[0, 0, 1]);
        assert!(internal_codes[3..].iter().all(|code| *code == 2));
        assert_eq!(output.levels(), vec![false, true]);
    }
}
