#![cfg(not(loom))]

//! 多线程压力测试：并发生产者、随机完成延迟与缓冲归属不变量。
//!
//! # 测试目标（Why）
//! - 同一来源的并发生产者拿到的序列号必须互不相同，且在同一块缓冲内严格递增；没有丢帧时它们恰好覆盖 `0..N`；
//! - 传输持有租约期间，对应缓冲的归属必须始终是 `Transport`；完成后回到 `Free` 且写游标归零；
//! - 三个任务上下文生产者同时写入时，两个原子槽位与一个兜底槽位足以容纳，不产生丢帧。
//!
//! # 结构安排（How）
//! - 生产者使用 std 线程与 `Barrier` 对齐起跑；
//! - 完成线程以 `rand` 生成的随机延迟模拟 DMA，并在完成前检查归属；
//! - 计数断言读取的是冲刷之前的统计，冲刷会清零计数。

use std::{
    collections::HashSet,
    sync::{
        Arc, Barrier,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use rand::Rng;

use blelog_core::{
    BleLogManager, BufferOwnership, ExecContext, LogBufferConfig, LogSource,
    test_stubs::{
        decode::decode_frames,
        transport::{DeferredTransport, RecordingTransport},
    },
};

fn quiet(config: LogBufferConfig) -> LogBufferConfig {
    config.with_housekeeping_interval(Duration::from_secs(3600))
}

/// 偶数号生产者走任务上下文，奇数号走中断上下文。
fn context_for(producer: usize) -> ExecContext {
    if producer % 2 == 0 {
        ExecContext::Task
    } else {
        ExecContext::Isr
    }
}

/// 并发写同一来源：序列号唯一且在每块缓冲内严格递增，写入帧数与解码帧数一致。
#[test]
fn concurrent_producers_get_unique_sequences() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 200;

    let transport = RecordingTransport::shared();
    let mut manager = BleLogManager::new(quiet(LogBufferConfig::default()), transport.clone());
    manager.init().expect("初始化");
    let manager = Arc::new(manager);
    let barrier = Arc::new(Barrier::new(PRODUCERS));

    let handles: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let ctx = context_for(producer);
                barrier.wait();
                let mut written = 0usize;
                for round in 0..PER_PRODUCER {
                    let data = [producer as u8, round as u8, 0, 0, 0, 0, 0, 0];
                    if manager.write(LogSource::Host, ctx, &data) {
                        written += 1;
                    }
                }
                written
            })
        })
        .collect();
    let written: usize = handles
        .into_iter()
        .map(|handle| handle.join().expect("生产者不应 panic"))
        .sum();

    let host = manager.statistics()[LogSource::Host.index()];
    assert_eq!(host.written_frames as usize, written);
    assert_eq!((host.written_frames + host.lost_frames) as usize, PRODUCERS * PER_PRODUCER);
    manager.flush();

    let sequences: Vec<u32> = decode_frames(&transport.sent_bytes())
        .into_iter()
        .filter(|frame| frame.source == LogSource::Host.code())
        .map(|frame| frame.sequence)
        .collect();
    assert_eq!(sequences.len(), written);
    let unique: HashSet<u32> = sequences.iter().copied().collect();
    assert_eq!(unique.len(), sequences.len(), "序列号不得重复");
    for (buffer_id, bytes) in transport.sends() {
        let in_buffer: Vec<u32> = decode_frames(&bytes)
            .into_iter()
            .filter(|frame| frame.source == LogSource::Host.code())
            .map(|frame| frame.sequence)
            .collect();
        assert!(
            in_buffer.windows(2).all(|pair| pair[0] < pair[1]),
            "缓冲 {buffer_id} 内的序列号必须严格递增：{in_buffer:?}"
        );
    }
    assert!(sequences.iter().all(|seq| (*seq as usize) < PRODUCERS * PER_PRODUCER));
    if host.lost_frames == 0 {
        let mut sorted = sequences;
        sorted.sort_unstable();
        assert_eq!(sorted, (0..(PRODUCERS * PER_PRODUCER) as u32).collect::<Vec<_>>());
    }
}

/// 三个任务上下文生产者同时写入，两原子槽位加一兜底槽位不产生丢帧。
#[test]
fn three_simultaneous_task_writers_lose_nothing() {
    let config = quiet(LogBufferConfig::default().with_slots(2, 1));
    let mut manager = BleLogManager::new(config, RecordingTransport::shared());
    manager.init().expect("初始化");
    let barrier = Barrier::new(3);

    thread::scope(|scope| {
        for _ in 0..3 {
            scope.spawn(|| {
                barrier.wait();
                assert!(manager.write(LogSource::Custom, ExecContext::Task, &[9; 32]));
            });
        }
    });
    let custom = manager.statistics()[LogSource::Custom.index()];
    assert_eq!(custom.written_frames, 3);
    assert_eq!(custom.lost_frames, 0);
}

/// 随机完成延迟下的归属不变量：租约存活期间缓冲恒为 `Transport`。
#[test]
fn ownership_is_exclusive_under_random_completion_latency() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 300;

    let config = quiet(LogBufferConfig::default().with_buffer_size(256));
    let transport = DeferredTransport::shared();
    let mut manager = BleLogManager::new(config, transport.clone());
    manager.init().expect("初始化");
    let stop = AtomicBool::new(false);
    let violations = parking_lot::Mutex::new(Vec::<String>::new());

    let (written, lost) = thread::scope(|scope| {
        let completer = scope.spawn(|| {
            let mut rng = rand::thread_rng();
            let mut completed = 0usize;
            loop {
                let leases = transport.take_pending();
                if leases.is_empty() && stop.load(Ordering::SeqCst) {
                    break completed;
                }
                for lease in leases {
                    let state = manager
                        .buffer_states()
                        .into_iter()
                        .find(|state| state.buffer_id == lease.buffer_id());
                    match state {
                        Some(state) if state.ownership == BufferOwnership::Transport => {}
                        other => violations
                            .lock()
                            .push(format!("buffer {} leased while {other:?}", lease.buffer_id())),
                    }
                    thread::sleep(Duration::from_micros(rng.gen_range(0..200)));
                    lease.complete();
                    completed += 1;
                }
                thread::sleep(Duration::from_micros(50));
            }
        });

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let manager = &manager;
                scope.spawn(move || {
                    let mut rng = rand::thread_rng();
                    let source = [
                        LogSource::Host,
                        LogSource::Hci,
                        LogSource::LinkLayerTask,
                        LogSource::Encode,
                    ][producer];
                    let ctx = context_for(producer);
                    for _ in 0..PER_PRODUCER {
                        let len = rng.gen_range(0..64);
                        manager.write(source, ctx, &vec![producer as u8; len]);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().expect("生产者不应 panic");
        }

        let stats = manager.statistics();
        let written: u32 = stats[1..].iter().map(|s| s.written_frames).sum();
        let lost: u32 = stats[1..].iter().map(|s| s.lost_frames).sum();
        manager.flush();
        stop.store(true, Ordering::SeqCst);
        assert!(completer.join().expect("完成线程不应 panic") > 0);
        (written, lost)
    });

    let violations = violations.into_inner();
    assert!(violations.is_empty(), "{violations:?}");
    assert_eq!((written + lost) as usize, PRODUCERS * PER_PRODUCER);
    assert!(
        manager
            .buffer_states()
            .iter()
            .all(|state| state.ownership == BufferOwnership::Free && state.pos == 0),
        "冲刷后所有缓冲都应空闲且清空"
    );
}
