#![cfg(loom)]

//! 槽位锁与获取策略的 Loom 模型。
//!
//! 运行方式：`RUSTFLAGS="--cfg loom" cargo test -p blelog-core --test loom_slots --release`。
//! 原子类型经 crate 内的垫片替换为 Loom 实现，模型穷举的是真实代码路径。

use loom::{
    model,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use blelog_core::{
    ExecContext, LogBufferConfig, LogSource, SlotKind,
    lock::{LockKind, SlotLock},
    pool::SlotPool,
    test_stubs::transport::RecordingTransport,
};

#[test]
fn atomic_slot_lock_admits_one_holder() {
    //
    // 教案级说明：两个线程对同一原子槽位做非阻塞 CAS。
    // - **What**：任一时刻至多一个守卫存活；失败方拿到 `None` 而不是阻塞。
    model(|| {
        let lock = Arc::new(SlotLock::new(LockKind::Atomic));
        let inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    if let Some(_guard) = lock.try_acquire() {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0, "临界区内已有持有者");
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("线程不应 panic");
        }
        assert!(!lock.is_locked());
    });
}

#[test]
fn pool_routes_contending_task_writers_to_distinct_slots() {
    //
    // 教案级说明：一个任务原子槽位加一个任务兜底槽位，两个任务线程同时获取。
    // - **How**：每个线程持有句柄期间对命中的槽位计数，计数必须恒为 1；
    // - **What**：获取总能成功，且同一槽位不会被两个线程同时持有。
    model(|| {
        let config = LogBufferConfig::default()
            .with_slots(1, 0)
            .with_buffer_size(64)
            .with_dedicated_slots(false, 64);
        let transport = RecordingTransport::new();
        let pool = Arc::new(SlotPool::new(&config, &transport).expect("分配缓冲"));
        let atomic_holders = Arc::new(AtomicUsize::new(0));
        let fallback_holders = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let atomic_holders = Arc::clone(&atomic_holders);
                let fallback_holders = Arc::clone(&fallback_holders);
                thread::spawn(move || {
                    let handle = pool.acquire(LogSource::Host, ExecContext::Task);
                    let counter = match handle.kind() {
                        SlotKind::TaskAtomic(0) => &atomic_holders,
                        SlotKind::TaskFallback => &fallback_holders,
                        other => panic!("任务上下文不应命中 {other:?}"),
                    };
                    assert_eq!(counter.fetch_add(1, Ordering::SeqCst), 0);
                    counter.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("线程不应 panic");
        }
    });
}
