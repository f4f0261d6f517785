//! 槽位锁纪律：以和类型表达“无锁 / 自旋 / 原子 CAS / 互斥”四种独占方式。
//!
//! # 教案式说明
//! - **意图 (Why)**：不同槽位的争用模型不同。原子槽位只做一次非阻塞 CAS，失败即换下一个；
//!   兜底槽位必须保证可得，因此阻塞等待；上游已串行化的来源则完全不需要锁。
//! - **逻辑 (How)**：[`SlotLock`] 的每个变体实现同一组 `try_acquire` / `acquire` 能力，
//!   返回的 [`SlotGuard`] 在 `Drop` 时释放，保证所有退出路径都会解锁。
//! - **契约 (What)**：同一时刻至多一个守卫存活（`None` 变体除外，它依赖调用方的上游串行化）。
//! - **权衡 (Trade-offs)**：`Mutex` 变体基于 `parking_lot`，会让等待线程休眠，
//!   只适合任务上下文；中断上下文应使用 `Spin` 或 `Atomic`。

use serde::{Deserialize, Serialize};

use crate::sync::{AtomicBool, Ordering, spin_hint};

/// 锁纪律标签，用于配置与诊断。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    /// 不加锁，调用方保证串行。
    None,
    /// 自旋锁。
    Spin,
    /// 单个原子标志上的 CAS。
    Atomic,
    /// 可休眠的互斥锁。
    Mutex,
}

/// 槽位锁的状态本体。
pub enum SlotLock {
    None,
    Spin(spin::Mutex<()>),
    Atomic(AtomicBool),
    Mutex(parking_lot::Mutex<()>),
}

impl SlotLock {
    /// 按标签创建处于释放状态的锁。
    pub fn new(kind: LockKind) -> Self {
        match kind {
            LockKind::None => Self::None,
            LockKind::Spin => Self::Spin(spin::Mutex::new(())),
            LockKind::Atomic => Self::Atomic(AtomicBool::new(false)),
            LockKind::Mutex => Self::Mutex(parking_lot::Mutex::new(())),
        }
    }

    /// 锁纪律标签。
    pub fn kind(&self) -> LockKind {
        match self {
            Self::None => LockKind::None,
            Self::Spin(_) => LockKind::Spin,
            Self::Atomic(_) => LockKind::Atomic,
            Self::Mutex(_) => LockKind::Mutex,
        }
    }

    /// 非阻塞获取，失败立即返回 `None`。
    pub fn try_acquire(&self) -> Option<SlotGuard<'_>> {
        match self {
            Self::None => Some(SlotGuard::Unlocked),
            Self::Spin(lock) => lock.try_lock().map(SlotGuard::Spin),
            Self::Atomic(flag) => flag
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .ok()
                .map(|_| SlotGuard::Atomic(flag)),
            Self::Mutex(lock) => lock.try_lock().map(SlotGuard::Mutex),
        }
    }

    /// 阻塞获取；`Atomic` 变体退化为 CAS 自旋。
    pub fn acquire(&self) -> SlotGuard<'_> {
        match self {
            Self::None => SlotGuard::Unlocked,
            Self::Spin(lock) => SlotGuard::Spin(lock.lock()),
            Self::Mutex(lock) => SlotGuard::Mutex(lock.lock()),
            Self::Atomic(flag) => loop {
                if flag
                    .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    break SlotGuard::Atomic(flag);
                }
                while flag.load(Ordering::Relaxed) {
                    spin_hint();
                }
            },
        }
    }

    /// 当前是否被持有；`None` 变体永远返回 `false`。
    pub fn is_locked(&self) -> bool {
        match self {
            Self::None => false,
            Self::Spin(lock) => lock.is_locked(),
            Self::Atomic(flag) => flag.load(Ordering::Relaxed),
            Self::Mutex(lock) => lock.is_locked(),
        }
    }
}

/// 槽位独占守卫，析构即释放。
#[must_use = "dropping the guard releases the slot immediately"]
pub enum SlotGuard<'a> {
    Unlocked,
    Spin(spin::MutexGuard<'a, ()>),
    Atomic(&'a AtomicBool),
    Mutex(parking_lot::MutexGuard<'a, ()>),
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let SlotGuard::Atomic(flag) = self {
            flag.store(false, Ordering::Release);
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn exclusive_variants_refuse_second_holder() {
        for kind in [LockKind::Spin, LockKind::Atomic, LockKind::Mutex] {
            let lock = SlotLock::new(kind);
            let guard = lock.try_acquire().expect("空闲锁必须可得");
            assert!(lock.is_locked(), "{kind:?} 持有期间应显示为已锁");
            assert!(lock.try_acquire().is_none(), "{kind:?} 不得被重复获取");
            drop(guard);
            assert!(!lock.is_locked());
            let _again = lock.acquire();
        }
    }

    #[test]
    fn none_variant_never_blocks() {
        let lock = SlotLock::new(LockKind::None);
        let _a = lock.acquire();
        let _b = lock.try_acquire().expect("无锁槽位总是可得");
        assert!(!lock.is_locked());
        assert_eq!(lock.kind(), LockKind::None);
    }
}
