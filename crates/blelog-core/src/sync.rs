//! 原子类型垫片：常规构建走 `core::sync::atomic`，`cfg(loom)` 下换成 Loom 的可建模实现。
//!
//! 槽位锁与缓冲所有权状态机只通过这里取原子类型，
//! 这样 `tests/loom_slots.rs` 可以直接穷举真实代码路径而不是复制一份模型。

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicUsize, Ordering};

#[cfg(not(loom))]
pub(crate) use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicUsize, Ordering};

/// 忙等循环里的让步点；Loom 需要显式让出以便探索交错。
#[inline]
pub(crate) fn spin_hint() {
    #[cfg(loom)]
    loom::thread::yield_now();
    #[cfg(not(loom))]
    core::hint::spin_loop();
}
