//! 测试替身集合：传输、时钟、同步输出、转储输出与参考解码器。
//!
//! # 设计定位（Why）
//! - 单元测试、集成测试与基准都需要满足 [`crate::transport::PeripheralTransport`] 等契约，
//!   但关注点各不相同：有的只要字节落地，有的要手动控制完成时机，有的要模拟总线故障；
//! - 集中在一个公开模块里，接口调整时各测试获得统一的编译错误提示，而不是各自复制一份桩。
//!
//! # 使用方式（How）
//! - `use blelog_core::test_stubs::transport::RecordingTransport;` 等按需引入；
//! - [`decode::decode_frames`] 是唯一的帧解码实现，供断言线上格式使用。
//!
//! # 契约说明（What）
//! - 这些类型只用于测试与基准，生产代码不应依赖；
//! - 所有记录型替身内部使用 `parking_lot::Mutex`，可在任意线程上调用。

pub mod decode;
pub mod transport;

pub mod clock {
    //! 手动推进的时间源。

    use std::sync::atomic::{AtomicU64, Ordering};

    use crate::timestamp::TimestampSource;

    /// 以微秒为单位手动推进的时钟；OS tick 为 1 kHz。
    #[derive(Debug, Default)]
    pub struct ManualClock {
        micros: AtomicU64,
    }

    impl ManualClock {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn advance_micros(&self, micros: u64) {
            self.micros.fetch_add(micros, Ordering::SeqCst);
        }

        pub fn advance_millis(&self, millis: u64) {
            self.advance_micros(millis * 1000);
        }

        pub fn set_micros(&self, micros: u64) {
            self.micros.store(micros, Ordering::SeqCst);
        }

        fn now(&self) -> u64 {
            self.micros.load(Ordering::SeqCst)
        }
    }

    impl TimestampSource for ManualClock {
        fn os_millis(&self) -> u32 {
            (self.now() / 1000) as u32
        }

        fn low_level_ticks(&self) -> u32 {
            self.now() as u32
        }

        fn hr_timer_us(&self) -> u64 {
            self.now()
        }

        fn os_ticks(&self) -> u32 {
            (self.now() / 1000) as u32
        }
    }
}

pub mod sync_output {
    //! 记录电平变化的同步输出。

    use parking_lot::Mutex;

    use crate::timestamp::SyncOutput;

    #[derive(Debug, Default)]
    pub struct RecordingSyncOutput {
        levels: Mutex<Vec<bool>>,
    }

    impl RecordingSyncOutput {
        /// 按时间顺序返回每次设置的电平。
        pub fn levels(&self) -> Vec<bool> {
            self.levels.lock().clone()
        }
    }

    impl SyncOutput for RecordingSyncOutput {
        fn set_level(&self, high: bool) {
            self.levels.lock().push(high);
        }
    }
}

pub mod console {
    //! 记录转储内容的输出。

    use parking_lot::Mutex;

    use crate::{console::ConsoleSink, pool::BufferState};

    #[derive(Debug, Default)]
    pub struct RecordingConsole {
        sessions: Mutex<usize>,
        dumps: Mutex<Vec<(BufferState, Vec<u8>)>>,
    }

    impl RecordingConsole {
        /// 已完成的转储次数。
        pub fn sessions(&self) -> usize {
            *self.sessions.lock()
        }

        /// 全部被转储的缓冲与内容。
        pub fn dumps(&self) -> Vec<(BufferState, Vec<u8>)> {
            self.dumps.lock().clone()
        }
    }

    impl ConsoleSink for RecordingConsole {
        fn dump_buffer(&self, state: &BufferState, bytes: &[u8]) {
            self.dumps.lock().push((*state, bytes.to_vec()));
        }

        fn end(&self) {
            *self.sessions.lock() += 1;
        }
    }
}
