//! 按来源维护的序列号与写入 / 丢失计数。
//!
//! # 模块角色（Why）
//! - 序列号写进每帧的 `meta` 高 24 位，离线工具据此发现缺口并恢复单一来源内的顺序；
//! - 写入 / 丢失计数是拥塞的唯一可见信号：热路径上的获取失败从不报错，只在这里记账。
//!
//! # 核心机制（How）
//! - 每个来源一条 [`SourceRecord`]，全部字段为原子整数，生产者在任意上下文中无锁更新；
//! - 序列号在尝试写入时即被消耗（包括随后丢失的帧），因此丢帧会在解码流中表现为序号缺口；
//! - `reset` 只清零计数器，序列号作为来源身份的一部分保持单调。
//!
//! # 契约说明（What）
//! - `enhanced == false` 时计数器保持为 0，`emit` 不产生任何帧，序列号照常递增；
//! - 所有读数都是逐字段的原子快照，跨字段之间不保证同一时刻。

use serde::{Deserialize, Serialize};

use crate::{
    frame::SEQUENCE_MASK,
    source::{InternalCode, LogSource},
    sync::{AtomicU32, Ordering},
};

/// 统计帧负载长度：内部码 + 来源码 + 4 个 `u32` 计数。
pub const STATISTICS_PAYLOAD_LEN: usize = 2 + 4 * 4;

/// 单个来源的统计读数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStatistics {
    pub source: u8,
    pub written_frames: u32,
    pub lost_frames: u32,
    pub written_bytes: u32,
    pub lost_bytes: u32,
}

impl SourceStatistics {
    /// 所有计数是否为零。
    pub fn is_zero(&self) -> bool {
        self.written_frames == 0
            && self.lost_frames == 0
            && self.written_bytes == 0
            && self.lost_bytes == 0
    }

    /// 序列化为统计帧负载。
    pub fn to_payload(&self) -> [u8; STATISTICS_PAYLOAD_LEN] {
        let mut out = [0u8; STATISTICS_PAYLOAD_LEN];
        out[0] = InternalCode::Statistics.code();
        out[1] = self.source;
        out[2..6].copy_from_slice(&self.written_frames.to_ne_bytes());
        out[6..10].copy_from_slice(&self.lost_frames.to_ne_bytes());
        out[10..14].copy_from_slice(&self.written_bytes.to_ne_bytes());
        out[14..18].copy_from_slice(&self.lost_bytes.to_ne_bytes());
        out
    }
}

struct SourceRecord {
    sequence: AtomicU32,
    written_frames: AtomicU32,
    lost_frames: AtomicU32,
    written_bytes: AtomicU32,
    lost_bytes: AtomicU32,
}

impl SourceRecord {
    fn new() -> Self {
        Self {
            sequence: AtomicU32::new(0),
            written_frames: AtomicU32::new(0),
            lost_frames: AtomicU32::new(0),
            written_bytes: AtomicU32::new(0),
            lost_bytes: AtomicU32::new(0),
        }
    }

    fn read(&self, source: LogSource) -> SourceStatistics {
        SourceStatistics {
            source: source.code(),
            written_frames: self.written_frames.load(Ordering::Relaxed),
            lost_frames: self.lost_frames.load(Ordering::Relaxed),
            written_bytes: self.written_bytes.load(Ordering::Relaxed),
            lost_bytes: self.lost_bytes.load(Ordering::Relaxed),
        }
    }

    fn take(&self, source: LogSource) -> SourceStatistics {
        SourceStatistics {
            source: source.code(),
            written_frames: self.written_frames.swap(0, Ordering::Relaxed),
            lost_frames: self.lost_frames.swap(0, Ordering::Relaxed),
            written_bytes: self.written_bytes.swap(0, Ordering::Relaxed),
            lost_bytes: self.lost_bytes.swap(0, Ordering::Relaxed),
        }
    }

    fn clear(&self) {
        self.written_frames.store(0, Ordering::Relaxed);
        self.lost_frames.store(0, Ordering::Relaxed);
        self.written_bytes.store(0, Ordering::Relaxed);
        self.lost_bytes.store(0, Ordering::Relaxed);
    }
}

/// 统计管理器。
pub struct StatisticsManager {
    enhanced: bool,
    records: [SourceRecord; LogSource::COUNT],
}

impl StatisticsManager {
    /// 创建全部为零的统计表。
    pub fn new(enhanced: bool) -> Self {
        Self {
            enhanced,
            records: std::array::from_fn(|_| SourceRecord::new()),
        }
    }

    /// 是否维护写入 / 丢失计数。
    pub fn is_enhanced(&self) -> bool {
        self.enhanced
    }

    /// 取出来源的下一个序列号，在 24 位处回绕。
    ///
    /// `u32` 计数器本身在 2^32 处回绕，而 2^32 是 2^24 的整数倍，
    /// 因此掩码后的序列在回绕点依旧连续。
    #[inline]
    pub fn next_sequence(&self, source: LogSource) -> u32 {
        self.records[source.index()].sequence.fetch_add(1, Ordering::Relaxed) & SEQUENCE_MASK
    }

    /// 记录一次写入或丢失。
    #[inline]
    pub fn update(&self, source: LogSource, bytes: usize, lost: bool) {
        if !self.enhanced {
            return;
        }
        let record = &self.records[source.index()];
        let bytes = bytes as u32;
        if lost {
            record.lost_frames.fetch_add(1, Ordering::Relaxed);
            record.lost_bytes.fetch_add(bytes, Ordering::Relaxed);
        } else {
            record.written_frames.fetch_add(1, Ordering::Relaxed);
            record.written_bytes.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    /// 发送失败的缓冲整体计入内部来源的丢失。
    pub fn record_transport_loss(&self, bytes: usize) {
        self.update(LogSource::Internal, bytes, true);
    }

    /// 清零所有计数，保留序列号。
    pub fn reset(&self) {
        for record in &self.records {
            record.clear();
        }
    }

    /// 非破坏性读取全部来源。
    pub fn snapshot(&self) -> Vec<SourceStatistics> {
        LogSource::ALL
            .iter()
            .zip(&self.records)
            .map(|(source, record)| record.read(*source))
            .collect()
    }

    /// 读取并清零全部来源。
    pub fn take(&self) -> Vec<SourceStatistics> {
        LogSource::ALL
            .iter()
            .zip(&self.records)
            .map(|(source, record)| record.take(*source))
            .collect()
    }

    /// 把每个来源的当前读数交给 `write` 序列化为统计帧负载。
    ///
    /// - **契约 (What)**：`write` 通常是写路径本身，返回是否写入成功；
    ///   这里先读取再写入，因此统计帧自身计入的内部来源字节要到下一个周期才体现。
    /// - 返回成功写入的帧数。
    pub fn emit(&self, mut write: impl FnMut(&[u8]) -> bool) -> usize {
        if !self.enhanced {
            return 0;
        }
        let mut emitted = 0;
        for (source, record) in LogSource::ALL.iter().zip(&self.records) {
            let payload = record.read(*source).to_payload();
            if write(&payload) {
                emitted += 1;
            }
        }
        emitted
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn sequence_wraps_at_wire_width() {
        let stats = StatisticsManager::new(true);
        stats.records[LogSource::Host.index()]
            .sequence
            .store(SEQUENCE_MASK, Ordering::Relaxed);
        assert_eq!(stats.next_sequence(LogSource::Host), SEQUENCE_MASK);
        assert_eq!(stats.next_sequence(LogSource::Host), 0);
        assert_eq!(stats.next_sequence(LogSource::Custom), 0);
    }

    #[test]
    fn reset_preserves_sequence() {
        let stats = StatisticsManager::new(true);
        stats.next_sequence(LogSource::Hci);
        stats.update(LogSource::Hci, 12, false);
        stats.update(LogSource::Hci, 30, true);
        stats.reset();
        assert!(stats.snapshot().iter().all(SourceStatistics::is_zero));
        assert_eq!(stats.next_sequence(LogSource::Hci), 1);
    }

    #[test]
    fn basic_mode_keeps_counters_at_zero() {
        let stats = StatisticsManager::new(false);
        stats.update(LogSource::Host, 10, false);
        assert!(stats.snapshot().iter().all(SourceStatistics::is_zero));
        assert_eq!(stats.emit(|_| true), 0);
    }

    #[test]
    fn take_clears_and_emit_serializes_every_source() {
        let stats = StatisticsManager::new(true);
        stats.update(LogSource::Encode, 20, false);
        stats.record_transport_loss(64);

        let mut payloads = Vec::new();
        let emitted = stats.emit(|payload| {
            payloads.push(payload.to_vec());
            true
        });
        assert_eq!(emitted, LogSource::COUNT);
        let encode = &payloads[LogSource::Encode.index()];
        assert_eq!(encode[0], InternalCode::Statistics.code());
        assert_eq!(encode[1], LogSource::Encode.code());
        assert_eq!(&encode[2..6], &1u32.to_ne_bytes());
        assert_eq!(&encode[10..14], &20u32.to_ne_bytes());

        let taken = stats.take();
        assert_eq!(taken[LogSource::Internal.index()].lost_bytes, 64);
        assert!(stats.snapshot().iter().all(SourceStatistics::is_zero));
    }
}
