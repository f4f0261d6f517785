//! 帧编解码：`header | payload | tail` 的最小线上格式。
//!
//! ```text
//! Header: length:u16   负载字节数
//!         meta:u32     source_code[7:0] | sequence[31:8]
//! Payload: length 字节（普通写入：4 字节毫秒时间戳 + 调用方数据）
//! Tail:    checksum:u32
//! ```
//!
//! 所有多字节字段使用本机字节序，帧头紧凑排列无填充。
//! 解码由离线工具完成；本 crate 只在 [`crate::test_stubs::decode`] 中为测试提供一个参考解码器。

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{error::FrameError, source::LogSource};

/// 帧头字节数：`u16` 长度 + `u32` 元数据。
pub const HEADER_LEN: usize = 2 + 4;

/// 帧尾字节数：`u32` 校验和。
pub const TAIL_LEN: usize = 4;

/// 每帧固定开销。
pub const FRAME_OVERHEAD: usize = HEADER_LEN + TAIL_LEN;

/// 普通写入在负载前拼接的毫秒时间戳长度。
pub const TIMESTAMP_LEN: usize = 4;

/// 序列号在 `meta` 中占用的位宽。
pub const SEQUENCE_BITS: u32 = 24;

/// 序列号掩码，计数器在此处回绕。
pub const SEQUENCE_MASK: u32 = (1 << SEQUENCE_BITS) - 1;

/// 校验和覆盖范围。
///
/// - `HeaderOnly`：只覆盖 6 字节帧头，编码开销与负载长度无关，是默认值；
/// - `HeaderAndPayload`：额外覆盖负载，代价是每字节一次加法。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumScope {
    #[default]
    HeaderOnly,
    HeaderAndPayload,
}

/// 解析后的帧头。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u16,
    pub meta: u32,
}

impl FrameHeader {
    /// 以来源与序列号构造帧头，序列号截断到 24 位。
    pub fn new(source: LogSource, sequence: u32, length: u16) -> Self {
        Self {
            length,
            meta: u32::from(source.code()) | ((sequence & SEQUENCE_MASK) << 8),
        }
    }

    /// 来源码。
    pub fn source_code(&self) -> u8 {
        (self.meta & 0xFF) as u8
    }

    /// 24 位序列号。
    pub fn sequence(&self) -> u32 {
        self.meta >> 8
    }

    /// 按线上布局序列化。
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..2].copy_from_slice(&self.length.to_ne_bytes());
        out[2..].copy_from_slice(&self.meta.to_ne_bytes());
        out
    }

    /// 从线上布局还原。
    pub fn from_bytes(raw: &[u8; HEADER_LEN]) -> Self {
        Self {
            length: u16::from_ne_bytes([raw[0], raw[1]]),
            meta: u32::from_ne_bytes([raw[2], raw[3], raw[4], raw[5]]),
        }
    }
}

/// 快速非密码学校验和：覆盖字节的 32 位回绕累加。
///
/// 选择累加而非 CRC 是为了让中断上下文中的编码成本保持在每字节一次加法；
/// 它只用于发现截断与错位，不承担完整性保护。
#[inline]
pub fn checksum(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |acc, byte| acc.wrapping_add(u32::from(*byte)))
}

/// 给定负载长度时整帧占用的字节数。
#[inline]
pub const fn frame_len(payload_len: usize) -> usize {
    payload_len + FRAME_OVERHEAD
}

/// 将一帧追加到 `dst` 末尾。
///
/// # 教案式说明
/// - **意图 (Why)**：`parts` 允许把时间戳前缀与调用方数据拼成一个负载而无需中间拷贝。
/// - **逻辑 (How)**：先检查 `limit - dst.len()` 是否容得下整帧，随后依次写帧头、各段负载，
///   最后按 `scope` 对刚写入的字节求校验和并写入帧尾。
/// - **契约 (What)**：
///   - `limit` 为缓冲的逻辑容量，调用方保证 `dst` 的底层分配不小于它，因此写入不会触发扩容；
///   - 成功时返回新的写游标（即 `dst.len()`）；
///   - 失败时 `dst` 保持原样。
pub fn encode(
    dst: &mut BytesMut,
    limit: usize,
    source: LogSource,
    sequence: u32,
    parts: &[&[u8]],
    scope: ChecksumScope,
) -> Result<usize, FrameError> {
    let payload_len: usize = parts.iter().map(|part| part.len()).sum();
    let length = u16::try_from(payload_len)
        .map_err(|_| FrameError::PayloadTooLong { len: payload_len })?;
    let needed = frame_len(payload_len);
    let available = limit.saturating_sub(dst.len());
    if needed > available {
        return Err(FrameError::InsufficientSpace { needed, available });
    }

    let start = dst.len();
    let header = FrameHeader::new(source, sequence, length);
    dst.put_slice(&header.to_bytes());
    for part in parts {
        dst.put_slice(part);
    }
    let sum = match scope {
        ChecksumScope::HeaderOnly => checksum(&dst[start..start + HEADER_LEN]),
        ChecksumScope::HeaderAndPayload => checksum(&dst[start..]),
    };
    dst.put_slice(&sum.to_ne_bytes());
    Ok(dst.len())
}
