//! 参考解码器：把传输收到的字节流还原成帧。
//!
//! 生产环境的解码由离线工具完成；这里的实现只服务于断言，遇到截断的尾部即停止。

use crate::frame::{ChecksumScope, FrameHeader, HEADER_LEN, TAIL_LEN, TIMESTAMP_LEN, checksum};

/// 一个已解码的帧。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedFrame {
    pub header: FrameHeader,
    pub source: u8,
    pub sequence: u32,
    pub payload: Vec<u8>,
    pub checksum: u32,
}

impl DecodedFrame {
    /// 普通写入的毫秒时间戳前缀；负载不足 4 字节时为 `None`。
    pub fn timestamp(&self) -> Option<u32> {
        let raw: [u8; TIMESTAMP_LEN] = self.payload.get(..TIMESTAMP_LEN)?.try_into().ok()?;
        Some(u32::from_ne_bytes(raw))
    }

    /// 去掉时间戳前缀后的调用方数据。
    pub fn body(&self) -> &[u8] {
        self.payload.get(TIMESTAMP_LEN..).unwrap_or_default()
    }

    /// 按覆盖范围校验帧尾。
    pub fn verify(&self, scope: ChecksumScope) -> bool {
        let header = checksum(&self.header.to_bytes());
        let expected = match scope {
            ChecksumScope::HeaderOnly => header,
            ChecksumScope::HeaderAndPayload => header.wrapping_add(checksum(&self.payload)),
        };
        expected == self.checksum
    }
}

/// 顺序解码字节流中的全部完整帧。
pub fn decode_frames(mut bytes: &[u8]) -> Vec<DecodedFrame> {
    let mut frames = Vec::new();
    while bytes.len() >= HEADER_LEN {
        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&bytes[..HEADER_LEN]);
        let header = FrameHeader::from_bytes(&raw);
        let payload_end = HEADER_LEN + usize::from(header.length);
        let frame_end = payload_end + TAIL_LEN;
        if bytes.len() < frame_end {
            break;
        }
        let mut tail = [0u8; TAIL_LEN];
        tail.copy_from_slice(&bytes[payload_end..frame_end]);
        frames.push(DecodedFrame {
            header,
            source: header.source_code(),
            sequence: header.sequence(),
            payload: bytes[HEADER_LEN..payload_end].to_vec(),
            checksum: u32::from_ne_bytes(tail),
        });
        bytes = &bytes[frame_end..];
    }
    frames
}
