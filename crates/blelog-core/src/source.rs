//! 日志来源与执行上下文的封闭枚举。

use serde::{Deserialize, Serialize};

/// 日志记录的逻辑来源，编码进帧头 `meta` 的低 8 位。
///
/// # 教案式说明
/// - **意图 (Why)**：离线解码工具按来源拆分数据流并校验序列号连续性；
///   统计内存与来源数量线性相关，因此枚举刻意保持精简。
/// - **契约 (What)**：判别值即线上编码，新增变体只能追加在末尾，且需同步更新 [`LogSource::ALL`]。
/// - **权衡 (Trade-offs)**：使用封闭枚举而非开放整数，调用方无法携带自定义来源码，
///   换来统计数组可以按索引直接寻址。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum LogSource {
    /// 子系统自身产生的管理帧（信息帧、时间同步帧、统计帧）。
    Internal = 0,
    /// 应用自定义来源。
    Custom = 1,
    /// 链路层任务路径。
    LinkLayerTask = 2,
    /// 链路层 HCI 路径。
    LinkLayerHci = 3,
    /// 链路层中断路径。
    LinkLayerIsr = 4,
    /// 主机协议栈。
    Host = 5,
    /// HCI 传输层。
    Hci = 6,
    /// 编码后的紧凑日志。
    Encode = 7,
}

impl LogSource {
    /// 来源总数，用于预分配统计数组。
    pub const COUNT: usize = 8;

    /// 全部来源，顺序与判别值一致。
    pub const ALL: [LogSource; Self::COUNT] = [
        LogSource::Internal,
        LogSource::Custom,
        LogSource::LinkLayerTask,
        LogSource::LinkLayerHci,
        LogSource::LinkLayerIsr,
        LogSource::Host,
        LogSource::Hci,
        LogSource::Encode,
    ];

    /// 线上来源码。
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// 统计数组下标。
    pub const fn index(self) -> usize {
        self as usize
    }

    /// 由来源码还原枚举，未知码返回 `None`。
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }
}

/// 调用方声明的执行上下文。
///
/// - **意图 (Why)**：槽位池按上下文分区，任务与中断永不争用同一把自旋锁，
///   从结构上杜绝两者之间的优先级反转。
/// - **契约 (What)**：调用方必须如实声明；在中断上下文中声明 `Task`
///   可能让中断自旋等待一个被它抢占的任务。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecContext {
    /// 可抢占的任务上下文。
    Task,
    /// 不可抢占的中断上下文。
    Isr,
}

/// 内部帧负载的首字节，区分管理帧种类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InternalCode {
    /// 版本信息帧，初始化完成时与每个管理周期各发一次。
    Info = 0,
    /// 时间同步帧。
    TimestampSync = 1,
    /// 单个来源的统计帧。
    Statistics = 2,
}

impl InternalCode {
    /// 线上编码。
    pub const fn code(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_all() {
        for (idx, source) in LogSource::ALL.iter().enumerate() {
            assert_eq!(source.index(), idx);
            assert_eq!(LogSource::from_code(source.code()), Some(*source));
        }
        assert_eq!(LogSource::from_code(LogSource::COUNT as u8), None);
    }
}
