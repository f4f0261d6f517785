//! 外设传输契约。
//!
//! # 契约声明
//! * **只定义接口**：具体总线驱动（UART-DMA、SPI-DMA 等）不在核心内实现；
//!   宿主侧参考实现见 `blelog-transport-io`，测试替身见 [`crate::test_stubs::transport`]。
//! * **异步完成**：`send` 只负责*启动*传输，数据搬运结束后由驱动在任意上下文（通常是完成中断）
//!   完成 [`TransportLease`]，这是缓冲重新可写的唯一途径。
//!
//! # 失败语义
//! * `send` 返回错误时租约已被丢弃，缓冲已回到空闲态；派发器据此把整块缓冲计为丢失。
//! * 永不完成租约的传输会饿死缓冲池；核心只在冲刷阶段以有界等待兜底。

use crate::{
    buffer::{TransportBuffer, TransportLease},
    error::TransportError,
};

/// 外设传输。
///
/// # 教案式说明
/// - **意图 (Why)**：把总线相关的缓冲分配与发送抽离成 trait，核心只依赖 `init / trans_init / send`
///   三组能力，换总线无需触碰缓冲管理逻辑。
/// - **契约 (What)**：
///   - `init(buffer_count)` 在任何 `trans_init` 之前调用一次；`deinit` 在全部 `trans_deinit` 之后调用；
///   - `trans_init(size)` 返回容量不小于 `size` 的缓冲，可通过 [`TransportBuffer::with_context`]
///     附加驱动私有数据；
///   - `send(lease)` 不得阻塞等待传输完成，且必须最终完成租约。
/// - **权衡 (Trade-offs)**：租约以值传递，驱动可以把它塞进自己的队列跨线程完成；
///   代价是驱动无法“归还未发送的租约”，放弃发送只能丢弃它。
pub trait PeripheralTransport: Send + Sync + 'static {
    /// 初始化总线资源，`buffer_count` 为随后将分配的缓冲总数。
    fn init(&self, buffer_count: usize) -> Result<(), TransportError>;

    /// 释放总线资源。
    fn deinit(&self);

    /// 分配一块传输缓冲。
    fn trans_init(&self, size: usize) -> Result<TransportBuffer, TransportError> {
        Ok(TransportBuffer::new(size))
    }

    /// 释放一块传输缓冲关联的驱动资源。
    fn trans_deinit(&self, _buffer: &TransportBuffer) {}

    /// 启动一次异步发送。
    fn send(&self, lease: TransportLease) -> Result<(), TransportError>;
}
