//! 设备热插拔事件源
//!
//! 内核事件订阅的边界抽象。热插拔通知线程消费该事件源，并且只
//! 调用设备注册表的公开 attach/detach 入口，从不直接接触设备
//! 记录。

use crate::ChannelError;
use std::time::Duration;

/// 热插拔动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugAction {
    /// 设备接入
    Attach,
    /// 设备拔出
    Detach,
}

/// 一次热插拔事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotplugEvent {
    /// 发生变化的物理设备 ID
    pub device_id: u32,
    /// 接入还是拔出
    pub action: HotplugAction,
}

/// 热插拔事件订阅
pub trait HotplugSource: Send {
    /// 有界等待下一个事件
    ///
    /// `Ok(None)` 表示超时（调用方借此检查关停标志）；
    /// `Err(Closed)` 表示事件源已关闭，通知线程应退出。
    fn recv_event(&mut self, timeout: Duration) -> Result<Option<HotplugEvent>, ChannelError>;
}
