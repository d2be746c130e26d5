//! 设备驻留消息通道
//!
//! 对厂商消息传递驱动的抽象：每个物理设备一个逻辑 server，
//! server 上可建立多个会话。厂商驱动只在 [`MessageDriver`] /
//! [`RawServer`] / [`RawSession`] 三个 trait 的边界上出现，
//! 守护进程核心不感知具体驱动。
//!
//! 会话 ID 从有界池中分配，会话结束（drop）时归还。池耗尽时
//! 拒绝新会话而不是增长。

use crate::{ChannelError, ChannelKind, ControlSession};
use devc_protocol::Packet;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// 单个设备 server 允许的最大并发会话数
pub const MAX_SESSIONS_PER_SERVER: u32 = 256;

/// 厂商消息传递驱动的入口
pub trait MessageDriver: Send + Sync {
    /// 枚举当前在位的设备
    fn enumerate(&self) -> Vec<u32>;

    /// 为设备创建消息 server
    ///
    /// 设备尚未就绪时返回 [`ChannelError::NotReady`]，调用方按
    /// 重试策略退避重试，首次失败不视为永久失败。
    fn create_server(&self, device_id: u32) -> Result<Box<dyn RawServer>, ChannelError>;
}

/// 驱动层的设备 server 句柄
pub trait RawServer: Send + Sync {
    /// 有界等待接受一个会话
    ///
    /// `Ok(None)` 表示超时；server 被 [`shutdown`](RawServer::shutdown)
    /// 后返回 [`ChannelError::Closed`]。
    fn accept(&self, timeout: Duration) -> Result<Option<Box<dyn RawSession>>, ChannelError>;

    /// 停止接受新会话并唤醒阻塞中的 accept
    fn shutdown(&self);

    /// 释放 server 资源
    ///
    /// 调用方保证在位会话已全部排空。
    fn destroy(&self) -> Result<(), ChannelError>;
}

/// 驱动层的单个会话
pub trait RawSession: Send {
    /// 发送一个数据报帧
    fn send(&mut self, frame: &[u8]) -> Result<(), ChannelError>;

    /// 有界等待接收一个数据报帧
    fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, ChannelError>;

    /// 关闭会话
    fn close(&mut self);
}

/// 设备消息通道 server
///
/// 包装驱动 server 句柄并管理会话 ID 池。
pub struct DeviceServer {
    device_id: u32,
    raw: Box<dyn RawServer>,
    // 可用会话 ID 池；与原始驱动一致，从高到低分配
    id_pool: Arc<Mutex<Vec<u32>>>,
}

impl DeviceServer {
    /// 包装驱动 server 句柄
    pub fn new(device_id: u32, raw: Box<dyn RawServer>) -> Self {
        let pool: Vec<u32> = (1..=MAX_SESSIONS_PER_SERVER).rev().collect();
        Self {
            device_id,
            raw,
            id_pool: Arc::new(Mutex::new(pool)),
        }
    }

    /// 该 server 服务的设备 ID
    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// 有界等待接受一个会话
    ///
    /// 成功时分配会话 ID 并返回 [`DeviceSession`]；ID 池耗尽时关闭
    /// 该驱动会话并拒绝。
    pub fn accept_session(&self, timeout: Duration) -> Result<Option<DeviceSession>, ChannelError> {
        let Some(mut raw_session) = self.raw.accept(timeout)? else {
            return Ok(None);
        };

        let session_id = {
            let mut pool = self.id_pool.lock();
            match pool.pop() {
                Some(id) => id,
                None => {
                    raw_session.close();
                    return Err(ChannelError::SessionPoolExhausted(MAX_SESSIONS_PER_SERVER));
                },
            }
        };

        debug!(device_id = self.device_id, session_id, "device session accepted");
        Ok(Some(DeviceSession {
            device_id: self.device_id,
            session_id,
            raw: raw_session,
            id_pool: Arc::clone(&self.id_pool),
        }))
    }

    /// 停止接受新会话并唤醒阻塞中的 accept
    pub fn shutdown(&self) {
        self.raw.shutdown();
    }

    /// 释放 server 资源（调用方保证会话已排空）
    pub fn destroy(&self) -> Result<(), ChannelError> {
        self.raw.destroy()
    }
}

/// 设备消息通道上的一个会话
///
/// 持有驱动会话引用直到接收循环退出；drop 时关闭驱动会话并把
/// 会话 ID 归还池中，保证所有退出路径都释放引用。
pub struct DeviceSession {
    device_id: u32,
    session_id: u32,
    raw: Box<dyn RawSession>,
    id_pool: Arc<Mutex<Vec<u32>>>,
}

impl DeviceSession {
    /// 本会话的会话 ID
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// 本会话所属设备
    pub fn device_id(&self) -> u32 {
        self.device_id
    }
}

impl ControlSession for DeviceSession {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Device
    }

    fn peer(&self) -> String {
        format!("device{}/session{}", self.device_id, self.session_id)
    }

    fn send(&mut self, packet: &Packet) -> Result<(), ChannelError> {
        self.raw.send(&packet.encode())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Packet>, ChannelError> {
        match self.raw.recv(timeout)? {
            Some(frame) => Ok(Some(Packet::decode(&frame)?)),
            None => Ok(None),
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.raw.close();
        self.id_pool.lock().push(self.session_id);
        debug!(
            device_id = self.device_id,
            session_id = self.session_id,
            "device session released"
        );
    }
}
