//! 守护进程核心错误类型

use devc_channel::ChannelError;
use devc_protocol::ProtocolError;
use thiserror::Error;

/// 守护进程核心错误
///
/// 会话级错误（协议/通道故障）只关闭出错的会话；启动期错误
/// （监听/证书/注册表初始化失败）向上传播并导致进程非零退出。
#[derive(Error, Debug)]
pub enum DaemonError {
    /// 通道层错误
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// 协议层错误
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 设备未在注册表中
    #[error("Device {0} is not attached")]
    DeviceNotAttached(u32),

    /// 设备已在注册表中
    #[error("Device {0} is already attached")]
    DeviceAlreadyAttached(u32),

    /// 设备正在下线排空
    #[error("Device {0} is draining")]
    DeviceDraining(u32),

    /// 设备生命周期状态不满足操作前置条件
    #[error("Device {device_id} is in state {state}, expected {expected}")]
    BadLifecycleState {
        device_id: u32,
        state: &'static str,
        expected: &'static str,
    },

    /// 同一分发键被注册了两次
    #[error("Duplicate handler registration for {0}")]
    DuplicateHandler(String),

    /// 处理器启动期初始化失败
    #[error("Handler `{name}` init failed: {source}")]
    HandlerInit {
        name: &'static str,
        source: HandlerError,
    },

    /// 设备 server 创建在重试耗尽后仍失败
    #[error("Device {device_id} server creation failed after {attempts} attempts: {last_error}")]
    ServerCreateExhausted {
        device_id: u32,
        attempts: u32,
        last_error: String,
    },

    /// 工作线程创建失败
    #[error("Failed to spawn thread `{name}`: {source}")]
    ThreadSpawn {
        name: String,
        source: std::io::Error,
    },
}

/// 处理器执行错误
///
/// 处理器失败只影响当前请求：会话保持打开，错误描述作为
/// `HandlerError` 状态的应答载荷回传。
#[derive(Error, Debug)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        Self::new(e.to_string())
    }
}
