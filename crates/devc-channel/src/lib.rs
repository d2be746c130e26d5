//! # Devc Channel Layer
//!
//! 传输抽象层，为守护进程提供两种控制通道的统一接口。
//!
//! ## 模块
//!
//! - `secure`: 证书加密的 socket 通道（主机侧发起的控制会话）
//! - `device`: 设备驻留消息通道（厂商驱动边界抽象，每设备一个 server）
//! - `hotplug`: 设备热插拔事件源抽象
//!
//! 会话层统一通过 [`ControlSession`] trait 收发 [`Packet`]，
//! 上层（devc-daemon）不感知具体传输。

use devc_protocol::{Packet, ProtocolError};
use std::io;
use std::time::Duration;
use thiserror::Error;

pub mod device;
pub mod hotplug;
pub mod secure;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use device::{DeviceServer, DeviceSession, MessageDriver, RawServer, RawSession};
pub use hotplug::{HotplugAction, HotplugEvent, HotplugSource};
pub use secure::{CertPaths, ListenerMode, SocketListener, SocketSession, TlsServerConfig};

/// 通道类型：一个会话由哪种传输承载
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// 主机侧 socket 通道（TLS）
    Socket,
    /// 设备驻留消息通道
    Device,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Socket => write!(f, "socket"),
            ChannelKind::Device => write!(f, "device"),
        }
    }
}

/// 证书装载/校验错误
///
/// 任一变体都是启动期致命错误：监听器拒绝启动，进程以非零退出。
#[derive(Error, Debug)]
pub enum CertError {
    /// 证书文件缺失或不可读
    #[error("Certificate file unreadable: {path}: {source}")]
    Unreadable {
        path: std::path::PathBuf,
        source: io::Error,
    },

    /// 文件中未找到证书
    #[error("No certificate found in {0}")]
    MissingCert(std::path::PathBuf),

    /// 文件中未找到私钥
    #[error("No private key found in {0}")]
    MissingKey(std::path::PathBuf),

    /// 加密私钥不受支持
    #[error("Encrypted private key is not supported: {0} (provide an unencrypted PKCS#8 key)")]
    EncryptedKey(std::path::PathBuf),

    /// 证书链无法通过 CA 验证
    #[error("Certificate chain does not verify against the CA: {0}")]
    ChainInvalid(String),

    /// 证书已过期
    #[error("Certificate has expired")]
    Expired,

    /// 证书尚未生效
    #[error("Certificate is not yet valid")]
    NotYetValid,

    /// 私钥与证书不匹配
    #[error("Private key does not match the certificate: {0}")]
    KeyMismatch(String),

    /// 配置的服务名非法
    #[error("Invalid server name: {0}")]
    BadServerName(String),
}

/// 通道层统一错误类型
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Certificate error: {0}")]
    Certificate(#[from] CertError),

    /// 对端关闭了通道
    #[error("Channel closed by peer")]
    Closed,

    /// 收到的帧无法解析（会话级协议错误）
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 驱动不认识该设备
    #[error("Device {0} is not known to the driver")]
    NoSuchDevice(u32),

    /// 设备 server 暂时不可用（设备尚未就绪，可重试）
    #[error("Device server transiently unavailable: {0}")]
    NotReady(String),

    /// 会话 ID 池耗尽
    #[error("Session id pool exhausted (limit {0})")]
    SessionPoolExhausted(u32),

    /// 厂商驱动返回的其他错误
    #[error("Driver error: {0}")]
    Driver(String),
}

impl ChannelError {
    /// 该错误是否意味着对端/通道已不可用（会话应被关闭）
    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelError::Closed)
    }
}

/// 控制会话的统一收发接口
///
/// socket 通道的每个已接受连接、设备消息通道的每个已建立会话各
/// 对应一个实现实例。`recv` 使用有界等待，以便 worker 在无流量时
/// 也能周期性检查关停/下线标志。
pub trait ControlSession: Send {
    /// 本会话的传输类型
    fn kind(&self) -> ChannelKind;

    /// 对端标识（日志用）
    fn peer(&self) -> String;

    /// 发送一个帧
    fn send(&mut self, packet: &Packet) -> Result<(), ChannelError>;

    /// 有界等待接收一个帧
    ///
    /// `Ok(None)` 表示超时且无任何在途字节；`Err(Closed)` 表示对端
    /// 关闭；其余错误为传输/协议故障。
    fn recv(&mut self, timeout: Duration) -> Result<Option<Packet>, ChannelError>;
}
