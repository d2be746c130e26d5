//! # Devc Protocol
//!
//! 控制通道协议定义（无传输依赖）
//!
//! ## 模块
//!
//! - `envelope`: 请求/应答信封（命令类 + 设备 ID +载荷）
//! - `packet`: 传输层分片帧（Small/Chunk）
//! - `codec`: 信封编码、分片重组、流式读写
//!
//! ## 字节序
//!
//! 所有多字节字段使用小端字节序（LE）。
//!
//! ## 分层
//!
//! ```text
//! Handler Layer (devc-daemon)
//!     ↓ RequestEnvelope / ReplyEnvelope
//! Codec (encode_request / Reassembler)
//!     ↓ Packet（一个信封可能被拆成多个 Packet）
//! Transport Layer (devc-channel)
//! ```

pub mod codec;
pub mod envelope;
pub mod packet;

// 重新导出常用类型
pub use codec::{Assembled, Reassembler, encode_reply, encode_request, read_packet, write_packet};
pub use envelope::{HOST_DEVICE_ID, ReplyEnvelope, RequestEnvelope};
pub use packet::{PACKET_HEADER_LEN, Packet, PacketKind};

use num_enum::TryFromPrimitive;
use thiserror::Error;

/// 单个信封允许声明的最大载荷长度（64 MiB）
///
/// 超过该值的声明长度在收到第一个分片时立即拒绝，防止恶意
/// 客户端通过超大声明长度耗尽内存。
pub const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

/// 默认分片大小（字节）
///
/// 两种传输的单个数据报/帧的载荷上限，可由配置覆盖。
pub const DEFAULT_MAX_CHUNK: usize = 64 * 1024;

/// 命令类枚举
///
/// 两种传输共享同一套命令类编号。除 `Detect` 与 `QueryStatus`
/// 由守护进程内置处理外，其余命令类由外部处理器模块在启动时注册。
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum CommandClass {
    /// 探测守护进程是否存活
    Detect = 0x01,
    /// 在设备侧执行命令
    ExecCommand = 0x02,
    /// 在主机侧执行命令
    HostCommand = 0x03,
    /// 向设备发送文件
    SendFile = 0x04,
    /// 从设备获取文件
    GetFile = 0x05,
    /// 文件同步（发送后校验）
    SyncFile = 0x06,
    /// 获取设备日志
    GetLog = 0x07,
    /// 启动性能采集
    ProfStart = 0x08,
    /// 停止性能采集
    ProfStop = 0x09,
    /// 获取异常转储
    GetDump = 0x0A,
    /// 查询守护进程状态
    QueryStatus = 0x0B,
}

/// 应答状态码
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum StatusCode {
    /// 成功
    Ok = 0x00,
    /// 协议错误（分片/长度校验失败）
    ProtocolError = 0x01,
    /// 命令类未注册
    UnknownCommand = 0x02,
    /// 目标设备当前未被服务（未接入或正在下线）
    DeviceNotServed = 0x03,
    /// 处理器执行失败
    HandlerError = 0x04,
}

/// 协议层错误类型
///
/// 所有变体都意味着会话级故障：出错的会话被关闭，
/// 守护进程本身继续运行。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// 缓冲区长度不足以容纳包头
    #[error("Packet too short: {actual} bytes, need at least {expected}")]
    TooShort { expected: usize, actual: usize },

    /// 包头 kind 字段非法
    #[error("Invalid packet kind: {0:#04x}")]
    InvalidPacketKind(u8),

    /// 命令类字段非法
    #[error("Invalid command class: {0:#04x}")]
    InvalidCommandClass(u8),

    /// 状态码字段非法
    #[error("Invalid status code: {0:#04x}")]
    InvalidStatusCode(u8),

    /// 包头声明的分片长度与实际字节数不符
    #[error("Truncated packet: header declares {declared} bytes, got {actual}")]
    TruncatedPacket { declared: u32, actual: usize },

    /// 声明的载荷长度超出上限
    #[error("Declared payload length {0} exceeds limit {MAX_PAYLOAD_LEN}")]
    OversizedPayload(u32),

    /// 重组完成时累计长度与声明长度不符
    #[error("Payload length mismatch: declared {declared}, assembled {assembled}")]
    LengthMismatch { declared: u32, assembled: u64 },

    /// 单个分片就超过了声明的载荷长度
    #[error("Assembled bytes overflow declared length {declared}")]
    PayloadOverflow { declared: u32 },

    /// 同一通道上两个请求的分片交错
    #[error("Interleaved fragments on one channel (in-flight request not finished)")]
    InterleavedRequest,

    /// 信封载荷长度超过 u32 表示范围
    #[error("Payload too large to encode: {0} bytes")]
    PayloadTooLarge(usize),

    /// 分片大小参数非法
    #[error("Invalid max_chunk: {0} (must be > 0)")]
    InvalidChunkSize(usize),
}
