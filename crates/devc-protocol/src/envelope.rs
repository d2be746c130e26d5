//! 请求/应答信封定义
//!
//! 信封是控制请求的逻辑单元，与分片方式无关。上层处理器只看到
//! 完整的信封，分片与重组由 `codec` 模块负责。

use crate::{CommandClass, StatusCode};
use bytes::Bytes;

/// 请求信封
///
/// 由客户端构造，经一个或多个 [`Packet`](crate::Packet) 传输后，
/// 由对应的会话 worker 完整重组并消费一次。
///
/// 不变量：编码时写入的 `payload_len` 必须等于 `payload` 的实际
/// 字节数；重组侧校验该不变量，违反视为协议错误。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnvelope {
    /// 命令类
    pub command: CommandClass,
    /// 目标设备 ID（主机侧命令使用 [`HOST_DEVICE_ID`]）
    pub device_id: u32,
    /// 载荷
    pub payload: Bytes,
}

/// 主机侧命令使用的伪设备 ID
///
/// 携带该 ID 的请求不做设备在位检查。
pub const HOST_DEVICE_ID: u32 = u32::MAX;

impl RequestEnvelope {
    /// 创建新的请求信封
    pub fn new(command: CommandClass, device_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            device_id,
            payload: payload.into(),
        }
    }

    /// 载荷长度（字节）
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

/// 应答信封
///
/// 每个成功重组并分发的请求都对应一个应答；协议错误在传输支持
/// 回传时也以应答形式通知客户端（状态码 `ProtocolError`）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyEnvelope {
    /// 对应请求的命令类
    pub command: CommandClass,
    /// 对应请求的设备 ID
    pub device_id: u32,
    /// 执行结果状态码
    pub status: StatusCode,
    /// 应答载荷（错误时通常为错误描述文本）
    pub payload: Bytes,
}

impl ReplyEnvelope {
    /// 创建成功应答
    pub fn ok(command: CommandClass, device_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            device_id,
            status: StatusCode::Ok,
            payload: payload.into(),
        }
    }

    /// 创建错误应答
    pub fn error(command: CommandClass, device_id: u32, status: StatusCode, message: &str) -> Self {
        Self {
            command,
            device_id,
            status,
            payload: Bytes::copy_from_slice(message.as_bytes()),
        }
    }

    /// 该应答是否表示成功
    pub fn is_ok(&self) -> bool {
        self.status == StatusCode::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_envelope_new() {
        let req = RequestEnvelope::new(CommandClass::Detect, 0, Bytes::new());
        assert_eq!(req.command, CommandClass::Detect);
        assert_eq!(req.device_id, 0);
        assert_eq!(req.payload_len(), 0);
    }

    #[test]
    fn test_reply_envelope_ok() {
        let reply = ReplyEnvelope::ok(CommandClass::QueryStatus, 3, Bytes::from_static(b"up"));
        assert!(reply.is_ok());
        assert_eq!(reply.payload.as_ref(), b"up");
    }

    #[test]
    fn test_reply_envelope_error() {
        let reply = ReplyEnvelope::error(
            CommandClass::ExecCommand,
            5,
            StatusCode::DeviceNotServed,
            "device 5 is not currently served",
        );
        assert!(!reply.is_ok());
        assert_eq!(reply.status, StatusCode::DeviceNotServed);
    }
}
