//! 传输层分片帧定义
//!
//! 一个信封被编码为一个（小请求快速路径）或多个（分片路径）
//! Packet。两种传输共用同一种帧格式：设备消息通道按数据报整帧
//! 收发，socket 通道依靠包头中的长度字段做流式定界。

use crate::{CommandClass, ProtocolError, StatusCode};
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;

/// 包头长度（16 字节）
///
/// ```text
/// byte 0      kind（Small/Chunk）
/// byte 1      flags（bit0 = last, bit1 = reply）
/// byte 2      command（命令类）
/// byte 3      status（应答状态码，请求恒为 0）
/// bytes 4-7   device_id u32 LE
/// bytes 8-11  total_len u32 LE（信封声明的载荷总长）
/// bytes 12-15 len u32 LE（本分片的字节数）
/// ```
pub const PACKET_HEADER_LEN: usize = 16;

const FLAG_LAST: u8 = 0x01;
const FLAG_REPLY: u8 = 0x02;

/// 分片类型
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum PacketKind {
    /// 单包承载完整信封（小请求快速路径）
    Small = 0x01,
    /// 多包分片中的一片
    Chunk = 0x02,
}

/// 一个传输层帧
///
/// 不变量：同一请求的分片必须在同一通道上按发送顺序投递和消费，
/// 不允许与另一个在途请求的分片交错（由 [`Reassembler`] 校验）。
///
/// [`Reassembler`]: crate::codec::Reassembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// 分片类型
    pub kind: PacketKind,
    /// 是否为该信封的最后一个分片
    pub is_last: bool,
    /// 方向标记：true 表示应答方向
    pub is_reply: bool,
    /// 命令类
    pub command: CommandClass,
    /// 应答状态码（请求方向恒为 `Ok`）
    pub status: StatusCode,
    /// 设备 ID
    pub device_id: u32,
    /// 信封声明的载荷总长
    pub total_len: u32,
    /// 本分片承载的载荷字节
    pub value: Bytes,
}

impl Packet {
    /// 本分片的载荷字节数
    pub fn len(&self) -> usize {
        self.value.len()
    }

    /// 本分片是否不含载荷
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// 编码为完整帧（包头 + 载荷）
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_LEN + self.value.len());
        self.encode_header(&mut buf);
        buf.put_slice(&self.value);
        buf.freeze()
    }

    /// 只编码包头到缓冲区
    pub fn encode_header(&self, buf: &mut BytesMut) {
        let mut flags = 0u8;
        if self.is_last {
            flags |= FLAG_LAST;
        }
        if self.is_reply {
            flags |= FLAG_REPLY;
        }
        buf.put_u8(self.kind as u8);
        buf.put_u8(flags);
        buf.put_u8(self.command as u8);
        buf.put_u8(self.status as u8);
        buf.put_u32_le(self.device_id);
        buf.put_u32_le(self.total_len);
        buf.put_u32_le(self.value.len() as u32);
    }

    /// 从完整帧解码（数据报传输：一个数据报恰好一帧）
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let (header, declared_len) = Self::decode_header(frame)?;
        let actual = frame.len() - PACKET_HEADER_LEN;
        if actual != declared_len as usize {
            return Err(ProtocolError::TruncatedPacket {
                declared: declared_len,
                actual,
            });
        }
        Ok(Self {
            value: Bytes::copy_from_slice(&frame[PACKET_HEADER_LEN..]),
            ..header
        })
    }

    /// 解码包头，返回帧骨架与声明的分片长度
    ///
    /// 返回的 `Packet.value` 为空，调用方负责按声明长度读入载荷
    /// （流式传输的定界方式）。
    pub fn decode_header(buf: &[u8]) -> Result<(Self, u32), ProtocolError> {
        if buf.len() < PACKET_HEADER_LEN {
            return Err(ProtocolError::TooShort {
                expected: PACKET_HEADER_LEN,
                actual: buf.len(),
            });
        }
        let kind =
            PacketKind::try_from(buf[0]).map_err(|_| ProtocolError::InvalidPacketKind(buf[0]))?;
        let flags = buf[1];
        let command = CommandClass::try_from(buf[2])
            .map_err(|_| ProtocolError::InvalidCommandClass(buf[2]))?;
        let status =
            StatusCode::try_from(buf[3]).map_err(|_| ProtocolError::InvalidStatusCode(buf[3]))?;
        let device_id = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let total_len = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let len = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);

        Ok((
            Self {
                kind,
                is_last: flags & FLAG_LAST != 0,
                is_reply: flags & FLAG_REPLY != 0,
                command,
                status,
                device_id,
                total_len,
                value: Bytes::new(),
            },
            len,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Packet {
        Packet {
            kind: PacketKind::Chunk,
            is_last: true,
            is_reply: false,
            command: CommandClass::SendFile,
            status: StatusCode::Ok,
            device_id: 3,
            total_len: 2000,
            value: Bytes::from_static(b"tail"),
        }
    }

    #[test]
    fn test_packet_encode_decode_round_trip() {
        let packet = sample_packet();
        let frame = packet.encode();
        assert_eq!(frame.len(), PACKET_HEADER_LEN + 4);
        let decoded = Packet::decode(&frame).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_packet_decode_too_short() {
        let err = Packet::decode(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, ProtocolError::TooShort { .. }));
    }

    #[test]
    fn test_packet_decode_bad_kind() {
        let mut frame = sample_packet().encode().to_vec();
        frame[0] = 0x7F;
        let err = Packet::decode(&frame).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidPacketKind(0x7F));
    }

    #[test]
    fn test_packet_decode_bad_command() {
        let mut frame = sample_packet().encode().to_vec();
        frame[2] = 0xEE;
        let err = Packet::decode(&frame).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidCommandClass(0xEE));
    }

    #[test]
    fn test_packet_decode_truncated_value() {
        let mut frame = sample_packet().encode().to_vec();
        frame.pop();
        let err = Packet::decode(&frame).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::TruncatedPacket {
                declared: 4,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_reply_flag_round_trip() {
        let mut packet = sample_packet();
        packet.is_reply = true;
        packet.status = StatusCode::HandlerError;
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert!(decoded.is_reply);
        assert_eq!(decoded.status, StatusCode::HandlerError);
    }
}
