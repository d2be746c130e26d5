//! 信封编码与分片重组
//!
//! 编码：`Encode(envelope, max_chunk) → 有序 Packet 列表`。
//! 重组：每个会话持有一个 [`Reassembler`]，按到达顺序喂入 Packet，
//! 收到 `is_last` 分片后校验累计长度并产出完整信封。
//!
//! 任何重组错误都会丢弃已累计的部分缓冲，绝不向上层交付残缺信封。

use crate::envelope::{ReplyEnvelope, RequestEnvelope};
use crate::packet::{PACKET_HEADER_LEN, Packet, PacketKind};
use crate::{CommandClass, MAX_PAYLOAD_LEN, ProtocolError, StatusCode};
use bytes::{Bytes, BytesMut};
use std::io::{self, Read, Write};

/// 流式读取时，帧中途连续空读的上限
///
/// 包头已经到达说明对端正在发送，正常情况下剩余字节很快到齐；
/// 连续超时超过该次数视为对端停滞，会话按传输错误关闭。
const MID_FRAME_STALL_TICKS: u32 = 30;

/// 编码请求信封为有序分片列表
///
/// 载荷不超过 `max_chunk` 时走单包快速路径（`Small`）；否则拆为
/// `ceil(len / max_chunk)` 个 `Chunk`，仅最后一片带 `is_last` 标记。
pub fn encode_request(env: &RequestEnvelope, max_chunk: usize) -> Result<Vec<Packet>, ProtocolError> {
    encode_envelope(
        env.command,
        StatusCode::Ok,
        false,
        env.device_id,
        &env.payload,
        max_chunk,
    )
}

/// 编码应答信封为有序分片列表
pub fn encode_reply(env: &ReplyEnvelope, max_chunk: usize) -> Result<Vec<Packet>, ProtocolError> {
    encode_envelope(
        env.command,
        env.status,
        true,
        env.device_id,
        &env.payload,
        max_chunk,
    )
}

fn encode_envelope(
    command: CommandClass,
    status: StatusCode,
    is_reply: bool,
    device_id: u32,
    payload: &Bytes,
    max_chunk: usize,
) -> Result<Vec<Packet>, ProtocolError> {
    if max_chunk == 0 {
        return Err(ProtocolError::InvalidChunkSize(max_chunk));
    }
    let total = payload.len();
    if total > u32::MAX as usize || total > MAX_PAYLOAD_LEN as usize {
        return Err(ProtocolError::PayloadTooLarge(total));
    }
    let total_len = total as u32;

    // 快速路径：整个信封放进一个 Small 包
    if total <= max_chunk {
        return Ok(vec![Packet {
            kind: PacketKind::Small,
            is_last: true,
            is_reply,
            command,
            status,
            device_id,
            total_len,
            value: payload.clone(),
        }]);
    }

    let count = total.div_ceil(max_chunk);
    let mut packets = Vec::with_capacity(count);
    let mut offset = 0usize;
    while offset < total {
        let end = usize::min(offset + max_chunk, total);
        packets.push(Packet {
            kind: PacketKind::Chunk,
            is_last: end == total,
            is_reply,
            command,
            status,
            device_id,
            total_len,
            value: payload.slice(offset..end),
        });
        offset = end;
    }
    Ok(packets)
}

/// 重组产物：请求或应答信封
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembled {
    Request(RequestEnvelope),
    Reply(ReplyEnvelope),
}

/// 按会话维度的分片重组器
///
/// 同一通道上同一时刻最多存在一个在途信封；收到与在途信封不一致
/// 的分片（交错）按协议错误处理。出错时丢弃部分缓冲。
#[derive(Debug, Default)]
pub struct Reassembler {
    pending: Option<Pending>,
}

#[derive(Debug)]
struct Pending {
    command: CommandClass,
    status: StatusCode,
    device_id: u32,
    total_len: u32,
    is_reply: bool,
    buf: BytesMut,
}

impl Reassembler {
    /// 创建新的重组器
    pub fn new() -> Self {
        Self { pending: None }
    }

    /// 当前在途信封的命令类（用于协议错误应答回显）
    pub fn pending_command(&self) -> Option<CommandClass> {
        self.pending.as_ref().map(|p| p.command)
    }

    /// 当前在途信封的设备 ID
    pub fn pending_device(&self) -> Option<u32> {
        self.pending.as_ref().map(|p| p.device_id)
    }

    /// 丢弃在途的部分缓冲
    pub fn clear(&mut self) {
        self.pending = None;
    }

    /// 喂入一个分片
    ///
    /// 返回 `Ok(Some(..))` 表示信封完整；`Ok(None)` 表示还需更多
    /// 分片；`Err` 为协议错误，部分缓冲已被丢弃，会话应被关闭。
    pub fn push(&mut self, packet: Packet) -> Result<Option<Assembled>, ProtocolError> {
        match self.push_inner(packet) {
            Ok(out) => Ok(out),
            Err(e) => {
                // 不向上层交付残缺信封
                self.pending = None;
                Err(e)
            },
        }
    }

    fn push_inner(&mut self, packet: Packet) -> Result<Option<Assembled>, ProtocolError> {
        if packet.total_len > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::OversizedPayload(packet.total_len));
        }

        let Some(pending) = self.pending.as_mut() else {
            return match packet.kind {
                // 快速路径：单包信封
                PacketKind::Small => {
                    if packet.value.len() as u64 != u64::from(packet.total_len) {
                        return Err(ProtocolError::LengthMismatch {
                            declared: packet.total_len,
                            assembled: packet.value.len() as u64,
                        });
                    }
                    Ok(Some(Self::finish(
                        packet.command,
                        packet.status,
                        packet.device_id,
                        packet.is_reply,
                        packet.value,
                    )))
                },
                // 分片路径：首片建立在途状态
                PacketKind::Chunk => {
                    let mut pending = Pending {
                        command: packet.command,
                        status: packet.status,
                        device_id: packet.device_id,
                        total_len: packet.total_len,
                        is_reply: packet.is_reply,
                        buf: BytesMut::with_capacity(packet.total_len as usize),
                    };
                    pending.buf.extend_from_slice(&packet.value);
                    if pending.buf.len() as u64 > u64::from(pending.total_len) {
                        return Err(ProtocolError::PayloadOverflow {
                            declared: pending.total_len,
                        });
                    }
                    if packet.is_last {
                        return Self::finalize(pending).map(Some);
                    }
                    self.pending = Some(pending);
                    Ok(None)
                },
            };
        };

        // 在途信封中混入单包：两个请求交错
        if packet.kind == PacketKind::Small {
            return Err(ProtocolError::InterleavedRequest);
        }
        if pending.command != packet.command
            || pending.device_id != packet.device_id
            || pending.total_len != packet.total_len
            || pending.is_reply != packet.is_reply
        {
            return Err(ProtocolError::InterleavedRequest);
        }
        pending.buf.extend_from_slice(&packet.value);
        if pending.buf.len() as u64 > u64::from(pending.total_len) {
            return Err(ProtocolError::PayloadOverflow {
                declared: pending.total_len,
            });
        }
        if packet.is_last {
            let pending = self.pending.take().expect("pending checked above");
            return Self::finalize(pending).map(Some);
        }
        Ok(None)
    }

    fn finalize(pending: Pending) -> Result<Assembled, ProtocolError> {
        if pending.buf.len() as u64 != u64::from(pending.total_len) {
            return Err(ProtocolError::LengthMismatch {
                declared: pending.total_len,
                assembled: pending.buf.len() as u64,
            });
        }
        Ok(Self::finish(
            pending.command,
            pending.status,
            pending.device_id,
            pending.is_reply,
            pending.buf.freeze(),
        ))
    }

    fn finish(
        command: CommandClass,
        status: StatusCode,
        device_id: u32,
        is_reply: bool,
        payload: Bytes,
    ) -> Assembled {
        if is_reply {
            Assembled::Reply(ReplyEnvelope {
                command,
                device_id,
                status,
                payload,
            })
        } else {
            Assembled::Request(RequestEnvelope {
                command,
                device_id,
                payload,
            })
        }
    }
}

/// 向流式传输写入一个完整帧
pub fn write_packet<W: Write>(writer: &mut W, packet: &Packet) -> io::Result<()> {
    writer.write_all(&packet.encode())?;
    writer.flush()
}

/// 从流式传输读取一个完整帧
///
/// 返回 `Ok(None)` 表示在任何字节到达前读超时（调用方借此检查
/// 关停/下线标志）；包头到达后的字节按帧中途处理，连续停滞超过
/// [`MID_FRAME_STALL_TICKS`] 次返回 `TimedOut` 错误。
/// 对端干净关闭（首字节前 EOF）返回 `UnexpectedEof` 错误。
/// 包头声明的帧长超过 [`MAX_PAYLOAD_LEN`] 时在分配缓冲前拒绝，
/// 帧长上限与载荷上限一致，恶意包头不会触发大块分配。
pub fn read_packet<R: Read>(reader: &mut R) -> io::Result<Option<Packet>> {
    let mut header = [0u8; PACKET_HEADER_LEN];
    let mut filled = 0usize;
    let mut stall_ticks = 0u32;

    while filled < PACKET_HEADER_LEN {
        match reader.read(&mut header[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the channel",
                ));
            },
            Ok(n) => {
                filled += n;
                stall_ticks = 0;
            },
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                if filled == 0 {
                    // 空闲超时：没有任何在途帧
                    return Ok(None);
                }
                stall_ticks += 1;
                if stall_ticks >= MID_FRAME_STALL_TICKS {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "peer stalled mid-frame",
                    ));
                }
            },
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let (skeleton, declared_len) = Packet::decode_header(&header)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if declared_len > MAX_PAYLOAD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            ProtocolError::OversizedPayload(declared_len),
        ));
    }

    let mut value = vec![0u8; declared_len as usize];
    let mut filled = 0usize;
    let mut stall_ticks = 0u32;
    while filled < value.len() {
        match reader.read(&mut value[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed mid-frame",
                ));
            },
            Ok(n) => {
                filled += n;
                stall_ticks = 0;
            },
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                stall_ticks += 1;
                if stall_ticks >= MID_FRAME_STALL_TICKS {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "peer stalled mid-frame",
                    ));
                }
            },
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(Some(Packet {
        value: Bytes::from(value),
        ..skeleton
    }))
}
