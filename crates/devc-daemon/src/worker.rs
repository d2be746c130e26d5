//! 会话 worker
//!
//! 每个已接受的会话一个 worker 线程，运行阻塞式
//! `接收 → 重组 → 分发 → 应答` 循环。分发在 worker 线程内同步
//! 执行，单会话同一时刻只有一个在途命令。
//!
//! 退出条件：对端关闭、传输/协议故障、守护进程关停、或（设备
//! 通道）所属设备转入排空。排空检查只发生在请求之间，在途请求
//! 完整执行并送出应答后 worker 才退出；对端送出半个信封后停滞
//! 时按 [`DEFAULT_ENVELOPE_STALL_TICKS`] 上限拆除会话。

use crate::dispatch::{DispatchTable, RequestContext};
use crate::registry::{DeviceRegistry, SessionGuard};
use crate::stats::{DaemonStats, bump};
use devc_channel::{ChannelError, ControlSession};
use devc_protocol::{
    Assembled, CommandClass, HOST_DEVICE_ID, Reassembler, ReplyEnvelope, RequestEnvelope,
    StatusCode, encode_reply,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// 无流量时的接收轮询周期
///
/// worker 借助有界接收周期性检查关停/排空标志。
pub const RECV_TICK: Duration = Duration::from_millis(250);

/// 在途信封允许的连续空读次数上限
///
/// 排空检查在信封中途是关闭的；对端送出首片后停滞会钉死一条
/// Draining 记录，超过该次数后会话按停滞对端拆除。
pub const DEFAULT_ENVELOPE_STALL_TICKS: u32 = 30;

/// 会话 worker 的共享环境
pub struct WorkerEnv {
    pub registry: Arc<DeviceRegistry>,
    pub dispatch: Arc<DispatchTable>,
    pub stats: Arc<DaemonStats>,
    pub shutdown: Arc<AtomicBool>,
    /// 应答编码的分片大小
    pub max_chunk: usize,
    /// 信封中途允许的连续空读次数
    pub stall_ticks: u32,
}

/// 运行一个会话直到结束
///
/// `guard` 对设备通道会话为 `Some`：存续期间设备记录保持在位，
/// worker 退出（任何路径）时随 drop 释放引用。socket 会话不
/// 绑定设备，传 `None`。
pub fn run_session(
    env: &WorkerEnv,
    mut session: Box<dyn ControlSession>,
    guard: Option<SessionGuard>,
) {
    let peer = session.peer();
    let channel = session.kind();
    bump(&env.stats.sessions_opened);
    info!(%peer, %channel, "session started");

    let ctx = RequestContext {
        channel,
        peer: peer.clone(),
        registry: Arc::clone(&env.registry),
        stats: Arc::clone(&env.stats),
    };
    let mut reassembler = Reassembler::new();
    let mut stalled = 0u32;

    loop {
        if env.shutdown.load(Ordering::Relaxed) {
            debug!(%peer, "session exiting on shutdown");
            break;
        }
        // 排空检查只在请求之间做：在途信封允许完整收完
        if reassembler.pending_command().is_none()
            && let Some(g) = &guard
            && env.registry.is_disabled(g.device_id())
        {
            info!(%peer, device_id = g.device_id(), "session exiting on device drain");
            break;
        }

        let packet = match session.recv(RECV_TICK) {
            Ok(Some(packet)) => {
                stalled = 0;
                packet
            },
            Ok(None) => {
                // 信封中途排空检查是关闭的，停滞对端必须有界拆除
                if reassembler.pending_command().is_some() {
                    stalled += 1;
                    if stalled >= env.stall_ticks {
                        bump(&env.stats.protocol_errors);
                        warn!(%peer, "peer stalled mid-envelope, closing session");
                        break;
                    }
                }
                continue;
            },
            Err(e) if e.is_closed() => {
                debug!(%peer, "peer closed session");
                break;
            },
            Err(ChannelError::Protocol(e)) => {
                bump(&env.stats.protocol_errors);
                warn!(%peer, error = %e, "undecodable frame, closing session");
                break;
            },
            Err(e) => {
                warn!(%peer, error = %e, "transport error, closing session");
                break;
            },
        };

        // push 出错会丢弃在途缓冲，出错前记下信封标识用于错误应答；
        // 首片就出错时退回该片包头自带的标识
        let (err_command, err_device) = reassembler
            .pending_command()
            .zip(reassembler.pending_device())
            .unwrap_or((packet.command, packet.device_id));
        let assembled = match reassembler.push(packet) {
            Ok(None) => continue,
            Ok(Some(assembled)) => assembled,
            Err(e) => {
                bump(&env.stats.protocol_errors);
                warn!(%peer, error = %e, "reassembly failed, closing session");
                send_error_reply(
                    &mut session,
                    env,
                    err_command,
                    err_device,
                    StatusCode::ProtocolError,
                    &e.to_string(),
                );
                break;
            },
        };

        let req = match assembled {
            Assembled::Request(req) => req,
            Assembled::Reply(reply) => {
                // 守护进程侧不应收到应答信封
                bump(&env.stats.protocol_errors);
                warn!(%peer, command = ?reply.command, "unexpected reply envelope, closing session");
                break;
            },
        };

        let reply = handle_request(env, &ctx, &req);
        bump(&env.stats.replies_sent);
        if let Err(e) = send_reply(&mut session, env, &reply) {
            warn!(%peer, error = %e, "failed to send reply, closing session");
            break;
        }
    }

    bump(&env.stats.sessions_closed);
    info!(%peer, "session ended");
    drop(guard);
}

/// 分发一个完整请求并构造应答
fn handle_request(env: &WorkerEnv, ctx: &RequestContext, req: &RequestEnvelope) -> ReplyEnvelope {
    let Some(handler) = env.dispatch.lookup(req.command, ctx.channel) else {
        bump(&env.stats.unknown_commands);
        debug!(peer = %ctx.peer, command = ?req.command, "unknown command class");
        return ReplyEnvelope::error(
            req.command,
            req.device_id,
            StatusCode::UnknownCommand,
            "command class not registered for this channel",
        );
    };

    // socket 请求携带真实设备 ID 时检查目标设备在位；设备通道
    // 会话由 guard 预先绑定，无需重复检查
    if handler.needs_device()
        && ctx.channel == devc_channel::ChannelKind::Socket
        && req.device_id != HOST_DEVICE_ID
        && !env.registry.is_served(req.device_id)
    {
        bump(&env.stats.device_not_served);
        return ReplyEnvelope::error(
            req.command,
            req.device_id,
            StatusCode::DeviceNotServed,
            &format!("device {} is not currently served", req.device_id),
        );
    }

    bump(&env.stats.requests_dispatched);
    match handler.process(ctx, req) {
        Ok(payload) => ReplyEnvelope::ok(req.command, req.device_id, payload),
        Err(e) => {
            bump(&env.stats.handler_errors);
            warn!(peer = %ctx.peer, command = ?req.command, error = %e, "handler failed");
            ReplyEnvelope::error(req.command, req.device_id, StatusCode::HandlerError, e.message())
        },
    }
}

fn send_reply(
    session: &mut Box<dyn ControlSession>,
    env: &WorkerEnv,
    reply: &ReplyEnvelope,
) -> Result<(), ChannelError> {
    for packet in encode_reply(reply, env.max_chunk)? {
        session.send(&packet)?;
    }
    Ok(())
}

/// 尽力而为的协议错误应答；失败只记日志（会话马上就要关了）
fn send_error_reply(
    session: &mut Box<dyn ControlSession>,
    env: &WorkerEnv,
    command: CommandClass,
    device_id: u32,
    status: StatusCode,
    message: &str,
) {
    let reply = ReplyEnvelope::error(command, device_id, status, message);
    if let Err(e) = send_reply(session, env, &reply) {
        debug!(error = %e, "error reply not delivered");
    }
}

/// 供测试和 in-process 客户端使用：向会话发送请求并等待完整应答
pub fn roundtrip(
    session: &mut dyn ControlSession,
    req: &RequestEnvelope,
    max_chunk: usize,
    timeout: Duration,
) -> Result<ReplyEnvelope, ChannelError> {
    for packet in devc_protocol::encode_request(req, max_chunk)? {
        session.send(&packet)?;
    }
    let mut reassembler = Reassembler::new();
    loop {
        let Some(packet) = session.recv(timeout)? else {
            return Err(ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no reply within timeout",
            )));
        };
        match reassembler.push(packet)? {
            None => continue,
            Some(Assembled::Reply(reply)) => return Ok(reply),
            Some(Assembled::Request(_)) => {
                return Err(ChannelError::Protocol(
                    devc_protocol::ProtocolError::InterleavedRequest,
                ));
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchTable;
    use crate::handlers::{DetectHandler, QueryStatusHandler};
    use devc_channel::mock::MockMessageDriver;
    use devc_channel::{ChannelKind, DeviceServer, MessageDriver};
    use devc_protocol::encode_request;
    use std::thread;

    const TICK: Duration = Duration::from_millis(500);

    fn test_env() -> WorkerEnv {
        let table = DispatchTable::builder()
            .register_both(CommandClass::Detect, Arc::new(DetectHandler))
            .unwrap()
            .register_both(CommandClass::QueryStatus, Arc::new(QueryStatusHandler))
            .unwrap()
            .build();
        WorkerEnv {
            registry: Arc::new(DeviceRegistry::new()),
            dispatch: Arc::new(table),
            stats: Arc::new(DaemonStats::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            max_chunk: 64,
            stall_ticks: 3,
        }
    }

    /// 在 mock 设备通道上起一个 worker，返回客户端会话与线程句柄
    fn spawn_worker(
        env: Arc<WorkerEnv>,
        driver: &MockMessageDriver,
        device_id: u32,
    ) -> (devc_channel::mock::MockClientSession, thread::JoinHandle<()>) {
        driver.attach_device(device_id);
        env.registry.attach(device_id).unwrap();
        let server = DeviceServer::new(device_id, driver.create_server(device_id).unwrap());
        env.registry.begin_serving(device_id).unwrap();

        let client = driver.connect(device_id).unwrap();
        let session = server.accept_session(TICK).unwrap().unwrap();
        let guard = env.registry.start_session(device_id).unwrap();
        let handle = thread::spawn(move || run_session(&env, Box::new(session), Some(guard)));
        (client, handle)
    }

    #[test]
    fn test_detect_round_trip_session_stays_open() {
        let env = Arc::new(test_env());
        let driver = MockMessageDriver::new();
        let (mut client, handle) = spawn_worker(Arc::clone(&env), &driver, 0);

        // 同一会话连续两个请求
        for payload in [&b"one"[..], &b"two"[..]] {
            let req = RequestEnvelope::new(CommandClass::Detect, 0, payload);
            let reply = roundtrip(&mut client, &req, 64, TICK).unwrap();
            assert!(reply.is_ok());
            assert_eq!(reply.payload.as_ref(), payload);
        }

        env.shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();
        assert_eq!(env.stats.requests_dispatched.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_chunked_request_round_trip() {
        let env = Arc::new(test_env());
        let driver = MockMessageDriver::new();
        let (mut client, handle) = spawn_worker(Arc::clone(&env), &driver, 1);

        // 2000 字节载荷 @ max_chunk 64 ⇒ 多分片
        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let req = RequestEnvelope::new(CommandClass::Detect, 1, payload.clone());
        let reply = roundtrip(&mut client, &req, 64, TICK).unwrap();
        assert!(reply.is_ok());
        assert_eq!(reply.payload.as_ref(), payload.as_slice());

        env.shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn test_unknown_command_keeps_session_open() {
        let env = Arc::new(test_env());
        let driver = MockMessageDriver::new();
        let (mut client, handle) = spawn_worker(Arc::clone(&env), &driver, 2);

        let req = RequestEnvelope::new(CommandClass::ExecCommand, 2, &b""[..]);
        let reply = roundtrip(&mut client, &req, 64, TICK).unwrap();
        assert_eq!(reply.status, StatusCode::UnknownCommand);

        // 会话仍可用
        let req = RequestEnvelope::new(CommandClass::Detect, 2, &b"still here"[..]);
        let reply = roundtrip(&mut client, &req, 64, TICK).unwrap();
        assert!(reply.is_ok());

        env.shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();
        assert_eq!(env.stats.unknown_commands.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_length_mismatch_closes_session_with_error_reply() {
        let env = Arc::new(test_env());
        let driver = MockMessageDriver::new();
        let (mut client, handle) = spawn_worker(Arc::clone(&env), &driver, 3);

        // 手工构造声明长度与实际不符的分片序列
        let req = RequestEnvelope::new(CommandClass::Detect, 3, vec![0u8; 200]);
        let mut packets = encode_request(&req, 64).unwrap();
        packets.pop(); // 丢掉最后一片
        let mut bad_last = packets.pop().unwrap();
        bad_last.is_last = true; // 提前终止：累计长度 < 声明长度
        packets.push(bad_last);
        for packet in &packets {
            client.send(packet).unwrap();
        }

        let reply = {
            let mut reassembler = Reassembler::new();
            loop {
                let packet = client.recv(TICK).unwrap().unwrap();
                if let Some(Assembled::Reply(reply)) = reassembler.push(packet).unwrap() {
                    break reply;
                }
            }
        };
        assert_eq!(reply.status, StatusCode::ProtocolError);

        // worker 已按协议错误退出
        handle.join().unwrap();
        assert_eq!(env.stats.protocol_errors.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_malformed_first_packet_gets_error_reply() {
        let env = Arc::new(test_env());
        let driver = MockMessageDriver::new();
        let (mut client, handle) = spawn_worker(Arc::clone(&env), &driver, 5);

        // 首片就坏：Small 包声明 5 字节载荷，实际只带 1 字节
        let bad = devc_protocol::Packet {
            kind: devc_protocol::PacketKind::Small,
            is_last: true,
            is_reply: false,
            command: CommandClass::Detect,
            status: StatusCode::Ok,
            device_id: 5,
            total_len: 5,
            value: bytes::Bytes::from_static(&[0x42]),
        };
        client.send(&bad).unwrap();

        // 没有在途信封可退回，错误应答取包头自带的标识
        let reply = {
            let mut reassembler = Reassembler::new();
            loop {
                let packet = client.recv(TICK).unwrap().unwrap();
                if let Some(Assembled::Reply(reply)) = reassembler.push(packet).unwrap() {
                    break reply;
                }
            }
        };
        assert_eq!(reply.status, StatusCode::ProtocolError);
        assert_eq!(reply.command, CommandClass::Detect);
        assert_eq!(reply.device_id, 5);

        handle.join().unwrap();
        assert_eq!(env.stats.protocol_errors.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_stalled_envelope_torn_down_and_drain_completes() {
        let env = Arc::new(test_env());
        let driver = MockMessageDriver::new();
        let (mut client, handle) = spawn_worker(Arc::clone(&env), &driver, 6);

        // 只送出多分片请求的首片，然后对端沉默
        let req = RequestEnvelope::new(CommandClass::Detect, 6, vec![1u8; 300]);
        let packets = encode_request(&req, 64).unwrap();
        client.send(&packets[0]).unwrap();
        thread::sleep(Duration::from_millis(100));

        // 设备下线：信封中途不做排空检查，靠停滞上限拆会话
        env.registry.detach(6);
        handle.join().unwrap();
        assert!(env.registry.snapshot().is_empty());
        assert_eq!(env.stats.protocol_errors.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_drain_lets_inflight_request_finish() {
        let env = Arc::new(test_env());
        let driver = MockMessageDriver::new();
        let (mut client, handle) = spawn_worker(Arc::clone(&env), &driver, 4);

        // 先送出一个多分片请求的前半部分
        let payload: Vec<u8> = vec![7u8; 300];
        let req = RequestEnvelope::new(CommandClass::Detect, 4, payload.clone());
        let packets = encode_request(&req, 64).unwrap();
        let (head, tail) = packets.split_at(2);
        for packet in head {
            client.send(packet).unwrap();
        }
        thread::sleep(Duration::from_millis(100));

        // 中途请求设备下线，再补齐剩余分片
        env.registry.detach(4);
        for packet in tail {
            client.send(packet).unwrap();
        }

        // 在途请求完整执行并送出应答
        let mut reassembler = Reassembler::new();
        let reply = loop {
            let packet = client.recv(TICK).unwrap().unwrap();
            if let Some(Assembled::Reply(reply)) = reassembler.push(packet).unwrap() {
                break reply;
            }
        };
        assert!(reply.is_ok());
        assert_eq!(reply.payload.as_ref(), payload.as_slice());

        // 随后 worker 因排空退出，guard drop 完成移除
        handle.join().unwrap();
        assert!(env.registry.snapshot().is_empty());
    }

    #[test]
    fn test_device_not_served_on_socket_requests() {
        // socket 通道不绑定设备，逐请求检查目标设备
        let env = Arc::new(test_env());
        let ctx = RequestContext {
            channel: ChannelKind::Socket,
            peer: "test".into(),
            registry: Arc::clone(&env.registry),
            stats: Arc::clone(&env.stats),
        };

        struct NeedsDevice;
        impl crate::dispatch::CommandHandler for NeedsDevice {
            fn name(&self) -> &'static str {
                "needs_device"
            }
            fn process(
                &self,
                _: &RequestContext,
                _: &RequestEnvelope,
            ) -> Result<bytes::Bytes, crate::error::HandlerError> {
                Ok(bytes::Bytes::new())
            }
        }
        let table = DispatchTable::builder()
            .register(CommandClass::ExecCommand, ChannelKind::Socket, Arc::new(NeedsDevice))
            .unwrap()
            .build();
        let env = WorkerEnv {
            dispatch: Arc::new(table),
            registry: Arc::clone(&env.registry),
            stats: Arc::clone(&env.stats),
            shutdown: Arc::clone(&env.shutdown),
            max_chunk: 64,
            stall_ticks: 3,
        };

        // 设备不在位
        let req = RequestEnvelope::new(CommandClass::ExecCommand, 9, &b""[..]);
        let reply = handle_request(&env, &ctx, &req);
        assert_eq!(reply.status, StatusCode::DeviceNotServed);

        // 主机伪设备 ID 跳过检查
        let req = RequestEnvelope::new(CommandClass::ExecCommand, HOST_DEVICE_ID, &b""[..]);
        let reply = handle_request(&env, &ctx, &req);
        assert!(reply.is_ok());

        // 设备在位后放行
        env.registry.attach(9).unwrap();
        env.registry.begin_serving(9).unwrap();
        let req = RequestEnvelope::new(CommandClass::ExecCommand, 9, &b""[..]);
        let reply = handle_request(&env, &ctx, &req);
        assert!(reply.is_ok());
    }
}
