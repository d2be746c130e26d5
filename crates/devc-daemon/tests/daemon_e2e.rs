//! 守护进程端到端测试
//!
//! 用进程内 mock 驱动 + 回环 socket 监听把完整栈跑起来：
//! 监督器启动顺序、两种通道的请求往返、热插拔上线/下线、
//! server 创建重试、关停收敛。

use devc_channel::mock::MockMessageDriver;
use devc_channel::{ChannelKind, ListenerMode, SocketListener};
use devc_daemon::handlers::{DetectHandler, QueryStatusHandler};
use devc_daemon::{DispatchTable, RetryPolicy, Supervisor, SupervisorConfig, roundtrip};
use devc_protocol::{
    Assembled, CommandClass, HOST_DEVICE_ID, Reassembler, ReplyEnvelope, RequestEnvelope,
    StatusCode, encode_request, read_packet, write_packet,
};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(1000);

/// 回环 socket 上的测试客户端（明文模式）
struct TcpClient {
    stream: TcpStream,
}

impl TcpClient {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        Self { stream }
    }

    fn roundtrip(&mut self, req: &RequestEnvelope) -> ReplyEnvelope {
        for packet in encode_request(req, 64).unwrap() {
            write_packet(&mut self.stream, &packet).unwrap();
        }
        let mut reassembler = Reassembler::new();
        let deadline = Instant::now() + TICK;
        loop {
            match read_packet(&mut self.stream).unwrap() {
                Some(packet) => {
                    if let Some(Assembled::Reply(reply)) = reassembler.push(packet).unwrap() {
                        return reply;
                    }
                },
                None => assert!(Instant::now() < deadline, "no reply within timeout"),
            }
        }
    }
}

fn test_table() -> DispatchTable {
    DispatchTable::builder()
        .register_both(CommandClass::Detect, Arc::new(DetectHandler))
        .unwrap()
        .register_both(CommandClass::QueryStatus, Arc::new(QueryStatusHandler))
        .unwrap()
        .build()
}

fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        accept_tick: Duration::from_millis(20),
        max_chunk: 64,
        retry: RetryPolicy {
            max_attempts: 5,
            wait: Duration::from_millis(20),
        },
        drain_timeout: Duration::from_secs(2),
        shutdown_timeout: Duration::from_secs(2),
    }
}

fn start_daemon(driver: &MockMessageDriver) -> (Arc<Supervisor>, SocketAddr) {
    let listener = SocketListener::bind("127.0.0.1:0", ListenerMode::Plaintext).unwrap();
    let addr = listener.local_addr().unwrap();
    let supervisor = Supervisor::start(
        fast_config(),
        test_table(),
        listener,
        Arc::new(driver.clone()),
        Box::new(driver.hotplug_source()),
    )
    .unwrap();
    (supervisor, addr)
}

/// 有界等待一个条件成立
fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for: {what}");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_detect_over_socket_session_survives() {
    let driver = MockMessageDriver::new();
    let (supervisor, addr) = start_daemon(&driver);

    let mut client = TcpClient::connect(addr);
    // 同一连接连续两个请求
    let reply = client.roundtrip(&RequestEnvelope::new(CommandClass::Detect, 0, &b""[..]));
    assert!(reply.is_ok());
    let reply = client.roundtrip(&RequestEnvelope::new(CommandClass::Detect, 0, &b"again"[..]));
    assert!(reply.is_ok());
    assert_eq!(reply.payload.as_ref(), b"again");

    supervisor.shutdown();
}

#[test]
fn test_chunked_envelope_over_socket() {
    let driver = MockMessageDriver::new();
    let (supervisor, addr) = start_daemon(&driver);

    let mut client = TcpClient::connect(addr);
    let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    let reply = client.roundtrip(&RequestEnvelope::new(
        CommandClass::Detect,
        HOST_DEVICE_ID,
        payload.clone(),
    ));
    assert!(reply.is_ok());
    assert_eq!(reply.payload.as_ref(), payload.as_slice());

    supervisor.shutdown();
}

#[test]
fn test_hotplug_attach_serves_device_channel() {
    let driver = MockMessageDriver::new();
    let (supervisor, _addr) = start_daemon(&driver);

    // 运行中接入设备，等待其进入服务状态
    driver.attach_device(3);
    wait_until("device 3 serving", || {
        supervisor.env().registry.is_served(3)
    });

    let mut session = driver.connect(3).unwrap();
    let req = RequestEnvelope::new(CommandClass::Detect, 3, &b"hello"[..]);
    let reply = roundtrip(&mut session, &req, 64, TICK).unwrap();
    assert!(reply.is_ok());
    assert_eq!(reply.payload.as_ref(), b"hello");

    supervisor.shutdown();
}

#[test]
fn test_startup_enumeration_serves_existing_devices() {
    let driver = MockMessageDriver::new();
    driver.attach_device(0);
    driver.attach_device(1);
    let (supervisor, _addr) = start_daemon(&driver);

    wait_until("both devices serving", || {
        supervisor.env().registry.is_served(0) && supervisor.env().registry.is_served(1)
    });

    supervisor.shutdown();
    assert!(supervisor.env().registry.snapshot().is_empty());
}

#[test]
fn test_server_create_retry_on_attach() {
    let driver = MockMessageDriver::new();
    driver.attach_device(2);
    driver.script_create_failures(2, 3);
    let (supervisor, _addr) = start_daemon(&driver);

    // 前 3 次创建失败，重试策略内恢复
    wait_until("device 2 serving after retries", || {
        supervisor.env().registry.is_served(2)
    });

    supervisor.shutdown();
}

#[test]
fn test_hotplug_detach_stops_serving() {
    let driver = MockMessageDriver::new();
    driver.attach_device(5);
    let (supervisor, addr) = start_daemon(&driver);
    wait_until("device 5 serving", || {
        supervisor.env().registry.is_served(5)
    });

    driver.detach_device(5);
    wait_until("device 5 removed", || {
        supervisor.env().registry.snapshot().is_empty()
    });

    // 下线后注册表不再列出该设备
    let mut client = TcpClient::connect(addr);
    let reply = client.roundtrip(&RequestEnvelope::new(CommandClass::QueryStatus, HOST_DEVICE_ID, &b""[..]));
    assert!(reply.is_ok());
    let text = String::from_utf8(reply.payload.to_vec()).unwrap();
    assert!(text.contains("devices:"));
    assert!(!text.contains("5:"));

    supervisor.shutdown();
}

#[test]
fn test_unknown_command_over_socket() {
    let driver = MockMessageDriver::new();
    let (supervisor, addr) = start_daemon(&driver);

    let mut client = TcpClient::connect(addr);
    let reply = client.roundtrip(&RequestEnvelope::new(
        CommandClass::ProfStart,
        HOST_DEVICE_ID,
        &b""[..],
    ));
    assert_eq!(reply.status, StatusCode::UnknownCommand);

    // 会话未被关闭
    let reply = client.roundtrip(&RequestEnvelope::new(CommandClass::Detect, 0, &b""[..]));
    assert!(reply.is_ok());

    supervisor.shutdown();
}

#[test]
fn test_query_status_reports_channel_traffic() {
    let driver = MockMessageDriver::new();
    driver.attach_device(7);
    let (supervisor, addr) = start_daemon(&driver);
    wait_until("device 7 serving", || {
        supervisor.env().registry.is_served(7)
    });

    // 设备通道上打一个请求，再从 socket 查状态
    let mut session = driver.connect(7).unwrap();
    let req = RequestEnvelope::new(CommandClass::Detect, 7, &b"x"[..]);
    assert!(roundtrip(&mut session, &req, 64, TICK).unwrap().is_ok());

    let mut client = TcpClient::connect(addr);
    let reply = client.roundtrip(&RequestEnvelope::new(
        CommandClass::QueryStatus,
        HOST_DEVICE_ID,
        &b""[..],
    ));
    assert!(reply.is_ok());
    let text = String::from_utf8(reply.payload.to_vec()).unwrap();
    assert!(text.contains("7: serving"));

    supervisor.shutdown();
}

#[test]
fn test_shutdown_converges_with_open_sessions() {
    let driver = MockMessageDriver::new();
    driver.attach_device(4);
    let (supervisor, _addr) = start_daemon(&driver);
    wait_until("device 4 serving", || {
        supervisor.env().registry.is_served(4)
    });

    // 打开一个空闲设备会话，然后直接关停
    let mut session = driver.connect(4).unwrap();
    let req = RequestEnvelope::new(CommandClass::Detect, 4, &b""[..]);
    assert!(roundtrip(&mut session, &req, 64, TICK).unwrap().is_ok());

    supervisor.shutdown();
    assert!(supervisor.env().registry.snapshot().is_empty());
    // 幂等
    supervisor.shutdown();
}

#[test]
fn test_shutdown_waits_for_socket_sessions() {
    let driver = MockMessageDriver::new();
    let (supervisor, addr) = start_daemon(&driver);

    let mut client = TcpClient::connect(addr);
    let reply = client.roundtrip(&RequestEnvelope::new(CommandClass::Detect, 0, &b"hi"[..]));
    assert!(reply.is_ok());

    // 关停返回前 socket worker 必须已退出：对端立即观察到干净关闭
    supervisor.shutdown();
    let deadline = Instant::now() + Duration::from_secs(2);
    let err = loop {
        match read_packet(&mut client.stream) {
            Ok(None) => assert!(Instant::now() < deadline, "peer socket not closed"),
            Ok(Some(_)) => panic!("unexpected frame after shutdown"),
            Err(e) => break e,
        }
    };
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
}

#[test]
fn test_kind_of_device_channel_session() {
    let driver = MockMessageDriver::new();
    driver.attach_device(6);
    let (supervisor, _addr) = start_daemon(&driver);
    wait_until("device 6 serving", || {
        supervisor.env().registry.is_served(6)
    });

    let session = driver.connect(6).unwrap();
    assert_eq!(devc_channel::ControlSession::kind(&session), ChannelKind::Device);

    supervisor.shutdown();
}
