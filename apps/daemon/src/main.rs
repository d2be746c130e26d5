//! 控制通道守护进程主入口
//!
//! 启动顺序：单例锁 → 日志 → 证书装载 → 监听器绑定 → 监督器
//! 启动（注册表/通知线程/枚举上线）→ 等待退出信号。启动期任一
//! 失败以非零码退出，不进入服务状态。
//!
//! 设备后端：厂商消息传递驱动在本仓库边界之外，二进制默认挂载
//! 进程内 mock 后端（`--mock-device` 预接入设备），用于联调与
//! 端到端验证；接入真实驱动只需替换 `MessageDriver` 实现。

mod singleton;

use clap::Parser;
use devc_channel::mock::MockMessageDriver;
use devc_channel::{CertPaths, ListenerMode, SocketListener, TlsServerConfig};
use devc_daemon::handlers::{DetectHandler, QueryStatusHandler};
use devc_daemon::{DispatchTable, RetryPolicy, Supervisor, SupervisorConfig};
use devc_protocol::{CommandClass, DEFAULT_MAX_CHUNK};
use singleton::SingletonLock;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// 加速卡控制通道守护进程
#[derive(Parser, Debug)]
#[command(name = "devcd")]
#[command(about = "Accelerator device control-channel daemon", long_about = None)]
struct Args {
    /// socket 通道监听地址
    #[arg(long, default_value = "127.0.0.1:22810")]
    listen: String,

    /// CA 证书路径（PEM）
    #[arg(long)]
    ca: Option<PathBuf>,

    /// 服务端证书链路径（PEM）
    #[arg(long)]
    cert: Option<PathBuf>,

    /// 服务端私钥路径（PEM，未加密）
    #[arg(long)]
    key: Option<PathBuf>,

    /// 证书应匹配的服务名
    #[arg(long, default_value = "localhost")]
    server_name: String,

    /// 明文监听（仅测试；生产部署必须提供证书）
    #[arg(long, hide = true)]
    insecure_plaintext: bool,

    /// 锁文件路径
    ///
    /// 默认自动选择用户可写目录（XDG_RUNTIME_DIR 或 /tmp）
    #[arg(long)]
    lock_file: Option<String>,

    /// 信封分片大小（字节）
    #[arg(long, default_value_t = DEFAULT_MAX_CHUNK)]
    max_chunk: usize,

    /// 设备 server 创建的最大尝试次数
    #[arg(long, default_value = "12")]
    retry_attempts: u32,

    /// 两次创建尝试之间的等待（毫秒）
    #[arg(long, default_value = "500")]
    retry_wait_ms: u64,

    /// 单设备下线排空等待上限（秒）
    #[arg(long, default_value = "5")]
    drain_timeout: u64,

    /// 关停时全体排空等待上限（秒）
    #[arg(long, default_value = "10")]
    shutdown_timeout: u64,

    /// 预接入的 mock 设备 ID（可重复）
    #[arg(long)]
    mock_device: Vec<u32>,
}

/// 默认锁文件路径：优先 XDG_RUNTIME_DIR，其次 /tmp
fn default_lock_file() -> String {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        let path = std::path::Path::new(&runtime_dir).join("devcd.lock");
        if let Some(parent) = path.parent()
            && (parent.exists() || std::fs::create_dir_all(parent).is_ok())
        {
            return path.to_string_lossy().to_string();
        }
    }
    "/tmp/devcd.lock".to_string()
}

fn listener_mode(args: &Args) -> Result<ListenerMode, String> {
    if args.insecure_plaintext {
        warn!("running with --insecure-plaintext, sessions are NOT encrypted");
        return Ok(ListenerMode::Plaintext);
    }
    let (Some(ca), Some(cert), Some(key)) = (&args.ca, &args.cert, &args.key) else {
        return Err("--ca, --cert and --key are required (or --insecure-plaintext for tests)".into());
    };
    let paths = CertPaths {
        ca: ca.clone(),
        cert: cert.clone(),
        key: key.clone(),
        key_password: None,
        server_name: args.server_name.clone(),
    };
    let config = TlsServerConfig::load(&paths).map_err(|e| e.to_string())?;
    Ok(ListenerMode::Tls(config))
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // 单例锁：同一主机只允许一个实例
    let lock_file = args.lock_file.clone().unwrap_or_else(default_lock_file);
    let _lock = match SingletonLock::try_lock(&lock_file) {
        Ok(lock) => lock,
        Err(e) => {
            error!(lock_file, error = %e, "failed to acquire singleton lock");
            process::exit(1);
        },
    };

    // 证书装载与校验：任何失败都是启动期致命错误
    let mode = match listener_mode(&args) {
        Ok(mode) => mode,
        Err(e) => {
            error!(error = %e, "certificate setup failed");
            process::exit(1);
        },
    };

    let listener = match SocketListener::bind(&args.listen, mode) {
        Ok(listener) => listener,
        Err(e) => {
            error!(listen = %args.listen, error = %e, "failed to bind listener");
            process::exit(1);
        },
    };

    let dispatch = match DispatchTable::builder()
        .register_both(CommandClass::Detect, Arc::new(DetectHandler))
        .and_then(|b| b.register_both(CommandClass::QueryStatus, Arc::new(QueryStatusHandler)))
    {
        Ok(builder) => builder.build(),
        Err(e) => {
            error!(error = %e, "handler registration failed");
            process::exit(1);
        },
    };

    let driver = MockMessageDriver::new();
    let hotplug = driver.hotplug_source();
    for device_id in &args.mock_device {
        driver.attach_device(*device_id);
    }

    let config = SupervisorConfig {
        max_chunk: args.max_chunk,
        retry: RetryPolicy {
            max_attempts: args.retry_attempts,
            wait: Duration::from_millis(args.retry_wait_ms),
        },
        drain_timeout: Duration::from_secs(args.drain_timeout),
        shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
        ..SupervisorConfig::default()
    };

    info!(listen = %args.listen, lock_file, "devcd starting");
    let supervisor = match Supervisor::start(
        config,
        dispatch,
        listener,
        Arc::new(driver),
        Box::new(hotplug),
    ) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!(error = %e, "daemon startup failed");
            process::exit(1);
        },
    };

    // 信号 → 优雅关停
    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    }) {
        error!(error = %e, "failed to install signal handler");
        supervisor.shutdown();
        process::exit(1);
    }

    info!("devcd started, press Ctrl+C to stop");
    let _ = stop_rx.recv();
    info!("interrupt received, shutting down");
    supervisor.shutdown();
}
