//! 守护进程监督器
//!
//! 固定的启动顺序：注册表 → 热插拔通知线程 → 分发表初始化 →
//! socket 监听线程 → 枚举在位设备并逐个上线 → 进入稳态。
//! 关停按相反方向收敛：置关停标志 → 停止接受新会话 → 全体设备
//! 转入排空 → 有界等待在途会话结束 → 销毁 server 并回收线程。
//!
//! 监督器本身不碰任何会话字节：收发全部发生在会话 worker 线程。

use crate::dispatch::DispatchTable;
use crate::error::DaemonError;
use crate::registry::{DeviceRegistry, RetryPolicy};
use crate::stats::DaemonStats;
use crate::worker::{WorkerEnv, run_session};
use devc_channel::{
    ChannelError, DeviceServer, HotplugAction, HotplugSource, MessageDriver, SocketListener,
};
use devc_protocol::DEFAULT_MAX_CHUNK;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// 监督器配置
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// accept/事件循环的轮询周期
    pub accept_tick: Duration,
    /// 信封编码的分片大小
    pub max_chunk: usize,
    /// 设备 server 创建的重试策略
    pub retry: RetryPolicy,
    /// 单个设备下线时等待排空的上限
    pub drain_timeout: Duration,
    /// 关停时等待全体设备排空的上限
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            accept_tick: Duration::from_millis(250),
            max_chunk: DEFAULT_MAX_CHUNK,
            retry: RetryPolicy::default(),
            drain_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// 守护进程监督器
pub struct Supervisor {
    env: Arc<WorkerEnv>,
    driver: Arc<dyn MessageDriver>,
    config: SupervisorConfig,
    servers: Mutex<HashMap<u32, Arc<DeviceServer>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// 在途 socket 会话数；设备会话由注册表引用计数覆盖
    sock_sessions: Arc<AtomicUsize>,
    stopped: AtomicBool,
}

impl Supervisor {
    /// 按固定顺序启动守护进程，返回稳态运行中的监督器
    ///
    /// 任何一步失败都让错误向上传播，调用方以非零退出；已登记
    /// 设备的 server 创建失败不算启动失败（记录日志，设备留在
    /// `Attached`，等待下一次拔插）。
    pub fn start(
        config: SupervisorConfig,
        dispatch: DispatchTable,
        listener: SocketListener,
        driver: Arc<dyn MessageDriver>,
        hotplug: Box<dyn HotplugSource>,
    ) -> Result<Arc<Self>, DaemonError> {
        let env = Arc::new(WorkerEnv {
            registry: Arc::new(DeviceRegistry::new()),
            dispatch: Arc::new(dispatch),
            stats: Arc::new(DaemonStats::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            max_chunk: config.max_chunk,
            stall_ticks: crate::worker::DEFAULT_ENVELOPE_STALL_TICKS,
        });
        env.dispatch.init_all()?;

        let supervisor = Arc::new(Self {
            env,
            driver,
            config,
            servers: Mutex::new(HashMap::new()),
            threads: Mutex::new(Vec::new()),
            sock_sessions: Arc::new(AtomicUsize::new(0)),
            stopped: AtomicBool::new(false),
        });

        // 热插拔通知线程：只调用注册表入口和上/下线方法
        let sup = Arc::clone(&supervisor);
        let handle = thread::Builder::new()
            .name("hotplug_notifier".into())
            .spawn(move || sup.notifier_loop(hotplug))
            .map_err(|e| DaemonError::ThreadSpawn {
                name: "hotplug_notifier".into(),
                source: e,
            })?;
        supervisor.threads.lock().push(handle);

        // socket accept 线程
        let sup = Arc::clone(&supervisor);
        let handle = thread::Builder::new()
            .name("sock_accept".into())
            .spawn(move || sup.sock_accept_loop(listener))
            .map_err(|e| DaemonError::ThreadSpawn {
                name: "sock_accept".into(),
                source: e,
            })?;
        supervisor.threads.lock().push(handle);

        // 启动期枚举：在位设备逐个上线
        for device_id in supervisor.driver.enumerate() {
            match supervisor.env.registry.attach(device_id) {
                Ok(()) => {
                    if let Err(e) = supervisor.serve_device(device_id) {
                        error!(device_id, error = %e, "device server bring-up failed at startup");
                    }
                },
                Err(DaemonError::DeviceAlreadyAttached(_)) => {
                    // 热插拔事件抢先处理了该设备
                    debug!(device_id, "device already attached during enumeration");
                },
                Err(e) => return Err(e),
            }
        }

        info!("supervisor entered steady state");
        Ok(supervisor)
    }

    /// worker 共享环境（测试与状态查询用）
    pub fn env(&self) -> &Arc<WorkerEnv> {
        &self.env
    }

    /// 关停守护进程并等待收敛（幂等）
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutdown requested");
        self.env.shutdown.store(true, Ordering::SeqCst);

        // 停止接受新会话，然后全体排空
        for server in self.servers.lock().values() {
            server.shutdown();
        }
        self.env.registry.detach_all();
        let deadline = Instant::now() + self.config.shutdown_timeout;
        if !self
            .env
            .registry
            .wait_all_removed(self.config.shutdown_timeout)
        {
            warn!("some device sessions did not drain before shutdown timeout");
        }

        // socket 会话不持注册表引用，单独有界等待后强制继续
        while self.sock_sessions.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                warn!(
                    active = self.sock_sessions.load(Ordering::SeqCst),
                    "socket sessions did not finish before shutdown timeout"
                );
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        for (device_id, server) in self.servers.lock().drain() {
            if let Err(e) = server.destroy() {
                warn!(device_id, error = %e, "device server destroy failed");
            }
        }

        let threads: Vec<JoinHandle<()>> = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let name = handle.thread().name().unwrap_or("?").to_string();
            if handle.join().is_err() {
                error!(thread = %name, "supervised thread panicked");
            }
        }

        self.env.dispatch.destroy_all();
        info!("shutdown complete");
    }

    /// 为已登记设备创建消息 server 并进入服务状态
    fn serve_device(self: &Arc<Self>, device_id: u32) -> Result<(), DaemonError> {
        let raw = create_server_with_retry(
            self.driver.as_ref(),
            device_id,
            self.config.retry,
            &self.env.shutdown,
        )?;
        let server = Arc::new(DeviceServer::new(device_id, raw));
        self.env.registry.begin_serving(device_id)?;
        self.servers.lock().insert(device_id, Arc::clone(&server));

        let sup = Arc::clone(self);
        let name = format!("dev_accept_{device_id}");
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || sup.dev_accept_loop(device_id, server))
            .map_err(|e| DaemonError::ThreadSpawn { name, source: e })?;
        self.threads.lock().push(handle);
        Ok(())
    }

    /// 设备下线：排空在途会话后销毁 server
    fn stop_serving(&self, device_id: u32) {
        self.env.registry.detach(device_id);
        let Some(server) = self.servers.lock().remove(&device_id) else {
            return;
        };
        server.shutdown();
        if !self
            .env
            .registry
            .wait_removed(device_id, self.config.drain_timeout)
        {
            warn!(device_id, "sessions did not drain before device removal timeout");
        }
        if let Err(e) = server.destroy() {
            warn!(device_id, error = %e, "device server destroy failed");
        }
    }

    fn notifier_loop(self: Arc<Self>, mut hotplug: Box<dyn HotplugSource>) {
        loop {
            if self.env.shutdown.load(Ordering::Relaxed) {
                break;
            }
            let event = match hotplug.recv_event(self.config.accept_tick) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    if !self.env.shutdown.load(Ordering::Relaxed) {
                        warn!(error = %e, "hotplug source closed, notifier exiting");
                    }
                    break;
                },
            };
            match event.action {
                HotplugAction::Attach => match self.env.registry.attach(event.device_id) {
                    Ok(()) => {
                        info!(device_id = event.device_id, "hotplug attach");
                        if let Err(e) = self.serve_device(event.device_id) {
                            error!(
                                device_id = event.device_id,
                                error = %e,
                                "device server bring-up failed"
                            );
                        }
                    },
                    Err(DaemonError::DeviceAlreadyAttached(_)) => {
                        debug!(device_id = event.device_id, "duplicate attach event ignored");
                    },
                    Err(e) => {
                        warn!(device_id = event.device_id, error = %e, "attach rejected");
                    },
                },
                HotplugAction::Detach => {
                    info!(device_id = event.device_id, "hotplug detach");
                    self.stop_serving(event.device_id);
                },
            }
        }
        debug!("hotplug notifier exited");
    }

    fn sock_accept_loop(self: Arc<Self>, listener: SocketListener) {
        loop {
            if self.env.shutdown.load(Ordering::Relaxed) {
                break;
            }
            match listener.accept() {
                Ok(Some(session)) => {
                    let env = Arc::clone(&self.env);
                    let active = Arc::clone(&self.sock_sessions);
                    active.fetch_add(1, Ordering::SeqCst);
                    let spawned = thread::Builder::new()
                        .name("sock_worker".into())
                        .spawn(move || {
                            run_session(&env, Box::new(session), None);
                            active.fetch_sub(1, Ordering::SeqCst);
                        });
                    if let Err(e) = spawned {
                        self.sock_sessions.fetch_sub(1, Ordering::SeqCst);
                        error!(error = %e, "failed to spawn socket session worker");
                    }
                },
                Ok(None) => thread::sleep(self.config.accept_tick),
                Err(e) => {
                    // 单个连接的握手/accept 失败只影响该连接
                    warn!(error = %e, "socket accept failed");
                    thread::sleep(self.config.accept_tick);
                },
            }
        }
        debug!("socket accept loop exited");
    }

    fn dev_accept_loop(self: Arc<Self>, device_id: u32, server: Arc<DeviceServer>) {
        loop {
            if self.env.shutdown.load(Ordering::Relaxed)
                || self.env.registry.is_disabled(device_id)
            {
                break;
            }
            match server.accept_session(self.config.accept_tick) {
                Ok(Some(session)) => {
                    let guard = match self.env.registry.start_session(device_id) {
                        Ok(guard) => guard,
                        Err(e) => {
                            // 设备刚好转入排空，拒绝会话
                            debug!(device_id, error = %e, "session rejected");
                            continue;
                        },
                    };
                    let env = Arc::clone(&self.env);
                    let name = format!("dev_worker_{device_id}");
                    let spawned = thread::Builder::new()
                        .name(name)
                        .spawn(move || run_session(&env, Box::new(session), Some(guard)));
                    if let Err(e) = spawned {
                        error!(device_id, error = %e, "failed to spawn device session worker");
                    }
                },
                Ok(None) => continue,
                Err(ChannelError::SessionPoolExhausted(limit)) => {
                    warn!(device_id, limit, "session rejected: id pool exhausted");
                },
                Err(e) => {
                    if !e.is_closed() {
                        warn!(device_id, error = %e, "device accept failed");
                    }
                    break;
                },
            }
        }
        debug!(device_id, "device accept loop exited");
    }
}

/// 按重试策略创建设备消息 server
///
/// 只有 [`ChannelError::NotReady`] 触发重试；其他错误立即失败。
/// 关停标志置位时提前放弃。
fn create_server_with_retry(
    driver: &dyn MessageDriver,
    device_id: u32,
    retry: RetryPolicy,
    shutdown: &AtomicBool,
) -> Result<Box<dyn devc_channel::RawServer>, DaemonError> {
    let mut last_error = String::new();
    for attempt in 1..=retry.max_attempts {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match driver.create_server(device_id) {
            Ok(raw) => {
                if attempt > 1 {
                    info!(device_id, attempt, "device server created after retry");
                }
                return Ok(raw);
            },
            Err(ChannelError::NotReady(msg)) => {
                debug!(device_id, attempt, "device server not ready yet");
                last_error = msg;
                if attempt < retry.max_attempts {
                    thread::sleep(retry.wait);
                }
            },
            Err(e) => return Err(e.into()),
        }
    }
    Err(DaemonError::ServerCreateExhausted {
        device_id,
        attempts: retry.max_attempts,
        last_error,
    })
}
