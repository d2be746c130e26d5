//! # Devc Daemon Core
//!
//! 加速卡控制通道守护进程的核心：设备注册表与生命周期状态机、
//! 命令分发表、会话 worker、热插拔通知与监督器。
//!
//! ## 架构
//!
//! ```text
//! Supervisor
//!   ├── hotplug_notifier 线程 ──▶ DeviceRegistry（attach/detach）
//!   ├── sock_accept 线程 ──▶ 每连接一个 sock_worker 线程
//!   └── dev_accept_N 线程 ──▶ 每会话一个 dev_worker_N 线程
//!
//! worker 循环：接收 → 重组 → 分发 → 应答
//! ```
//!
//! 传输细节在 `devc-channel`，帧/信封编解码在 `devc-protocol`；
//! 本 crate 只消费 [`ControlSession`](devc_channel::ControlSession)
//! 抽象，不感知字节如何到达。

pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod registry;
pub mod stats;
pub mod supervisor;
pub mod worker;

pub use dispatch::{CommandHandler, DispatchTable, RequestContext};
pub use error::{DaemonError, HandlerError};
pub use registry::{DeviceRegistry, Lifecycle, RetryPolicy, SessionGuard};
pub use stats::DaemonStats;
pub use supervisor::{Supervisor, SupervisorConfig};
pub use worker::{WorkerEnv, roundtrip, run_session};
