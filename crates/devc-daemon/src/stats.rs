//! 运行统计
//!
//! 各 worker 线程无锁递增的计数器集合，`QueryStatus` 命令和
//! 关停日志读取。计数只增不减，读取使用 Relaxed 即可。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// 守护进程运行统计
#[derive(Debug)]
pub struct DaemonStats {
    /// 已接受的会话数（两种通道合计）
    pub sessions_opened: AtomicU64,
    /// 已结束的会话数
    pub sessions_closed: AtomicU64,
    /// 成功分发的请求数
    pub requests_dispatched: AtomicU64,
    /// 已发送的应答数（含错误应答）
    pub replies_sent: AtomicU64,
    /// 会话级协议错误数
    pub protocol_errors: AtomicU64,
    /// 未注册命令类的请求数
    pub unknown_commands: AtomicU64,
    /// 处理器返回失败的请求数
    pub handler_errors: AtomicU64,
    /// 因目标设备不在服务而拒绝的请求数
    pub device_not_served: AtomicU64,
    started_at: Instant,
}

impl DaemonStats {
    pub fn new() -> Self {
        Self {
            sessions_opened: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            requests_dispatched: AtomicU64::new(0),
            replies_sent: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            unknown_commands: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
            device_not_served: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// 守护进程运行时长（秒）
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// 渲染为多行文本（`QueryStatus` 应答载荷）
    pub fn render(&self) -> String {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        format!(
            "uptime_secs: {}\n\
             sessions_opened: {}\n\
             sessions_closed: {}\n\
             requests_dispatched: {}\n\
             replies_sent: {}\n\
             protocol_errors: {}\n\
             unknown_commands: {}\n\
             handler_errors: {}\n\
             device_not_served: {}\n",
            self.uptime_secs(),
            get(&self.sessions_opened),
            get(&self.sessions_closed),
            get(&self.requests_dispatched),
            get(&self.replies_sent),
            get(&self.protocol_errors),
            get(&self.unknown_commands),
            get(&self.handler_errors),
            get(&self.device_not_served),
        )
    }
}

impl Default for DaemonStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 计数器 +1 的简写
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
