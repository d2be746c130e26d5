//! 设备注册表与生命周期状态机
//!
//! 每个物理设备一条记录，生命周期：
//!
//! ```text
//! Attached ──begin_serving──▶ Serving ──detach──▶ Draining ──最后一个会话结束──▶ (移除)
//!     │                                              ▲
//!     └──────────────detach（无会话，立即移除）────────┘
//! ```
//!
//! "Removed" 不是一个显式状态：记录从表中消失即为已移除。同一
//! 设备 ID 重新接入从 `Attached` 重新开始，不保留旧状态。
//!
//! 全部状态在一把 [`Mutex`] 之下，配套一个 [`Condvar`] 用于
//! 关停路径等待排空完成。会话通过 [`SessionGuard`] 引用计数，
//! guard drop 时递减，保证所有退出路径都释放引用。

use crate::error::DaemonError;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 设备生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// 已接入，消息 server 尚未就绪
    Attached,
    /// server 就绪，接受新会话
    Serving,
    /// 已请求下线：不再接受新会话，等待在途会话排空
    Draining,
}

impl Lifecycle {
    fn name(self) -> &'static str {
        match self {
            Lifecycle::Attached => "Attached",
            Lifecycle::Serving => "Serving",
            Lifecycle::Draining => "Draining",
        }
    }
}

#[derive(Debug)]
struct DeviceRecord {
    state: Lifecycle,
    active_sessions: u32,
}

/// 设备 server 创建的重试策略
///
/// 设备上电后驱动侧就绪存在窗口期，首次创建失败按固定间隔
/// 重试，重试耗尽才视为该设备不可服务。
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// 最大尝试次数（含首次）
    pub max_attempts: u32,
    /// 两次尝试之间的等待
    pub wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 12,
            wait: Duration::from_millis(500),
        }
    }
}

/// 设备注册表
///
/// 热插拔通知线程、会话 worker 与关停路径共享的唯一事实来源。
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<u32, DeviceRecord>>,
    drained: Condvar,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个新接入的设备（初始状态 `Attached`）
    ///
    /// 同一设备 ID 重复接入是幂等的：已有记录时返回
    /// `DeviceAlreadyAttached`，调用方通常降级为告警。
    pub fn attach(&self, device_id: u32) -> Result<(), DaemonError> {
        let mut devices = self.devices.lock();
        if devices.contains_key(&device_id) {
            return Err(DaemonError::DeviceAlreadyAttached(device_id));
        }
        devices.insert(
            device_id,
            DeviceRecord {
                state: Lifecycle::Attached,
                active_sessions: 0,
            },
        );
        info!(device_id, "device attached");
        Ok(())
    }

    /// 设备消息 server 就绪，开始接受会话
    pub fn begin_serving(&self, device_id: u32) -> Result<(), DaemonError> {
        let mut devices = self.devices.lock();
        let record = devices
            .get_mut(&device_id)
            .ok_or(DaemonError::DeviceNotAttached(device_id))?;
        match record.state {
            Lifecycle::Attached => {
                record.state = Lifecycle::Serving;
                info!(device_id, "device serving");
                Ok(())
            },
            other => Err(DaemonError::BadLifecycleState {
                device_id,
                state: other.name(),
                expected: "Attached",
            }),
        }
    }

    /// 请求设备下线
    ///
    /// 无在途会话时立即移除记录；否则转入 `Draining`，由最后一个
    /// [`SessionGuard`] 的 drop 完成移除。对未知设备是无害的
    /// no-op（拔出事件可能重复投递）。
    pub fn detach(&self, device_id: u32) {
        let mut devices = self.devices.lock();
        let Some(record) = devices.get_mut(&device_id) else {
            debug!(device_id, "detach for unknown device ignored");
            return;
        };
        if record.active_sessions == 0 {
            devices.remove(&device_id);
            info!(device_id, "device removed (no active sessions)");
            self.drained.notify_all();
        } else {
            record.state = Lifecycle::Draining;
            info!(
                device_id,
                active_sessions = record.active_sessions,
                "device draining"
            );
        }
    }

    /// 请求所有在位设备下线（关停路径）
    pub fn detach_all(&self) {
        let ids: Vec<u32> = self.devices.lock().keys().copied().collect();
        for device_id in ids {
            self.detach(device_id);
        }
    }

    /// 在 `Serving` 设备上登记一个新会话
    ///
    /// 返回的 guard 将设备引用计数 +1，drop 时 -1。`Draining`
    /// 设备拒绝新会话，保证排空单调完成。
    pub fn start_session(self: &Arc<Self>, device_id: u32) -> Result<SessionGuard, DaemonError> {
        let mut devices = self.devices.lock();
        let record = devices
            .get_mut(&device_id)
            .ok_or(DaemonError::DeviceNotAttached(device_id))?;
        match record.state {
            Lifecycle::Serving => {
                record.active_sessions += 1;
                debug!(
                    device_id,
                    active_sessions = record.active_sessions,
                    "session pinned"
                );
                Ok(SessionGuard {
                    registry: Arc::clone(self),
                    device_id,
                })
            },
            Lifecycle::Draining => Err(DaemonError::DeviceDraining(device_id)),
            other => Err(DaemonError::BadLifecycleState {
                device_id,
                state: other.name(),
                expected: "Serving",
            }),
        }
    }

    /// 设备当前是否处于可服务状态
    pub fn is_served(&self, device_id: u32) -> bool {
        self.devices
            .lock()
            .get(&device_id)
            .map(|r| r.state == Lifecycle::Serving)
            .unwrap_or(false)
    }

    /// 设备是否已下线或正在下线（worker 在请求间检查该标志）
    pub fn is_disabled(&self, device_id: u32) -> bool {
        self.devices
            .lock()
            .get(&device_id)
            .map(|r| r.state == Lifecycle::Draining)
            .unwrap_or(true)
    }

    /// 当前注册表快照：(设备 ID, 状态, 在途会话数)
    pub fn snapshot(&self) -> Vec<(u32, Lifecycle, u32)> {
        let devices = self.devices.lock();
        let mut rows: Vec<_> = devices
            .iter()
            .map(|(id, r)| (*id, r.state, r.active_sessions))
            .collect();
        rows.sort_unstable_by_key(|row| row.0);
        rows
    }

    /// 等待指定设备的记录被移除
    ///
    /// 返回 `true` 表示已移除，`false` 表示超时（设备仍有在途会话）。
    pub fn wait_removed(&self, device_id: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut devices = self.devices.lock();
        while devices.contains_key(&device_id) {
            if self.drained.wait_until(&mut devices, deadline).timed_out() {
                return !devices.contains_key(&device_id);
            }
        }
        true
    }

    /// 等待注册表清空（关停路径，有界等待）
    pub fn wait_all_removed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut devices = self.devices.lock();
        while !devices.is_empty() {
            if self.drained.wait_until(&mut devices, deadline).timed_out() {
                if devices.is_empty() {
                    return true;
                }
                warn!(
                    remaining = devices.len(),
                    "shutdown drain timed out with devices still pinned"
                );
                return false;
            }
        }
        true
    }

    fn release_session(&self, device_id: u32) {
        let mut devices = self.devices.lock();
        let Some(record) = devices.get_mut(&device_id) else {
            return;
        };
        record.active_sessions = record.active_sessions.saturating_sub(1);
        debug!(
            device_id,
            active_sessions = record.active_sessions,
            "session released"
        );
        if record.state == Lifecycle::Draining && record.active_sessions == 0 {
            devices.remove(&device_id);
            info!(device_id, "device removed (drain complete)");
            self.drained.notify_all();
        }
    }
}

/// 会话对设备的引用凭据
///
/// 存续期间设备记录不会被移除；drop 递减引用计数并在排空
/// 完成时触发移除。
#[derive(Debug)]
pub struct SessionGuard {
    registry: Arc<DeviceRegistry>,
    device_id: u32,
}

impl SessionGuard {
    pub fn device_id(&self) -> u32 {
        self.device_id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.release_session(self.device_id);
    }
}
