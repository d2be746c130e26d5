//! 命令分发表
//!
//! 以 (命令类, 通道类型) 为键查找处理器。表在启动期由
//! [`DispatchTableBuilder`] 一次性构建，进入服务状态后不可变，
//! worker 侧查表无需加锁。
//!
//! 查找失败（命令类未注册）是客户端可见错误，不是守护进程故障：
//! 回 `UnknownCommand` 应答，会话保持打开。

use crate::error::{DaemonError, HandlerError};
use crate::registry::DeviceRegistry;
use crate::stats::DaemonStats;
use bytes::Bytes;
use devc_channel::ChannelKind;
use devc_protocol::{CommandClass, RequestEnvelope};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// 处理器看到的请求上下文
pub struct RequestContext {
    /// 请求到达的通道类型
    pub channel: ChannelKind,
    /// 会话对端标识（日志用）
    pub peer: String,
    /// 设备注册表（处理器只读查询，例如状态上报）
    pub registry: Arc<DeviceRegistry>,
    /// 守护进程运行统计
    pub stats: Arc<DaemonStats>,
}

/// 命令处理器契约
///
/// 启动期 `init` 一次、关停期 `destroy` 一次；`process` 在会话
/// worker 线程内同步调用，阻塞只影响本会话。实现必须可在多个
/// worker 线程间共享。
pub trait CommandHandler: Send + Sync {
    /// 处理器名（日志/注册错误用）
    fn name(&self) -> &'static str;

    /// 启动期初始化
    fn init(&self) -> Result<(), HandlerError> {
        Ok(())
    }

    /// 处理一个完整请求，返回应答载荷
    fn process(&self, ctx: &RequestContext, req: &RequestEnvelope) -> Result<Bytes, HandlerError>;

    /// 关停期清理
    fn destroy(&self) {}

    /// 该命令是否要求目标设备处于可服务状态
    ///
    /// 返回 `true` 时，socket 通道上携带真实设备 ID 的请求先做
    /// 设备在位检查；主机侧命令返回 `false` 跳过检查。
    fn needs_device(&self) -> bool {
        true
    }
}

type DispatchKey = (CommandClass, ChannelKind);

/// 不可变命令分发表
pub struct DispatchTable {
    handlers: HashMap<DispatchKey, Arc<dyn CommandHandler>>,
}

impl DispatchTable {
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder {
            handlers: HashMap::new(),
        }
    }

    /// 查找处理器
    pub fn lookup(&self, command: CommandClass, channel: ChannelKind) -> Option<&Arc<dyn CommandHandler>> {
        self.handlers.get(&(command, channel))
    }

    /// 启动期依次初始化所有处理器（同一实例只初始化一次）
    pub fn init_all(&self) -> Result<(), DaemonError> {
        for handler in self.unique_handlers() {
            handler.init().map_err(|e| DaemonError::HandlerInit {
                name: handler.name(),
                source: e,
            })?;
            info!(handler = handler.name(), "handler initialized");
        }
        Ok(())
    }

    /// 关停期依次清理所有处理器
    pub fn destroy_all(&self) {
        for handler in self.unique_handlers() {
            handler.destroy();
            info!(handler = handler.name(), "handler destroyed");
        }
    }

    /// 已注册的分发键数量
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    // 同一处理器实例可注册到多个键下，init/destroy 按实例去重
    fn unique_handlers(&self) -> Vec<&Arc<dyn CommandHandler>> {
        let mut seen: Vec<&Arc<dyn CommandHandler>> = Vec::new();
        for handler in self.handlers.values() {
            if !seen.iter().any(|h| Arc::ptr_eq(h, handler)) {
                seen.push(handler);
            }
        }
        seen
    }
}

/// 分发表构建器
///
/// 重复注册同一 (命令类, 通道类型) 键是启动期致命错误。
pub struct DispatchTableBuilder {
    handlers: HashMap<DispatchKey, Arc<dyn CommandHandler>>,
}

impl DispatchTableBuilder {
    /// 注册一个处理器
    pub fn register(
        mut self,
        command: CommandClass,
        channel: ChannelKind,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<Self, DaemonError> {
        if self.handlers.contains_key(&(command, channel)) {
            return Err(DaemonError::DuplicateHandler(format!(
                "({command:?}, {channel})"
            )));
        }
        self.handlers.insert((command, channel), handler);
        Ok(self)
    }

    /// 同一处理器注册到两种通道
    pub fn register_both(
        self,
        command: CommandClass,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<Self, DaemonError> {
        self.register(command, ChannelKind::Socket, Arc::clone(&handler))?
            .register(command, ChannelKind::Device, handler)
    }

    pub fn build(self) -> DispatchTable {
        DispatchTable {
            handlers: self.handlers,
        }
    }
}
