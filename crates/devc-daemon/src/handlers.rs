//! 内置命令处理器
//!
//! 守护进程自带 `Detect` 与 `QueryStatus` 两个处理器；其余命令类
//! （命令执行、文件传输、性能采集等）由外部处理器模块实现
//! [`CommandHandler`] 并在启动期注册。

use crate::dispatch::{CommandHandler, RequestContext};
use crate::error::HandlerError;
use crate::registry::Lifecycle;
use bytes::Bytes;
use devc_protocol::RequestEnvelope;
use std::fmt::Write as _;
use tracing::debug;

/// 存活探测
///
/// 回显请求载荷。客户端借此确认守护进程在位且会话可用；
/// 不做设备在位检查（device-id 为 0 的探测在设备枚举前就应可用）。
pub struct DetectHandler;

impl CommandHandler for DetectHandler {
    fn name(&self) -> &'static str {
        "detect"
    }

    fn process(&self, ctx: &RequestContext, req: &RequestEnvelope) -> Result<Bytes, HandlerError> {
        debug!(peer = %ctx.peer, channel = %ctx.channel, "detect probe");
        Ok(req.payload.clone())
    }

    fn needs_device(&self) -> bool {
        false
    }
}

/// 守护进程状态查询
///
/// 应答载荷为多行文本：运行统计 + 注册表快照。
pub struct QueryStatusHandler;

impl CommandHandler for QueryStatusHandler {
    fn name(&self) -> &'static str {
        "query_status"
    }

    fn process(&self, ctx: &RequestContext, _req: &RequestEnvelope) -> Result<Bytes, HandlerError> {
        let mut text = ctx.stats.render();
        text.push_str("devices:\n");
        for (device_id, state, sessions) in ctx.registry.snapshot() {
            let state = match state {
                Lifecycle::Attached => "attached",
                Lifecycle::Serving => "serving",
                Lifecycle::Draining => "draining",
            };
            let _ = writeln!(text, "  {device_id}: {state} sessions={sessions}");
        }
        Ok(Bytes::from(text))
    }

    fn needs_device(&self) -> bool {
        false
    }
}
