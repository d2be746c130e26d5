//! Mock 后端（无硬件依赖）
//!
//! 进程内实现厂商驱动与热插拔事件源，用于测试和本地联调：
//! 会话由 crossbeam 通道承载，`attach_device`/`detach_device`
//! 同步驱动表状态并发出热插拔事件，`script_create_failures`
//! 可脚本化 server 创建的瞬时失败以测试重试策略。

use crate::device::{MessageDriver, RawServer, RawSession};
use crate::hotplug::{HotplugAction, HotplugEvent, HotplugSource};
use crate::{ChannelError, ChannelKind, ControlSession};
use crossbeam_channel::{Receiver, Sender, select, unbounded};
use devc_protocol::Packet;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct MockDevice {
    /// 剩余的脚本化 server 创建失败次数
    create_failures: u32,
    /// server 在位时的会话投递端
    accept_tx: Option<Sender<MockRawSession>>,
}

/// 进程内 mock 驱动
///
/// clone 共享同一份设备表。
#[derive(Clone)]
pub struct MockMessageDriver {
    devices: Arc<Mutex<HashMap<u32, MockDevice>>>,
    hotplug_tx: Sender<HotplugEvent>,
    hotplug_rx: Arc<Mutex<Option<Receiver<HotplugEvent>>>>,
}

impl MockMessageDriver {
    pub fn new() -> Self {
        let (hotplug_tx, hotplug_rx) = unbounded();
        Self {
            devices: Arc::new(Mutex::new(HashMap::new())),
            hotplug_tx,
            hotplug_rx: Arc::new(Mutex::new(Some(hotplug_rx))),
        }
    }

    /// 接入一个设备并发出 Attach 事件
    pub fn attach_device(&self, device_id: u32) {
        self.devices.lock().entry(device_id).or_insert(MockDevice {
            create_failures: 0,
            accept_tx: None,
        });
        let _ = self.hotplug_tx.send(HotplugEvent {
            device_id,
            action: HotplugAction::Attach,
        });
    }

    /// 拔出一个设备并发出 Detach 事件
    ///
    /// 拔出只断开 server 的 accept 路径；已建立会话的通道保留，
    /// 在途请求可以排空完成。
    pub fn detach_device(&self, device_id: u32) {
        self.devices.lock().remove(&device_id);
        let _ = self.hotplug_tx.send(HotplugEvent {
            device_id,
            action: HotplugAction::Detach,
        });
    }

    /// 让接下来 `n` 次 server 创建返回瞬时失败
    pub fn script_create_failures(&self, device_id: u32, n: u32) {
        if let Some(dev) = self.devices.lock().get_mut(&device_id) {
            dev.create_failures = n;
        }
    }

    /// 客户端视角：向设备的 server 建立一个会话
    pub fn connect(&self, device_id: u32) -> Result<MockClientSession, ChannelError> {
        let devices = self.devices.lock();
        let dev = devices
            .get(&device_id)
            .ok_or(ChannelError::NoSuchDevice(device_id))?;
        let Some(accept_tx) = dev.accept_tx.as_ref() else {
            return Err(ChannelError::NotReady(format!(
                "device {device_id} has no server yet"
            )));
        };

        let (c2s_tx, c2s_rx) = unbounded();
        let (s2c_tx, s2c_rx) = unbounded();
        accept_tx
            .send(MockRawSession {
                tx: s2c_tx,
                rx: c2s_rx,
            })
            .map_err(|_| ChannelError::Closed)?;

        Ok(MockClientSession {
            device_id,
            tx: c2s_tx,
            rx: s2c_rx,
        })
    }

    /// 取出热插拔事件源（只能取一次）
    pub fn hotplug_source(&self) -> MockHotplugSource {
        let rx = self
            .hotplug_rx
            .lock()
            .take()
            .expect("hotplug source already taken");
        MockHotplugSource { rx }
    }
}

impl Default for MockMessageDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageDriver for MockMessageDriver {
    fn enumerate(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.devices.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn create_server(&self, device_id: u32) -> Result<Box<dyn RawServer>, ChannelError> {
        let mut devices = self.devices.lock();
        let dev = devices
            .get_mut(&device_id)
            .ok_or(ChannelError::NoSuchDevice(device_id))?;

        if dev.create_failures > 0 {
            dev.create_failures -= 1;
            return Err(ChannelError::NotReady(format!(
                "device {device_id} is still coming up"
            )));
        }

        let (accept_tx, accept_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = unbounded();
        dev.accept_tx = Some(accept_tx);

        Ok(Box::new(MockRawServer {
            accept_rx,
            shutdown_tx,
            shutdown_rx,
        }))
    }
}

struct MockRawServer {
    accept_rx: Receiver<MockRawSession>,
    shutdown_tx: Sender<()>,
    shutdown_rx: Receiver<()>,
}

impl RawServer for MockRawServer {
    fn accept(&self, timeout: Duration) -> Result<Option<Box<dyn RawSession>>, ChannelError> {
        select! {
            recv(self.accept_rx) -> r => match r {
                Ok(session) => Ok(Some(Box::new(session) as Box<dyn RawSession>)),
                Err(_) => Err(ChannelError::Closed),
            },
            recv(self.shutdown_rx) -> _ => Err(ChannelError::Closed),
            default(timeout) => Ok(None),
        }
    }

    fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    fn destroy(&self) -> Result<(), ChannelError> {
        let _ = self.shutdown_tx.send(());
        Ok(())
    }
}

struct MockRawSession {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl RawSession for MockRawSession {
    fn send(&mut self, frame: &[u8]) -> Result<(), ChannelError> {
        self.tx.send(frame.to_vec()).map_err(|_| ChannelError::Closed)
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, ChannelError> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Ok(None),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(ChannelError::Closed),
        }
    }

    fn close(&mut self) {}
}

/// mock 会话的客户端端点
pub struct MockClientSession {
    device_id: u32,
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl ControlSession for MockClientSession {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Device
    }

    fn peer(&self) -> String {
        format!("mock-client/device{}", self.device_id)
    }

    fn send(&mut self, packet: &Packet) -> Result<(), ChannelError> {
        self.tx
            .send(packet.encode().to_vec())
            .map_err(|_| ChannelError::Closed)
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Packet>, ChannelError> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(Packet::decode(&frame)?)),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Ok(None),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(ChannelError::Closed),
        }
    }
}

/// mock 热插拔事件源
pub struct MockHotplugSource {
    rx: Receiver<HotplugEvent>,
}

impl HotplugSource for MockHotplugSource {
    fn recv_event(&mut self, timeout: Duration) -> Result<Option<HotplugEvent>, ChannelError> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Ok(None),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(ChannelError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(50);

    #[test]
    fn test_connect_before_server_fails() {
        let driver = MockMessageDriver::new();
        driver.attach_device(0);
        assert!(matches!(driver.connect(0), Err(ChannelError::NotReady(_))));
    }

    #[test]
    fn test_scripted_create_failures() {
        let driver = MockMessageDriver::new();
        driver.attach_device(1);
        driver.script_create_failures(1, 2);
        assert!(matches!(
            driver.create_server(1),
            Err(ChannelError::NotReady(_))
        ));
        assert!(matches!(
            driver.create_server(1),
            Err(ChannelError::NotReady(_))
        ));
        assert!(driver.create_server(1).is_ok());
    }

    #[test]
    fn test_hotplug_events_delivered() {
        let driver = MockMessageDriver::new();
        let mut source = driver.hotplug_source();
        driver.attach_device(5);
        driver.detach_device(5);

        let e1 = source.recv_event(TICK).unwrap().unwrap();
        assert_eq!(e1.device_id, 5);
        assert_eq!(e1.action, HotplugAction::Attach);
        let e2 = source.recv_event(TICK).unwrap().unwrap();
        assert_eq!(e2.action, HotplugAction::Detach);
        assert!(source.recv_event(TICK).unwrap().is_none());
    }

    #[test]
    fn test_detach_disconnects_server_accept() {
        let driver = MockMessageDriver::new();
        driver.attach_device(2);
        let server = driver.create_server(2).unwrap();
        driver.detach_device(2);
        assert!(matches!(server.accept(TICK), Err(ChannelError::Closed)));
    }

    #[test]
    fn test_enumerate_sorted() {
        let driver = MockMessageDriver::new();
        driver.attach_device(3);
        driver.attach_device(0);
        driver.attach_device(7);
        assert_eq!(driver.enumerate(), vec![0, 3, 7]);
    }
}
