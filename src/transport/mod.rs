//! 字节流传输
//!
//! 把排空线程取出的数据原样转发给外部接收进程。
//! 设计要点：
//! - 单一连接句柄，所有修改操作在同一把锁内串行执行
//! - 不缓存未发送的数据：最多一次、尽力而为
//! - 对端断开时恰好做一次"断开 → 重连 → 重试"，绝不无限重试

mod connector;

pub use connector::{
    Connector, SinkAddress, SinkStream, SocketConnector, TransportConfig, DEFAULT_PIPE_NAME,
    DEFAULT_TCP_PORT,
};

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// 传输错误
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// 接收端未监听
    #[error("sink connection unavailable: {0}")]
    ConnectionUnavailable(#[source] io::Error),
    /// 发送时无法建立连接，数据已丢弃
    #[error("not connected to sink")]
    NotConnected,
    /// 写入失败，数据已丢弃
    #[error("write to sink failed: {0}")]
    Write(#[source] io::Error),
}

/// 转发接口
///
/// 方法都取 `&self`：排空线程和调用 stop 的线程可能同时访问
pub trait Transport: Send + Sync {
    /// 建立连接；已连接时立即返回
    fn connect(&self) -> Result<(), TransportError>;

    /// 发送一段数据，必要时自动连接 / 重连一次
    fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// 断开连接；未连接时什么都不做
    fn disconnect(&self);

    fn is_connected(&self) -> bool;
}

/// 对端断开类错误：值得重连一次
fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// 基于 `Connector` 的传输实现
pub struct PipeTransport<C: Connector> {
    connector: C,
    stream: Mutex<Option<C::Stream>>,
    connected: AtomicBool,
    connect_count: AtomicU64,
    reconnect_count: AtomicU64,
}

impl PipeTransport<SocketConnector> {
    /// 按配置创建 socket 传输
    pub fn from_config(config: TransportConfig) -> Self {
        Self::new(SocketConnector::new(config))
    }
}

impl<C: Connector> PipeTransport<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            stream: Mutex::new(None),
            connected: AtomicBool::new(false),
            connect_count: AtomicU64::new(0),
            reconnect_count: AtomicU64::new(0),
        }
    }

    /// 成功建立连接的次数
    pub fn connect_count(&self) -> u64 {
        self.connect_count.load(Ordering::Relaxed)
    }

    /// 发送途中触发重连的次数
    pub fn reconnect_count(&self) -> u64 {
        self.reconnect_count.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, Option<C::Stream>> {
        // 句柄本身在 panic 后仍然有效，继续使用
        self.stream.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connect_locked(&self, slot: &mut Option<C::Stream>) -> Result<(), TransportError> {
        if slot.is_some() {
            return Ok(());
        }

        match self.connector.connect() {
            Ok(stream) => {
                *slot = Some(stream);
                self.connected.store(true, Ordering::Release);
                self.connect_count.fetch_add(1, Ordering::Relaxed);
                log::info!("Connected to sink {}", self.connector.describe());
                Ok(())
            }
            Err(e) => {
                log::debug!("Sink {} unavailable: {}", self.connector.describe(), e);
                Err(TransportError::ConnectionUnavailable(e))
            }
        }
    }

    fn disconnect_locked(&self, slot: &mut Option<C::Stream>) {
        if slot.take().is_some() {
            self.connected.store(false, Ordering::Release);
            log::info!("Disconnected from sink {}", self.connector.describe());
        }
    }
}

impl<C: Connector> Transport for PipeTransport<C> {
    fn connect(&self) -> Result<(), TransportError> {
        let mut slot = self.lock();
        self.connect_locked(&mut slot)
    }

    fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut slot = self.lock();

        if self.connect_locked(&mut slot).is_err() {
            return Err(TransportError::NotConnected);
        }

        let Some(stream) = slot.as_mut() else {
            return Err(TransportError::NotConnected);
        };

        let err = match stream.write_all(data) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if !is_disconnect(&err) {
            return Err(TransportError::Write(err));
        }

        // 对端断开：恰好一次恢复
        log::warn!("Sink disconnected ({}), attempting reconnect", err);
        self.reconnect_count.fetch_add(1, Ordering::Relaxed);
        self.disconnect_locked(&mut slot);
        self.connect_locked(&mut slot)?;

        let Some(stream) = slot.as_mut() else {
            return Err(TransportError::NotConnected);
        };

        match stream.write_all(data) {
            Ok(()) => Ok(()),
            Err(e) => {
                if is_disconnect(&e) {
                    self.disconnect_locked(&mut slot);
                }
                Err(TransportError::Write(e))
            }
        }
    }

    fn disconnect(&self) {
        let mut slot = self.lock();
        self.disconnect_locked(&mut slot);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
