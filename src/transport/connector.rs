//! 接收端连接器
//!
//! 负责解析固定的本地通道名并打开字节流连接。
//! unix 上使用 Unix domain socket，其余平台退回本机 TCP

use std::fmt;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::net::UnixStream;

/// 接收端的固定逻辑名称
pub const DEFAULT_PIPE_NAME: &str = "CavernAudioPipe";

/// 非 unix 平台的默认本机端口
pub const DEFAULT_TCP_PORT: u16 = 47011;

/// 接收端地址
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkAddress {
    #[cfg(unix)]
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl SinkAddress {
    /// 按逻辑名称解析本地通道
    #[cfg(unix)]
    pub fn local(name: &str) -> Self {
        Self::Unix(std::env::temp_dir().join(format!("{}.sock", name)))
    }

    #[cfg(not(unix))]
    pub fn local(_name: &str) -> Self {
        Self::Tcp(SocketAddr::from(([127, 0, 0, 1], DEFAULT_TCP_PORT)))
    }
}

impl Default for SinkAddress {
    fn default() -> Self {
        Self::local(DEFAULT_PIPE_NAME)
    }
}

impl fmt::Display for SinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

/// 传输配置
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// 接收端地址
    pub sink: SinkAddress,
    /// TCP 连接超时
    pub connect_timeout: Duration,
    /// 系统级写超时，保证排空 tick 不会无限阻塞
    pub write_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            sink: SinkAddress::default(),
            connect_timeout: Duration::from_millis(500),
            write_timeout: Duration::from_millis(200),
        }
    }
}

/// 打开到接收端的连接
///
/// 只负责"打开"，连接状态和重连策略由 `PipeTransport` 管理
pub trait Connector: Send + Sync {
    type Stream: Write + Send;

    fn connect(&self) -> io::Result<Self::Stream>;

    /// 用于日志的地址描述
    fn describe(&self) -> String;
}

/// 已建立的字节流
pub enum SinkStream {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Write for SinkStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Self::Unix(stream) => stream.write(buf),
            Self::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Self::Unix(stream) => stream.flush(),
            Self::Tcp(stream) => stream.flush(),
        }
    }
}

/// 基于 socket 的连接器
pub struct SocketConnector {
    config: TransportConfig,
}

impl SocketConnector {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

impl Connector for SocketConnector {
    type Stream = SinkStream;

    fn connect(&self) -> io::Result<SinkStream> {
        let write_timeout = Some(self.config.write_timeout).filter(|t| !t.is_zero());

        match &self.config.sink {
            #[cfg(unix)]
            SinkAddress::Unix(path) => {
                let stream = UnixStream::connect(path)?;
                stream.set_write_timeout(write_timeout)?;
                Ok(SinkStream::Unix(stream))
            }
            SinkAddress::Tcp(addr) => {
                let stream = TcpStream::connect_timeout(addr, self.config.connect_timeout)?;
                stream.set_write_timeout(write_timeout)?;
                stream.set_nodelay(true)?;
                Ok(SinkStream::Tcp(stream))
            }
        }
    }

    fn describe(&self) -> String {
        self.config.sink.to_string()
    }
}
