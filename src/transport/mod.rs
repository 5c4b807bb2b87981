mod tls;

pub use tls::{load_client_config, upgrade_tls};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use socket2::{SockRef, TcpKeepalive};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::ConnectError;
use crate::tunnel::{self, RelayUrl, TargetAddr};

/// 到网关的路由方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    /// 直接 TCP 连接
    #[default]
    Direct,
    /// 经 SOCKS5 中继
    Relay,
}

impl std::fmt::Display for RouteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteKind::Direct => write!(f, "direct"),
            RouteKind::Relay => write!(f, "relay"),
        }
    }
}

/// 传输层连接抽象
///
/// 直连 socket、隧道、TLS 之后的流都统一成这个类型，上层不关心来源
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

// 为所有满足条件的类型自动实现 Transport
impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedTransport = Pin<Box<dyn Transport>>;

/// 字节流工厂：每次 open 都产生一条新的到目标的原始字节流
#[async_trait]
pub trait StreamFactory: Send + Sync {
    async fn open(&self, target: &TargetAddr) -> Result<BoxedTransport, ConnectError>;

    fn route(&self) -> RouteKind;

    /// 使用的中继（直连时为 None）
    fn relay(&self) -> Option<&RelayUrl> {
        None
    }
}

/// TCP keepalive 参数
#[derive(Debug, Clone, Copy)]
pub struct KeepaliveConfig {
    /// Keepalive 首次探测时间
    pub time: Option<Duration>,
    /// Keepalive 探测间隔
    pub interval: Option<Duration>,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            time: Some(Duration::from_secs(30)),
            interval: Some(Duration::from_secs(10)),
        }
    }
}

pub fn apply_keepalive(stream: &TcpStream, config: &KeepaliveConfig) {
    if config.time.is_none() && config.interval.is_none() {
        return;
    }

    let mut keepalive = TcpKeepalive::new();
    if let Some(time) = config.time {
        keepalive = keepalive.with_time(time);
    }
    if let Some(interval) = config.interval {
        keepalive = keepalive.with_interval(interval);
    }

    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!("Failed to set TCP keepalive: {}", e);
    }
}

/// 直接连接目标
pub struct DirectStreamFactory {
    connect_timeout: Duration,
    keepalive: KeepaliveConfig,
}

impl DirectStreamFactory {
    pub fn new(connect_timeout: Duration, keepalive: KeepaliveConfig) -> Self {
        Self {
            connect_timeout,
            keepalive,
        }
    }
}

#[async_trait]
impl StreamFactory for DirectStreamFactory {
    async fn open(&self, target: &TargetAddr) -> Result<BoxedTransport, ConnectError> {
        let addr = target.to_string();
        debug!("Connecting directly to {}", addr);

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ConnectError::timeout(self.connect_timeout))?
            .map_err(|e| ConnectError::transport(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true).ok();
        apply_keepalive(&stream, &self.keepalive);
        Ok(Box::pin(stream))
    }

    fn route(&self) -> RouteKind {
        RouteKind::Direct
    }
}

/// 经 SOCKS5 中继连接目标
pub struct RelayStreamFactory {
    relay: RelayUrl,
    timeout: Duration,
    keepalive: KeepaliveConfig,
}

impl RelayStreamFactory {
    pub fn new(relay: RelayUrl, timeout: Duration, keepalive: KeepaliveConfig) -> Self {
        Self {
            relay,
            timeout,
            keepalive,
        }
    }
}

#[async_trait]
impl StreamFactory for RelayStreamFactory {
    async fn open(&self, target: &TargetAddr) -> Result<BoxedTransport, ConnectError> {
        debug!("Opening tunnel to {} via {}", target, self.relay);
        let stream = tunnel::connect(&self.relay, target, self.timeout).await?;
        apply_keepalive(&stream, &self.keepalive);
        Ok(Box::pin(stream))
    }

    fn route(&self) -> RouteKind {
        RouteKind::Relay
    }

    fn relay(&self) -> Option<&RelayUrl> {
        Some(&self.relay)
    }
}
