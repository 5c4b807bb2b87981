/// 自定义错误类型
///
/// 每一层使用独立的 thiserror 枚举，调用者可以按 kind 做精确的恢复决策：
/// 隧道错误反馈给代理池，连接错误决定是否重连，调用错误只影响单次调用
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::tunnel::ReplyCode;

/// 隧道错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelErrorKind {
    /// 无法连到中继
    Unreachable,
    /// 握手被拒绝或中途断开
    HandshakeRejected,
    /// 超时
    Timeout,
    /// 没有可接受的认证方式
    UnsupportedAuth,
}

/// SOCKS5 隧道客户端错误
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 中继地址无法解析
    #[error("Invalid relay url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// 目标地址无法编码
    #[error("Invalid target address: {0}")]
    InvalidTarget(String),

    /// 连接中继失败
    #[error("Failed to reach relay {addr}: {source}")]
    Unreachable {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 握手失败（版本错误、提前关闭、读写错误）
    #[error("Relay handshake rejected: {0}")]
    HandshakeRejected(String),

    /// 中继拒绝 CONNECT 请求
    #[error("Relay refused CONNECT: {0}")]
    ConnectRefused(ReplyCode),

    /// 中继不接受任何提供的认证方式
    #[error("Relay offered no acceptable authentication method")]
    UnsupportedAuth,

    /// 用户名/密码被拒绝
    #[error("Relay rejected credentials (status {0:#04x})")]
    AuthFailed(u8),

    /// 超时
    #[error("Relay handshake timeout after {duration:?}")]
    Timeout { duration: Duration },
}

/// 隧道 Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn unreachable(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Unreachable {
            addr: addr.into(),
            source,
        }
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::HandshakeRejected(msg.into())
    }

    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 错误分类
    pub fn kind(&self) -> TunnelErrorKind {
        match self {
            Self::InvalidUrl { .. } | Self::InvalidTarget(_) | Self::Unreachable { .. } => {
                TunnelErrorKind::Unreachable
            }
            Self::HandshakeRejected(_) | Self::ConnectRefused(_) | Self::AuthFailed(_) => {
                TunnelErrorKind::HandshakeRejected
            }
            Self::UnsupportedAuth => TunnelErrorKind::UnsupportedAuth,
            Self::Timeout { .. } => TunnelErrorKind::Timeout,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 中继返回的 CONNECT 拒绝码
    pub fn reply_code(&self) -> Option<ReplyCode> {
        match self {
            Self::ConnectRefused(code) => Some(*code),
            _ => None,
        }
    }
}

/// 连接建立错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    TransportFailed,
    AuthRejected,
    ProtocolError,
    Timeout,
}

/// 建立网关会话时的错误
#[derive(Error, Debug)]
pub enum ConnectError {
    /// 隧道建立失败
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    /// 传输层错误（TCP、TLS、WebSocket）
    #[error("Transport error: {0}")]
    Transport(String),

    /// 登录被网关拒绝
    #[error("Login rejected by gate (code {code}): {message}")]
    AuthRejected { code: i64, message: String },

    /// 协议错误
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 超时
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: Duration },

    /// 连接在建立过程中被关闭
    #[error("Connection closed during open")]
    Closed,
}

impl ConnectError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    pub fn kind(&self) -> ConnectErrorKind {
        match self {
            Self::Tunnel(e) if e.is_timeout() => ConnectErrorKind::Timeout,
            Self::Tunnel(_) | Self::Transport(_) | Self::Closed => {
                ConnectErrorKind::TransportFailed
            }
            Self::AuthRejected { .. } => ConnectErrorKind::AuthRejected,
            Self::Protocol(_) => ConnectErrorKind::ProtocolError,
            Self::Timeout { .. } => ConnectErrorKind::Timeout,
        }
    }

    /// 登录被拒绝不应自动重试
    pub fn is_auth_rejected(&self) -> bool {
        matches!(self, Self::AuthRejected { .. })
    }

    /// 是否由中继隧道本身导致
    pub fn is_tunnel(&self) -> bool {
        matches!(self, Self::Tunnel(_))
    }
}

/// 单次请求的错误
#[derive(Error, Debug, Clone)]
pub enum CallError {
    /// 连接不在线
    #[error("Connection is not online")]
    NotConnected,

    /// 调用超时，连接仍然可用
    #[error("Call {service}.{method} timed out after {duration:?}")]
    Timeout {
        service: String,
        method: String,
        duration: Duration,
    },

    /// 传输层错误，连接进入重连
    #[error("Transport error: {0}")]
    Transport(String),

    /// 连接已关闭
    #[error("Connection closed")]
    Closed,

    /// 网关返回了错误码
    #[error("{service}.{method} failed: code={code} {message}")]
    Remote {
        service: String,
        method: String,
        code: i64,
        message: String,
    },

    /// 回复内容无法解析
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl CallError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn remote_code(&self) -> Option<i64> {
        match self {
            Self::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// 账号会话错误
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Account '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Account '{0}' not found")]
    NotFound(String),

    /// 登录被拒绝，需要人工重新发起
    #[error("Login rejected for account '{account}': {source}")]
    AuthRejected {
        account: String,
        #[source]
        source: ConnectError,
    },

    /// 重试次数用尽
    #[error("Account '{account}' gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        account: String,
        attempts: u32,
        last_error: String,
    },

    /// 被主动停止或被服务器踢下线
    #[error("Account '{account}' stopped: {reason}")]
    Stopped { account: String, reason: String },
}

impl SessionError {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AuthRejected { .. } | Self::RetriesExhausted { .. } | Self::Stopped { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_error_kinds() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(
            TunnelError::unreachable("127.0.0.1:1080", io_err).kind(),
            TunnelErrorKind::Unreachable
        );
        assert_eq!(
            TunnelError::ConnectRefused(ReplyCode::ConnectionRefused).kind(),
            TunnelErrorKind::HandshakeRejected
        );
        assert_eq!(
            TunnelError::UnsupportedAuth.kind(),
            TunnelErrorKind::UnsupportedAuth
        );
        assert_eq!(
            TunnelError::timeout(Duration::from_secs(1)).kind(),
            TunnelErrorKind::Timeout
        );
    }

    #[test]
    fn test_connect_refused_message() {
        let err = TunnelError::ConnectRefused(ReplyCode::ConnectionRefused);
        assert_eq!(err.reply_code(), Some(ReplyCode::ConnectionRefused));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_connect_error_kind() {
        let err: ConnectError = TunnelError::timeout(Duration::from_secs(3)).into();
        assert_eq!(err.kind(), ConnectErrorKind::Timeout);
        assert!(err.is_tunnel());

        let err = ConnectError::AuthRejected {
            code: 1001,
            message: "bad code".into(),
        };
        assert!(err.is_auth_rejected());
        assert_eq!(err.kind(), ConnectErrorKind::AuthRejected);
        assert_eq!(
            ConnectError::transport("reset").kind(),
            ConnectErrorKind::TransportFailed
        );
    }

    #[test]
    fn test_call_error_checks() {
        let err = CallError::Remote {
            service: "gamepb.userpb.UserService".into(),
            method: "Heartbeat".into(),
            code: 1000014,
            message: "logged in elsewhere".into(),
        };
        assert_eq!(err.remote_code(), Some(1000014));
        assert!(!err.is_timeout());
        assert!(CallError::Transport("eof".into()).is_transport());
    }
}
