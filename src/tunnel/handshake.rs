//! SOCKS5 客户端握手（RFC 1928 / RFC 1929）

use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::{RelayCredentials, TargetAddr};
use crate::error::{Result, TunnelError};

pub const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// CONNECT 应答码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyCode {
    GeneralFailure,
    NotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    Unknown(u8),
}

impl ReplyCode {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => Self::GeneralFailure,
            0x02 => Self::NotAllowed,
            0x03 => Self::NetworkUnreachable,
            0x04 => Self::HostUnreachable,
            0x05 => Self::ConnectionRefused,
            0x06 => Self::TtlExpired,
            0x07 => Self::CommandNotSupported,
            0x08 => Self::AddressTypeNotSupported,
            other => Self::Unknown(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::GeneralFailure => 0x01,
            Self::NotAllowed => 0x02,
            Self::NetworkUnreachable => 0x03,
            Self::HostUnreachable => 0x04,
            Self::ConnectionRefused => 0x05,
            Self::TtlExpired => 0x06,
            Self::CommandNotSupported => 0x07,
            Self::AddressTypeNotSupported => 0x08,
            Self::Unknown(b) => b,
        }
    }
}

impl std::fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::GeneralFailure => "general failure",
            Self::NotAllowed => "connection not allowed by ruleset",
            Self::NetworkUnreachable => "network unreachable",
            Self::HostUnreachable => "host unreachable",
            Self::ConnectionRefused => "connection refused",
            Self::TtlExpired => "TTL expired",
            Self::CommandNotSupported => "command not supported",
            Self::AddressTypeNotSupported => "address type not supported",
            Self::Unknown(b) => return write!(f, "unknown reply code {:#04x}", b),
        };
        write!(f, "{} ({:#04x})", name, self.as_byte())
    }
}

/// 把握手阶段的 I/O 错误映射为 HandshakeRejected
fn io_failure(step: &'static str) -> impl FnOnce(std::io::Error) -> TunnelError {
    move |e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TunnelError::rejected(format!("relay closed the stream during {}", step))
        } else {
            TunnelError::rejected(format!("{} failed: {}", step, e))
        }
    }
}

/// 在已连接的流上执行 SOCKS5 握手，成功后流即为到目标的透明通道
///
/// 返回中继报告的绑定地址（仅供诊断）
pub async fn handshake<S>(
    stream: &mut S,
    target: &TargetAddr,
    credentials: Option<&RelayCredentials>,
) -> Result<TargetAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // 提前编码目标地址，非法地址不发送任何字节
    let address = target.encode()?;

    // 1. 方法协商
    let greeting: &[u8] = if credentials.is_some() {
        &[SOCKS_VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS]
    } else {
        &[SOCKS_VERSION, 1, METHOD_NO_AUTH]
    };
    stream
        .write_all(greeting)
        .await
        .map_err(io_failure("method negotiation"))?;
    stream.flush().await.map_err(io_failure("method negotiation"))?;

    let mut choice = [0u8; 2];
    stream
        .read_exact(&mut choice)
        .await
        .map_err(io_failure("method negotiation"))?;
    if choice[0] != SOCKS_VERSION {
        return Err(TunnelError::rejected(format!(
            "unexpected version {:#04x} in method reply",
            choice[0]
        )));
    }

    match (choice[1], credentials) {
        (METHOD_NO_AUTH, _) => {}
        (METHOD_USER_PASS, Some(creds)) => authenticate(stream, creds).await?,
        (METHOD_NONE_ACCEPTABLE, _) | (METHOD_USER_PASS, None) => {
            return Err(TunnelError::UnsupportedAuth)
        }
        (other, _) => {
            return Err(TunnelError::rejected(format!(
                "relay chose method {:#04x} which was not offered",
                other
            )))
        }
    }

    // 2. CONNECT 请求
    let mut request = Vec::with_capacity(3 + address.len());
    request.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00]);
    request.extend_from_slice(&address);
    stream
        .write_all(&request)
        .await
        .map_err(io_failure("connect request"))?;
    stream.flush().await.map_err(io_failure("connect request"))?;

    // 3. CONNECT 应答
    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(io_failure("connect reply"))?;
    if head[0] != SOCKS_VERSION {
        return Err(TunnelError::rejected(format!(
            "unexpected version {:#04x} in connect reply",
            head[0]
        )));
    }
    if head[1] != 0x00 {
        return Err(TunnelError::ConnectRefused(ReplyCode::from_byte(head[1])));
    }

    let bound = read_bound_addr(stream, head[3]).await?;
    debug!("Relay granted CONNECT to {} (bound {})", target, bound);
    Ok(bound)
}

/// 用户名/密码子协商
async fn authenticate<S>(stream: &mut S, creds: &RelayCredentials) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user = creds.username.as_bytes();
    let pass = creds.password.as_bytes();
    if user.len() > 255 || pass.len() > 255 {
        return Err(TunnelError::rejected(
            "username and password must be at most 255 bytes",
        ));
    }

    let mut msg = Vec::with_capacity(3 + user.len() + pass.len());
    msg.push(AUTH_VERSION);
    msg.push(user.len() as u8);
    msg.extend_from_slice(user);
    msg.push(pass.len() as u8);
    msg.extend_from_slice(pass);
    stream
        .write_all(&msg)
        .await
        .map_err(io_failure("authentication"))?;
    stream.flush().await.map_err(io_failure("authentication"))?;

    let mut status = [0u8; 2];
    stream
        .read_exact(&mut status)
        .await
        .map_err(io_failure("authentication"))?;
    if status[1] != 0x00 {
        return Err(TunnelError::AuthFailed(status[1]));
    }
    Ok(())
}

async fn read_bound_addr<S>(stream: &mut S, atyp: u8) -> Result<TargetAddr>
where
    S: AsyncRead + Unpin,
{
    let host = match atyp {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream
                .read_exact(&mut addr)
                .await
                .map_err(io_failure("connect reply"))?;
            Ipv4Addr::from(addr).to_string()
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream
                .read_exact(&mut addr)
                .await
                .map_err(io_failure("connect reply"))?;
            Ipv6Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(io_failure("connect reply"))?;
            let mut name = vec![0u8; len[0] as usize];
            stream
                .read_exact(&mut name)
                .await
                .map_err(io_failure("connect reply"))?;
            String::from_utf8_lossy(&name).into_owned()
        }
        other => {
            return Err(TunnelError::rejected(format!(
                "unsupported bound address type {:#04x}",
                other
            )))
        }
    };

    let mut port = [0u8; 2];
    stream
        .read_exact(&mut port)
        .await
        .map_err(io_failure("connect reply"))?;
    Ok(TargetAddr::new(host, u16::from_be_bytes(port)))
}

/// 编码地址类型 + 地址 + 端口
pub(crate) fn encode_address(host: &str, port: u16) -> Result<Vec<u8>> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    let mut buf = Vec::with_capacity(bare.len() + 4);
    if let Ok(ip) = bare.parse::<Ipv4Addr>() {
        buf.push(ATYP_IPV4);
        buf.extend_from_slice(&ip.octets());
    } else if let Ok(ip) = bare.parse::<Ipv6Addr>() {
        buf.push(ATYP_IPV6);
        buf.extend_from_slice(&ip.octets());
    } else {
        if bare.is_empty() || bare.len() > 255 {
            return Err(TunnelError::InvalidTarget(format!(
                "domain name length {} is out of range",
                bare.len()
            )));
        }
        buf.push(ATYP_DOMAIN);
        buf.push(bare.len() as u8);
        buf.extend_from_slice(bare.as_bytes());
    }
    buf.extend_from_slice(&port.to_be_bytes());
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TunnelErrorKind;
    use tokio::io::duplex;

    const GRANTED: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 10, 0, 0, 1, 0x1F, 0x90];

    #[tokio::test]
    async fn test_no_auth_connect_granted() {
        let (mut client, mut relay) = duplex(1024);
        let target = TargetAddr::new("gate.example.com", 443);

        let server = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            relay.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            relay.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 5];
            relay.read_exact(&mut head).await.unwrap();
            assert_eq!(head, [0x05, 0x01, 0x00, 0x03, 16]);
            let mut rest = [0u8; 18];
            relay.read_exact(&mut rest).await.unwrap();
            assert_eq!(&rest[..16], b"gate.example.com");
            assert_eq!(&rest[16..], &443u16.to_be_bytes());
            relay.write_all(&GRANTED).await.unwrap();

            // 握手之后是透明通道
            relay.write_all(b"payload").await.unwrap();
        });

        let bound = handshake(&mut client, &target, None).await.unwrap();
        assert_eq!(bound, TargetAddr::new("10.0.0.1", 8080));

        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"payload");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_reply() {
        let (mut client, mut relay) = duplex(1024);
        let target = TargetAddr::new("127.0.0.1", 80);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            relay.read_exact(&mut greeting).await.unwrap();
            relay.write_all(&[0x05, 0x00]).await.unwrap();
            let mut request = [0u8; 10];
            relay.read_exact(&mut request).await.unwrap();
            assert_eq!(request, [0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0, 80]);
            relay
                .write_all(&[0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let err = handshake(&mut client, &target, None).await.unwrap_err();
        assert_eq!(err.kind(), TunnelErrorKind::HandshakeRejected);
        assert_eq!(err.reply_code(), Some(ReplyCode::GeneralFailure));
    }

    #[tokio::test]
    async fn test_no_acceptable_method() {
        let (mut client, mut relay) = duplex(1024);
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            relay.read_exact(&mut greeting).await.unwrap();
            relay.write_all(&[0x05, 0xFF]).await.unwrap();
        });

        let err = handshake(&mut client, &TargetAddr::new("example.com", 80), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), TunnelErrorKind::UnsupportedAuth);
    }

    #[tokio::test]
    async fn test_username_password_subnegotiation() {
        let (mut client, mut relay) = duplex(1024);
        let creds = RelayCredentials {
            username: "alice".into(),
            password: "s3cret".into(),
        };

        tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            relay.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x02, 0x00, 0x02]);
            relay.write_all(&[0x05, 0x02]).await.unwrap();

            let mut auth = [0u8; 14];
            relay.read_exact(&mut auth).await.unwrap();
            assert_eq!(auth[0], 0x01);
            assert_eq!(auth[1], 5);
            assert_eq!(&auth[2..7], b"alice");
            assert_eq!(auth[7], 6);
            assert_eq!(&auth[8..14], b"s3cret");
            relay.write_all(&[0x01, 0x00]).await.unwrap();

            let mut request = [0u8; 10];
            relay.read_exact(&mut request).await.unwrap();
            relay.write_all(&GRANTED).await.unwrap();
        });

        handshake(&mut client, &TargetAddr::new("1.2.3.4", 443), Some(&creds))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_credentials_rejected() {
        let (mut client, mut relay) = duplex(1024);
        let creds = RelayCredentials {
            username: "u".into(),
            password: "p".into(),
        };
        tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            relay.read_exact(&mut greeting).await.unwrap();
            relay.write_all(&[0x05, 0x02]).await.unwrap();
            let mut auth = [0u8; 5];
            relay.read_exact(&mut auth).await.unwrap();
            relay.write_all(&[0x01, 0x01]).await.unwrap();
        });

        let err = handshake(&mut client, &TargetAddr::new("1.2.3.4", 443), Some(&creds))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::AuthFailed(0x01)));
    }

    #[tokio::test]
    async fn test_premature_close_is_rejected() {
        let (mut client, relay) = duplex(1024);
        drop(relay);
        let err = handshake(&mut client, &TargetAddr::new("1.2.3.4", 443), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), TunnelErrorKind::HandshakeRejected);
    }

    #[test]
    fn test_encode_address_types() {
        assert_eq!(
            encode_address("192.168.1.2", 1080).unwrap(),
            vec![0x01, 192, 168, 1, 2, 0x04, 0x38]
        );
        let v6 = encode_address("[::1]", 443).unwrap();
        assert_eq!(v6[0], 0x04);
        assert_eq!(v6.len(), 1 + 16 + 2);
        assert!(encode_address(&"a".repeat(256), 80).is_err());
    }

    #[test]
    fn test_reply_code_names() {
        assert_eq!(ReplyCode::from_byte(0x05), ReplyCode::ConnectionRefused);
        assert_eq!(ReplyCode::from_byte(0x42), ReplyCode::Unknown(0x42));
        assert_eq!(ReplyCode::TtlExpired.to_string(), "TTL expired (0x06)");
    }
}
