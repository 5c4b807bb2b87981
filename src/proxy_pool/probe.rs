use futures::future::join_all;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::ProxyPool;
use crate::error::TunnelError;
use crate::tunnel::{self, RelayUrl, TargetAddr};

/// 读取探测响应的上限
const MAX_RESPONSE_BYTES: usize = 16 * 1024;

/// 探测错误
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("I/O error through tunnel: {0}")]
    Io(#[from] std::io::Error),

    #[error("Probe timeout after {0:?}")]
    Timeout(Duration),

    #[error("Unexpected probe response: {0}")]
    UnexpectedResponse(String),
}

/// 成功的探测
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSuccess {
    pub latency_ms: u64,
    pub exit_ip: Ipv4Addr,
}

/// 单个中继的探测结果
#[derive(Debug)]
pub struct ProbeOutcome {
    pub url: RelayUrl,
    pub result: Result<ProbeSuccess, ProbeError>,
}

/// 一轮探测的汇总
#[derive(Debug, Default)]
pub struct ProbeReport {
    pub outcomes: Vec<ProbeOutcome>,
}

impl ProbeReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

/// 通过中继请求一个返回出口 IP 的 HTTP 服务
pub async fn probe_endpoint(
    relay: &RelayUrl,
    target: &TargetAddr,
    timeout: Duration,
) -> Result<ProbeSuccess, ProbeError> {
    let started = Instant::now();
    let attempt = async {
        let mut stream = tunnel::connect(relay, target, timeout).await?;
        let request = format!(
            "GET / HTTP/1.1\r\nHost: {}\r\nUser-Agent: curl/8.5.0\r\nAccept: */*\r\nConnection: close\r\n\r\n",
            target.host
        );
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        let mut response = Vec::with_capacity(1024);
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            response.extend_from_slice(&buf[..n]);
            if response.len() >= MAX_RESPONSE_BYTES {
                break;
            }
        }
        Ok::<_, ProbeError>(response)
    };

    let response = tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| ProbeError::Timeout(timeout))??;
    let latency_ms = started.elapsed().as_millis() as u64;

    let exit_ip = parse_identity_response(&response)?;
    Ok(ProbeSuccess {
        latency_ms,
        exit_ip,
    })
}

/// 要求 2xx 状态行，并从正文中取第一个 IPv4 地址
fn parse_identity_response(response: &[u8]) -> Result<Ipv4Addr, ProbeError> {
    let text = String::from_utf8_lossy(response);
    let status_line = text.lines().next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    let status = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") || !status.starts_with('2') {
        return Err(ProbeError::UnexpectedResponse(format!(
            "status line '{}'",
            status_line.chars().take(64).collect::<String>()
        )));
    }

    let body = text.split("\r\n\r\n").nth(1).unwrap_or_default();
    first_ipv4(body).ok_or_else(|| {
        ProbeError::UnexpectedResponse("no IPv4 address in response body".to_string())
    })
}

fn first_ipv4(text: &str) -> Option<Ipv4Addr> {
    text.split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .filter(|token| token.len() >= 7)
        .find_map(|token| token.trim_matches('.').parse::<Ipv4Addr>().ok())
}

impl ProxyPool {
    /// 分批并发探测所有中继，把结果反馈到健康状态
    pub async fn probe_all(&self, timeout: Duration) -> ProbeReport {
        let urls: Vec<RelayUrl> = self.list_endpoints().into_iter().map(|e| e.url).collect();
        let batch_size = self.config.probe_batch_size.max(1);
        let target = self.config.probe_target.clone();
        let mut report = ProbeReport::default();

        info!(
            "Probing {} relays via {} (batch size {})",
            urls.len(),
            target,
            batch_size
        );

        for batch in urls.chunks(batch_size) {
            let results = join_all(
                batch
                    .iter()
                    .map(|url| probe_endpoint(url, &target, timeout)),
            )
            .await;

            for (url, result) in batch.iter().zip(results) {
                match &result {
                    Ok(success) => {
                        debug!(
                            "Relay {} OK: exit {} in {} ms",
                            url, success.exit_ip, success.latency_ms
                        );
                        self.mark_success(url, success.latency_ms);
                        self.record_exit_ip(url, Some(success.exit_ip.to_string()));
                    }
                    Err(e) => {
                        warn!("Relay {} probe failed: {}", url, e);
                        self.mark_failed(url);
                    }
                }
                report.outcomes.push(ProbeOutcome {
                    url: url.clone(),
                    result,
                });
            }
        }

        info!(
            "Probe finished: {} ok, {} failed",
            report.succeeded(),
            report.failed()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_identity_response() {
        let response = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\n当前 IP：203.0.113.7  来自于：中国 广东\n";
        assert_eq!(
            parse_identity_response(response.as_bytes()).unwrap(),
            Ipv4Addr::new(203, 0, 113, 7)
        );
    }

    #[test]
    fn test_parse_rejects_non_2xx() {
        let response = b"HTTP/1.1 403 Forbidden\r\n\r\nIP: 1.2.3.4";
        assert!(matches!(
            parse_identity_response(response),
            Err(ProbeError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn test_parse_requires_ip() {
        let response = b"HTTP/1.1 200 OK\r\n\r\nversion 1.2.3 only";
        assert!(parse_identity_response(response).is_err());
    }

    #[test]
    fn test_first_ipv4_skips_noise() {
        assert_eq!(
            first_ipv4("v1.0 at 10.1.2.3."),
            Some(Ipv4Addr::new(10, 1, 2, 3))
        );
        assert_eq!(first_ipv4("999.1.1.1"), None);
    }
}
