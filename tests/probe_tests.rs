/// Integration tests for relay probing and health persistence
mod common;

use common::*;
use gate_tunnel::proxy_pool::{PoolConfig, ProbeError, ProxyPool};
use gate_tunnel::tunnel::{RelayUrl, TargetAddr};
use std::net::Ipv4Addr;
use std::time::Duration;

fn pool_probing(ip_port: u16) -> ProxyPool {
    ProxyPool::new(PoolConfig {
        failure_threshold: 1,
        probe_target: TargetAddr::new("127.0.0.1", ip_port),
        ..Default::default()
    })
}

#[tokio::test]
async fn test_probe_reports_exit_ip() {
    let (ip_port, _ip) = start_ip_server("203.0.113.7").await;
    let relay = start_socks5_relay(RelayBehavior::default()).await;
    let dead_url = format!("socks5://127.0.0.1:{}", get_available_port());

    let pool = pool_probing(ip_port);
    pool.add(&relay.url()).unwrap();
    pool.add(&dead_url).unwrap();

    let report = pool.probe_all(Duration::from_secs(2)).await;
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.failed(), 1);

    let good = report
        .outcomes
        .iter()
        .find(|o| o.url.port() == relay.port)
        .unwrap();
    let success = good.result.as_ref().unwrap();
    assert_eq!(success.exit_ip, Ipv4Addr::new(203, 0, 113, 7));

    let dead = report
        .outcomes
        .iter()
        .find(|o| o.url.port() != relay.port)
        .unwrap();
    assert!(matches!(dead.result, Err(ProbeError::Tunnel(_))));

    let good_endpoint = pool.get(&RelayUrl::parse(&relay.url()).unwrap()).unwrap();
    assert_eq!(good_endpoint.health.total_successes, 1);
    assert_eq!(good_endpoint.health.exit_ip.as_deref(), Some("203.0.113.7"));
    assert!(good_endpoint.health.last_latency_ms.is_some());

    // 阈值为 1，失败一次即被禁用
    let dead_endpoint = pool.get(&RelayUrl::parse(&dead_url).unwrap()).unwrap();
    assert!(dead_endpoint.is_disabled_at(pool.now_ms()));
    assert_eq!(pool.available_count(), 1);
    assert_eq!(
        pool.acquire(None),
        Some(RelayUrl::parse(&relay.url()).unwrap())
    );
}

#[tokio::test]
async fn test_probe_rejects_non_identity_response() {
    // 回显服务把 GET 请求原样返回，状态行不是 HTTP 响应
    let (echo_port, _echo) = start_echo_server().await;
    let relay = start_socks5_relay(RelayBehavior::default()).await;

    let pool = pool_probing(echo_port);
    pool.add(&relay.url()).unwrap();

    let report = pool.probe_all(Duration::from_millis(500)).await;
    assert_eq!(report.failed(), 1);
    assert!(matches!(
        report.outcomes[0].result,
        Err(ProbeError::UnexpectedResponse(_)) | Err(ProbeError::Timeout(_))
    ));
}

#[tokio::test]
async fn test_probe_results_survive_restart() {
    let (ip_port, _ip) = start_ip_server("198.51.100.20").await;
    let relay = start_socks5_relay(RelayBehavior {
        credentials: Some(("farmer".to_string(), "secret".to_string())),
        ..Default::default()
    })
    .await;
    let url = relay.url_with("farmer", "secret");

    let pool = pool_probing(ip_port);
    pool.add(&url).unwrap();
    let report = pool.probe_all(Duration::from_secs(2)).await;
    assert_eq!(report.succeeded(), 1);

    let path = std::env::temp_dir().join(format!(
        "gate-tunnel-probe-{}-{}.json",
        std::process::id(),
        relay.port
    ));
    pool.save_health(&path).unwrap();

    // 快照中不出现明文密码
    let saved = std::fs::read_to_string(&path).unwrap();
    assert!(!saved.contains("secret"));

    let restarted = pool_probing(ip_port);
    restarted.add(&url).unwrap();
    assert_eq!(restarted.load_health(&path).unwrap(), 1);
    let endpoint = restarted.get(&RelayUrl::parse(&url).unwrap()).unwrap();
    assert_eq!(endpoint.health.total_successes, 1);
    assert_eq!(endpoint.health.exit_ip.as_deref(), Some("198.51.100.20"));

    let _ = std::fs::remove_file(&path);
}
