//! Common utilities for integration tests
#![allow(dead_code)]

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use gate_tunnel::gate::login::{HeartbeatReply, LoginReply, UserBasic};
use gate_tunnel::gate::protocol::{EventMessage, Frame, MessageType};
use gate_tunnel::gate::ConnectionConfig;
use parking_lot::Mutex;
use prost::Message as _;
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Create a simple echo server for testing
pub async fn start_echo_server() -> (u16, JoinHandle<()>) {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    (port, handle)
}

// ============= SOCKS5 relay =============

/// 中继行为
#[derive(Debug, Clone, Default)]
pub struct RelayBehavior {
    /// 需要的用户名/密码
    pub credentials: Option<(String, String)>,
    /// 非 0 时 CONNECT 以该状态码拒绝
    pub refuse_with: u8,
    /// 接受连接后不回应
    pub silent: bool,
}

pub struct MockRelay {
    pub port: u16,
    /// 成功建立的隧道数
    pub tunnels: Arc<AtomicUsize>,
    /// 最近一次 CONNECT 的目标
    pub last_target: Arc<Mutex<Option<(String, u16)>>>,
    handle: JoinHandle<()>,
}

impl MockRelay {
    pub fn url(&self) -> String {
        format!("socks5://127.0.0.1:{}", self.port)
    }

    pub fn url_with(&self, user: &str, pass: &str) -> String {
        format!("socks5://{}:{}@127.0.0.1:{}", user, pass, self.port)
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// 启动一个转发型 SOCKS5 中继
pub async fn start_socks5_relay(behavior: RelayBehavior) -> MockRelay {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind relay");
    let port = listener.local_addr().unwrap().port();
    let tunnels = Arc::new(AtomicUsize::new(0));
    let last_target = Arc::new(Mutex::new(None));

    let handle = {
        let tunnels = tunnels.clone();
        let last_target = last_target.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let behavior = behavior.clone();
                let tunnels = tunnels.clone();
                let last_target = last_target.clone();
                tokio::spawn(async move {
                    let _ = serve_socks5(socket, behavior, tunnels, last_target).await;
                });
            }
        })
    };

    MockRelay {
        port,
        tunnels,
        last_target,
        handle,
    }
}

async fn serve_socks5(
    mut socket: TcpStream,
    behavior: RelayBehavior,
    tunnels: Arc<AtomicUsize>,
    last_target: Arc<Mutex<Option<(String, u16)>>>,
) -> std::io::Result<()> {
    if behavior.silent {
        let mut sink = [0u8; 256];
        while socket.read(&mut sink).await? > 0 {}
        return Ok(());
    }

    let mut head = [0u8; 2];
    socket.read_exact(&mut head).await?;
    let mut methods = vec![0u8; head[1] as usize];
    socket.read_exact(&mut methods).await?;

    let wanted = if behavior.credentials.is_some() { 0x02 } else { 0x00 };
    if !methods.contains(&wanted) {
        socket.write_all(&[0x05, 0xFF]).await?;
        return Ok(());
    }
    socket.write_all(&[0x05, wanted]).await?;

    if let Some((user, pass)) = &behavior.credentials {
        let mut ver_len = [0u8; 2];
        socket.read_exact(&mut ver_len).await?;
        let mut got_user = vec![0u8; ver_len[1] as usize];
        socket.read_exact(&mut got_user).await?;
        let mut pass_len = [0u8; 1];
        socket.read_exact(&mut pass_len).await?;
        let mut got_pass = vec![0u8; pass_len[0] as usize];
        socket.read_exact(&mut got_pass).await?;
        if got_user != user.as_bytes() || got_pass != pass.as_bytes() {
            socket.write_all(&[0x01, 0x01]).await?;
            return Ok(());
        }
        socket.write_all(&[0x01, 0x00]).await?;
    }

    let mut request = [0u8; 4];
    socket.read_exact(&mut request).await?;
    let host = match request[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            socket.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            socket.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            socket.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        0x04 => {
            let mut ip = [0u8; 16];
            socket.read_exact(&mut ip).await?;
            std::net::Ipv6Addr::from(ip).to_string()
        }
        _ => return Ok(()),
    };
    let mut port = [0u8; 2];
    socket.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);
    *last_target.lock() = Some((host.clone(), port));

    if behavior.refuse_with != 0 {
        socket
            .write_all(&[0x05, behavior.refuse_with, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await?;
        return Ok(());
    }

    let target_host = if host == "localhost" { "127.0.0.1".to_string() } else { host };
    let mut upstream = match TcpStream::connect((target_host.as_str(), port)).await {
        Ok(s) => s,
        Err(_) => {
            socket
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?;
            return Ok(());
        }
    };
    socket
        .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90])
        .await?;
    tunnels.fetch_add(1, Ordering::SeqCst);
    tokio::io::copy_bidirectional(&mut socket, &mut upstream).await?;
    Ok(())
}

// ============= HTTP identity endpoint =============

/// 返回固定出口 IP 的 HTTP 服务
pub async fn start_ip_server(exit_ip: &'static str) -> (u16, JoinHandle<()>) {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind ip server");
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let body = format!("当前 IP：{}  来自于：测试网络\n", exit_ip);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    (port, handle)
}

// ============= Gate WebSocket server =============

/// 登录时被拒绝的 code
pub const REJECTED_CODE: &str = "bad-code";

/// 网关行为
#[derive(Debug, Clone)]
pub struct GateBehavior {
    /// 回复是否回显 client_seq
    pub echo_client_seq: bool,
    /// 不回复心跳
    pub silent_heartbeat: bool,
    /// `Slow` 方法的回复延迟
    pub slow_delay: Duration,
    /// 登录回复的延迟
    pub login_delay: Duration,
    /// 这些序号的连接回复登录后立即断开（从 1 开始计数）
    pub drop_after_login: Vec<usize>,
}

impl Default for GateBehavior {
    fn default() -> Self {
        Self {
            echo_client_seq: true,
            silent_heartbeat: false,
            slow_delay: Duration::from_millis(300),
            login_delay: Duration::ZERO,
            drop_after_login: Vec::new(),
        }
    }
}

/// 收到的请求
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub connection: usize,
    pub frame: Frame,
}

/// 模拟网关
///
/// 按顺序处理请求；支持的方法：
/// Login, Heartbeat, Echo, Slow, Silent, Pushes, Garbage, Regress, Fail, Elsewhere, Drop, Kick
pub struct MockGate {
    pub port: u16,
    pub connections: Arc<AtomicUsize>,
    pub requests: Arc<Mutex<Vec<ReceivedRequest>>>,
    pub queries: Arc<Mutex<Vec<String>>>,
    drop_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl MockGate {
    pub fn url(&self) -> String {
        format!("ws://127.0.0.1:{}/prod/ws", self.port)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        let mut config = ConnectionConfig::new(&self.url(), "1.6.0-test").unwrap();
        config.connect_timeout = Duration::from_secs(2);
        config.login_timeout = Duration::from_secs(2);
        config.call_timeout = Duration::from_secs(2);
        config
    }

    /// 断开所有现有连接
    pub fn drop_connections(&self) {
        let _ = self.drop_tx.send(());
    }

    /// 某个方法的请求
    pub fn requests_for(&self, method: &str) -> Vec<ReceivedRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.frame.method == method)
            .cloned()
            .collect()
    }
}

impl Drop for MockGate {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn start_mock_gate(behavior: GateBehavior) -> MockGate {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind gate");
    let port = listener.local_addr().unwrap().port();
    let connections = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(Mutex::new(Vec::new()));
    let queries = Arc::new(Mutex::new(Vec::new()));
    let (drop_tx, _) = broadcast::channel(16);

    let handle = {
        let connections = connections.clone();
        let requests = requests.clone();
        let queries = queries.clone();
        let drop_tx = drop_tx.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let index = connections.fetch_add(1, Ordering::SeqCst) + 1;
                let behavior = behavior.clone();
                let requests = requests.clone();
                let queries = queries.clone();
                let drop_rx = drop_tx.subscribe();
                tokio::spawn(async move {
                    serve_gate(socket, index, behavior, requests, queries, drop_rx).await;
                });
            }
        })
    };

    MockGate {
        port,
        connections,
        requests,
        queries,
        drop_tx,
        handle,
    }
}

fn reply(request: &Frame, echo_seq: bool, server_seq: u64, payload: Vec<u8>) -> Frame {
    Frame {
        kind: MessageType::Reply,
        client_seq: if echo_seq { request.client_seq } else { 0 },
        server_seq,
        payload: Bytes::from(payload),
        ..request.clone()
    }
}

fn push(message_type: &str, body: Vec<u8>, server_seq: u64) -> Frame {
    Frame {
        service: "gatepb.GateService".to_string(),
        method: "Push".to_string(),
        kind: MessageType::Push,
        client_seq: 0,
        server_seq,
        error_code: 0,
        error_message: String::new(),
        payload: Bytes::from(
            EventMessage {
                message_type: message_type.to_string(),
                body,
            }
            .encode_to_vec(),
        ),
    }
}

async fn serve_gate(
    socket: TcpStream,
    index: usize,
    behavior: GateBehavior,
    requests: Arc<Mutex<Vec<ReceivedRequest>>>,
    queries: Arc<Mutex<Vec<String>>>,
    mut drop_rx: broadcast::Receiver<()>,
) {
    let query = Arc::new(Mutex::new(String::new()));
    let callback = {
        let query = query.clone();
        move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            *query.lock() = req.uri().query().unwrap_or_default().to_string();
            Ok(resp)
        }
    };
    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(socket, callback).await else {
        return;
    };
    let query = query.lock().clone();
    queries.lock().push(query.clone());
    let login_code = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("code="))
        .unwrap_or_default()
        .to_string();

    let mut server_seq = 100u64;
    let mut next_seq = || {
        server_seq += 1;
        server_seq
    };

    loop {
        let message = tokio::select! {
            _ = drop_rx.recv() => return,
            message = ws.next() => message,
        };
        let data = match message {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
            Some(Ok(_)) => continue,
        };
        let Ok(request) = Frame::decode(&data) else {
            continue;
        };
        requests.lock().push(ReceivedRequest {
            connection: index,
            frame: request.clone(),
        });

        let echo = behavior.echo_client_seq;
        let mut out: Vec<Vec<u8>> = Vec::new();
        match request.method.as_str() {
            "Login" => {
                if !behavior.login_delay.is_zero() {
                    tokio::time::sleep(behavior.login_delay).await;
                }
                let mut frame = reply(&request, echo, next_seq(), Vec::new());
                if login_code == REJECTED_CODE {
                    frame.error_code = 1001;
                    frame.error_message = "invalid code".to_string();
                } else {
                    frame.payload = Bytes::from(
                        LoginReply {
                            basic: Some(UserBasic {
                                gid: 1000 + index as i64,
                                name: "farmer".to_string(),
                                level: 12,
                                gold: 3400,
                                exp: 560,
                            }),
                            time_now_millis: 1_700_000_000_000,
                        }
                        .encode_to_vec(),
                    );
                }
                out.push(frame.encode());
                if behavior.drop_after_login.contains(&index) {
                    for frame in out {
                        let _ = ws.send(Message::binary(frame)).await;
                    }
                    return;
                }
            }
            "Heartbeat" => {
                if behavior.silent_heartbeat {
                    continue;
                }
                let body = HeartbeatReply {
                    server_time: 1_700_000_000_000,
                }
                .encode_to_vec();
                out.push(reply(&request, echo, next_seq(), body).encode());
            }
            "Echo" => {
                out.push(reply(&request, echo, next_seq(), request.payload.to_vec()).encode());
            }
            "Slow" => {
                tokio::time::sleep(behavior.slow_delay).await;
                out.push(reply(&request, echo, next_seq(), request.payload.to_vec()).encode());
            }
            "Silent" => continue,
            "Pushes" => {
                for i in 0..3u8 {
                    out.push(push("gamepb.itempb.ItemNotify", vec![i], next_seq()).encode());
                }
                out.push(push("gamepb.plantpb.LandsNotify", vec![9], next_seq()).encode());
                out.push(reply(&request, echo, next_seq(), b"done".to_vec()).encode());
            }
            "Garbage" => {
                out.push(vec![0xff, 0xff, 0xff, 0xff]);
                out.push(reply(&request, echo, next_seq(), b"after".to_vec()).encode());
            }
            "Regress" => {
                out.push(reply(&request, echo, 1, Vec::new()).encode());
            }
            "Fail" => {
                let mut frame = reply(&request, echo, next_seq(), Vec::new());
                frame.error_code = 42;
                frame.error_message = "boom".to_string();
                out.push(frame.encode());
            }
            "Elsewhere" => {
                let mut frame = reply(&request, echo, next_seq(), Vec::new());
                frame.error_code = 1_000_014;
                frame.error_message = "logged in elsewhere".to_string();
                out.push(frame.encode());
            }
            "Drop" => return,
            "Kick" => {
                out.push(push("gamepb.userpb.KickoutNotify", Vec::new(), next_seq()).encode());
                for frame in out {
                    let _ = ws.send(Message::binary(frame)).await;
                }
                let _ = ws.close(None).await;
                return;
            }
            _ => {
                out.push(reply(&request, echo, next_seq(), Vec::new()).encode());
            }
        }

        for frame in out {
            if ws.send(Message::binary(frame)).await.is_err() {
                return;
            }
        }
    }
}
