//! 单账号的网关连接
//!
//! 协议回复不携带可靠的请求标识，因此同一连接任意时刻最多只有一个请求在途，
//! 其余调用在 FIFO 门闩上排队。超时的请求会留下一个占位，
//! 它迟到的回复到达时被消费并丢弃，不会错配给后面的调用

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_rustls::{rustls, TlsConnector};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::events::{EventBus, ListenerId, PushEvent, PushKind};
use super::heartbeat::{self, HeartbeatSettings};
use super::login::{
    decode_login_reply, encode_login_request, DeviceInfo, UserProfile, LOGIN_METHOD,
    REMOTE_LOGIN_CODE, USER_SERVICE,
};
use super::protocol::{decode_event, Frame, MessageType};
use crate::error::{CallError, ConnectError};
use crate::transport::{load_client_config, upgrade_tls, BoxedTransport, StreamFactory};
use crate::tunnel::TargetAddr;

/// 保留的 RTT 样本数
const MAX_RTT_SAMPLES: usize = 20;
/// 没有样本时报告的 RTT
const DEFAULT_RTT_MS: u64 = 150;
/// 超时请求占位的上限
const MAX_STALE_REPLIES: usize = 32;
/// 发送队列长度
const OUTBOUND_QUEUE: usize = 64;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36 MicroMessenger/7.0.20.1781(0x6700143B) NetType/WIFI MiniProgramEnv/Windows WindowsWechat/WMPF WindowsWechat(0x63090a13)";

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Online,
    Reconnecting,
    Closing,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Online => "online",
            Self::Reconnecting => "reconnecting",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// 连接配置
#[derive(Clone)]
pub struct ConnectionConfig {
    /// `ws://` 或 `wss://` 网关地址
    pub server_url: Url,
    pub platform: String,
    pub os: String,
    pub client_version: String,
    pub origin: String,
    pub user_agent: String,
    pub device_info: DeviceInfo,
    /// TCP/TLS/WebSocket 握手各自的超时
    pub connect_timeout: Duration,
    pub login_timeout: Duration,
    pub call_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_max_misses: u32,
    /// wss 使用的 TLS 配置
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl ConnectionConfig {
    /// 使用默认参数创建配置；wss 地址默认跳过证书验证
    pub fn new(server_url: &str, client_version: &str) -> anyhow::Result<Self> {
        let server_url = Url::parse(server_url)
            .map_err(|e| anyhow::anyhow!("Invalid gate url '{}': {}", server_url, e))?;
        let tls = match server_url.scheme() {
            "wss" => Some(load_client_config(None, true)?),
            "ws" => None,
            other => anyhow::bail!("Unsupported gate url scheme '{}'", other),
        };
        let origin = format!(
            "https://{}",
            server_url.host_str().unwrap_or("gate-obt.nqf.qq.com")
        );

        Ok(Self {
            platform: "qq".to_string(),
            os: "iOS".to_string(),
            client_version: client_version.to_string(),
            origin,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            device_info: DeviceInfo::with_client_version(client_version),
            connect_timeout: Duration::from_secs(10),
            login_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_millis(25_000),
            heartbeat_max_misses: 2,
            tls,
            server_url,
        })
    }

    /// 网关的 host:port
    pub fn gate_target(&self) -> Result<TargetAddr, ConnectError> {
        let host = self
            .server_url
            .host_str()
            .ok_or_else(|| ConnectError::protocol("Gate url has no host"))?;
        let port = self
            .server_url
            .port_or_known_default()
            .ok_or_else(|| ConnectError::protocol("Gate url has no port"))?;
        Ok(TargetAddr::new(
            host.trim_start_matches('[').trim_end_matches(']'),
            port,
        ))
    }

    /// 带登录参数的 WebSocket 握手请求
    fn handshake_request(&self, login_code: &str) -> Result<Request, ConnectError> {
        let mut url = self.server_url.clone();
        url.query_pairs_mut()
            .clear()
            .append_pair("platform", &self.platform)
            .append_pair("os", &self.os)
            .append_pair("ver", &self.client_version)
            .append_pair("code", login_code)
            .append_pair("openID", "");

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectError::protocol(format!("Invalid handshake request: {}", e)))?;
        let headers = request.headers_mut();
        for (name, value) in [
            (header::USER_AGENT, &self.user_agent),
            (header::ORIGIN, &self.origin),
        ] {
            let value = HeaderValue::from_str(value)
                .map_err(|e| ConnectError::protocol(format!("Invalid {} header: {}", name, e)))?;
            headers.insert(name, value);
        }
        Ok(request)
    }
}

type WsSink = SplitSink<WebSocketStream<BoxedTransport>, Message>;
type WsStream = SplitStream<WebSocketStream<BoxedTransport>>;

/// 在途请求
struct InFlight {
    client_seq: u64,
    sent_at: Instant,
    reply_tx: oneshot::Sender<Result<Frame, CallError>>,
}

/// 请求发出后由调用方持有；调用方不再等待时，
/// 仍在途的请求转为占位，迟到的回复不会交给下一个调用
struct PendingReply<'a> {
    inner: &'a Inner,
    client_seq: u64,
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        let mut slot = self.inner.slot.lock();
        if slot.in_flight.as_ref().map(|c| c.client_seq) == Some(self.client_seq) {
            slot.in_flight = None;
            slot.push_stale(self.client_seq);
        }
    }
}

/// 单槽位：一个在途请求 + 超时请求的占位
#[derive(Default)]
struct CallSlot {
    in_flight: Option<InFlight>,
    stale: VecDeque<u64>,
}

impl CallSlot {
    fn push_stale(&mut self, client_seq: u64) {
        if self.stale.len() >= MAX_STALE_REPLIES {
            self.stale.pop_front();
        }
        self.stale.push_back(client_seq);
    }

    fn fail_in_flight(&mut self, error: CallError) {
        if let Some(call) = self.in_flight.take() {
            let _ = call.reply_tx.send(Err(error));
        }
        self.stale.clear();
    }
}

struct SeqState {
    /// 下一个请求使用的 client_seq
    next_client: u64,
    /// 见过的最大 server_seq
    server: u64,
}

impl Default for SeqState {
    fn default() -> Self {
        Self {
            next_client: 1,
            server: 0,
        }
    }
}

/// 当前底层流的会话
struct ActiveSession {
    generation: u64,
    outbound: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

pub(super) struct Inner {
    config: ConnectionConfig,
    state_tx: watch::Sender<ConnectionState>,
    gate: tokio::sync::Mutex<()>,
    slot: Mutex<CallSlot>,
    seq: Mutex<SeqState>,
    bus: EventBus,
    session: Mutex<Option<ActiveSession>>,
    generation: AtomicU64,
    rtt: Mutex<VecDeque<u64>>,
    profile: Mutex<Option<UserProfile>>,
    last_error: Mutex<Option<String>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.cancel.cancel();
        }
    }
}

/// 网关连接句柄，克隆后共享同一个连接
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn new(config: ConnectionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                state_tx,
                gate: tokio::sync::Mutex::new(()),
                slot: Mutex::new(CallSlot::default()),
                seq: Mutex::new(SeqState::default()),
                bus: EventBus::new(),
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                rtt: Mutex::new(VecDeque::with_capacity(MAX_RTT_SAMPLES)),
                profile: Mutex::new(None),
                last_error: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.state() == ConnectionState::Online
    }

    /// 最近一次发送的 client_seq（未发送过时为 0）
    pub fn client_seq(&self) -> u64 {
        self.inner.seq.lock().next_client - 1
    }

    /// 见过的最大 server_seq
    pub fn server_seq(&self) -> u64 {
        self.inner.seq.lock().server
    }

    pub fn profile(&self) -> Option<UserProfile> {
        self.inner.profile.lock().clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    /// 最近 RTT 样本的中位数
    pub fn rtt_median_ms(&self) -> u64 {
        let samples = self.inner.rtt.lock();
        if samples.is_empty() {
            return DEFAULT_RTT_MS;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        sorted[sorted.len() / 2]
    }

    /// 订阅推送
    pub fn on<F>(&self, kind: PushKind, listener: F) -> ListenerId
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on(kind, listener)
    }

    pub fn off(&self, kind: PushKind, id: ListenerId) -> bool {
        self.inner.bus.off(kind, id)
    }

    /// 建立底层流、完成 WebSocket 握手并登录
    ///
    /// 每次 open 都从 client_seq = 1 重新开始
    pub async fn open(
        &self,
        factory: &dyn StreamFactory,
        login_code: &str,
    ) -> Result<UserProfile, ConnectError> {
        let inner = &self.inner;
        inner.teardown_session();
        let generation = inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *inner.seq.lock() = SeqState::default();
        inner
            .slot
            .lock()
            .fail_in_flight(CallError::Transport("connection reopened".into()));
        inner.rtt.lock().clear();
        inner.set_state_for(generation, ConnectionState::Connecting);

        let result = match self.establish(factory, login_code, generation).await {
            Ok(profile) if inner.mark_online(generation) => Ok(profile),
            Ok(_) if inner.current_generation() != generation => Err(ConnectError::Closed),
            // 登录回复之后、上线之前流已断开
            Ok(_) => Err(ConnectError::transport(
                inner
                    .last_error
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "stream lost during login".to_string()),
            )),
            other => other,
        };

        match result {
            Ok(profile) => {
                *inner.profile.lock() = Some(profile.clone());
                *inner.last_error.lock() = None;
                self.spawn_heartbeat(generation, profile.gid);
                info!(
                    "Gate session online via {} (gid={}, name={}, level={})",
                    factory.route(),
                    profile.gid,
                    profile.name,
                    profile.level
                );
                Ok(profile)
            }
            Err(e) => {
                // 已被 close 或更新的 open 取代时不动新会话
                if inner.current_generation() != generation {
                    return Err(e);
                }
                inner.teardown_session();
                inner
                    .slot
                    .lock()
                    .fail_in_flight(CallError::Transport("open failed".into()));
                *inner.last_error.lock() = Some(e.to_string());
                inner.set_state_for(generation, ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        factory: &dyn StreamFactory,
        login_code: &str,
        generation: u64,
    ) -> Result<UserProfile, ConnectError> {
        let inner = &self.inner;
        let config = &inner.config;
        let target = config.gate_target()?;

        let stream = factory.open(&target).await?;
        let stream = match &config.tls {
            Some(tls) if config.server_url.scheme() == "wss" => {
                let connector = TlsConnector::from(tls.clone());
                tokio::time::timeout(
                    config.connect_timeout,
                    upgrade_tls(stream, &target.host, &connector),
                )
                .await
                .map_err(|_| ConnectError::timeout(config.connect_timeout))??
            }
            _ => stream,
        };

        if !inner.set_state_for(generation, ConnectionState::Handshaking) {
            return Err(ConnectError::Closed);
        }
        let request = config.handshake_request(login_code)?;
        let (ws, _response) = tokio::time::timeout(
            config.connect_timeout,
            tokio_tungstenite::client_async(request, stream),
        )
        .await
        .map_err(|_| ConnectError::timeout(config.connect_timeout))?
        .map_err(|e| ConnectError::transport(format!("WebSocket handshake failed: {}", e)))?;
        debug!("WebSocket established with {}", target);

        let (sink, stream) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let cancel = CancellationToken::new();
        tokio::spawn(write_loop(
            Arc::downgrade(&self.inner),
            generation,
            sink,
            outbound_rx,
            cancel.clone(),
        ));
        tokio::spawn(read_loop(
            Arc::downgrade(&self.inner),
            generation,
            stream,
            cancel.clone(),
        ));
        {
            let mut session = inner.session.lock();
            if inner.current_generation() != generation {
                cancel.cancel();
                return Err(ConnectError::Closed);
            }
            *session = Some(ActiveSession {
                generation,
                outbound: outbound_tx,
                cancel,
            });
        }

        let body = encode_login_request(&config.device_info);
        match self
            .send_call(USER_SERVICE, LOGIN_METHOD, Bytes::from(body), config.login_timeout, true)
            .await
        {
            Ok(payload) => decode_login_reply(&payload),
            Err(CallError::Remote { code, message, .. }) => {
                warn!("Login rejected: code={} {}", code, message);
                Err(ConnectError::AuthRejected { code, message })
            }
            Err(CallError::Timeout { duration, .. }) => Err(ConnectError::timeout(duration)),
            Err(CallError::Closed) => Err(ConnectError::Closed),
            Err(e) => Err(ConnectError::transport(format!("Login failed: {}", e))),
        }
    }

    fn spawn_heartbeat(&self, generation: u64, gid: i64) {
        let config = &self.inner.config;
        let settings = HeartbeatSettings {
            interval: config.heartbeat_interval,
            timeout: config.call_timeout.min(config.heartbeat_interval),
            max_misses: config.heartbeat_max_misses.max(1),
            gid,
            client_version: config.client_version.clone(),
        };
        let cancel = match self.inner.session.lock().as_ref() {
            Some(session) if session.generation == generation => session.cancel.clone(),
            _ => return,
        };
        tokio::spawn(heartbeat::run(
            Arc::downgrade(&self.inner),
            generation,
            settings,
            cancel,
        ));
    }

    /// 发起一次请求并等待回复
    ///
    /// 同一连接上的调用严格按 FIFO 串行；超时只影响本次调用，
    /// 传输错误会让连接进入 Reconnecting
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        payload: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<Bytes, CallError> {
        let timeout = timeout.unwrap_or(self.inner.config.call_timeout);
        self.send_call(service, method, payload.into(), timeout, false)
            .await
    }

    async fn send_call(
        &self,
        service: &str,
        method: &str,
        payload: Bytes,
        timeout: Duration,
        during_login: bool,
    ) -> Result<Bytes, CallError> {
        let inner = &self.inner;
        let _turn = inner.gate.lock().await;

        match self.state() {
            ConnectionState::Online => {}
            ConnectionState::Handshaking if during_login => {}
            ConnectionState::Closing | ConnectionState::Closed => return Err(CallError::Closed),
            _ => return Err(CallError::NotConnected),
        }
        let outbound = match inner.session.lock().as_ref() {
            Some(session) => session.outbound.clone(),
            None => return Err(CallError::NotConnected),
        };

        // 先占住发送队列的位置，登记在途和入队之间不再有 await
        let permit = outbound
            .reserve()
            .await
            .map_err(|_| CallError::Transport("outbound queue closed".into()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let client_seq = {
            let mut seq = inner.seq.lock();
            let client_seq = seq.next_client;
            seq.next_client += 1;
            let frame = Frame::request(service, method, client_seq, seq.server, payload);
            inner.slot.lock().in_flight = Some(InFlight {
                client_seq,
                sent_at: Instant::now(),
                reply_tx,
            });
            permit.send(frame.encode());
            client_seq
        };
        // 在门闩释放之前执行：超时或调用方放弃等待时把请求转为占位
        let _pending = PendingReply {
            inner,
            client_seq,
        };

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(Ok(frame))) if frame.error_code != 0 => Err(CallError::Remote {
                service: service.to_string(),
                method: method.to_string(),
                code: frame.error_code,
                message: frame.error_message,
            }),
            Ok(Ok(Ok(frame))) => Ok(frame.payload),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(CallError::Closed),
            Err(_) => {
                debug!(
                    "Call {}.{} (seq={}) timed out after {:?}",
                    service, method, client_seq, timeout
                );
                Err(CallError::Timeout {
                    service: service.to_string(),
                    method: method.to_string(),
                    duration: timeout,
                })
            }
        }
    }

    /// 关闭连接，所有排队和在途的调用以 Closed 失败。可重复调用
    ///
    /// 进行中的 open 随之失效，返回 Closed
    pub fn close(&self) {
        let inner = &self.inner;
        inner.generation.fetch_add(1, Ordering::AcqRel);
        if self.state() == ConnectionState::Closed {
            return;
        }
        inner.set_state(ConnectionState::Closing);
        inner.teardown_session();
        inner.slot.lock().fail_in_flight(CallError::Closed);
        inner.set_state(ConnectionState::Closed);
        debug!("Gate connection closed");
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Connection state {} -> {}", previous, state);
        }
    }

    /// 仅当 generation 仍是当前代时切换状态
    fn set_state_for(&self, generation: u64, state: ConnectionState) -> bool {
        let mut applied = false;
        self.state_tx.send_if_modified(|current| {
            if self.current_generation() != generation {
                return false;
            }
            applied = true;
            if *current == state {
                return false;
            }
            debug!("Connection state {} -> {}", current, state);
            *current = state;
            true
        });
        applied
    }

    /// 登录完成后上线；流已断开、已关闭或被取代时返回 false
    fn mark_online(&self, generation: u64) -> bool {
        self.state_tx.send_if_modified(|current| {
            let live = self
                .session
                .lock()
                .as_ref()
                .is_some_and(|s| s.generation == generation);
            if !live
                || self.current_generation() != generation
                || *current != ConnectionState::Handshaking
            {
                return false;
            }
            debug!("Connection state {} -> {}", current, ConnectionState::Online);
            *current = ConnectionState::Online;
            true
        })
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn teardown_session(&self) {
        if let Some(session) = self.session.lock().take() {
            session.cancel.cancel();
        }
    }

    /// 底层流出错：终止当前流，在途调用以传输错误失败
    ///
    /// 只处理当前代的流；在线时转入 Reconnecting，握手阶段交给 open 处理
    fn fail_transport(&self, generation: u64, reason: &str) {
        if generation != self.current_generation() {
            debug!("Ignoring failure from superseded stream: {}", reason);
            return;
        }
        let state = *self.state_tx.borrow();
        if matches!(state, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }

        self.teardown_session();
        self.slot
            .lock()
            .fail_in_flight(CallError::Transport(reason.to_string()));
        *self.last_error.lock() = Some(reason.to_string());

        // 会话拆除之后再看状态，open 不会把已断开的流标记为在线
        let lost = self.state_tx.send_if_modified(|current| {
            if *current != ConnectionState::Online {
                return false;
            }
            *current = ConnectionState::Reconnecting;
            true
        });
        if lost {
            warn!("Gate transport lost: {}", reason);
        } else {
            debug!("Transport failed during {}: {}", state, reason);
        }
    }

    fn handle_frame(&self, data: &[u8]) {
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Discarding undecodable frame ({} bytes): {}", data.len(), e);
                return;
            }
        };

        {
            let mut seq = self.seq.lock();
            if frame.server_seq > seq.server {
                seq.server = frame.server_seq;
            } else if frame.server_seq < seq.server {
                debug!(
                    "Ignoring regressed server_seq {} (current {})",
                    frame.server_seq, seq.server
                );
            }
        }

        match frame.kind {
            MessageType::Reply => self.resolve_reply(frame),
            MessageType::Push => self.dispatch_push(frame),
            MessageType::Request => warn!(
                "Discarding unexpected request frame {}.{}",
                frame.service, frame.method
            ),
        }
    }

    /// 回复按位置匹配；若回复带有 client_seq，则用它识别超时请求的迟到回复
    fn resolve_reply(&self, frame: Frame) {
        if frame.error_code == REMOTE_LOGIN_CODE {
            warn!(
                "{}.{}: account logged in elsewhere ({})",
                frame.service, frame.method, frame.error_message
            );
        }
        let remote_login = (frame.error_code == REMOTE_LOGIN_CODE).then(|| PushEvent {
            kind: PushKind::RemoteLogin,
            message_type: format!("{}.{}", frame.service, frame.method),
            body: Bytes::from(frame.error_message.clone().into_bytes()),
        });

        let target = {
            let mut slot = self.slot.lock();
            let echoed = frame.client_seq;
            let matches_in_flight =
                |slot: &CallSlot| slot.in_flight.as_ref().map(|c| c.client_seq) == Some(echoed);

            if echoed != 0 && matches_in_flight(&slot) {
                slot.stale.retain(|s| *s > echoed);
                slot.in_flight.take()
            } else if echoed != 0 && slot.stale.contains(&echoed) {
                slot.stale.retain(|s| *s > echoed);
                debug!("Discarding late reply for timed out seq={}", echoed);
                None
            } else if echoed == 0 && slot.stale.pop_front().is_some() {
                debug!("Discarding late reply for a timed out call");
                None
            } else if echoed == 0 {
                slot.in_flight.take()
            } else {
                None
            }
        };

        // 先通知监听器，调用方拿到回复时事件已经送达
        if let Some(event) = &remote_login {
            self.bus.emit(event);
        }

        match target {
            Some(call) => {
                let rtt = call.sent_at.elapsed().as_millis() as u64;
                {
                    let mut samples = self.rtt.lock();
                    if samples.len() >= MAX_RTT_SAMPLES {
                        samples.pop_front();
                    }
                    samples.push_back(rtt);
                }
                let _ = call.reply_tx.send(Ok(frame));
            }
            None if remote_login.is_none() => {
                debug!(
                    "Discarding unsolicited reply {}.{} (seq={})",
                    frame.service, frame.method, frame.client_seq
                );
            }
            None => {}
        }
    }

    fn dispatch_push(&self, frame: Frame) {
        if frame.payload.is_empty() {
            return;
        }
        let event = match decode_event(&frame.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("Discarding undecodable push: {}", e);
                return;
            }
        };
        let kind = PushKind::classify(&event.message_type);
        if kind.is_terminal() {
            warn!("Received {}", event.message_type);
        }
        self.bus.emit(&PushEvent {
            kind,
            message_type: event.message_type,
            body: Bytes::from(event.body),
        });
    }
}

async fn write_loop(
    inner: Weak<Inner>,
    generation: u64,
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tokio::time::timeout(Duration::from_secs(1), sink.close()).await;
                break;
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(Message::binary(frame)).await {
                    if let Some(inner) = inner.upgrade() {
                        inner.fail_transport(generation, &format!("write failed: {}", e));
                    }
                    break;
                }
            }
        }
    }
}

async fn read_loop(
    inner: Weak<Inner>,
    generation: u64,
    mut stream: WsStream,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = stream.next() => message,
        };
        let Some(inner) = inner.upgrade() else { break };

        match message {
            Some(Ok(Message::Binary(data))) => inner.handle_frame(&data),
            Some(Ok(Message::Text(_))) => warn!("Discarding unexpected text message"),
            Some(Ok(Message::Close(frame))) => {
                let reason = match frame {
                    Some(f) => format!("closed by gate: {} {}", u16::from(f.code), f.reason.as_str()),
                    None => "closed by gate".to_string(),
                };
                inner.fail_transport(generation, &reason);
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                inner.fail_transport(generation, &format!("read failed: {}", e));
                break;
            }
            None => {
                inner.fail_transport(generation, "stream ended");
                break;
            }
        }
    }
}

impl Connection {
    pub(super) fn from_weak(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Connection { inner })
    }

    pub(super) fn fail_transport(&self, generation: u64, reason: &str) {
        self.inner.fail_transport(generation, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::new("wss://gate-obt.nqf.qq.com/prod/ws", "1.6.0").unwrap();
        assert!(config.tls.is_some());
        assert_eq!(config.origin, "https://gate-obt.nqf.qq.com");
        assert_eq!(config.heartbeat_interval, Duration::from_millis(25_000));
        assert_eq!(
            config.gate_target().unwrap(),
            TargetAddr::new("gate-obt.nqf.qq.com", 443)
        );
        assert!(ConnectionConfig::new("http://example.com", "1").is_err());
    }

    #[test]
    fn test_handshake_request_query_and_headers() {
        let config = ConnectionConfig::new("ws://127.0.0.1:9000/prod/ws", "1.6.0").unwrap();
        let request = config.handshake_request("abc+def").unwrap();
        let uri = request.uri().to_string();
        assert!(uri.contains("platform=qq"));
        assert!(uri.contains("ver=1.6.0"));
        assert!(uri.contains("code=abc%2Bdef"));
        assert!(uri.ends_with("openID="));
        assert!(request.headers().contains_key(header::ORIGIN));
        assert!(request.headers().contains_key(header::USER_AGENT));
    }

    #[test]
    fn test_rtt_median_default_and_window() {
        let conn = Connection::new(ConnectionConfig::new("ws://127.0.0.1:1/ws", "1").unwrap());
        assert_eq!(conn.rtt_median_ms(), DEFAULT_RTT_MS);
        {
            let mut samples = conn.inner.rtt.lock();
            for v in [30, 10, 20] {
                samples.push_back(v);
            }
        }
        assert_eq!(conn.rtt_median_ms(), 20);
    }

    #[tokio::test]
    async fn test_call_before_open_is_not_connected() {
        let conn = Connection::new(ConnectionConfig::new("ws://127.0.0.1:1/ws", "1").unwrap());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        let err = conn.call("svc", "m", Bytes::new(), None).await.unwrap_err();
        assert!(matches!(err, CallError::NotConnected));

        conn.close();
        conn.close();
        let err = conn.call("svc", "m", Bytes::new(), None).await.unwrap_err();
        assert!(matches!(err, CallError::Closed));
    }

    #[test]
    fn test_stale_slot_is_bounded() {
        let mut slot = CallSlot::default();
        for seq in 0..(MAX_STALE_REPLIES as u64 + 5) {
            slot.push_stale(seq);
        }
        assert_eq!(slot.stale.len(), MAX_STALE_REPLIES);
        assert_eq!(slot.stale.front(), Some(&5));
    }
}
