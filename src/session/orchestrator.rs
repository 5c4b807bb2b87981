//! 多账号会话调度
//!
//! 每个账号一个监督任务：掉线后报告中继故障、进入 Degraded，
//! 按退避更换中继重连；重试用尽、登录被拒或被踢下线时进入 Closed

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::activities::{Activity, ActivitySet};
use super::backoff::Backoff;
use super::state::{AccountIdentity, AccountState, AccountStatus, Credentials, StateChange};
use crate::error::{ConnectError, SessionError};
use crate::gate::{Connection, ConnectionConfig, ConnectionState, PushKind, UserProfile};
use crate::proxy_pool::ProxyPool;
use crate::transport::{DirectStreamFactory, KeepaliveConfig, RelayStreamFactory, StreamFactory};
use crate::tunnel::RelayUrl;

/// 调度参数
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// 一次掉线后最多重连几次
    pub max_reconnect_attempts: u32,
    /// 首次 start 最多尝试几次
    pub start_attempts: u32,
    /// 直连的 TCP 超时
    pub connect_timeout: Duration,
    /// 经中继时 TCP 连接 + 握手的总超时
    pub tunnel_timeout: Duration,
    pub keepalive: KeepaliveConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_base: Duration::from_secs(2),
            reconnect_max: Duration::from_secs(60),
            max_reconnect_attempts: 10,
            start_attempts: 3,
            connect_timeout: Duration::from_secs(10),
            tunnel_timeout: Duration::from_secs(10),
            keepalive: KeepaliveConfig::default(),
        }
    }
}

/// 单个账号的启动选项
#[derive(Clone, Default)]
pub struct AccountOptions {
    /// 不使用中继池
    pub direct: bool,
    pub activities: Vec<Arc<dyn Activity>>,
}

struct AccountSession {
    identity: AccountIdentity,
    credentials: Credentials,
    options: AccountOptions,
    connection: Connection,
    state: Mutex<AccountState>,
    relay: Mutex<Option<RelayUrl>>,
    attempts: AtomicU32,
    last_error: Mutex<Option<String>>,
    activities: Mutex<Option<ActivitySet>>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl AccountSession {
    fn status(&self) -> AccountStatus {
        AccountStatus {
            account: self.identity.id.clone(),
            platform: self.identity.platform.clone(),
            state: *self.state.lock(),
            relay: self.relay.lock().as_ref().map(RelayUrl::masked),
            reconnect_attempts: self.attempts.load(Ordering::Acquire),
            last_error: self.last_error.lock().clone(),
            profile: self.connection.profile(),
            rtt_ms: self.connection.rtt_median_ms(),
        }
    }

    async fn stop_activities(&self) {
        let set = self.activities.lock().take();
        if let Some(set) = set {
            set.stop().await;
        }
    }

    fn start_activities(&self) {
        if self.options.activities.is_empty() {
            return;
        }
        let set = ActivitySet::start(&self.connection, &self.options.activities);
        debug!(
            "[{}] Started {} activities",
            self.identity.id,
            set.len()
        );
        *self.activities.lock() = Some(set);
    }
}

/// 一次连接尝试的结果
enum AttemptError {
    /// 登录被拒，不再重试
    Fatal(ConnectError),
    /// 可以换中继重试
    Retry(String),
    /// 账号已被停止
    Cancelled,
}

struct Shared {
    pool: Arc<ProxyPool>,
    gate: ConnectionConfig,
    config: SessionConfig,
    accounts: Mutex<HashMap<String, Arc<AccountSession>>>,
    events: broadcast::Sender<StateChange>,
}

/// 账号调度器，克隆后共享
#[derive(Clone)]
pub struct SessionOrchestrator {
    shared: Arc<Shared>,
}

impl SessionOrchestrator {
    pub fn new(pool: Arc<ProxyPool>, gate: ConnectionConfig, config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                pool,
                gate,
                config,
                accounts: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.shared.pool
    }

    /// 订阅所有账号的状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.shared.events.subscribe()
    }

    pub fn status(&self, account: &str) -> Option<AccountStatus> {
        self.shared
            .accounts
            .lock()
            .get(account)
            .map(|session| session.status())
    }

    /// 所有账号的状态，按 id 排序
    pub fn list(&self) -> Vec<AccountStatus> {
        let sessions: Vec<Arc<AccountSession>> =
            self.shared.accounts.lock().values().cloned().collect();
        let mut statuses: Vec<AccountStatus> = sessions.iter().map(|s| s.status()).collect();
        statuses.sort_by(|a, b| a.account.cmp(&b.account));
        statuses
    }

    /// 账号的连接句柄，供上层业务发起调用或订阅推送
    pub fn connection(&self, account: &str) -> Option<Connection> {
        self.shared
            .accounts
            .lock()
            .get(account)
            .map(|s| s.connection.clone())
    }

    pub async fn start(
        &self,
        identity: AccountIdentity,
        credentials: Credentials,
    ) -> Result<UserProfile, SessionError> {
        self.start_with(identity, credentials, AccountOptions::default())
            .await
    }

    /// 启动账号并等待首次登录结果
    pub async fn start_with(
        &self,
        identity: AccountIdentity,
        credentials: Credentials,
        options: AccountOptions,
    ) -> Result<UserProfile, SessionError> {
        let account = identity.id.clone();
        let session = {
            let mut accounts = self.shared.accounts.lock();
            if let Some(existing) = accounts.get(&account) {
                if *existing.state.lock() != AccountState::Closed {
                    return Err(SessionError::AlreadyRunning(account));
                }
            }

            let mut gate = self.shared.gate.clone();
            gate.platform = identity.platform.clone();
            let session = Arc::new(AccountSession {
                identity,
                credentials,
                options,
                connection: Connection::new(gate),
                state: Mutex::new(AccountState::Closed),
                relay: Mutex::new(None),
                attempts: AtomicU32::new(0),
                last_error: Mutex::new(None),
                activities: Mutex::new(None),
                cancel: CancellationToken::new(),
                supervisor: Mutex::new(None),
            });
            accounts.insert(account.clone(), session.clone());
            session
        };

        let (terminal_tx, terminal_rx) = mpsc::unbounded_channel();
        for kind in [PushKind::Kickout, PushKind::RemoteLogin] {
            let terminal_tx = terminal_tx.clone();
            session.connection.on(kind, move |event| {
                let _ = terminal_tx.send(format!("{:?}: {}", event.kind, event.message_type));
            });
        }

        info!("[{}] Starting account", account);
        let attempts = self.shared.config.start_attempts.max(1);
        let mut backoff = Backoff::new(
            self.shared.config.reconnect_base,
            self.shared.config.reconnect_max,
        );
        let mut previous: Option<RelayUrl> = None;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = backoff.next_delay();
                debug!("[{}] Retrying start in {:?}", account, delay);
                tokio::select! {
                    _ = session.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self.connect_once(&session, previous.as_ref()).await {
                Ok(_) if session.cancel.is_cancelled() => break,
                Ok(profile) => {
                    self.transition(&session, AccountState::Online);
                    session.start_activities();
                    let supervisor = tokio::spawn(self.clone().supervise(session.clone(), terminal_rx));
                    *session.supervisor.lock() = Some(supervisor);
                    // stop() 在上面几步之间执行时看不到 supervisor，由这里收尾
                    if session.cancel.is_cancelled() {
                        self.close_session(&session, "stopped").await;
                        return Err(SessionError::Stopped {
                            account,
                            reason: "stopped during start".to_string(),
                        });
                    }
                    info!(
                        "[{}] Online as '{}' (gid={})",
                        account, profile.name, profile.gid
                    );
                    return Ok(profile);
                }
                Err(AttemptError::Fatal(e)) => {
                    self.close_session(&session, &e.to_string()).await;
                    return Err(SessionError::AuthRejected { account, source: e });
                }
                Err(AttemptError::Cancelled) => break,
                Err(AttemptError::Retry(reason)) => {
                    warn!(
                        "[{}] Start attempt {}/{} failed: {}",
                        account, attempt, attempts, reason
                    );
                    previous = session.relay.lock().take();
                    last_error = reason;
                }
            }
        }

        if session.cancel.is_cancelled() {
            self.close_session(&session, "stopped").await;
            return Err(SessionError::Stopped {
                account,
                reason: "stopped during start".to_string(),
            });
        }
        self.close_session(&session, &last_error).await;
        Err(SessionError::RetriesExhausted {
            account,
            attempts,
            last_error,
        })
    }

    /// 停止账号。重复调用无副作用
    pub async fn stop(&self, account: &str) -> Result<(), SessionError> {
        let session = self
            .shared
            .accounts
            .lock()
            .get(account)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(account.to_string()))?;

        session.cancel.cancel();
        let supervisor = session.supervisor.lock().take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
        if *session.state.lock() != AccountState::Closed {
            info!("[{}] Stopping account", account);
        }
        self.close_session(&session, "stopped").await;
        Ok(())
    }

    pub async fn stop_all(&self) {
        let accounts: Vec<String> = self.shared.accounts.lock().keys().cloned().collect();
        let stops = accounts.iter().map(|account| self.stop(account));
        futures::future::join_all(stops).await;
    }

    /// 从列表中移除已关闭的账号
    pub fn remove(&self, account: &str) -> Result<(), SessionError> {
        let mut accounts = self.shared.accounts.lock();
        match accounts.get(account) {
            None => Err(SessionError::NotFound(account.to_string())),
            Some(session) if *session.state.lock() != AccountState::Closed => {
                Err(SessionError::AlreadyRunning(account.to_string()))
            }
            Some(_) => {
                accounts.remove(account);
                Ok(())
            }
        }
    }

    fn transition(&self, session: &AccountSession, to: AccountState) {
        let from = {
            let mut state = session.state.lock();
            let from = *state;
            if from == to {
                return;
            }
            *state = to;
            from
        };
        debug!("[{}] {} -> {}", session.identity.id, from, to);
        let _ = self.shared.events.send(StateChange {
            account: session.identity.id.clone(),
            from,
            to,
        });
    }

    fn stream_factory(&self, relay: Option<&RelayUrl>) -> Box<dyn StreamFactory> {
        let config = &self.shared.config;
        match relay {
            Some(relay) => Box::new(RelayStreamFactory::new(
                relay.clone(),
                config.tunnel_timeout,
                config.keepalive,
            )),
            None => Box::new(DirectStreamFactory::new(
                config.connect_timeout,
                config.keepalive,
            )),
        }
    }

    /// 选中继、建立连接并登录一次
    ///
    /// 失败时已把结果反馈给中继池并释放名额
    async fn connect_once(
        &self,
        session: &AccountSession,
        exclude: Option<&RelayUrl>,
    ) -> Result<UserProfile, AttemptError> {
        let pool = &self.shared.pool;
        let account = &session.identity.id;

        let relay = if session.options.direct || pool.is_empty() {
            None
        } else {
            match pool.acquire(exclude) {
                Some(relay) => Some(relay),
                None => {
                    self.transition(session, AccountState::Connecting);
                    return Err(AttemptError::Retry("no relay available".to_string()));
                }
            }
        };
        *session.relay.lock() = relay.clone();

        self.transition(session, AccountState::Connecting);
        match &relay {
            Some(relay) => debug!("[{}] Connecting via {}", account, relay),
            None => debug!("[{}] Connecting directly", account),
        }

        let factory = self.stream_factory(relay.as_ref());
        let started = Instant::now();
        let result = {
            let conn = &session.connection;
            let mut states = conn.subscribe_state();
            let open = conn.open(factory.as_ref(), &session.credentials.code);
            tokio::pin!(open);
            loop {
                tokio::select! {
                    result = &mut open => break Some(result),
                    _ = session.cancel.cancelled() => break None,
                    changed = states.changed() => {
                        if changed.is_ok() && *states.borrow_and_update() == ConnectionState::Handshaking {
                            self.transition(session, AccountState::Authenticating);
                        }
                    }
                }
            }
        };

        let release = |relay: &Option<RelayUrl>| {
            if let Some(relay) = relay {
                pool.release(relay);
            }
        };

        match result {
            None => {
                release(&relay);
                *session.relay.lock() = None;
                Err(AttemptError::Cancelled)
            }
            Some(Ok(profile)) => {
                if let Some(relay) = &relay {
                    pool.mark_success(relay, started.elapsed().as_millis() as u64);
                }
                *session.last_error.lock() = None;
                Ok(profile)
            }
            Some(Err(e)) if e.is_auth_rejected() => {
                release(&relay);
                *session.relay.lock() = None;
                *session.last_error.lock() = Some(e.to_string());
                Err(AttemptError::Fatal(e))
            }
            Some(Err(e)) => {
                if let Some(relay) = &relay {
                    pool.mark_failed(relay);
                }
                release(&relay);
                *session.last_error.lock() = Some(e.to_string());
                // 保留 relay 以便下一次 acquire 排除它
                Err(AttemptError::Retry(e.to_string()))
            }
        }
    }

    async fn supervise(
        self,
        session: Arc<AccountSession>,
        mut terminal_rx: mpsc::UnboundedReceiver<String>,
    ) {
        let account = session.identity.id.clone();
        let mut states = session.connection.subscribe_state();
        // 订阅之前已经掉线的情况同样处理
        let mut lost = *states.borrow_and_update() == ConnectionState::Reconnecting;

        loop {
            if !lost {
                tokio::select! {
                    biased;
                    _ = session.cancel.cancelled() => return,
                    reason = terminal_rx.recv() => {
                        let reason = reason.unwrap_or_else(|| "terminal push".to_string());
                        warn!("[{}] Session ended by server: {}", account, reason);
                        self.close_session(&session, &reason).await;
                        return;
                    }
                    changed = states.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if *states.borrow_and_update() != ConnectionState::Reconnecting {
                            continue;
                        }
                    }
                }
            }
            lost = false;

            // 掉线：每次只进入一次 Degraded
            session.stop_activities().await;
            let reason = session
                .connection
                .last_error()
                .unwrap_or_else(|| "transport lost".to_string());
            *session.last_error.lock() = Some(reason.clone());
            self.transition(&session, AccountState::Degraded);
            let failed_relay = session.relay.lock().take();
            if let Some(relay) = &failed_relay {
                self.shared.pool.mark_failed(relay);
                self.shared.pool.release(relay);
            }
            warn!("[{}] Connection lost: {}", account, reason);

            match self.reconnect(&session, failed_relay).await {
                Ok(_) if session.cancel.is_cancelled() => return,
                Ok(profile) => {
                    session.attempts.store(0, Ordering::Release);
                    self.transition(&session, AccountState::Online);
                    session.start_activities();
                    info!("[{}] Reconnected (gid={})", account, profile.gid);
                    // 新连接可能在 open 返回后就已断开，这次变化不会再通过 changed() 送达
                    lost = *states.borrow_and_update() == ConnectionState::Reconnecting;
                }
                Err(None) => return,
                Err(Some(reason)) => {
                    error!("[{}] Giving up: {}", account, reason);
                    self.close_session(&session, &reason).await;
                    return;
                }
            }
        }
    }

    /// 按退避重连；Err(None) 表示被停止
    async fn reconnect(
        &self,
        session: &AccountSession,
        mut previous: Option<RelayUrl>,
    ) -> Result<UserProfile, Option<String>> {
        let config = &self.shared.config;
        let mut backoff = Backoff::new(config.reconnect_base, config.reconnect_max);
        let max_attempts = config.max_reconnect_attempts.max(1);

        for attempt in 1..=max_attempts {
            session.attempts.store(attempt, Ordering::Release);
            let delay = backoff.next_delay();
            info!(
                "[{}] Reconnect {}/{} in {:?}",
                session.identity.id, attempt, max_attempts, delay
            );
            tokio::select! {
                _ = session.cancel.cancelled() => return Err(None),
                _ = tokio::time::sleep(delay) => {}
            }

            match self.connect_once(session, previous.as_ref()).await {
                Ok(profile) => return Ok(profile),
                Err(AttemptError::Cancelled) => return Err(None),
                Err(AttemptError::Fatal(e)) => return Err(Some(e.to_string())),
                Err(AttemptError::Retry(reason)) => {
                    debug!("[{}] Reconnect failed: {}", session.identity.id, reason);
                    if let Some(relay) = session.relay.lock().take() {
                        previous = Some(relay);
                    }
                    self.transition(session, AccountState::Degraded);
                }
            }
        }

        let last = session
            .last_error
            .lock()
            .clone()
            .unwrap_or_else(|| "unknown error".to_string());
        Err(Some(
            SessionError::RetriesExhausted {
                account: session.identity.id.clone(),
                attempts: max_attempts,
                last_error: last,
            }
            .to_string(),
        ))
    }

    /// 停止任务、关闭连接、释放中继并进入 Closed
    async fn close_session(&self, session: &AccountSession, reason: &str) {
        session.stop_activities().await;
        session.connection.close();
        if let Some(relay) = session.relay.lock().take() {
            self.shared.pool.release(&relay);
        }
        if *session.state.lock() != AccountState::Closed && reason != "stopped" {
            *session.last_error.lock() = Some(reason.to_string());
        }
        self.transition(session, AccountState::Closed);
    }
}
