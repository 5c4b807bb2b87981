// 配置管理模块

mod validator;

pub use validator::ConfigValidator;

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::gate::{ConnectionConfig, DeviceInfo, DEFAULT_USER_AGENT};
use crate::proxy_pool::{PoolConfig, ProxyPool};
use crate::session::{decode_hex, Activity, PeriodicCall, SessionConfig};
use crate::transport::{load_client_config, KeepaliveConfig};
use crate::tunnel::TargetAddr;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "GATE_TUNNEL_";

/// 网关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// 网关地址（ws:// 或 wss://）
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// 客户端版本号，随登录和心跳发送
    #[serde(default = "default_client_version")]
    pub client_version: String,
    /// 默认平台（qq 或 wx），账号可单独指定
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default = "default_os")]
    pub os: String,
    /// Origin 头，默认由网关地址推导
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// 是否跳过证书验证
    #[serde(default = "default_true")]
    pub skip_verify: bool,
    /// CA 证书路径（可选）
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub device_info: Option<DeviceInfo>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            client_version: default_client_version(),
            platform: default_platform(),
            os: default_os(),
            origin: None,
            user_agent: default_user_agent(),
            skip_verify: true,
            ca_cert_path: None,
            device_info: None,
        }
    }
}

fn default_server_url() -> String {
    "wss://gate-obt.nqf.qq.com/prod/ws".to_string()
}

fn default_client_version() -> String {
    "1.6.0.14_20251224".to_string()
}

fn default_platform() -> String {
    "qq".to_string()
}

fn default_os() -> String {
    "iOS".to_string()
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_true() -> bool {
    true
}

/// 连接参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_login_timeout_ms")]
    pub login_timeout_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_max_misses")]
    pub heartbeat_max_misses: u32,
    /// TCP keepalive 首次探测时间，0 表示不设置
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            login_timeout_ms: default_login_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_max_misses: default_heartbeat_max_misses(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_login_timeout_ms() -> u64 {
    10_000
}

fn default_call_timeout_ms() -> u64 {
    5_000
}

fn default_heartbeat_interval_ms() -> u64 {
    25_000
}

fn default_heartbeat_max_misses() -> u32 {
    2
}

fn default_keepalive_secs() -> u64 {
    30
}

/// 中继池配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyPoolConfig {
    /// 关闭时所有账号直连
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 直接写在配置里的中继
    #[serde(default)]
    pub proxies: Vec<String>,
    /// 中继列表文件，每行一个
    #[serde(default)]
    pub proxies_file: Option<String>,
    /// 健康状态快照（JSON）
    #[serde(default)]
    pub health_file: Option<String>,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_max_users_per_proxy")]
    pub max_users_per_proxy: usize,
    #[serde(default = "default_probe_batch_size")]
    pub probe_batch_size: usize,
    #[serde(default = "default_probe_host")]
    pub probe_host: String,
    #[serde(default = "default_probe_port")]
    pub probe_port: u16,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// 经中继建立连接（TCP + 握手）的超时
    #[serde(default = "default_tunnel_timeout_ms")]
    pub tunnel_timeout_ms: u64,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            proxies: Vec::new(),
            proxies_file: None,
            health_file: None,
            failure_threshold: default_failure_threshold(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_users_per_proxy: default_max_users_per_proxy(),
            probe_batch_size: default_probe_batch_size(),
            probe_host: default_probe_host(),
            probe_port: default_probe_port(),
            probe_timeout_ms: default_probe_timeout_ms(),
            tunnel_timeout_ms: default_tunnel_timeout_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    5 * 60 * 1000
}

fn default_backoff_max_ms() -> u64 {
    60 * 60 * 1000
}

fn default_max_users_per_proxy() -> usize {
    10
}

fn default_probe_batch_size() -> usize {
    5
}

fn default_probe_host() -> String {
    "myip.ipip.net".to_string()
}

fn default_probe_port() -> u16 {
    80
}

fn default_probe_timeout_ms() -> u64 {
    8_000
}

fn default_tunnel_timeout_ms() -> u64 {
    10_000
}

/// 会话调度配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_start_attempts")]
    pub start_attempts: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            start_attempts: default_start_attempts(),
        }
    }
}

fn default_reconnect_base_ms() -> u64 {
    2_000
}

fn default_reconnect_max_ms() -> u64 {
    60_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_start_attempts() -> u32 {
    3
}

/// 账号配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    /// 未设置时使用 [gate] 中的平台
    #[serde(default)]
    pub platform: Option<String>,
    /// 登录 code
    pub code: String,
    /// 不经过中继池
    #[serde(default)]
    pub direct: bool,
}

/// 周期调用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityConfig {
    pub name: String,
    pub service: String,
    pub method: String,
    /// 请求正文（十六进制）
    #[serde(default)]
    pub payload_hex: String,
    pub interval_ms: u64,
    #[serde(default)]
    pub initial_delay_ms: u64,
}

impl ActivityConfig {
    pub fn to_activity(&self) -> Result<PeriodicCall> {
        let payload = decode_hex(&self.payload_hex)
            .with_context(|| format!("Activity '{}': payload_hex is not valid hex", self.name))?;
        Ok(PeriodicCall {
            name: self.name.clone(),
            service: self.service.clone(),
            method: self.method.clone(),
            payload: Bytes::from(payload),
            period: Duration::from_millis(self.interval_ms),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
        })
    }
}

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub proxy_pool: ProxyPoolConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub activities: Vec<ActivityConfig>,
}

impl AppConfig {
    /// 从文件加载配置，应用环境变量覆盖并验证
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {}", path))?;
        let mut config: AppConfig =
            toml::from_str(&content).context("Failed to parse configuration")?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate().context("Configuration validation failed")?;
        Ok(config)
    }

    /// 用 `GATE_TUNNEL_*` 变量覆盖配置
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        if let Some(url) = var("SERVER_URL") {
            info!("Gate url overridden by {}SERVER_URL", ENV_PREFIX);
            self.gate.server_url = url;
        }
        if let Some(path) = var("PROXIES_FILE") {
            self.proxy_pool.proxies_file = Some(path);
        }
    }

    pub fn validate(&self) -> Result<()> {
        ConfigValidator::validate_app_config(self)
    }

    /// 账号使用的连接配置
    pub fn connection_config(&self) -> Result<ConnectionConfig> {
        let gate = &self.gate;
        let mut config = ConnectionConfig::new(&gate.server_url, &gate.client_version)?;
        if config.tls.is_some() {
            let ca = gate
                .ca_cert_path
                .as_ref()
                .map(|p| expand_path(&p.to_string_lossy()));
            config.tls = Some(load_client_config(ca.as_deref(), gate.skip_verify)?);
        }
        config.platform = gate.platform.clone();
        config.os = gate.os.clone();
        config.user_agent = gate.user_agent.clone();
        if let Some(origin) = &gate.origin {
            config.origin = origin.clone();
        }
        if let Some(device_info) = &gate.device_info {
            let mut device_info = device_info.clone();
            if device_info.client_version.is_empty() {
                device_info.client_version = gate.client_version.clone();
            }
            config.device_info = device_info;
        }

        let conn = &self.connection;
        config.connect_timeout = Duration::from_millis(conn.connect_timeout_ms);
        config.login_timeout = Duration::from_millis(conn.login_timeout_ms);
        config.call_timeout = Duration::from_millis(conn.call_timeout_ms);
        config.heartbeat_interval = Duration::from_millis(conn.heartbeat_interval_ms);
        config.heartbeat_max_misses = conn.heartbeat_max_misses;
        Ok(config)
    }

    pub fn pool_config(&self) -> PoolConfig {
        let pool = &self.proxy_pool;
        PoolConfig {
            failure_threshold: pool.failure_threshold,
            backoff_base: Duration::from_millis(pool.backoff_base_ms),
            backoff_max: Duration::from_millis(pool.backoff_max_ms),
            max_users_per_endpoint: pool.max_users_per_proxy,
            probe_batch_size: pool.probe_batch_size,
            probe_target: TargetAddr::new(pool.probe_host.clone(), pool.probe_port),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        let keepalive = match self.connection.keepalive_secs {
            0 => KeepaliveConfig {
                time: None,
                interval: None,
            },
            secs => KeepaliveConfig {
                time: Some(Duration::from_secs(secs)),
                ..KeepaliveConfig::default()
            },
        };
        SessionConfig {
            reconnect_base: Duration::from_millis(self.session.reconnect_base_ms),
            reconnect_max: Duration::from_millis(self.session.reconnect_max_ms),
            max_reconnect_attempts: self.session.max_reconnect_attempts,
            start_attempts: self.session.start_attempts,
            connect_timeout: Duration::from_millis(self.connection.connect_timeout_ms),
            tunnel_timeout: Duration::from_millis(self.proxy_pool.tunnel_timeout_ms),
            keepalive,
        }
    }

    /// 构建中继池：配置中的中继、中继列表文件，以及健康快照
    pub fn build_pool(&self) -> Result<ProxyPool> {
        let pool = ProxyPool::new(self.pool_config());
        if !self.proxy_pool.enabled {
            info!("Relay pool disabled, all accounts connect directly");
            return Ok(pool);
        }

        for raw in &self.proxy_pool.proxies {
            if let Err(e) = pool.add(raw) {
                warn!("Skipping relay from config: {}", e);
            }
        }
        if let Some(file) = &self.proxy_pool.proxies_file {
            pool.load_file(&expand_path(file))?;
        }
        if let Some(file) = &self.proxy_pool.health_file {
            pool.load_health(&expand_path(file))?;
        }
        Ok(pool)
    }

    pub fn health_file(&self) -> Option<PathBuf> {
        self.proxy_pool.health_file.as_deref().map(expand_path)
    }

    pub fn build_activities(&self) -> Result<Vec<Arc<dyn Activity>>> {
        self.activities
            .iter()
            .map(|a| Ok(Arc::new(a.to_activity()?) as Arc<dyn Activity>))
            .collect()
    }
}

/// 展开 `~`
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}
