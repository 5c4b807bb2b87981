use anyhow::{bail, Result};
use std::collections::HashSet;
use tracing::warn;
use url::Url;

use super::{AccountConfig, ActivityConfig, AppConfig};
use crate::session::decode_hex;
use crate::tunnel::RelayUrl;

/// 心跳间隔上限
const MAX_HEARTBEAT_INTERVAL_MS: u64 = 5 * 60 * 1000;

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证名称不为空
    pub fn validate_name(name: &str, context: &str) -> Result<()> {
        if name.trim().is_empty() {
            bail!("{}: name cannot be empty", context);
        }
        Ok(())
    }

    /// 验证时长大于 0
    pub fn validate_positive(value: u64, context: &str) -> Result<()> {
        if value == 0 {
            bail!("{} must be greater than 0", context);
        }
        Ok(())
    }

    /// 验证网关地址
    pub fn validate_server_url(raw: &str) -> Result<()> {
        let url = match Url::parse(raw) {
            Ok(url) => url,
            Err(e) => bail!("gate.server_url '{}' is invalid: {}", raw, e),
        };
        if !matches!(url.scheme(), "ws" | "wss") {
            bail!(
                "gate.server_url must use ws:// or wss:// (got '{}')",
                url.scheme()
            );
        }
        if url.host_str().is_none() {
            bail!("gate.server_url '{}' has no host", raw);
        }
        Ok(())
    }

    /// 验证平台
    pub fn validate_platform(platform: &str, context: &str) -> Result<()> {
        if !matches!(platform, "qq" | "wx") {
            bail!("{}: platform must be 'qq' or 'wx' (got '{}')", context, platform);
        }
        Ok(())
    }

    /// 验证完整配置
    pub fn validate_app_config(config: &AppConfig) -> Result<()> {
        Self::validate_server_url(&config.gate.server_url)?;
        Self::validate_name(&config.gate.client_version, "gate.client_version")?;
        Self::validate_platform(&config.gate.platform, "gate")?;

        let conn = &config.connection;
        Self::validate_positive(conn.connect_timeout_ms, "connection.connect_timeout_ms")?;
        Self::validate_positive(conn.login_timeout_ms, "connection.login_timeout_ms")?;
        Self::validate_positive(conn.call_timeout_ms, "connection.call_timeout_ms")?;
        Self::validate_positive(conn.heartbeat_interval_ms, "connection.heartbeat_interval_ms")?;
        if conn.heartbeat_interval_ms > MAX_HEARTBEAT_INTERVAL_MS {
            bail!(
                "connection.heartbeat_interval_ms ({}) exceeds {} ms",
                conn.heartbeat_interval_ms,
                MAX_HEARTBEAT_INTERVAL_MS
            );
        }
        if conn.heartbeat_max_misses == 0 {
            bail!("connection.heartbeat_max_misses must be at least 1");
        }
        if conn.call_timeout_ms >= conn.heartbeat_interval_ms {
            warn!(
                "connection.call_timeout_ms ({}) is not shorter than heartbeat_interval_ms ({}), \
                 heartbeats will use the interval as their timeout",
                conn.call_timeout_ms, conn.heartbeat_interval_ms
            );
        }

        Self::validate_proxy_pool(config)?;

        let session = &config.session;
        Self::validate_positive(session.reconnect_base_ms, "session.reconnect_base_ms")?;
        if session.reconnect_max_ms < session.reconnect_base_ms {
            bail!(
                "session.reconnect_max_ms ({}) cannot be less than reconnect_base_ms ({})",
                session.reconnect_max_ms,
                session.reconnect_base_ms
            );
        }
        if session.max_reconnect_attempts == 0 || session.start_attempts == 0 {
            bail!("session.max_reconnect_attempts and session.start_attempts must be at least 1");
        }

        Self::validate_accounts(&config.accounts)?;
        Self::validate_activities(&config.activities)?;
        Ok(())
    }

    fn validate_proxy_pool(config: &AppConfig) -> Result<()> {
        let pool = &config.proxy_pool;
        if pool.failure_threshold == 0 {
            bail!("proxy_pool.failure_threshold must be at least 1");
        }
        Self::validate_positive(pool.backoff_base_ms, "proxy_pool.backoff_base_ms")?;
        if pool.backoff_max_ms < pool.backoff_base_ms {
            bail!(
                "proxy_pool.backoff_max_ms ({}) cannot be less than backoff_base_ms ({})",
                pool.backoff_max_ms,
                pool.backoff_base_ms
            );
        }
        if pool.max_users_per_proxy == 0 {
            bail!("proxy_pool.max_users_per_proxy must be at least 1");
        }
        if pool.probe_batch_size == 0 {
            bail!("proxy_pool.probe_batch_size must be at least 1");
        }
        Self::validate_name(&pool.probe_host, "proxy_pool.probe_host")?;
        if pool.probe_port == 0 {
            bail!("proxy_pool.probe_port cannot be 0");
        }
        Self::validate_positive(pool.probe_timeout_ms, "proxy_pool.probe_timeout_ms")?;
        Self::validate_positive(pool.tunnel_timeout_ms, "proxy_pool.tunnel_timeout_ms")?;

        for raw in &pool.proxies {
            if let Err(e) = RelayUrl::parse(raw) {
                bail!("proxy_pool.proxies: {}", e);
            }
        }
        if pool.enabled && pool.proxies.is_empty() && pool.proxies_file.is_none() {
            warn!("Relay pool is enabled but has no relays, accounts will connect directly");
        }
        Ok(())
    }

    /// 验证账号列表（检查重复 id）
    pub fn validate_accounts(accounts: &[AccountConfig]) -> Result<()> {
        let mut ids = HashSet::new();
        for account in accounts {
            Self::validate_name(&account.id, "Account")?;
            if !ids.insert(account.id.as_str()) {
                bail!("Duplicate account id: '{}'", account.id);
            }
            if account.code.trim().is_empty() {
                bail!("Account '{}': code cannot be empty", account.id);
            }
            if let Some(platform) = &account.platform {
                Self::validate_platform(platform, &format!("Account '{}'", account.id))?;
            }
        }
        Ok(())
    }

    /// 验证周期调用
    pub fn validate_activities(activities: &[ActivityConfig]) -> Result<()> {
        let mut names = HashSet::new();
        for activity in activities {
            Self::validate_name(&activity.name, "Activity")?;
            if !names.insert(activity.name.as_str()) {
                bail!("Duplicate activity name: '{}'", activity.name);
            }
            Self::validate_name(&activity.service, &format!("Activity '{}' service", activity.name))?;
            Self::validate_name(&activity.method, &format!("Activity '{}' method", activity.name))?;
            Self::validate_positive(
                activity.interval_ms,
                &format!("Activity '{}' interval_ms", activity.name),
            )?;
            if decode_hex(&activity.payload_hex).is_none() {
                bail!("Activity '{}': payload_hex is not valid hex", activity.name);
            }
        }
        Ok(())
    }
}
