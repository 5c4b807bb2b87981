//! 上游中继池：健康评分、选择、退避禁用与容量分配
//!
//! 每条记录有自己的锁，健康更新只锁定被更新的那一条；
//! 池级别的读写锁只在增加记录时写入

mod clock;
mod persist;
mod probe;

pub use clock::{Clock, ManualClock, SystemClock};
pub use persist::{relay_key, HealthEntry, HealthSnapshot};
pub use probe::{probe_endpoint, ProbeError, ProbeOutcome, ProbeReport, ProbeSuccess};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::TunnelError;
use crate::tunnel::{RelayUrl, TargetAddr};

/// 代理池配置
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// 连续失败达到该值后开始禁用
    pub failure_threshold: u32,
    /// 第一次禁用的时长
    pub backoff_base: Duration,
    /// 禁用时长上限
    pub backoff_max: Duration,
    /// 每个中继同时分配的账号上限
    pub max_users_per_endpoint: usize,
    /// 探测时每批并发数量
    pub probe_batch_size: usize,
    /// 探测目标（返回出口 IP 的 HTTP 服务）
    pub probe_target: TargetAddr,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            backoff_base: Duration::from_secs(5 * 60),
            backoff_max: Duration::from_secs(60 * 60),
            max_users_per_endpoint: 10,
            probe_batch_size: 5,
            probe_target: TargetAddr::new("myip.ipip.net", 80),
        }
    }
}

/// 中继的健康状态
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyHealth {
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_latency_ms: Option<u64>,
    pub last_checked_at_ms: Option<u64>,
    pub disabled_until_ms: Option<u64>,
    /// 最近一次探测得到的出口 IP
    pub exit_ip: Option<String>,
}

impl ProxyHealth {
    pub fn is_disabled_at(&self, now_ms: u64) -> bool {
        self.disabled_until_ms.is_some_and(|until| until > now_ms)
    }
}

/// 中继快照
#[derive(Debug, Clone)]
pub struct ProxyEndpoint {
    pub url: RelayUrl,
    pub health: ProxyHealth,
    pub active_users: usize,
    pub max_users: usize,
}

impl ProxyEndpoint {
    pub fn is_disabled_at(&self, now_ms: u64) -> bool {
        self.health.is_disabled_at(now_ms)
    }
}

/// 单条中继记录
struct EndpointRecord {
    url: RelayUrl,
    key: String,
    health: Mutex<ProxyHealth>,
    active_users: AtomicUsize,
    max_users: AtomicUsize,
}

impl EndpointRecord {
    fn new(url: RelayUrl, max_users: usize) -> Self {
        Self {
            key: url.canonical(),
            url,
            health: Mutex::new(ProxyHealth::default()),
            active_users: AtomicUsize::new(0),
            max_users: AtomicUsize::new(max_users),
        }
    }

    fn snapshot(&self) -> ProxyEndpoint {
        ProxyEndpoint {
            url: self.url.clone(),
            health: self.health.lock().clone(),
            active_users: self.active_users.load(Ordering::Acquire),
            max_users: self.max_users.load(Ordering::Acquire),
        }
    }

    /// 在容量内占用一个名额
    fn try_occupy(&self) -> bool {
        let limit = self.max_users.load(Ordering::Acquire);
        self.active_users
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok()
    }
}

/// 排序键：连续失败少的优先，其次延迟低的优先（未测量的排最后），最后按 URL
fn rank_key(endpoint: &ProxyEndpoint) -> (u32, u64, String) {
    (
        endpoint.health.consecutive_failures,
        endpoint.health.last_latency_ms.unwrap_or(u64::MAX),
        endpoint.url.canonical(),
    )
}

/// 批量导入的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub added: usize,
    pub duplicates: usize,
    pub invalid: usize,
}

#[derive(Default)]
struct PoolInner {
    records: Vec<Arc<EndpointRecord>>,
    index: HashMap<String, Arc<EndpointRecord>>,
}

/// 中继池
pub struct ProxyPool {
    config: PoolConfig,
    clock: Arc<dyn Clock>,
    inner: RwLock<PoolInner>,
}

impl ProxyPool {
    /// 创建使用系统时钟的代理池
    pub fn new(config: PoolConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: PoolConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: RwLock::new(PoolInner::default()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// 添加中继，已存在时返回 false
    pub fn add(&self, raw: &str) -> Result<bool, TunnelError> {
        let url = RelayUrl::parse(raw)?;
        Ok(self.insert(url))
    }

    fn insert(&self, url: RelayUrl) -> bool {
        let key = url.canonical();
        let mut inner = self.inner.write();
        if inner.index.contains_key(&key) {
            return false;
        }
        let record = Arc::new(EndpointRecord::new(url, self.config.max_users_per_endpoint));
        inner.index.insert(key, record.clone());
        inner.records.push(record);
        true
    }

    /// 导入文本列表：每行一个地址，忽略空行和 `#` 注释
    pub fn import_text(&self, text: &str) -> ImportSummary {
        let mut summary = ImportSummary::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match self.add(line) {
                Ok(true) => summary.added += 1,
                Ok(false) => summary.duplicates += 1,
                Err(e) => {
                    warn!("Skipping proxy entry: {}", e);
                    summary.invalid += 1;
                }
            }
        }
        summary
    }

    /// 导出规范形式的地址列表（包含认证信息）
    pub fn export_text(&self) -> String {
        let inner = self.inner.read();
        let mut out = String::new();
        for record in &inner.records {
            out.push_str(&record.key);
            out.push('\n');
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }

    fn record(&self, url: &RelayUrl) -> Option<Arc<EndpointRecord>> {
        self.inner.read().index.get(&url.canonical()).cloned()
    }

    fn records(&self) -> Vec<Arc<EndpointRecord>> {
        self.inner.read().records.clone()
    }

    /// 按加入顺序列出所有中继
    pub fn list_endpoints(&self) -> Vec<ProxyEndpoint> {
        self.records().iter().map(|r| r.snapshot()).collect()
    }

    pub fn get(&self, url: &RelayUrl) -> Option<ProxyEndpoint> {
        self.record(url).map(|r| r.snapshot())
    }

    /// 当前未被禁用的中继数量
    pub fn available_count(&self) -> usize {
        let now = self.clock.now_ms();
        self.records()
            .iter()
            .filter(|r| !r.health.lock().is_disabled_at(now))
            .count()
    }

    /// 选出最佳的可用中继，不占用名额
    pub fn select(&self) -> Option<ProxyEndpoint> {
        let now = self.clock.now_ms();
        self.records()
            .iter()
            .map(|r| r.snapshot())
            .filter(|e| !e.is_disabled_at(now))
            .min_by(|a, b| rank_key(a).cmp(&rank_key(b)))
    }

    /// 为账号分配一个中继并占用名额
    ///
    /// 优先负载最低的；没有满足条件的候选时放宽 exclude，但从不分配被禁用的中继
    pub fn acquire(&self, exclude: Option<&RelayUrl>) -> Option<RelayUrl> {
        let now = self.clock.now_ms();
        let exclude_key = exclude.map(|u| u.canonical());

        let mut candidates: Vec<(Arc<EndpointRecord>, ProxyEndpoint)> = self
            .records()
            .into_iter()
            .map(|r| {
                let snapshot = r.snapshot();
                (r, snapshot)
            })
            .filter(|(_, e)| !e.is_disabled_at(now) && e.active_users < e.max_users)
            .collect();
        candidates.sort_by(|(_, a), (_, b)| {
            a.active_users
                .cmp(&b.active_users)
                .then_with(|| rank_key(a).cmp(&rank_key(b)))
        });

        let preferred = candidates
            .iter()
            .filter(|(r, _)| exclude_key.as_deref() != Some(r.key.as_str()));
        let relaxed = candidates
            .iter()
            .filter(|(r, _)| exclude_key.as_deref() == Some(r.key.as_str()));

        for (record, _) in preferred.chain(relaxed) {
            if record.try_occupy() {
                let active = record.active_users.load(Ordering::Acquire);
                info!(
                    "Assigned relay {} (load {}/{})",
                    record.url,
                    active,
                    record.max_users.load(Ordering::Acquire)
                );
                return Some(record.url.clone());
            }
        }

        warn!("No relay available (all disabled or at capacity)");
        None
    }

    /// 释放 acquire 占用的名额
    pub fn release(&self, url: &RelayUrl) {
        if let Some(record) = self.record(url) {
            let _ = record
                .active_users
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
            debug!(
                "Released relay {} (load {})",
                url,
                record.active_users.load(Ordering::Acquire)
            );
        }
    }

    /// 设置单个中继的账号上限
    pub fn set_max_users(&self, url: &RelayUrl, max_users: usize) -> bool {
        match self.record(url) {
            Some(record) => {
                record.max_users.store(max_users.max(1), Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// 记录一次成功：清空连续失败并解除禁用
    pub fn mark_success(&self, url: &RelayUrl, latency_ms: u64) {
        let Some(record) = self.record(url) else {
            debug!("mark_success for unknown relay {}", url);
            return;
        };
        let now = self.clock.now_ms();
        let mut health = record.health.lock();
        let was_disabled = health.disabled_until_ms.is_some();
        health.consecutive_failures = 0;
        health.total_successes += 1;
        health.last_latency_ms = Some(latency_ms);
        health.last_checked_at_ms = Some(now);
        health.disabled_until_ms = None;
        if was_disabled {
            info!("Relay {} recovered ({} ms)", url, latency_ms);
        }
    }

    /// 记录一次失败，达到阈值后按指数退避禁用
    ///
    /// 返回本次设置的禁用时长
    pub fn mark_failed(&self, url: &RelayUrl) -> Option<Duration> {
        let Some(record) = self.record(url) else {
            debug!("mark_failed for unknown relay {}", url);
            return None;
        };
        let now = self.clock.now_ms();
        let mut health = record.health.lock();
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        health.total_failures += 1;
        health.last_checked_at_ms = Some(now);

        if health.consecutive_failures < self.config.failure_threshold {
            debug!(
                "Relay {} failed ({}/{})",
                url, health.consecutive_failures, self.config.failure_threshold
            );
            return None;
        }

        let window = self.backoff_window(health.consecutive_failures);
        health.disabled_until_ms = Some(now.saturating_add(window.as_millis() as u64));
        warn!(
            "Relay {} disabled for {:?} after {} consecutive failures",
            url, window, health.consecutive_failures
        );
        Some(window)
    }

    /// base * 2^(failures - threshold)，不超过上限
    fn backoff_window(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(self.config.failure_threshold).min(31);
        self.config
            .backoff_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.config.backoff_max)
            .min(self.config.backoff_max)
    }

    /// 手动恢复一个中继
    pub fn reset(&self, url: &RelayUrl) -> bool {
        match self.record(url) {
            Some(record) => {
                let mut health = record.health.lock();
                health.consecutive_failures = 0;
                health.disabled_until_ms = None;
                true
            }
            None => false,
        }
    }

    fn record_exit_ip(&self, url: &RelayUrl, ip: Option<String>) {
        if let Some(record) = self.record(url) {
            record.health.lock().exit_ip = ip;
        }
    }
}
