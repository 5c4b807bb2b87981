use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use super::{ImportSummary, ProxyHealth, ProxyPool};
use crate::tunnel::RelayUrl;

/// 健康状态快照中的一条记录
///
/// `key` 是规范 URL 的 SHA-256，用来匹配中继；`url` 隐藏密码，仅供阅读
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEntry {
    #[serde(default)]
    pub key: String,
    pub url: String,
    pub health: ProxyHealth,
}

/// 不可逆的中继标识，密码不同的同名中继得到不同的值
pub fn relay_key(url: &RelayUrl) -> String {
    hex::encode(Sha256::digest(url.canonical().as_bytes()))
}

/// 跨进程保存的健康状态
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub saved_at_ms: u64,
    pub endpoints: Vec<HealthEntry>,
}

impl ProxyPool {
    /// 从文本文件导入中继列表
    pub fn load_file(&self, path: &Path) -> Result<ImportSummary> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read proxies file: {:?}", path))?;
        let summary = self.import_text(&content);
        info!(
            "Loaded {} relays from {:?} ({} duplicate, {} invalid)",
            summary.added, path, summary.duplicates, summary.invalid
        );
        Ok(summary)
    }

    /// 把中继列表写回文本文件
    pub fn save_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.export_text())
            .with_context(|| format!("Failed to write proxies file: {:?}", path))
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            saved_at_ms: self.now_ms(),
            endpoints: self
                .list_endpoints()
                .into_iter()
                .map(|e| HealthEntry {
                    key: relay_key(&e.url),
                    url: e.url.masked(),
                    health: e.health,
                })
                .collect(),
        }
    }

    /// 恢复健康状态，快照中不存在于池里的地址被忽略
    pub fn restore_health(&self, snapshot: &HealthSnapshot) -> usize {
        let by_key: HashMap<String, RelayUrl> = self
            .list_endpoints()
            .into_iter()
            .map(|e| (relay_key(&e.url), e.url))
            .collect();

        let mut restored = 0;
        for entry in &snapshot.endpoints {
            let Some(url) = by_key.get(&entry.key) else {
                debug!("Ignoring health entry for unknown relay {}", entry.url);
                continue;
            };
            if let Some(record) = self.record(url) {
                *record.health.lock() = entry.health.clone();
                restored += 1;
            }
        }
        restored
    }

    pub fn save_health(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.health_snapshot())
            .context("Failed to serialize relay health")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write health file: {:?}", path))?;
        debug!("Saved relay health to {:?}", path);
        Ok(())
    }

    /// 加载健康快照；文件不存在时视为空
    pub fn load_health(&self, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read health file: {:?}", path))?;
        let snapshot: HealthSnapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse health file: {:?}", path))?;
        let restored = self.restore_health(&snapshot);
        info!("Restored health for {} relays from {:?}", restored, path);
        Ok(restored)
    }
}
