//! 账号在线后运行的周期任务

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::CallError;
use crate::gate::Connection;

/// 周期任务
#[async_trait]
pub trait Activity: Send + Sync {
    fn name(&self) -> &str;

    fn period(&self) -> Duration;

    fn initial_delay(&self) -> Duration {
        Duration::ZERO
    }

    async fn tick(&self, conn: &Connection) -> Result<(), CallError>;
}

/// 一组随账号上线启动、掉线时一起取消的任务
pub struct ActivitySet {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl ActivitySet {
    pub fn start(conn: &Connection, activities: &[Arc<dyn Activity>]) -> Self {
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        for activity in activities {
            tasks.spawn(run_activity(
                conn.clone(),
                activity.clone(),
                cancel.clone(),
            ));
        }
        Self { cancel, tasks }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// 取消全部任务并等待退出
    pub async fn stop(mut self) {
        self.cancel.cancel();
        while self.tasks.join_next().await.is_some() {}
    }
}

impl Drop for ActivitySet {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_activity(conn: Connection, activity: Arc<dyn Activity>, cancel: CancellationToken) {
    let period = activity.period().max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + activity.initial_delay(), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = activity.tick(&conn) => result,
        };
        match result {
            Ok(()) => {}
            Err(CallError::Closed) => break,
            Err(e) => warn!("Activity '{}' failed: {}", activity.name(), e),
        }
    }
    debug!("Activity '{}' stopped", activity.name());
}

/// 按固定间隔发出同一个请求
#[derive(Debug, Clone)]
pub struct PeriodicCall {
    pub name: String,
    pub service: String,
    pub method: String,
    pub payload: Bytes,
    pub period: Duration,
    pub initial_delay: Duration,
}

#[async_trait]
impl Activity for PeriodicCall {
    fn name(&self) -> &str {
        &self.name
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    async fn tick(&self, conn: &Connection) -> Result<(), CallError> {
        let reply = conn
            .call(&self.service, &self.method, self.payload.clone(), None)
            .await?;
        debug!(
            "{}: {}.{} -> {} bytes",
            self.name,
            self.service,
            self.method,
            reply.len()
        );
        Ok(())
    }
}

/// 解析十六进制负载，允许空白
pub fn decode_hex(text: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = text
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if digits.len() % 2 != 0 {
        return None;
    }
    digits
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        })
        .collect()
}
