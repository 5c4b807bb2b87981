use prost::Message as _;
use std::sync::Weak;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::connection::{Connection, Inner};
use super::login::{encode_heartbeat, HeartbeatReply, HEARTBEAT_METHOD, USER_SERVICE};
use crate::error::CallError;

pub(super) struct HeartbeatSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub max_misses: u32,
    pub gid: i64,
    pub client_version: String,
}

/// 周期发送心跳；连续超时达到上限时按传输错误处理
///
/// 带错误码的回复也算送达
pub(super) async fn run(
    inner: Weak<Inner>,
    generation: u64,
    settings: HeartbeatSettings,
    cancel: CancellationToken,
) {
    let mut ticker =
        tokio::time::interval_at(Instant::now() + settings.interval, settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut misses = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(conn) = Connection::from_weak(&inner) else { break };

        let body = encode_heartbeat(settings.gid, &settings.client_version);
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = conn.call(USER_SERVICE, HEARTBEAT_METHOD, body, Some(settings.timeout)) => result,
        };

        match result {
            Ok(payload) => {
                misses = 0;
                if let Ok(reply) = HeartbeatReply::decode(payload.as_ref()) {
                    debug!("Heartbeat ok (server_time={})", reply.server_time);
                }
            }
            Err(CallError::Remote { code, message, .. }) => {
                misses = 0;
                debug!("Heartbeat answered with error {}: {}", code, message);
            }
            Err(CallError::Timeout { .. }) => {
                misses += 1;
                warn!(
                    "Heartbeat timed out ({}/{})",
                    misses, settings.max_misses
                );
                if misses >= settings.max_misses {
                    conn.fail_transport(generation, "heartbeat not acknowledged");
                    break;
                }
            }
            Err(e) => {
                debug!("Heartbeat stopped: {}", e);
                break;
            }
        }
    }
}
