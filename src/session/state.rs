use serde::Serialize;
use std::fmt;

use crate::gate::UserProfile;

/// 账号状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountState {
    Connecting,
    Authenticating,
    Online,
    /// 暂时不可用，将自动重连
    Degraded,
    /// 已停止；需要重新 start
    Closed,
}

impl fmt::Display for AccountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Online => "online",
            Self::Degraded => "degraded",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// 账号身份
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountIdentity {
    pub id: String,
    /// `qq` 或 `wx`
    pub platform: String,
}

impl AccountIdentity {
    pub fn new(id: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            platform: platform.into(),
        }
    }
}

/// 登录凭据
#[derive(Clone)]
pub struct Credentials {
    pub code: String,
}

impl Credentials {
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("code", &"***").finish()
    }
}

/// 状态变化通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub account: String,
    pub from: AccountState,
    pub to: AccountState,
}

/// 账号的当前状况
#[derive(Debug, Clone, Serialize)]
pub struct AccountStatus {
    pub account: String,
    pub platform: String,
    pub state: AccountState,
    /// 使用中的中继（隐藏密码），直连时为 None
    pub relay: Option<String>,
    /// 当前这一轮的重连次数
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub profile: Option<UserProfile>,
    pub rtt_ms: u64,
}
