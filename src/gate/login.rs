//! 登录与心跳消息

use prost::Message as _;
use serde::{Deserialize, Serialize};

use crate::error::ConnectError;

pub const USER_SERVICE: &str = "gamepb.userpb.UserService";
pub const LOGIN_METHOD: &str = "Login";
pub const HEARTBEAT_METHOD: &str = "Heartbeat";

/// 账号在其他地方登录
pub const REMOTE_LOGIN_CODE: i64 = 1_000_014;

const LOGIN_SCENE_ID: &str = "1256";

/// 设备信息，随登录请求发送
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub client_version: String,
    #[prost(string, tag = "2")]
    #[serde(default = "default_sys_software")]
    pub sys_software: String,
    #[prost(string, tag = "3")]
    #[serde(default = "default_network")]
    pub network: String,
    #[prost(string, tag = "4")]
    #[serde(default = "default_memory")]
    pub memory: String,
    #[prost(string, tag = "5")]
    #[serde(default = "default_device_id")]
    pub device_id: String,
}

fn default_sys_software() -> String {
    "iOS 26.2.1".to_string()
}

fn default_network() -> String {
    "wifi".to_string()
}

fn default_memory() -> String {
    "7672".to_string()
}

fn default_device_id() -> String {
    "iPhone X<iPhone18,3>".to_string()
}

impl DeviceInfo {
    pub fn with_client_version(client_version: impl Into<String>) -> Self {
        Self {
            client_version: client_version.into(),
            sys_software: default_sys_software(),
            network: default_network(),
            memory: default_memory(),
            device_id: default_device_id(),
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportData {
    #[prost(string, tag = "1")]
    pub callback: String,
    #[prost(string, tag = "2")]
    pub cd_extend_info: String,
    #[prost(string, tag = "3")]
    pub click_id: String,
    #[prost(string, tag = "4")]
    pub clue_token: String,
    #[prost(string, tag = "5")]
    pub minigame_channel: String,
    #[prost(int32, tag = "6")]
    pub minigame_platid: i32,
    #[prost(string, tag = "7")]
    pub req_id: String,
    #[prost(string, tag = "8")]
    pub trackid: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoginRequest {
    #[prost(int64, tag = "1")]
    pub sharer_id: i64,
    #[prost(string, tag = "2")]
    pub sharer_open_id: String,
    #[prost(message, optional, tag = "3")]
    pub device_info: Option<DeviceInfo>,
    #[prost(int64, tag = "4")]
    pub share_cfg_id: i64,
    #[prost(string, tag = "5")]
    pub scene_id: String,
    #[prost(message, optional, tag = "6")]
    pub report_data: Option<ReportData>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserBasic {
    #[prost(int64, tag = "1")]
    pub gid: i64,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(int64, tag = "3")]
    pub level: i64,
    #[prost(int64, tag = "4")]
    pub gold: i64,
    #[prost(int64, tag = "5")]
    pub exp: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoginReply {
    #[prost(message, optional, tag = "1")]
    pub basic: Option<UserBasic>,
    #[prost(int64, tag = "2")]
    pub time_now_millis: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatRequest {
    #[prost(int64, tag = "1")]
    pub gid: i64,
    #[prost(string, tag = "2")]
    pub client_version: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatReply {
    #[prost(int64, tag = "1")]
    pub server_time: i64,
}

/// 登录后得到的账号信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UserProfile {
    pub gid: i64,
    pub name: String,
    pub level: i64,
    pub gold: i64,
    pub exp: i64,
    /// 登录时服务器时间（毫秒）
    pub server_time_ms: i64,
}

pub fn encode_login_request(device_info: &DeviceInfo) -> Vec<u8> {
    LoginRequest {
        sharer_id: 0,
        sharer_open_id: String::new(),
        device_info: Some(device_info.clone()),
        share_cfg_id: 0,
        scene_id: LOGIN_SCENE_ID.to_string(),
        report_data: Some(ReportData {
            minigame_channel: "other".to_string(),
            minigame_platid: 2,
            ..ReportData::default()
        }),
    }
    .encode_to_vec()
}

/// 解析登录回复，缺少 basic 视为协议错误
pub fn decode_login_reply(payload: &[u8]) -> Result<UserProfile, ConnectError> {
    let reply = LoginReply::decode(payload)
        .map_err(|e| ConnectError::protocol(format!("Undecodable login reply: {}", e)))?;
    let basic = reply
        .basic
        .ok_or_else(|| ConnectError::protocol("Login reply carries no user profile"))?;
    Ok(UserProfile {
        gid: basic.gid,
        name: basic.name,
        level: basic.level,
        gold: basic.gold,
        exp: basic.exp,
        server_time_ms: reply.time_now_millis,
    })
}

pub fn encode_heartbeat(gid: i64, client_version: &str) -> Vec<u8> {
    HeartbeatRequest {
        gid,
        client_version: client_version.to_string(),
    }
    .encode_to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_request_fields() {
        let raw = encode_login_request(&DeviceInfo::with_client_version("1.6.0.14_20251224"));
        let request = LoginRequest::decode(raw.as_slice()).unwrap();
        assert_eq!(request.scene_id, "1256");
        assert_eq!(
            request.device_info.unwrap().client_version,
            "1.6.0.14_20251224"
        );
        assert_eq!(request.report_data.unwrap().minigame_platid, 2);
    }

    #[test]
    fn test_login_reply_profile() {
        let raw = LoginReply {
            basic: Some(UserBasic {
                gid: 42,
                name: "farmer".into(),
                level: 7,
                gold: 1200,
                exp: 300,
            }),
            time_now_millis: 1_700_000_000_000,
        }
        .encode_to_vec();
        let profile = decode_login_reply(&raw).unwrap();
        assert_eq!(profile.gid, 42);
        assert_eq!(profile.name, "farmer");
        assert_eq!(profile.server_time_ms, 1_700_000_000_000);
    }

    #[test]
    fn test_login_reply_without_basic() {
        let raw = LoginReply::default().encode_to_vec();
        let err = decode_login_reply(&raw).unwrap_err();
        assert_eq!(err.kind(), crate::error::ConnectErrorKind::ProtocolError);
    }

    #[test]
    fn test_device_info_defaults_from_toml() {
        let info: DeviceInfo = toml::from_str("client_version = \"1.0\"").unwrap();
        assert_eq!(info.network, "wifi");
        assert_eq!(info.client_version, "1.0");
    }
}
