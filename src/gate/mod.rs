//! 网关连接层：帧编解码、请求/回复关联、推送分发、心跳

pub mod connection;
pub mod events;
mod heartbeat;
pub mod login;
pub mod protocol;

pub use connection::{Connection, ConnectionConfig, ConnectionState, DEFAULT_USER_AGENT};
pub use events::{EventBus, ListenerId, PushEvent, PushKind};
pub use login::{DeviceInfo, UserProfile, HEARTBEAT_METHOD, LOGIN_METHOD, REMOTE_LOGIN_CODE, USER_SERVICE};
pub use protocol::{EventMessage, Frame, FrameError, GateMessage, MessageType, Meta};
