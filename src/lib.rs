/// Gate Tunnel 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod cli;
pub mod config;
pub mod error;
pub mod gate;
pub mod proxy_pool;
pub mod session;
pub mod transport;
pub mod tunnel;

// 重新导出常用类型
pub use config::AppConfig;
pub use error::{CallError, ConnectError, Result, SessionError, TunnelError};
pub use gate::{Connection, ConnectionConfig, ConnectionState, PushEvent, PushKind};
pub use proxy_pool::{PoolConfig, ProxyEndpoint, ProxyPool};
pub use session::{AccountIdentity, AccountState, Credentials, SessionOrchestrator};
pub use tunnel::{RelayUrl, TargetAddr};
