//! 账号会话：状态机、重连退避、周期任务

pub mod activities;
pub mod backoff;
pub mod orchestrator;
pub mod state;

pub use activities::{decode_hex, Activity, ActivitySet, PeriodicCall};
pub use backoff::Backoff;
pub use orchestrator::{AccountOptions, SessionConfig, SessionOrchestrator};
pub use state::{AccountIdentity, AccountState, AccountStatus, Credentials, StateChange};
