//! 推送事件总线
//!
//! 推送类别是封闭的枚举；同一类别的监听器按注册顺序同步调用，
//! 单个监听器 panic 不影响其他监听器，也不影响连接

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// 推送类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushKind {
    Kickout,
    LandsNotify,
    ItemNotify,
    BasicNotify,
    FriendApplicationReceived,
    FriendAdded,
    GoodsUnlock,
    TaskInfo,
    NewEmail,
    DailyGiftStatusChanged,
    IllustratedRewardRedDot,
    /// 回复中的错误码表明账号在别处登录（由连接层合成）
    RemoteLogin,
    /// 未识别的推送
    Other,
}

/// 按 `EventMessage.message_type` 中包含的片段分类
const CLASSIFIERS: &[(&str, PushKind)] = &[
    ("Kickout", PushKind::Kickout),
    ("LandsNotify", PushKind::LandsNotify),
    ("ItemNotify", PushKind::ItemNotify),
    ("BasicNotify", PushKind::BasicNotify),
    (
        "FriendApplicationReceivedNotify",
        PushKind::FriendApplicationReceived,
    ),
    ("FriendAddedNotify", PushKind::FriendAdded),
    ("GoodsUnlockNotify", PushKind::GoodsUnlock),
    ("TaskInfoNotify", PushKind::TaskInfo),
    ("NewEmailNotify", PushKind::NewEmail),
    ("DailyGiftStatusChanged", PushKind::DailyGiftStatusChanged),
    (
        "IllustratedRewardRedDotNotify",
        PushKind::IllustratedRewardRedDot,
    ),
];

impl PushKind {
    pub fn classify(message_type: &str) -> Self {
        CLASSIFIERS
            .iter()
            .find(|(needle, _)| message_type.contains(needle))
            .map(|(_, kind)| *kind)
            .unwrap_or(PushKind::Other)
    }

    /// 是否意味着本次会话已失效
    pub fn is_terminal(self) -> bool {
        matches!(self, PushKind::Kickout | PushKind::RemoteLogin)
    }
}

/// 一次推送
#[derive(Debug, Clone)]
pub struct PushEvent {
    pub kind: PushKind,
    /// 原始 message_type（RemoteLogin 时为 `service.method`）
    pub message_type: String,
    pub body: Bytes,
}

pub type Listener = Arc<dyn Fn(&PushEvent) + Send + Sync>;

/// 监听器句柄，用于 off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<PushKind, Vec<(ListenerId, Listener)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册监听器
    pub fn on<F>(&self, kind: PushKind, listener: F) -> ListenerId
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// 注销监听器，返回是否找到
    pub fn off(&self, kind: PushKind, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        match listeners.get_mut(&kind) {
            Some(list) => {
                let before = list.len();
                list.retain(|(lid, _)| *lid != id);
                list.len() != before
            }
            None => false,
        }
    }

    pub fn listener_count(&self, kind: PushKind) -> usize {
        self.listeners.read().get(&kind).map_or(0, Vec::len)
    }

    /// 分发事件，返回成功执行的监听器数量
    pub fn emit(&self, event: &PushEvent) -> usize {
        // 先复制列表再调用，监听器内部可以安全地 on/off
        let snapshot: Vec<Listener> = match self.listeners.read().get(&event.kind) {
            Some(list) => list.iter().map(|(_, l)| l.clone()).collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for listener in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(_) => warn!(
                    "Push listener for {:?} ({}) panicked",
                    event.kind, event.message_type
                ),
            }
        }
        delivered
    }
}
