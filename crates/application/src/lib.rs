//! 应用层实现。
//!
//! 这里提供匿名聊天的核心用例：设备身份、房间匹配、成员在线状态、
//! 消息流、离开与重连，以及对外部适配器（存储、实时总线）的抽象。

pub mod clock;
pub mod error;
pub mod identity;
pub mod local_broadcast;
pub mod memory;
pub mod realtime;
pub mod repository;
pub mod services;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::ApplicationError;
pub use identity::{IdentityStorage, IdentityStorageError, IdentityStore};
pub use local_broadcast::LocalRealtimeBus;
pub use memory::{MemoryIdentityStorage, MemoryStore};
pub use realtime::{BusError, ChangeHandler, RealtimeBus, Subscription, SubscriptionHandle};
pub use repository::{
    ConnectionRepository, MessageRepository, ParticipantRepository, RoomRepository,
};
pub use services::{
    CoreDependencies, LeaveChatOutcome, LeaveOutcome, MatchOutcome, MessageChannel,
    ParticipantRegistry, PartnerPresence, PresenceSweeper, PresenceTracker, ReconnectOutcome,
    ReconnectionManager, RoomMatcher, SendMessageRequest, SweepPolicy, SweepReport,
};
