use std::sync::Arc;

use domain::ChangeEvent;

use crate::clock::Clock;
use crate::realtime::RealtimeBus;
use crate::repository::{
    ConnectionRepository, MessageRepository, ParticipantRepository, RoomRepository,
};

mod channel;
mod maintenance;
mod matcher;
mod presence;
mod reconnection;
mod registry;


pub use channel::{MessageChannel, SendMessageRequest};
pub use maintenance::{PresenceSweeper, SweepPolicy, SweepReport};
pub use matcher::{MatchOutcome, RoomMatcher};
pub use presence::{PartnerPresence, PresenceTracker};
pub use reconnection::{LeaveChatOutcome, ReconnectOutcome, ReconnectionManager};
pub use registry::{LeaveOutcome, ParticipantRegistry};

/// 核心组件共享的存储、总线和时钟。
#[derive(Clone)]
pub struct CoreDependencies {
    pub rooms: Arc<dyn RoomRepository>,
    pub participants: Arc<dyn ParticipantRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub connections: Arc<dyn ConnectionRepository>,
    pub bus: Arc<dyn RealtimeBus>,
    pub clock: Arc<dyn Clock>,
}

/// 变更已落库，推送失败只记录日志，订阅方可通过历史接口补齐。
async fn publish(bus: &dyn RealtimeBus, event: ChangeEvent) {
    let room_id = event.room_id();
    if let Err(err) = bus.publish(event).await {
        tracing::warn!(room_id = %room_id, error = %err, "推送变更事件失败");
    }
}
