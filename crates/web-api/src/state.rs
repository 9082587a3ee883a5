use std::sync::Arc;

use application::{
    CoreDependencies, MessageChannel, ParticipantRegistry, RealtimeBus, ReconnectionManager,
    RoomMatcher,
};
use config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    pub matcher: Arc<RoomMatcher>,
    pub registry: Arc<ParticipantRegistry>,
    pub channel: Arc<MessageChannel>,
    pub reconnection: Arc<ReconnectionManager>,
    pub bus: Arc<dyn RealtimeBus>,
    /// 下发给客户端的心跳间隔
    pub heartbeat_interval_secs: u64,
}

impl AppState {
    pub fn new(deps: CoreDependencies, config: &AppConfig) -> Self {
        Self {
            matcher: Arc::new(RoomMatcher::new(deps.clone())),
            registry: Arc::new(ParticipantRegistry::new(deps.clone())),
            channel: Arc::new(MessageChannel::new(
                deps.clone(),
                config.history.message_page_limit,
            )),
            reconnection: Arc::new(ReconnectionManager::new(
                deps.clone(),
                config.history.connection_limit,
            )),
            bus: deps.bus,
            heartbeat_interval_secs: config.presence.heartbeat_interval_secs,
        }
    }
}
