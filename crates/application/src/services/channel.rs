use std::collections::HashMap;
use std::sync::Arc;

use domain::{
    ChangeEvent, ChangeFilter, DeviceId, DisplayName, Message, MessageDraft, MessageId, RoomId,
};
use tokio::sync::Mutex;

use crate::error::ApplicationError;
use crate::realtime::Subscription;

use super::{publish, CoreDependencies};

#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub room_id: RoomId,
    pub participant_id: DisplayName,
    pub device_id: DeviceId,
    pub draft: MessageDraft,
}

/// 房间内只追加的有序消息流。
pub struct MessageChannel {
    deps: CoreDependencies,
    page_limit: usize,
    // 同一房间的追加与推送放在同一临界区，订阅方收到的顺序与序号一致
    send_gates: std::sync::Mutex<HashMap<RoomId, Arc<Mutex<()>>>>,
}

impl MessageChannel {
    pub fn new(deps: CoreDependencies, page_limit: usize) -> Self {
        Self {
            deps,
            page_limit: page_limit.max(1),
            send_gates: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// 取得房间的发送锁，顺带清掉已无人持有的锁。
    fn gate(&self, room_id: RoomId) -> Arc<Mutex<()>> {
        let mut gates = self
            .send_gates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        gates.retain(|id, gate| *id == room_id || Arc::strong_count(gate) > 1);
        gates.entry(room_id).or_default().clone()
    }

    /// 空消息静默丢弃，返回 `Ok(None)`。
    pub async fn send(
        &self,
        request: SendMessageRequest,
    ) -> Result<Option<Message>, ApplicationError> {
        let SendMessageRequest {
            room_id,
            participant_id,
            device_id,
            draft,
        } = request;
        let Some(payload) = draft.into_payload() else {
            tracing::debug!(room_id = %room_id, "忽略空消息");
            return Ok(None);
        };

        match self.deps.rooms.find_by_id(room_id).await? {
            Some(room) if room.is_open() => {}
            _ => return Err(ApplicationError::RoomUnavailable(room_id)),
        }

        let gate = self.gate(room_id);
        let _guard = gate.lock().await;
        let message = Message {
            id: MessageId::random(),
            room_id,
            participant_id,
            device_id,
            payload,
            sequence: 0,
            created_at: self.deps.clock.now(),
        };
        let message = self.deps.messages.append(message).await?;

        tracing::debug!(
            room_id = %room_id,
            sequence = message.sequence,
            message_type = %message.message_type(),
            "消息已写入"
        );
        publish(
            self.deps.bus.as_ref(),
            ChangeEvent::MessageInserted {
                message: message.clone(),
            },
        )
        .await;
        Ok(Some(message))
    }

    pub fn subscribe(&self, room_id: RoomId) -> Subscription {
        self.deps.bus.subscribe(ChangeFilter::MessagesInRoom(room_id))
    }

    /// 按序号升序读取历史消息，条数不超过配置的单页上限。
    pub async fn history(
        &self,
        room_id: RoomId,
        after_sequence: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, ApplicationError> {
        let limit = limit.unwrap_or(self.page_limit).clamp(1, self.page_limit);
        Ok(self
            .deps
            .messages
            .list_for_room(room_id, after_sequence, limit)
            .await?)
    }
}
