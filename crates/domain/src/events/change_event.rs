use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::participant::Participant;
use crate::room::Room;
use crate::value_objects::RoomId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowChange {
    Insert,
    Update,
}

/// 行级变更通知。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChangeEvent {
    RoomChanged {
        room: Room,
    },
    ParticipantChanged {
        change: RowChange,
        participant: Participant,
    },
    MessageInserted {
        message: Message,
    },
}

impl ChangeEvent {
    pub fn room_id(&self) -> RoomId {
        match self {
            ChangeEvent::RoomChanged { room } => room.id,
            ChangeEvent::ParticipantChanged { participant, .. } => participant.room_id,
            ChangeEvent::MessageInserted { message } => message.room_id,
        }
    }
}

/// 订阅过滤条件，对应 "insert on messages where room_id = X" 之类的订阅。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "room_id", rename_all = "snake_case")]
pub enum ChangeFilter {
    MessagesInRoom(RoomId),
    Room(RoomId),
    ParticipantsInRoom(RoomId),
    AnyInRoom(RoomId),
}

impl ChangeFilter {
    pub fn room_id(&self) -> RoomId {
        match self {
            ChangeFilter::MessagesInRoom(id)
            | ChangeFilter::Room(id)
            | ChangeFilter::ParticipantsInRoom(id)
            | ChangeFilter::AnyInRoom(id) => *id,
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.room_id() != self.room_id() {
            return false;
        }
        match (self, event) {
            (ChangeFilter::AnyInRoom(_), _) => true,
            (ChangeFilter::MessagesInRoom(_), ChangeEvent::MessageInserted { .. }) => true,
            (ChangeFilter::Room(_), ChangeEvent::RoomChanged { .. }) => true,
            (ChangeFilter::ParticipantsInRoom(_), ChangeEvent::ParticipantChanged { .. }) => true,
            _ => false,
        }
    }
}
