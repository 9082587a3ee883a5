use serde::{Deserialize, Serialize};

use crate::identity::Identity;
use crate::value_objects::{
    AvatarColor, DeviceId, DisplayName, ParticipantRowId, RoomId, SessionId, Timestamp,
};

/// 某设备在某个房间内的一次成员记录。
///
/// 每个 (room, device, session) 一行，只追加不删除，
/// 离开时仅把 `is_online` 置为 false。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantRowId,
    pub room_id: RoomId,
    /// 展示身份（匿名昵称）
    pub participant_id: DisplayName,
    pub device_id: DeviceId,
    pub session_id: SessionId,
    pub avatar_color: AvatarColor,
    pub is_online: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub joined_at: Timestamp,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: Timestamp,
}

impl Participant {
    pub fn join(
        room_id: RoomId,
        identity: &Identity,
        session_id: SessionId,
        joined_at: Timestamp,
    ) -> Self {
        Self {
            id: ParticipantRowId::random(),
            room_id,
            participant_id: identity.display_name.clone(),
            device_id: identity.device_id,
            session_id,
            avatar_color: identity.avatar_color.clone(),
            is_online: true,
            joined_at,
            last_seen: joined_at,
        }
    }

    pub fn go_offline(&mut self, now: Timestamp) {
        self.is_online = false;
        self.last_seen = now;
    }

    pub fn touch(&mut self, now: Timestamp) {
        if now > self.last_seen {
            self.last_seen = now;
        }
    }
}

/// 返回给对方展示用的参与者身份。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartnerInfo {
    pub participant_id: DisplayName,
    pub device_id: DeviceId,
    pub avatar_color: AvatarColor,
    pub is_online: bool,
}

impl From<&Participant> for PartnerInfo {
    fn from(value: &Participant) -> Self {
        Self {
            participant_id: value.participant_id.clone(),
            device_id: value.device_id,
            avatar_color: value.avatar_color.clone(),
            is_online: value.is_online,
        }
    }
}
