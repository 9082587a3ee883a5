use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use domain::{
    ChangeEvent, DeviceId, Participant, PartnerInfo, Room, RoomStatus, RowChange, SessionId,
};

use crate::realtime::ChangeHandler;

/// 客户端侧对另一位参与者在线状态的本地视图。
///
/// 通知按会话行到达，对方只要还有一个会话在线就算在线。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartnerPresence {
    me: DeviceId,
    partner: Option<PartnerInfo>,
    // 对方设备当前在线的会话
    online_sessions: HashSet<SessionId>,
    room_ended: bool,
}

impl PartnerPresence {
    /// 只知道对方身份时使用，对方已有的会话在收到通知前不可见。
    pub fn new(me: DeviceId, partner: Option<PartnerInfo>) -> Self {
        Self {
            me,
            partner,
            online_sessions: HashSet::new(),
            room_ended: false,
        }
    }

    /// 从房间成员记录构建，带上对方全部在线会话。
    pub fn from_members(me: DeviceId, members: &[Participant]) -> Self {
        let Some(partner_device) = members
            .iter()
            .map(|member| member.device_id)
            .find(|device| *device != me)
        else {
            return Self::new(me, None);
        };

        let rows: Vec<&Participant> = members
            .iter()
            .filter(|member| member.device_id == partner_device)
            .collect();
        let online_sessions: HashSet<SessionId> = rows
            .iter()
            .filter(|row| row.is_online)
            .map(|row| row.session_id)
            .collect();
        let partner = rows.last().map(|row| PartnerInfo {
            is_online: !online_sessions.is_empty(),
            ..PartnerInfo::from(*row)
        });

        Self {
            me,
            partner,
            online_sessions,
            room_ended: false,
        }
    }

    pub fn partner(&self) -> Option<&PartnerInfo> {
        self.partner.as_ref()
    }

    pub fn is_partner_online(&self) -> bool {
        self.partner.as_ref().is_some_and(|partner| partner.is_online)
    }

    pub fn room_ended(&self) -> bool {
        self.room_ended
    }

    /// 应用一条变更，返回本地视图是否改变。
    pub fn apply(&mut self, event: &ChangeEvent) -> bool {
        match event {
            ChangeEvent::ParticipantChanged {
                change,
                participant,
            } => self.apply_participant(*change, participant),
            ChangeEvent::RoomChanged { room } => self.apply_room(room),
            ChangeEvent::MessageInserted { .. } => false,
        }
    }

    fn apply_participant(&mut self, change: RowChange, participant: &Participant) -> bool {
        if participant.device_id == self.me {
            return false;
        }
        match &self.partner {
            Some(current) if current.device_id != participant.device_id => return false,
            // 等待中的一方在对方加入时才得知对方是谁
            None if change != RowChange::Insert => return false,
            _ => {}
        }

        if participant.is_online {
            self.online_sessions.insert(participant.session_id);
        } else {
            self.online_sessions.remove(&participant.session_id);
        }
        let incoming = PartnerInfo {
            is_online: !self.online_sessions.is_empty(),
            ..PartnerInfo::from(participant)
        };
        if self.partner.as_ref() == Some(&incoming) {
            return false;
        }
        self.partner = Some(incoming);
        true
    }

    fn apply_room(&mut self, room: &Room) -> bool {
        if room.status != RoomStatus::Ended || self.room_ended {
            return false;
        }
        self.room_ended = true;
        self.online_sessions.clear();
        if let Some(partner) = &mut self.partner {
            partner.is_online = false;
        }
        true
    }
}

/// 可以挂到订阅上的共享在线状态视图。
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    state: Arc<Mutex<PartnerPresence>>,
}

impl PresenceTracker {
    pub fn new(presence: PartnerPresence) -> Self {
        Self {
            state: Arc::new(Mutex::new(presence)),
        }
    }

    pub fn snapshot(&self) -> PartnerPresence {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PartnerPresence> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ChangeHandler for PresenceTracker {
    fn on_room_changed(&mut self, room: Room) {
        self.lock().apply_room(&room);
    }

    fn on_participant_changed(&mut self, change: RowChange, participant: Participant) {
        let changed = self.lock().apply_participant(change, &participant);
        if changed {
            tracing::debug!(
                room_id = %participant.room_id,
                device_id = %participant.device_id,
                online = participant.is_online,
                "对方在线状态变化"
            );
        }
    }
}
