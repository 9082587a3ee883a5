use domain::{
    ChangeEvent, Identity, Participant, PartnerInfo, Room, RoomId, RowChange, SessionId,
};

use crate::error::ApplicationError;

use super::{publish, CoreDependencies};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchOutcome {
    pub room: Room,
    pub participant: Participant,
    /// 认领到等待中的房间时为先到的一方，新建房间时为空
    pub partner: Option<PartnerInfo>,
}

/// 两人房间的匹配：优先认领等待中的房间，否则新建一个。
#[derive(Clone)]
pub struct RoomMatcher {
    deps: CoreDependencies,
}

impl RoomMatcher {
    pub fn new(deps: CoreDependencies) -> Self {
        Self { deps }
    }

    pub async fn find_or_create_room(
        &self,
        identity: &Identity,
        session_id: SessionId,
    ) -> Result<MatchOutcome, ApplicationError> {
        let waiting = self.deps.rooms.find_waiting(identity.device_id).await?;
        let Some(room) = waiting else {
            return self.create(identity, session_id).await;
        };

        match self.claim(room.id, identity, session_id).await {
            Err(ApplicationError::ClaimConflict(room_id)) => {
                tracing::warn!(
                    room_id = %room_id,
                    device_id = %identity.device_id,
                    "等待中的房间已被抢先认领，改为新建房间"
                );
                self.create(identity, session_id).await.map_err(|err| {
                    tracing::error!(room_id = %room_id, error = %err, "认领冲突后新建房间失败");
                    ApplicationError::ClaimConflict(room_id)
                })
            }
            other => other,
        }
    }

    async fn claim(
        &self,
        room_id: RoomId,
        identity: &Identity,
        session_id: SessionId,
    ) -> Result<MatchOutcome, ApplicationError> {
        let now = self.deps.clock.now();
        let participant = Participant::join(room_id, identity, session_id, now);
        let Some((room, participant)) = self
            .deps
            .rooms
            .claim_with_participant(room_id, participant, now)
            .await?
        else {
            return Err(ApplicationError::ClaimConflict(room_id));
        };

        let partner = match self.deps.participants.list_for_room(room_id).await {
            Ok(members) => members
                .iter()
                .find(|member| member.device_id != identity.device_id)
                .map(PartnerInfo::from),
            Err(err) => {
                // 房间已认领成功，对方信息可以稍后通过成员列表补齐
                tracing::warn!(room_id = %room_id, error = %err, "读取房间成员失败");
                None
            }
        };

        tracing::info!(
            room_id = %room_id,
            device_id = %identity.device_id,
            "认领等待中的房间，会话开始"
        );
        self.announce(&room, &participant).await;
        Ok(MatchOutcome {
            room,
            participant,
            partner,
        })
    }

    async fn create(
        &self,
        identity: &Identity,
        session_id: SessionId,
    ) -> Result<MatchOutcome, ApplicationError> {
        let now = self.deps.clock.now();
        let room = Room::new_waiting(RoomId::random(), now);
        let participant = Participant::join(room.id, identity, session_id, now);
        let (room, participant) = self
            .deps
            .rooms
            .create_with_participant(room, participant)
            .await?;

        tracing::info!(
            room_id = %room.id,
            device_id = %identity.device_id,
            "创建新房间，等待对方加入"
        );
        self.announce(&room, &participant).await;
        Ok(MatchOutcome {
            room,
            participant,
            partner: None,
        })
    }

    async fn announce(&self, room: &Room, participant: &Participant) {
        publish(
            self.deps.bus.as_ref(),
            ChangeEvent::RoomChanged { room: room.clone() },
        )
        .await;
        publish(
            self.deps.bus.as_ref(),
            ChangeEvent::ParticipantChanged {
                change: RowChange::Insert,
                participant: participant.clone(),
            },
        )
        .await;
    }
}
