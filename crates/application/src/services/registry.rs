use domain::{
    ChangeEvent, DeviceId, DisplayName, Identity, Participant, Room, RoomId, RowChange, SessionId,
};

use crate::error::ApplicationError;

use super::{publish, CoreDependencies};

/// 一次离开操作的结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub marked_offline: Vec<Participant>,
    /// 最后一个在线成员离开时房间随之结束
    pub room_ended: Option<Room>,
}

/// 参与者登记与在线状态。
///
/// 成员记录只追加、从不删除；房间结束只发生在离开路径上。
#[derive(Clone)]
pub struct ParticipantRegistry {
    deps: CoreDependencies,
}

impl ParticipantRegistry {
    pub fn new(deps: CoreDependencies) -> Self {
        Self { deps }
    }

    pub async fn join(
        &self,
        room_id: RoomId,
        identity: &Identity,
        session_id: SessionId,
    ) -> Result<Participant, ApplicationError> {
        // 房间状态由存储在写入时一并检查，与最后一人离开结束房间互斥
        let participant = Participant::join(room_id, identity, session_id, self.deps.clock.now());
        let participant = self
            .deps
            .participants
            .insert_if_open(participant)
            .await?
            .ok_or(ApplicationError::RoomUnavailable(room_id))?;

        tracing::info!(
            room_id = %room_id,
            device_id = %identity.device_id,
            "参与者加入房间"
        );
        publish(
            self.deps.bus.as_ref(),
            ChangeEvent::ParticipantChanged {
                change: RowChange::Insert,
                participant: participant.clone(),
            },
        )
        .await;
        Ok(participant)
    }

    /// 设备离开房间：该设备的所有在线记录置为离线，无人在线时结束房间。
    pub async fn leave(
        &self,
        room_id: RoomId,
        device_id: DeviceId,
    ) -> Result<LeaveOutcome, ApplicationError> {
        self.mark_offline(room_id, device_id, None).await
    }

    /// 只让某个会话下线，供心跳超时清理使用。
    pub async fn expire_session(
        &self,
        room_id: RoomId,
        device_id: DeviceId,
        session_id: SessionId,
    ) -> Result<LeaveOutcome, ApplicationError> {
        self.mark_offline(room_id, device_id, Some(session_id)).await
    }

    async fn mark_offline(
        &self,
        room_id: RoomId,
        device_id: DeviceId,
        session_id: Option<SessionId>,
    ) -> Result<LeaveOutcome, ApplicationError> {
        let now = self.deps.clock.now();
        let marked_offline = self
            .deps
            .participants
            .set_offline(room_id, device_id, session_id, now)
            .await?;

        for participant in &marked_offline {
            publish(
                self.deps.bus.as_ref(),
                ChangeEvent::ParticipantChanged {
                    change: RowChange::Update,
                    participant: participant.clone(),
                },
            )
            .await;
        }

        let room_ended = self.deps.rooms.end_if_vacant(room_id, now).await?;
        if let Some(room) = &room_ended {
            tracing::info!(room_id = %room_id, "房间内已无在线成员，房间结束");
            publish(
                self.deps.bus.as_ref(),
                ChangeEvent::RoomChanged { room: room.clone() },
            )
            .await;
        }

        tracing::debug!(
            room_id = %room_id,
            device_id = %device_id,
            marked = marked_offline.len(),
            "参与者离开房间"
        );
        Ok(LeaveOutcome {
            marked_offline,
            room_ended,
        })
    }

    /// 在线成员的展示名，按加入顺序。
    pub async fn list_active(&self, room_id: RoomId) -> Result<Vec<DisplayName>, ApplicationError> {
        let members = self.deps.participants.list_for_room(room_id).await?;
        Ok(members
            .into_iter()
            .filter(|participant| participant.is_online)
            .map(|participant| participant.participant_id)
            .collect())
    }

    pub async fn list_members(&self, room_id: RoomId) -> Result<Vec<Participant>, ApplicationError> {
        Ok(self.deps.participants.list_for_room(room_id).await?)
    }

    pub async fn heartbeat(
        &self,
        room_id: RoomId,
        device_id: DeviceId,
        session_id: SessionId,
    ) -> Result<Participant, ApplicationError> {
        self.deps
            .participants
            .touch(room_id, device_id, session_id, self.deps.clock.now())
            .await?
            .ok_or_else(|| ApplicationError::not_found("participant", device_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::tests::Harness;
    use domain::{ChangeFilter, RoomStatus};

    #[tokio::test]
    async fn join_rejects_missing_room() {
        let harness = Harness::new();
        let registry = harness.registry();
        let room_id = RoomId::random();

        let err = registry
            .join(room_id, &harness.identity(), SessionId::random())
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::RoomUnavailable(id) if id == room_id));
    }

    #[tokio::test]
    async fn join_never_lands_in_an_ended_room() {
        let harness = Harness::new();
        let (room, a, b) = harness.matched_pair().await;
        let registry = harness.registry();
        registry.leave(room.id, a.device_id).await.unwrap();
        registry.leave(room.id, b.device_id).await.unwrap();

        let err = registry
            .join(room.id, &a, SessionId::random())
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::RoomUnavailable(id) if id == room.id));
        assert!(registry.list_active(room.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn leave_keeps_room_open_while_someone_is_online() {
        let harness = Harness::new();
        let (room, a, b) = harness.matched_pair().await;
        let registry = harness.registry();

        let outcome = registry.leave(room.id, b.device_id).await.unwrap();
        assert_eq!(outcome.marked_offline.len(), 1);
        assert!(outcome.room_ended.is_none());
        assert_eq!(harness.room(room.id).await.status, RoomStatus::Active);
        assert_eq!(
            registry.list_active(room.id).await.unwrap(),
            vec![a.display_name.clone()]
        );
        // 记录保留，只是离线
        assert_eq!(registry.list_members(room.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn last_leave_ends_room_and_publishes() {
        let harness = Harness::new();
        let (room, a, b) = harness.matched_pair().await;
        let registry = harness.registry();
        let mut room_feed = harness.subscribe(ChangeFilter::Room(room.id));

        registry.leave(room.id, b.device_id).await.unwrap();
        let outcome = registry.leave(room.id, a.device_id).await.unwrap();

        let ended = outcome.room_ended.unwrap();
        assert_eq!(ended.status, RoomStatus::Ended);
        assert_eq!(ended.participant_count, 2);
        match room_feed.try_recv() {
            Some(ChangeEvent::RoomChanged { room }) => assert_eq!(room.status, RoomStatus::Ended),
            other => panic!("expected room ended event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn leaving_twice_is_harmless() {
        let harness = Harness::new();
        let (room, a, b) = harness.matched_pair().await;
        let registry = harness.registry();

        registry.leave(room.id, a.device_id).await.unwrap();
        registry.leave(room.id, b.device_id).await.unwrap();
        let again = registry.leave(room.id, b.device_id).await.unwrap();

        assert!(again.marked_offline.is_empty());
        assert!(again.room_ended.is_none());
        assert_eq!(harness.room(room.id).await.status, RoomStatus::Ended);
    }

    #[tokio::test]
    async fn heartbeat_refreshes_only_online_rows() {
        let harness = Harness::new();
        let (room, a, _) = harness.matched_pair().await;
        let registry = harness.registry();
        let session = harness.session_of(room.id, a.device_id).await;

        harness.clock.advance(time::Duration::seconds(30));
        let touched = registry.heartbeat(room.id, a.device_id, session).await.unwrap();
        assert_eq!(touched.last_seen, harness.clock_now());

        registry.leave(room.id, a.device_id).await.unwrap();
        let err = registry
            .heartbeat(room.id, a.device_id, session)
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::NotFound { .. }));
    }
}
