//! 离开、历史连接与重连
//!
//! 每对设备只保留一条历史连接记录（无序设备对）。同一次房间会话里双方先后离开
//! 只刷新 `last_connected`；重连或在新房间再次相遇时 `connection_count` 加一。

use domain::{
    ChangeEvent, Connection, ConnectionId, DeviceId, DevicePair, DomainError, Identity,
    Participant, RepositoryError, Room, RoomId, RoomStatus, RowChange, SessionId, Timestamp,
};

use crate::error::ApplicationError;

use super::registry::{LeaveOutcome, ParticipantRegistry};
use super::{publish, CoreDependencies};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveChatOutcome {
    pub leave: LeaveOutcome,
    /// 等待中无人配对时离开不会产生历史记录
    pub connection: Option<Connection>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectOutcome {
    pub room: Room,
    pub participant: Participant,
    pub connection: Connection,
}

/// 历史连接的写入，离开聊天与后台清理共用。
#[derive(Clone)]
pub(super) struct HistoryRecorder {
    deps: CoreDependencies,
}

impl HistoryRecorder {
    pub(super) fn new(deps: CoreDependencies) -> Self {
        Self { deps }
    }

    /// 为 `device_id` 与房间内另一台设备记一次相遇，房间里没有别的设备时返回 `None`。
    pub(super) async fn record(
        &self,
        room_id: RoomId,
        device_id: DeviceId,
        members: &[Participant],
    ) -> Result<Option<Connection>, ApplicationError> {
        let partner = members
            .iter()
            .map(|member| member.device_id)
            .find(|other| *other != device_id);
        match partner {
            Some(other) => Ok(Some(self.upsert(room_id, device_id, other).await?)),
            None => Ok(None),
        }
    }

    async fn upsert(
        &self,
        room_id: RoomId,
        device_id: DeviceId,
        other: DeviceId,
    ) -> Result<Connection, ApplicationError> {
        let pair = DevicePair::new(device_id, other)?;
        let now = self.deps.clock.now();

        if let Some(existing) = self.deps.connections.find_by_pair(pair).await? {
            return self.meet(existing.id, room_id, now).await;
        }

        let connection = Connection::new(ConnectionId::random(), pair, room_id, now);
        match self.deps.connections.insert(connection).await {
            Ok(connection) => {
                tracing::info!(
                    connection_id = %connection.id,
                    room_id = %room_id,
                    "记录新的历史连接"
                );
                Ok(connection)
            }
            // 对方同时离开并抢先写入
            Err(RepositoryError::Conflict) => {
                let existing = self
                    .deps
                    .connections
                    .find_by_pair(pair)
                    .await?
                    .ok_or_else(|| ApplicationError::not_found("connection", room_id))?;
                self.meet(existing.id, room_id, now).await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn meet(
        &self,
        connection_id: ConnectionId,
        room_id: RoomId,
        now: Timestamp,
    ) -> Result<Connection, ApplicationError> {
        self.deps
            .connections
            .record_meeting(connection_id, room_id, now)
            .await?
            .ok_or_else(|| ApplicationError::not_found("connection", connection_id))
    }
}

#[derive(Clone)]
pub struct ReconnectionManager {
    deps: CoreDependencies,
    registry: ParticipantRegistry,
    history: HistoryRecorder,
    history_limit: usize,
}

impl ReconnectionManager {
    pub fn new(deps: CoreDependencies, history_limit: usize) -> Self {
        Self {
            registry: ParticipantRegistry::new(deps.clone()),
            history: HistoryRecorder::new(deps.clone()),
            deps,
            history_limit: history_limit.max(1),
        }
    }

    /// 离开房间并记录历史连接。
    ///
    /// 只有在房间里有过成员记录的设备才能离开，否则返回 [`ApplicationError::NotFound`]。
    pub async fn leave_chat(
        &self,
        room_id: RoomId,
        device_id: DeviceId,
    ) -> Result<LeaveChatOutcome, ApplicationError> {
        let members = self.deps.participants.list_for_room(room_id).await?;
        if !members.iter().any(|member| member.device_id == device_id) {
            return Err(ApplicationError::not_found("participant", device_id));
        }

        let leave = self.registry.leave(room_id, device_id).await?;
        let connection = self.history.record(room_id, device_id, &members).await?;
        Ok(LeaveChatOutcome { leave, connection })
    }

    /// 重新进入历史连接对应的房间。
    ///
    /// 房间不存在或已结束时返回 [`ApplicationError::RoomUnavailable`]，不会写入任何成员记录。
    pub async fn reconnect(
        &self,
        connection: &Connection,
        identity: &Identity,
        session_id: SessionId,
    ) -> Result<ReconnectOutcome, ApplicationError> {
        let connection = self.find_connection(connection.id).await?;
        if !connection.pair().contains(identity.device_id) {
            return Err(DomainError::invalid_argument(
                "device_id",
                "device is not part of this connection",
            )
            .into());
        }

        let room_id = connection.room_id;
        let room = match self.deps.rooms.find_by_id(room_id).await? {
            Some(room) if room.is_open() => room,
            _ => {
                tracing::info!(room_id = %room_id, "重连目标房间已不可用");
                return Err(ApplicationError::RoomUnavailable(room_id));
            }
        };

        let (room, participant) = if room.status == RoomStatus::Waiting {
            self.claim(room_id, identity, session_id).await?
        } else {
            let participant = self.registry.join(room_id, identity, session_id).await?;
            (room, participant)
        };

        let connection = self
            .deps
            .connections
            .record_reconnect(connection.id, room_id, self.deps.clock.now())
            .await?
            .ok_or_else(|| ApplicationError::not_found("connection", connection.id))?;

        tracing::info!(
            connection_id = %connection.id,
            room_id = %room_id,
            count = connection.connection_count,
            "重连成功"
        );
        Ok(ReconnectOutcome {
            room,
            participant,
            connection,
        })
    }

    /// 对方仍在等待中的房间通过条件认领进入，保证人数不超过两人。
    async fn claim(
        &self,
        room_id: RoomId,
        identity: &Identity,
        session_id: SessionId,
    ) -> Result<(Room, Participant), ApplicationError> {
        let now = self.deps.clock.now();
        let participant = Participant::join(room_id, identity, session_id, now);
        let (room, participant) = self
            .deps
            .rooms
            .claim_with_participant(room_id, participant, now)
            .await?
            .ok_or(ApplicationError::RoomUnavailable(room_id))?;

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
        Ok((room, participant))
    }

    /// 设备参与过的历史连接，最近的在前。
    pub async fn list_history(
        &self,
        device_id: DeviceId,
    ) -> Result<Vec<Connection>, ApplicationError> {
        Ok(self
            .deps
            .connections
            .list_for_device(device_id, self.history_limit)
            .await?)
    }

    pub async fn find_connection(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Connection, ApplicationError> {
        self.deps
            .connections
            .find_by_id(connection_id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("connection", connection_id))
    }

    pub async fn set_favorite(
        &self,
        connection_id: ConnectionId,
        favorite: bool,
    ) -> Result<Connection, ApplicationError> {
        self.deps
            .connections
            .set_favorite(connection_id, favorite)
            .await?
            .ok_or_else(|| ApplicationError::not_found("connection", connection_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::repository::{ParticipantRepository, RoomRepository};
    use crate::services::tests::Harness;
    use async_trait::async_trait;
    use std::sync::Arc;

    /// 查到房间后、写入成员前，让房间里最后一个在线设备离开并结束房间。
    struct EndsAfterLookup {
        store: Arc<MemoryStore>,
        last_online: DeviceId,
    }

    #[async_trait]
    impl RoomRepository for EndsAfterLookup {
        async fn create_with_participant(
            &self,
            room: Room,
            participant: Participant,
        ) -> Result<(Room, Participant), RepositoryError> {
            self.store.create_with_participant(room, participant).await
        }

        async fn find_by_id(&self, id: RoomId) -> Result<Option<Room>, RepositoryError> {
            let room = RoomRepository::find_by_id(self.store.as_ref(), id).await?;
            let now = time::OffsetDateTime::now_utc();
            self.store.set_offline(id, self.last_online, None, now).await?;
            self.store.end_if_vacant(id, now).await?;
            Ok(room)
        }

        async fn find_waiting(
            &self,
            exclude_device: DeviceId,
        ) -> Result<Option<Room>, RepositoryError> {
            self.store.find_waiting(exclude_device).await
        }

        async fn claim_with_participant(
            &self,
            id: RoomId,
            participant: Participant,
            now: Timestamp,
        ) -> Result<Option<(Room, Participant)>, RepositoryError> {
            self.store.claim_with_participant(id, participant, now).await
        }

        async fn end_if_vacant(
            &self,
            id: RoomId,
            now: Timestamp,
        ) -> Result<Option<Room>, RepositoryError> {
            self.store.end_if_vacant(id, now).await
        }

        async fn list_waiting_created_before(
            &self,
            cutoff: Timestamp,
        ) -> Result<Vec<Room>, RepositoryError> {
            self.store.list_waiting_created_before(cutoff).await
        }
    }

    #[tokio::test]
    async fn leaving_a_waiting_room_records_nothing() {
        let harness = Harness::new();
        let a = harness.identity();
        let outcome = harness
            .matcher()
            .find_or_create_room(&a, SessionId::random())
            .await
            .unwrap();

        let left = harness
            .reconnection()
            .leave_chat(outcome.room.id, a.device_id)
            .await
            .unwrap();
        assert!(left.connection.is_none());
        assert_eq!(left.leave.room_ended.unwrap().status, RoomStatus::Ended);
        assert!(harness
            .reconnection()
            .list_history(a.device_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn both_leaves_share_one_record() {
        let harness = Harness::new();
        let (room, a, b) = harness.matched_pair().await;
        let manager = harness.reconnection();

        let first = manager.leave_chat(room.id, b.device_id).await.unwrap();
        harness.clock.advance(time::Duration::seconds(10));
        let second = manager.leave_chat(room.id, a.device_id).await.unwrap();

        let first = first.connection.unwrap();
        let second = second.connection.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.connection_count, 1);
        assert!(second.last_connected > first.last_connected);
        assert_eq!(manager.list_history(a.device_id).await.unwrap().len(), 1);
        assert_eq!(manager.list_history(b.device_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stranger_leaving_records_nothing() {
        let harness = Harness::new();
        let (room, a, _) = harness.matched_pair().await;
        let manager = harness.reconnection();
        let stranger = harness.identity();

        let err = manager
            .leave_chat(room.id, stranger.device_id)
            .await
            .unwrap_err();

        assert!(matches!(err, ApplicationError::NotFound { .. }));
        assert!(manager.list_history(a.device_id).await.unwrap().is_empty());
        assert!(manager
            .list_history(stranger.device_id)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(harness.room(room.id).await.status, RoomStatus::Active);
    }

    #[tokio::test]
    async fn room_ending_during_reconnect_is_unavailable() {
        let harness = Harness::new();
        let (room, a, b) = harness.matched_pair().await;
        let connection = harness
            .reconnection()
            .leave_chat(room.id, b.device_id)
            .await
            .unwrap()
            .connection
            .unwrap();

        let mut deps = harness.deps();
        deps.rooms = Arc::new(EndsAfterLookup {
            store: harness.store.clone(),
            last_online: a.device_id,
        });
        let err = ReconnectionManager::new(deps, 20)
            .reconnect(&connection, &b, SessionId::random())
            .await
            .unwrap_err();

        assert!(matches!(err, ApplicationError::RoomUnavailable(id) if id == room.id));
        assert_eq!(harness.room(room.id).await.status, RoomStatus::Ended);
        assert!(harness.registry().list_active(room.id).await.unwrap().is_empty());
        let stored = harness.reconnection().list_history(b.device_id).await.unwrap();
        assert_eq!(stored[0].connection_count, 1);
    }

    #[tokio::test]
    async fn concurrent_reconnects_are_all_counted() {
        let harness = Harness::new();
        let (room, a, b) = harness.matched_pair().await;
        let manager = harness.reconnection();
        let connection = manager
            .leave_chat(room.id, b.device_id)
            .await
            .unwrap()
            .connection
            .unwrap();

        let (from_a, from_b) = tokio::join!(
            manager.reconnect(&connection, &a, SessionId::random()),
            manager.reconnect(&connection, &b, SessionId::random()),
        );
        from_a.unwrap();
        from_b.unwrap();

        let stored = manager.find_connection(connection.id).await.unwrap();
        assert_eq!(stored.connection_count, 3);
    }

    #[tokio::test]
    async fn reconnect_to_ended_room_is_unavailable() {
        let harness = Harness::new();
        let (room, a, b) = harness.matched_pair().await;
        let manager = harness.reconnection();
        manager.leave_chat(room.id, a.device_id).await.unwrap();
        let connection = manager
            .leave_chat(room.id, b.device_id)
            .await
            .unwrap()
            .connection
            .unwrap();
        let members_before = harness.registry().list_members(room.id).await.unwrap().len();

        let err = manager
            .reconnect(&connection, &a, SessionId::random())
            .await
            .unwrap_err();

        assert!(matches!(err, ApplicationError::RoomUnavailable(id) if id == room.id));
        assert_eq!(
            harness.registry().list_members(room.id).await.unwrap().len(),
            members_before
        );
        let stored = manager.list_history(a.device_id).await.unwrap();
        assert_eq!(stored[0].connection_count, 1);
    }

    #[tokio::test]
    async fn reconnect_to_open_room_counts_once() {
        let harness = Harness::new();
        let (room, a, b) = harness.matched_pair().await;
        let manager = harness.reconnection();
        let connection = manager
            .leave_chat(room.id, b.device_id)
            .await
            .unwrap()
            .connection
            .unwrap();

        harness.clock.advance(time::Duration::minutes(1));
        let outcome = manager
            .reconnect(&connection, &b, SessionId::random())
            .await
            .unwrap();

        assert_eq!(outcome.room.id, room.id);
        assert_eq!(outcome.room.status, RoomStatus::Active);
        assert_eq!(outcome.connection.connection_count, 2);
        assert!(outcome.connection.last_connected > connection.last_connected);
        assert!(outcome.participant.is_online);
        assert_eq!(
            harness.registry().list_active(room.id).await.unwrap(),
            vec![a.display_name.clone(), b.display_name.clone()]
        );
    }

    #[tokio::test]
    async fn reconnect_keeps_message_history() {
        let harness = Harness::new();
        let (room, a, b) = harness.matched_pair().await;
        let channel = harness.channel();
        channel
            .send(crate::services::SendMessageRequest {
                room_id: room.id,
                participant_id: a.display_name.clone(),
                device_id: a.device_id,
                draft: domain::MessageDraft::text("before"),
            })
            .await
            .unwrap();
        let manager = harness.reconnection();
        let connection = manager
            .leave_chat(room.id, b.device_id)
            .await
            .unwrap()
            .connection
            .unwrap();

        manager
            .reconnect(&connection, &b, SessionId::random())
            .await
            .unwrap();
        let history = channel.history(room.id, None, None).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn stranger_cannot_use_connection() {
        let harness = Harness::new();
        let (room, _, b) = harness.matched_pair().await;
        let manager = harness.reconnection();
        let connection = manager
            .leave_chat(room.id, b.device_id)
            .await
            .unwrap()
            .connection
            .unwrap();

        let err = manager
            .reconnect(&connection, &harness.identity(), SessionId::random())
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::Domain(_)));
    }

    #[tokio::test]
    async fn meeting_again_in_new_room_increments_count() {
        let harness = Harness::new();
        let (first_room, a, b) = harness.matched_pair().await;
        let manager = harness.reconnection();
        manager.leave_chat(first_room.id, a.device_id).await.unwrap();
        manager.leave_chat(first_room.id, b.device_id).await.unwrap();

        let second_room = harness.pair_up(&a, &b).await;
        assert_ne!(second_room.id, first_room.id);
        let connection = manager
            .leave_chat(second_room.id, a.device_id)
            .await
            .unwrap()
            .connection
            .unwrap();

        assert_eq!(connection.connection_count, 2);
        assert_eq!(connection.room_id, second_room.id);
        assert_eq!(manager.list_history(b.device_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn favorite_toggle_persists() {
        let harness = Harness::new();
        let (room, a, _) = harness.matched_pair().await;
        let manager = harness.reconnection();
        let connection = manager
            .leave_chat(room.id, a.device_id)
            .await
            .unwrap()
            .connection
            .unwrap();

        let updated = manager.set_favorite(connection.id, true).await.unwrap();
        assert!(updated.is_favorite);
        assert!(manager.list_history(a.device_id).await.unwrap()[0].is_favorite);

        let err = manager
            .set_favorite(ConnectionId::random(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::NotFound { .. }));
    }

    #[tokio::test]
    async fn history_is_newest_first_and_capped() {
        let harness = Harness::new();
        let manager = ReconnectionManager::new(harness.deps(), 2);
        let me = harness.identity();

        for _ in 0..3 {
            let other = harness.identity();
            let room = harness.pair_up(&me, &other).await;
            harness.clock.advance(time::Duration::minutes(1));
            manager.leave_chat(room.id, me.device_id).await.unwrap();
        }

        let history = manager.list_history(me.device_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].last_connected > history[1].last_connected);
    }
}
