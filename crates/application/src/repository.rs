use async_trait::async_trait;
use domain::{
    Connection, ConnectionId, DeviceId, DevicePair, Message, Participant, RepositoryError, Room,
    RoomId, SessionId, Timestamp,
};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoomRepository: Send + Sync {
    /// 原子地创建房间并写入第一个参与者
    async fn create_with_participant(
        &self,
        room: Room,
        participant: Participant,
    ) -> Result<(Room, Participant), RepositoryError>;

    async fn find_by_id(&self, id: RoomId) -> Result<Option<Room>, RepositoryError>;

    /// 找一个 waiting 且只有 1 人的房间，排除该设备自己在线的房间
    async fn find_waiting(&self, exclude_device: DeviceId)
        -> Result<Option<Room>, RepositoryError>;

    /// 条件认领：仅当房间仍是 waiting/1 时切换为 active/2 并写入参与者。
    /// 没有命中任何行时返回 `None`。
    async fn claim_with_participant(
        &self,
        id: RoomId,
        participant: Participant,
        now: Timestamp,
    ) -> Result<Option<(Room, Participant)>, RepositoryError>;

    /// 条件结束：仅当房间未结束且没有在线参与者时切换为 ended
    async fn end_if_vacant(
        &self,
        id: RoomId,
        now: Timestamp,
    ) -> Result<Option<Room>, RepositoryError>;

    async fn list_waiting_created_before(
        &self,
        cutoff: Timestamp,
    ) -> Result<Vec<Room>, RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ParticipantRepository: Send + Sync {
    /// 仅当房间存在且未结束时写入，房间状态检查与写入在同一原子操作内完成。
    /// 房间不可用时返回 `None`。
    async fn insert_if_open(
        &self,
        participant: Participant,
    ) -> Result<Option<Participant>, RepositoryError>;

    /// 把设备（可选限定到某个会话）在房间内的在线行置为离线，返回被修改的行
    async fn set_offline(
        &self,
        room_id: RoomId,
        device_id: DeviceId,
        session_id: Option<SessionId>,
        now: Timestamp,
    ) -> Result<Vec<Participant>, RepositoryError>;

    /// 按加入顺序返回房间内的全部成员记录（含离线）
    async fn list_for_room(&self, room_id: RoomId) -> Result<Vec<Participant>, RepositoryError>;

    /// 刷新在线行的 last_seen，离线行不会被复活
    async fn touch(
        &self,
        room_id: RoomId,
        device_id: DeviceId,
        session_id: SessionId,
        now: Timestamp,
    ) -> Result<Option<Participant>, RepositoryError>;

    /// 在线但 last_seen 早于 cutoff 的行
    async fn list_stale(&self, cutoff: Timestamp) -> Result<Vec<Participant>, RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// 追加消息；`sequence` 字段由存储按房间单调分配并覆盖
    async fn append(&self, message: Message) -> Result<Message, RepositoryError>;

    /// 按序号升序返回 `after_sequence` 之后的消息
    async fn list_for_room(
        &self,
        room_id: RoomId,
        after_sequence: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Message>, RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionRepository: Send + Sync {
    async fn find_by_id(&self, id: ConnectionId) -> Result<Option<Connection>, RepositoryError>;

    async fn find_by_pair(&self, pair: DevicePair) -> Result<Option<Connection>, RepositoryError>;

    /// 同一无序设备对已存在记录时返回 `RepositoryError::Conflict`
    async fn insert(&self, connection: Connection) -> Result<Connection, RepositoryError>;

    /// 同一房间内只刷新 `last_connected`；换了房间则计数加一并记下新房间。
    /// 记录不存在时返回 `None`。
    async fn record_meeting(
        &self,
        id: ConnectionId,
        room_id: RoomId,
        now: Timestamp,
    ) -> Result<Option<Connection>, RepositoryError>;

    /// 原子地把 `connection_count` 加一
    async fn record_reconnect(
        &self,
        id: ConnectionId,
        room_id: RoomId,
        now: Timestamp,
    ) -> Result<Option<Connection>, RepositoryError>;

    async fn set_favorite(
        &self,
        id: ConnectionId,
        favorite: bool,
    ) -> Result<Option<Connection>, RepositoryError>;

    /// 设备出现在任一侧的记录，按 last_connected 倒序
    async fn list_for_device(
        &self,
        device_id: DeviceId,
        limit: usize,
    ) -> Result<Vec<Connection>, RepositoryError>;
}
