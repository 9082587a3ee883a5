use std::sync::Arc;

use application::repository::{
    ConnectionRepository, MessageRepository, ParticipantRepository, RoomRepository,
};
use async_trait::async_trait;
use domain::{
    AvatarColor, Connection, ConnectionId, DeviceId, DevicePair, DisplayName, Message, MessageId,
    MessagePayload, Participant, ParticipantRowId, RepositoryError, Room, RoomId, RoomStatus,
    SessionId, Timestamp,
};
use sqlx::{postgres::PgPoolOptions, types::Json, FromRow, PgExecutor, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    match err.as_database_error() {
        Some(db) if db.is_unique_violation() => RepositoryError::Conflict,
        _ => RepositoryError::storage(err.to_string()),
    }
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[derive(Debug, FromRow)]
struct RoomRecord {
    id: Uuid,
    status: String,
    participant_count: i16,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<RoomRecord> for Room {
    type Error = RepositoryError;

    fn try_from(value: RoomRecord) -> Result<Self, Self::Error> {
        let status: RoomStatus = value
            .status
            .parse()
            .map_err(|err: domain::DomainError| invalid_data(err.to_string()))?;
        let participant_count = u8::try_from(value.participant_count)
            .map_err(|_| invalid_data(format!("bad participant_count {}", value.participant_count)))?;

        Ok(Room {
            id: RoomId::from(value.id),
            status,
            participant_count,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ParticipantRecord {
    id: Uuid,
    room_id: Uuid,
    participant_id: String,
    device_id: Uuid,
    session_id: Uuid,
    avatar_color: String,
    is_online: bool,
    joined_at: OffsetDateTime,
    last_seen: OffsetDateTime,
}

impl TryFrom<ParticipantRecord> for Participant {
    type Error = RepositoryError;

    fn try_from(value: ParticipantRecord) -> Result<Self, Self::Error> {
        let participant_id = DisplayName::parse(value.participant_id)
            .map_err(|err| invalid_data(err.to_string()))?;
        let avatar_color =
            AvatarColor::parse(value.avatar_color).map_err(|err| invalid_data(err.to_string()))?;

        Ok(Participant {
            id: ParticipantRowId::from(value.id),
            room_id: RoomId::from(value.room_id),
            participant_id,
            device_id: DeviceId::from(value.device_id),
            session_id: SessionId::from(value.session_id),
            avatar_color,
            is_online: value.is_online,
            joined_at: value.joined_at,
            last_seen: value.last_seen,
        })
    }
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: Uuid,
    room_id: Uuid,
    participant_id: String,
    device_id: Uuid,
    sequence: i64,
    payload: Json<MessagePayload>,
    created_at: OffsetDateTime,
}

impl TryFrom<MessageRecord> for Message {
    type Error = RepositoryError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        let participant_id = DisplayName::parse(value.participant_id)
            .map_err(|err| invalid_data(err.to_string()))?;
        let sequence = u64::try_from(value.sequence)
            .map_err(|_| invalid_data(format!("bad sequence {}", value.sequence)))?;

        Ok(Message {
            id: MessageId::from(value.id),
            room_id: RoomId::from(value.room_id),
            participant_id,
            device_id: DeviceId::from(value.device_id),
            payload: value.payload.0,
            sequence,
            created_at: value.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ConnectionRecord {
    id: Uuid,
    user1_device_id: Uuid,
    user2_device_id: Uuid,
    room_id: Uuid,
    last_connected: OffsetDateTime,
    connection_count: i32,
    is_favorite: bool,
}

impl TryFrom<ConnectionRecord> for Connection {
    type Error = RepositoryError;

    fn try_from(value: ConnectionRecord) -> Result<Self, Self::Error> {
        let connection_count = u32::try_from(value.connection_count)
            .map_err(|_| invalid_data(format!("bad connection_count {}", value.connection_count)))?;

        Ok(Connection {
            id: ConnectionId::from(value.id),
            user1_device_id: DeviceId::from(value.user1_device_id),
            user2_device_id: DeviceId::from(value.user2_device_id),
            room_id: RoomId::from(value.room_id),
            last_connected: value.last_connected,
            connection_count,
            is_favorite: value.is_favorite,
        })
    }
}

async fn insert_participant<'e, E>(
    executor: E,
    participant: &Participant,
) -> Result<Participant, RepositoryError>
where
    E: PgExecutor<'e>,
{
    let record = sqlx::query_as::<_, ParticipantRecord>(
        r#"
        INSERT INTO participants (id, room_id, participant_id, device_id, session_id, avatar_color, is_online, joined_at, last_seen)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING id, room_id, participant_id, device_id, session_id, avatar_color, is_online, joined_at, last_seen
        "#,
    )
    .bind(Uuid::from(participant.id))
    .bind(Uuid::from(participant.room_id))
    .bind(participant.participant_id.as_str())
    .bind(Uuid::from(participant.device_id))
    .bind(Uuid::from(participant.session_id))
    .bind(participant.avatar_color.as_str())
    .bind(participant.is_online)
    .bind(participant.joined_at)
    .bind(participant.last_seen)
    .fetch_one(executor)
    .await
    .map_err(map_sqlx_err)?;

    Participant::try_from(record)
}

#[derive(Clone)]
pub struct PgRoomRepository {
    pool: PgPool,
}

impl PgRoomRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoomRepository for PgRoomRepository {
    async fn create_with_participant(
        &self,
        room: Room,
        participant: Participant,
    ) -> Result<(Room, Participant), RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let record = sqlx::query_as::<_, RoomRecord>(
            r#"
            INSERT INTO rooms (id, status, participant_count, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, status, participant_count, created_at, updated_at
            "#,
        )
        .bind(Uuid::from(room.id))
        .bind(room.status.as_str())
        .bind(i16::from(room.participant_count))
        .bind(room.created_at)
        .bind(room.updated_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        let participant = insert_participant(&mut *tx, &participant).await?;

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok((Room::try_from(record)?, participant))
    }

    async fn find_by_id(&self, id: RoomId) -> Result<Option<Room>, RepositoryError> {
        let record = sqlx::query_as::<_, RoomRecord>(
            r#"SELECT id, status, participant_count, created_at, updated_at FROM rooms WHERE id = $1"#,
        )
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Room::try_from).transpose()
    }

    async fn find_waiting(
        &self,
        exclude_device: DeviceId,
    ) -> Result<Option<Room>, RepositoryError> {
        let record = sqlx::query_as::<_, RoomRecord>(
            r#"
            SELECT r.id, r.status, r.participant_count, r.created_at, r.updated_at
            FROM rooms r
            WHERE r.status = 'waiting'
              AND r.participant_count = 1
              AND NOT EXISTS (
                  SELECT 1 FROM participants p
                  WHERE p.room_id = r.id AND p.device_id = $1 AND p.is_online
              )
            ORDER BY r.created_at
            LIMIT 1
            "#,
        )
        .bind(Uuid::from(exclude_device))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Room::try_from).transpose()
    }

    async fn claim_with_participant(
        &self,
        id: RoomId,
        participant: Participant,
        now: Timestamp,
    ) -> Result<Option<(Room, Participant)>, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let record = sqlx::query_as::<_, RoomRecord>(
            r#"
            UPDATE rooms
            SET status = 'active', participant_count = 2, updated_at = $2
            WHERE id = $1 AND status = 'waiting' AND participant_count = 1
            RETURNING id, status, participant_count, created_at, updated_at
            "#,
        )
        .bind(Uuid::from(id))
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        let Some(record) = record else {
            tx.rollback().await.map_err(map_sqlx_err)?;
            return Ok(None);
        };
        let participant = insert_participant(&mut *tx, &participant).await?;

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(Some((Room::try_from(record)?, participant)))
    }

    async fn end_if_vacant(
        &self,
        id: RoomId,
        now: Timestamp,
    ) -> Result<Option<Room>, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        // 先锁房间行，与 insert_if_open 的共享锁互斥；之后的在线检查能看到已提交的新成员
        let locked: Option<Uuid> = sqlx::query_scalar(
            r#"SELECT id FROM rooms WHERE id = $1 AND status <> 'ended' FOR UPDATE"#,
        )
        .bind(Uuid::from(id))
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        if locked.is_none() {
            tx.rollback().await.map_err(map_sqlx_err)?;
            return Ok(None);
        }

        let record = sqlx::query_as::<_, RoomRecord>(
            r#"
            UPDATE rooms
            SET status = 'ended', updated_at = GREATEST(updated_at, $2)
            WHERE id = $1
              AND NOT EXISTS (
                  SELECT 1 FROM participants WHERE room_id = $1 AND is_online
              )
            RETURNING id, status, participant_count, created_at, updated_at
            "#,
        )
        .bind(Uuid::from(id))
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;
        record.map(Room::try_from).transpose()
    }

    async fn list_waiting_created_before(
        &self,
        cutoff: Timestamp,
    ) -> Result<Vec<Room>, RepositoryError> {
        let records = sqlx::query_as::<_, RoomRecord>(
            r#"
            SELECT id, status, participant_count, created_at, updated_at
            FROM rooms
            WHERE status = 'waiting' AND created_at < $1
            ORDER BY created_at
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Room::try_from).collect()
    }
}

#[derive(Clone)]
pub struct PgParticipantRepository {
    pool: PgPool,
}

impl PgParticipantRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ParticipantRepository for PgParticipantRepository {
    async fn insert_if_open(
        &self,
        participant: Participant,
    ) -> Result<Option<Participant>, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let open: Option<Uuid> = sqlx::query_scalar(
            r#"SELECT id FROM rooms WHERE id = $1 AND status <> 'ended' FOR SHARE"#,
        )
        .bind(Uuid::from(participant.room_id))
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        if open.is_none() {
            tx.rollback().await.map_err(map_sqlx_err)?;
            return Ok(None);
        }

        let participant = insert_participant(&mut *tx, &participant).await?;
        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(Some(participant))
    }

    async fn set_offline(
        &self,
        room_id: RoomId,
        device_id: DeviceId,
        session_id: Option<SessionId>,
        now: Timestamp,
    ) -> Result<Vec<Participant>, RepositoryError> {
        let records = sqlx::query_as::<_, ParticipantRecord>(
            r#"
            UPDATE participants
            SET is_online = FALSE, last_seen = $4
            WHERE room_id = $1
              AND device_id = $2
              AND is_online
              AND ($3::uuid IS NULL OR session_id = $3)
            RETURNING id, room_id, participant_id, device_id, session_id, avatar_color, is_online, joined_at, last_seen
            "#,
        )
        .bind(Uuid::from(room_id))
        .bind(Uuid::from(device_id))
        .bind(session_id.map(Uuid::from))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Participant::try_from).collect()
    }

    async fn list_for_room(&self, room_id: RoomId) -> Result<Vec<Participant>, RepositoryError> {
        let records = sqlx::query_as::<_, ParticipantRecord>(
            r#"
            SELECT id, room_id, participant_id, device_id, session_id, avatar_color, is_online, joined_at, last_seen
            FROM participants
            WHERE room_id = $1
            ORDER BY joined_at, id
            "#,
        )
        .bind(Uuid::from(room_id))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Participant::try_from).collect()
    }

    async fn touch(
        &self,
        room_id: RoomId,
        device_id: DeviceId,
        session_id: SessionId,
        now: Timestamp,
    ) -> Result<Option<Participant>, RepositoryError> {
        let record = sqlx::query_as::<_, ParticipantRecord>(
            r#"
            UPDATE participants
            SET last_seen = GREATEST(last_seen, $4)
            WHERE room_id = $1 AND device_id = $2 AND session_id = $3 AND is_online
            RETURNING id, room_id, participant_id, device_id, session_id, avatar_color, is_online, joined_at, last_seen
            "#,
        )
        .bind(Uuid::from(room_id))
        .bind(Uuid::from(device_id))
        .bind(Uuid::from(session_id))
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Participant::try_from).transpose()
    }

    async fn list_stale(&self, cutoff: Timestamp) -> Result<Vec<Participant>, RepositoryError> {
        let records = sqlx::query_as::<_, ParticipantRecord>(
            r#"
            SELECT id, room_id, participant_id, device_id, session_id, avatar_color, is_online, joined_at, last_seen
            FROM participants
            WHERE is_online AND last_seen < $1
            ORDER BY last_seen
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Participant::try_from).collect()
    }
}

#[derive(Clone)]
pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn append(&self, message: Message) -> Result<Message, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        // 行锁保证同一房间的序号严格递增
        let sequence: Option<i64> = sqlx::query_scalar(
            r#"UPDATE rooms SET last_sequence = last_sequence + 1 WHERE id = $1 RETURNING last_sequence"#,
        )
        .bind(Uuid::from(message.room_id))
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        let sequence = sequence.ok_or(RepositoryError::NotFound)?;

        let record = sqlx::query_as::<_, MessageRecord>(
            r#"
            INSERT INTO messages (id, room_id, participant_id, device_id, sequence, message_type, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, room_id, participant_id, device_id, sequence, payload, created_at
            "#,
        )
        .bind(Uuid::from(message.id))
        .bind(Uuid::from(message.room_id))
        .bind(message.participant_id.as_str())
        .bind(Uuid::from(message.device_id))
        .bind(sequence)
        .bind(message.message_type().as_str())
        .bind(Json(&message.payload))
        .bind(message.created_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;
        Message::try_from(record)
    }

    async fn list_for_room(
        &self,
        room_id: RoomId,
        after_sequence: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Message>, RepositoryError> {
        let after = after_sequence
            .map(|sequence| i64::try_from(sequence).unwrap_or(i64::MAX))
            .unwrap_or(0);
        let records = sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT id, room_id, participant_id, device_id, sequence, payload, created_at
            FROM messages
            WHERE room_id = $1 AND sequence > $2
            ORDER BY sequence
            LIMIT $3
            "#,
        )
        .bind(Uuid::from(room_id))
        .bind(after)
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Message::try_from).collect()
    }
}

#[derive(Clone)]
pub struct PgConnectionRepository {
    pool: PgPool,
}

impl PgConnectionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConnectionRepository for PgConnectionRepository {
    async fn find_by_id(&self, id: ConnectionId) -> Result<Option<Connection>, RepositoryError> {
        let record = sqlx::query_as::<_, ConnectionRecord>(
            r#"
            SELECT id, user1_device_id, user2_device_id, room_id, last_connected, connection_count, is_favorite
            FROM connections WHERE id = $1
            "#,
        )
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Connection::try_from).transpose()
    }

    async fn find_by_pair(&self, pair: DevicePair) -> Result<Option<Connection>, RepositoryError> {
        let record = sqlx::query_as::<_, ConnectionRecord>(
            r#"
            SELECT id, user1_device_id, user2_device_id, room_id, last_connected, connection_count, is_favorite
            FROM connections WHERE user1_device_id = $1 AND user2_device_id = $2
            "#,
        )
        .bind(Uuid::from(pair.first()))
        .bind(Uuid::from(pair.second()))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Connection::try_from).transpose()
    }

    async fn insert(&self, connection: Connection) -> Result<Connection, RepositoryError> {
        let pair = connection.pair();
        let record = sqlx::query_as::<_, ConnectionRecord>(
            r#"
            INSERT INTO connections (id, user1_device_id, user2_device_id, room_id, last_connected, connection_count, is_favorite)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user1_device_id, user2_device_id) DO NOTHING
            RETURNING id, user1_device_id, user2_device_id, room_id, last_connected, connection_count, is_favorite
            "#,
        )
        .bind(Uuid::from(connection.id))
        .bind(Uuid::from(pair.first()))
        .bind(Uuid::from(pair.second()))
        .bind(Uuid::from(connection.room_id))
        .bind(connection.last_connected)
        .bind(i32::try_from(connection.connection_count).unwrap_or(i32::MAX))
        .bind(connection.is_favorite)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record
            .ok_or(RepositoryError::Conflict)
            .and_then(Connection::try_from)
    }

    async fn record_meeting(
        &self,
        id: ConnectionId,
        room_id: RoomId,
        now: Timestamp,
    ) -> Result<Option<Connection>, RepositoryError> {
        // SET 右侧引用的是更新前的 room_id
        let record = sqlx::query_as::<_, ConnectionRecord>(
            r#"
            UPDATE connections
            SET connection_count = connection_count + CASE WHEN room_id = $2 THEN 0 ELSE 1 END,
                room_id = $2,
                last_connected = GREATEST(last_connected, $3)
            WHERE id = $1
            RETURNING id, user1_device_id, user2_device_id, room_id, last_connected, connection_count, is_favorite
            "#,
        )
        .bind(Uuid::from(id))
        .bind(Uuid::from(room_id))
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Connection::try_from).transpose()
    }

    async fn record_reconnect(
        &self,
        id: ConnectionId,
        room_id: RoomId,
        now: Timestamp,
    ) -> Result<Option<Connection>, RepositoryError> {
        let record = sqlx::query_as::<_, ConnectionRecord>(
            r#"
            UPDATE connections
            SET connection_count = connection_count + 1,
                room_id = $2,
                last_connected = GREATEST(last_connected, $3)
            WHERE id = $1
            RETURNING id, user1_device_id, user2_device_id, room_id, last_connected, connection_count, is_favorite
            "#,
        )
        .bind(Uuid::from(id))
        .bind(Uuid::from(room_id))
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Connection::try_from).transpose()
    }

    async fn set_favorite(
        &self,
        id: ConnectionId,
        favorite: bool,
    ) -> Result<Option<Connection>, RepositoryError> {
        let record = sqlx::query_as::<_, ConnectionRecord>(
            r#"
            UPDATE connections SET is_favorite = $2
            WHERE id = $1
            RETURNING id, user1_device_id, user2_device_id, room_id, last_connected, connection_count, is_favorite
            "#,
        )
        .bind(Uuid::from(id))
        .bind(favorite)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Connection::try_from).transpose()
    }

    async fn list_for_device(
        &self,
        device_id: DeviceId,
        limit: usize,
    ) -> Result<Vec<Connection>, RepositoryError> {
        let records = sqlx::query_as::<_, ConnectionRecord>(
            r#"
            SELECT id, user1_device_id, user2_device_id, room_id, last_connected, connection_count, is_favorite
            FROM connections
            WHERE user1_device_id = $1 OR user2_device_id = $1
            ORDER BY last_connected DESC
            LIMIT $2
            "#,
        )
        .bind(Uuid::from(device_id))
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Connection::try_from).collect()
    }
}

pub struct PgStorage {
    pub pool: PgPool,
    pub room_repository: Arc<PgRoomRepository>,
    pub participant_repository: Arc<PgParticipantRepository>,
    pub message_repository: Arc<PgMessageRepository>,
    pub connection_repository: Arc<PgConnectionRepository>,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            room_repository: Arc::new(PgRoomRepository::new(pool.clone())),
            participant_repository: Arc::new(PgParticipantRepository::new(pool.clone())),
            message_repository: Arc::new(PgMessageRepository::new(pool.clone())),
            connection_repository: Arc::new(PgConnectionRepository::new(pool.clone())),
            pool,
        }
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
