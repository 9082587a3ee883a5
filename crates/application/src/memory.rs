//! 进程内存储实现
//!
//! 所有表放在同一把锁后面，条件更新因此天然是原子的。用于本地开发和测试。

use std::collections::HashMap;

use async_trait::async_trait;
use domain::{
    Connection, ConnectionId, DeviceId, DevicePair, Identity, Message, Participant,
    RepositoryError, Room, RoomId, RoomStatus, SessionId, Timestamp,
};
use tokio::sync::{Mutex, RwLock};

use crate::identity::{IdentityStorage, IdentityStorageError};
use crate::repository::{
    ConnectionRepository, MessageRepository, ParticipantRepository, RoomRepository,
};

#[derive(Default)]
struct Tables {
    rooms: HashMap<RoomId, Room>,
    participants: Vec<Participant>,
    messages: HashMap<RoomId, Vec<Message>>,
    sequences: HashMap<RoomId, u64>,
    connections: HashMap<ConnectionId, Connection>,
}

impl Tables {
    fn has_online(&self, room_id: RoomId) -> bool {
        self.participants
            .iter()
            .any(|p| p.room_id == room_id && p.is_online)
    }

    fn device_online_in(&self, room_id: RoomId, device_id: DeviceId) -> bool {
        self.participants
            .iter()
            .any(|p| p.room_id == room_id && p.device_id == device_id && p.is_online)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoomRepository for MemoryStore {
    async fn create_with_participant(
        &self,
        room: Room,
        participant: Participant,
    ) -> Result<(Room, Participant), RepositoryError> {
        let mut tables = self.tables.lock().await;
        if tables.rooms.contains_key(&room.id) {
            return Err(RepositoryError::Conflict);
        }
        tables.rooms.insert(room.id, room.clone());
        tables.participants.push(participant.clone());
        Ok((room, participant))
    }

    async fn find_by_id(&self, id: RoomId) -> Result<Option<Room>, RepositoryError> {
        let tables = self.tables.lock().await;
        Ok(tables.rooms.get(&id).cloned())
    }

    async fn find_waiting(
        &self,
        exclude_device: DeviceId,
    ) -> Result<Option<Room>, RepositoryError> {
        let tables = self.tables.lock().await;
        let room = tables
            .rooms
            .values()
            .filter(|room| room.is_claimable())
            .filter(|room| !tables.device_online_in(room.id, exclude_device))
            .min_by_key(|room| room.created_at)
            .cloned();
        Ok(room)
    }

    async fn claim_with_participant(
        &self,
        id: RoomId,
        participant: Participant,
        now: Timestamp,
    ) -> Result<Option<(Room, Participant)>, RepositoryError> {
        let mut tables = self.tables.lock().await;
        let Some(room) = tables.rooms.get_mut(&id) else {
            return Ok(None);
        };
        if !room.is_claimable() || room.activate(now).is_err() {
            return Ok(None);
        }
        let room = room.clone();
        tables.participants.push(participant.clone());
        Ok(Some((room, participant)))
    }

    async fn end_if_vacant(
        &self,
        id: RoomId,
        now: Timestamp,
    ) -> Result<Option<Room>, RepositoryError> {
        let mut tables = self.tables.lock().await;
        if tables.has_online(id) {
            return Ok(None);
        }
        let Some(room) = tables.rooms.get_mut(&id) else {
            return Ok(None);
        };
        if room.end(now).is_err() {
            return Ok(None);
        }
        Ok(Some(room.clone()))
    }

    async fn list_waiting_created_before(
        &self,
        cutoff: Timestamp,
    ) -> Result<Vec<Room>, RepositoryError> {
        let tables = self.tables.lock().await;
        let mut rooms: Vec<Room> = tables
            .rooms
            .values()
            .filter(|room| room.status == RoomStatus::Waiting && room.created_at < cutoff)
            .cloned()
            .collect();
        rooms.sort_by_key(|room| room.created_at);
        Ok(rooms)
    }
}

#[async_trait]
impl ParticipantRepository for MemoryStore {
    async fn insert_if_open(
        &self,
        participant: Participant,
    ) -> Result<Option<Participant>, RepositoryError> {
        let mut tables = self.tables.lock().await;
        let open = tables
            .rooms
            .get(&participant.room_id)
            .is_some_and(|room| room.is_open());
        if !open {
            return Ok(None);
        }
        if tables.participants.iter().any(|p| p.id == participant.id) {
            return Err(RepositoryError::Conflict);
        }
        tables.participants.push(participant.clone());
        Ok(Some(participant))
    }

    async fn set_offline(
        &self,
        room_id: RoomId,
        device_id: DeviceId,
        session_id: Option<SessionId>,
        now: Timestamp,
    ) -> Result<Vec<Participant>, RepositoryError> {
        let mut tables = self.tables.lock().await;
        let changed = tables
            .participants
            .iter_mut()
            .filter(|p| p.room_id == room_id && p.device_id == device_id && p.is_online)
            .filter(|p| session_id.map_or(true, |session| p.session_id == session))
            .map(|p| {
                p.go_offline(now);
                p.clone()
            })
            .collect();
        Ok(changed)
    }

    async fn list_for_room(&self, room_id: RoomId) -> Result<Vec<Participant>, RepositoryError> {
        let tables = self.tables.lock().await;
        let mut members: Vec<Participant> = tables
            .participants
            .iter()
            .filter(|p| p.room_id == room_id)
            .cloned()
            .collect();
        // 稳定排序，同一时刻加入的保持插入顺序
        members.sort_by_key(|p| p.joined_at);
        Ok(members)
    }

    async fn touch(
        &self,
        room_id: RoomId,
        device_id: DeviceId,
        session_id: SessionId,
        now: Timestamp,
    ) -> Result<Option<Participant>, RepositoryError> {
        let mut tables = self.tables.lock().await;
        let row = tables.participants.iter_mut().find(|p| {
            p.room_id == room_id
                && p.device_id == device_id
                && p.session_id == session_id
                && p.is_online
        });
        Ok(row.map(|p| {
            p.touch(now);
            p.clone()
        }))
    }

    async fn list_stale(&self, cutoff: Timestamp) -> Result<Vec<Participant>, RepositoryError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .participants
            .iter()
            .filter(|p| p.is_online && p.last_seen < cutoff)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn append(&self, mut message: Message) -> Result<Message, RepositoryError> {
        let mut tables = self.tables.lock().await;
        let sequence = tables.sequences.entry(message.room_id).or_insert(0);
        *sequence += 1;
        message.sequence = *sequence;
        tables
            .messages
            .entry(message.room_id)
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn list_for_room(
        &self,
        room_id: RoomId,
        after_sequence: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Message>, RepositoryError> {
        let tables = self.tables.lock().await;
        let after = after_sequence.unwrap_or(0);
        Ok(tables
            .messages
            .get(&room_id)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| m.sequence > after)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl ConnectionRepository for MemoryStore {
    async fn find_by_id(&self, id: ConnectionId) -> Result<Option<Connection>, RepositoryError> {
        let tables = self.tables.lock().await;
        Ok(tables.connections.get(&id).cloned())
    }

    async fn find_by_pair(&self, pair: DevicePair) -> Result<Option<Connection>, RepositoryError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .connections
            .values()
            .find(|c| c.pair() == pair)
            .cloned())
    }

    async fn insert(&self, connection: Connection) -> Result<Connection, RepositoryError> {
        let mut tables = self.tables.lock().await;
        let pair = connection.pair();
        if tables.connections.contains_key(&connection.id)
            || tables.connections.values().any(|c| c.pair() == pair)
        {
            return Err(RepositoryError::Conflict);
        }
        tables.connections.insert(connection.id, connection.clone());
        Ok(connection)
    }

    async fn record_meeting(
        &self,
        id: ConnectionId,
        room_id: RoomId,
        now: Timestamp,
    ) -> Result<Option<Connection>, RepositoryError> {
        let mut tables = self.tables.lock().await;
        Ok(tables.connections.get_mut(&id).map(|connection| {
            connection.record_meeting(room_id, now);
            connection.clone()
        }))
    }

    async fn record_reconnect(
        &self,
        id: ConnectionId,
        room_id: RoomId,
        now: Timestamp,
    ) -> Result<Option<Connection>, RepositoryError> {
        let mut tables = self.tables.lock().await;
        Ok(tables.connections.get_mut(&id).map(|connection| {
            connection.record_reconnect(room_id, now);
            connection.clone()
        }))
    }

    async fn set_favorite(
        &self,
        id: ConnectionId,
        favorite: bool,
    ) -> Result<Option<Connection>, RepositoryError> {
        let mut tables = self.tables.lock().await;
        Ok(tables.connections.get_mut(&id).map(|connection| {
            connection.set_favorite(favorite);
            connection.clone()
        }))
    }

    async fn list_for_device(
        &self,
        device_id: DeviceId,
        limit: usize,
    ) -> Result<Vec<Connection>, RepositoryError> {
        let tables = self.tables.lock().await;
        let mut connections: Vec<Connection> = tables
            .connections
            .values()
            .filter(|c| c.pair().contains(device_id))
            .cloned()
            .collect();
        connections.sort_by(|a, b| b.last_connected.cmp(&a.last_connected));
        connections.truncate(limit);
        Ok(connections)
    }
}

/// 内存中的单条身份记录。
#[derive(Default)]
pub struct MemoryIdentityStorage {
    record: RwLock<Option<Identity>>,
}

#[async_trait]
impl IdentityStorage for MemoryIdentityStorage {
    async fn load(&self) -> Result<Option<Identity>, IdentityStorageError> {
        Ok(self.record.read().await.clone())
    }

    async fn save(&self, identity: &Identity) -> Result<(), IdentityStorageError> {
        *self.record.write().await = Some(identity.clone());
        Ok(())
    }
}
