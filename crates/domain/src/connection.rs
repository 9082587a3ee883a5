use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{ConnectionId, DeviceId, RoomId, Timestamp};

/// 无序设备对，内部按大小归一化，(a, b) 与 (b, a) 相等。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DevicePair {
    first: DeviceId,
    second: DeviceId,
}

impl DevicePair {
    pub fn new(a: DeviceId, b: DeviceId) -> Result<Self, DomainError> {
        if a == b {
            return Err(DomainError::SelfPairing);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        Ok(Self { first, second })
    }

    pub fn first(&self) -> DeviceId {
        self.first
    }

    pub fn second(&self) -> DeviceId {
        self.second
    }

    pub fn contains(&self, device_id: DeviceId) -> bool {
        self.first == device_id || self.second == device_id
    }

    /// 返回另一方设备。
    pub fn other(&self, device_id: DeviceId) -> Option<DeviceId> {
        if device_id == self.first {
            Some(self.second)
        } else if device_id == self.second {
            Some(self.first)
        } else {
            None
        }
    }
}

/// 两台设备之间的历史连接记录，每个无序设备对只有一条。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub user1_device_id: DeviceId,
    pub user2_device_id: DeviceId,
    pub room_id: RoomId,
    #[serde(with = "time::serde::rfc3339")]
    pub last_connected: Timestamp,
    pub connection_count: u32,
    pub is_favorite: bool,
}

impl Connection {
    pub fn new(id: ConnectionId, pair: DevicePair, room_id: RoomId, now: Timestamp) -> Self {
        Self {
            id,
            user1_device_id: pair.first(),
            user2_device_id: pair.second(),
            room_id,
            last_connected: now,
            connection_count: 1,
            is_favorite: false,
        }
    }

    pub fn pair(&self) -> DevicePair {
        // 构造时已归一化且两端不同
        DevicePair {
            first: self.user1_device_id,
            second: self.user2_device_id,
        }
    }

    /// 刷新最近连接时间，只前进不后退。
    pub fn touch(&mut self, now: Timestamp) {
        if now > self.last_connected {
            self.last_connected = now;
        }
    }

    /// 重新连接（或在新房间再次相遇）一次。
    pub fn record_reconnect(&mut self, room_id: RoomId, now: Timestamp) {
        self.connection_count = self.connection_count.saturating_add(1);
        self.room_id = room_id;
        self.touch(now);
    }

    /// 离开房间时记一次相遇：同一房间只刷新时间，新房间计为再次连接。
    pub fn record_meeting(&mut self, room_id: RoomId, now: Timestamp) {
        if self.room_id == room_id {
            self.touch(now);
        } else {
            self.record_reconnect(room_id, now);
        }
    }

    pub fn set_favorite(&mut self, favorite: bool) {
        self.is_favorite = favorite;
    }
}
