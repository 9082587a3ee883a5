use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{RoomId, Timestamp};

/// 一个房间最多容纳的参与者数量。
pub const ROOM_CAPACITY: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Waiting,
    Active,
    Ended,
}

impl RoomStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomStatus::Waiting => "waiting",
            RoomStatus::Active => "active",
            RoomStatus::Ended => "ended",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            RoomStatus::Waiting => 0,
            RoomStatus::Active => 1,
            RoomStatus::Ended => 2,
        }
    }

    /// 状态只允许向前推进。
    pub fn can_advance_to(&self, next: RoomStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoomStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(RoomStatus::Waiting),
            "active" => Ok(RoomStatus::Active),
            "ended" => Ok(RoomStatus::Ended),
            other => Err(DomainError::invalid_argument(
                "room_status",
                format!("unknown status {other}"),
            )),
        }
    }
}

/// 两人匿名聊天的配对单元。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub status: RoomStatus,
    pub participant_count: u8,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: Timestamp,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: Timestamp,
}

impl Room {
    /// 第一个参与者创建房间：waiting / 1。
    pub fn new_waiting(id: RoomId, created_at: Timestamp) -> Self {
        Self {
            id,
            status: RoomStatus::Waiting,
            participant_count: 1,
            created_at,
            updated_at: created_at,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status != RoomStatus::Ended
    }

    pub fn is_claimable(&self) -> bool {
        self.status == RoomStatus::Waiting && self.participant_count == 1
    }

    /// 第二个参与者认领房间：waiting / 1 → active / 2。
    pub fn activate(&mut self, now: Timestamp) -> Result<(), DomainError> {
        if self.participant_count >= ROOM_CAPACITY {
            return Err(DomainError::RoomFull(self.id));
        }
        self.advance(RoomStatus::Active, now)?;
        self.participant_count = ROOM_CAPACITY;
        Ok(())
    }

    /// 所有参与者离线后结束房间，结束后不可复用。
    pub fn end(&mut self, now: Timestamp) -> Result<(), DomainError> {
        self.advance(RoomStatus::Ended, now)
    }

    fn advance(&mut self, next: RoomStatus, now: Timestamp) -> Result<(), DomainError> {
        if !self.status.can_advance_to(next) {
            return Err(DomainError::InvalidRoomTransition {
                room_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}
