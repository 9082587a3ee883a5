//! 领域模型错误定义
//!
//! 定义了领域层与仓储层可能出现的错误类型。

use thiserror::Error;

use crate::value_objects::RoomId;
use crate::RoomStatus;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// 参数校验失败
    #[error("invalid argument {field}: {reason}")]
    InvalidArgument { field: String, reason: String },

    /// 房间状态只能 waiting → active → ended 单调推进
    #[error("room {room_id} cannot move from {from} to {to}")]
    InvalidRoomTransition {
        room_id: RoomId,
        from: RoomStatus,
        to: RoomStatus,
    },

    /// 房间已满（两人上限）
    #[error("room {0} is full")]
    RoomFull(RoomId),

    /// 同一设备不能和自己配对
    #[error("a device cannot pair with itself")]
    SelfPairing,
}

impl DomainError {
    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;

/// 仓储层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("record not found")]
    NotFound,
    #[error("record already exists")]
    Conflict,
    #[error("storage error: {message}")]
    Storage { message: String },
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}
