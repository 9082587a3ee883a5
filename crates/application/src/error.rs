use domain::{DomainError, RepositoryError, RoomId};
use thiserror::Error;

use crate::identity::IdentityStorageError;
use crate::realtime::BusError;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    /// 重连目标房间不存在或已结束，直接反馈给用户，不自动重试
    #[error("room {0} is no longer available")]
    RoomUnavailable(RoomId),
    /// 认领等待中的房间时被并发抢先
    #[error("room {0} was claimed concurrently")]
    ClaimConflict(RoomId),
    /// 存储访问失败（网络/服务异常），由用户手动重试
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("repository error: {0}")]
    Repository(RepositoryError),
    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: String },
    #[error("realtime error: {0}")]
    Realtime(#[from] BusError),
    #[error("identity error: {0}")]
    Identity(#[from] IdentityStorageError),
}

impl ApplicationError {
    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        ApplicationError::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    /// 瞬时故障：界面给出非阻塞提示，用户可手动重试。
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApplicationError::StoreUnavailable(_)
                | ApplicationError::ClaimConflict(_)
                | ApplicationError::Realtime(_)
        )
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Storage { message } => ApplicationError::StoreUnavailable(message),
            other => ApplicationError::Repository(other),
        }
    }
}
