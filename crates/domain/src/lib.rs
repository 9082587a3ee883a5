//! 匿名聊天核心领域模型
//!
//! 包含设备身份、房间、参与者、消息、历史连接等实体，
//! 以及房间状态机和实时变更事件。

pub mod connection;
pub mod errors;
pub mod events;
pub mod identity;
pub mod message;
pub mod participant;
pub mod room;
pub mod value_objects;

// 重新导出常用类型
pub use connection::{Connection, DevicePair};
pub use errors::{DomainError, DomainResult, RepositoryError};
pub use events::{ChangeEvent, ChangeFilter, RowChange};
pub use identity::Identity;
pub use message::{Attachment, MediaKind, Message, MessageDraft, MessagePayload, MessageType};
pub use participant::{Participant, PartnerInfo};
pub use room::{Room, RoomStatus, ROOM_CAPACITY};
pub use value_objects::*;
