//! 基础设施层实现。
//!
//! 提供 PostgreSQL 仓储、数据库迁移、设备身份文件等适配器，实现应用层定义的接口，
//! 并按配置完成装配。

pub mod builder;
pub mod identity_file;
pub mod migrations;
pub mod repository;

pub use builder::{Infrastructure, InfrastructureError};
pub use identity_file::FileIdentityStorage;
pub use migrations::MIGRATOR;
pub use repository::{
    create_pg_pool, PgConnectionRepository, PgMessageRepository, PgParticipantRepository,
    PgRoomRepository, PgStorage,
};
