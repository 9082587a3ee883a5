use std::sync::Arc;

use application::{CoreDependencies, LocalRealtimeBus, MemoryStore, SystemClock};
use config::{AppConfig, StorageBackend};
use sqlx::PgPool;
use thiserror::Error;

use crate::{
    migrations::MIGRATOR,
    repository::{create_pg_pool, PgStorage},
};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// 按配置装配好的存储和实时总线。
#[derive(Clone)]
pub struct Infrastructure {
    pub deps: CoreDependencies,
    pub bus: Arc<LocalRealtimeBus>,
    pub pool: Option<PgPool>,
}

impl Infrastructure {
    pub async fn connect(config: &AppConfig) -> Result<Self, InfrastructureError> {
        match config.storage {
            StorageBackend::Memory => Ok(Self::in_memory(config)),
            StorageBackend::Postgres => {
                let pool =
                    create_pg_pool(&config.database.url, config.database.max_connections).await?;
                MIGRATOR.run(&pool).await?;
                tracing::info!("PostgreSQL 连接池就绪，迁移已执行");

                let storage = PgStorage::new(pool.clone());
                let bus = Arc::new(LocalRealtimeBus::new(config.realtime.channel_capacity));
                let deps = CoreDependencies {
                    rooms: storage.room_repository.clone(),
                    participants: storage.participant_repository.clone(),
                    messages: storage.message_repository.clone(),
                    connections: storage.connection_repository.clone(),
                    bus: bus.clone(),
                    clock: Arc::new(SystemClock),
                };
                Ok(Self {
                    deps,
                    bus,
                    pool: Some(pool),
                })
            }
        }
    }

    /// 进程内存储，重启后数据丢失。
    pub fn in_memory(config: &AppConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(LocalRealtimeBus::new(config.realtime.channel_capacity));
        let deps = CoreDependencies {
            rooms: store.clone(),
            participants: store.clone(),
            messages: store.clone(),
            connections: store,
            bus: bus.clone(),
            clock: Arc::new(SystemClock),
        };
        Self {
            deps,
            bus,
            pool: None,
        }
    }
}
