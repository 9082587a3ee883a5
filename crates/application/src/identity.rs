//! 设备身份存储
//!
//! 身份在设备首次启动时生成并写入设备本地的键值存储，之后每次启动读取，永不过期。
//! 身份作为显式的值传入各个核心组件，不存在全局单例。

use std::sync::Arc;

use async_trait::async_trait;
use domain::Identity;
use thiserror::Error;

use crate::clock::Clock;

#[derive(Debug, Error)]
pub enum IdentityStorageError {
    #[error("identity storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity record is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// 设备本地的键值存储，只保存一条身份记录。
#[async_trait]
pub trait IdentityStorage: Send + Sync {
    async fn load(&self) -> Result<Option<Identity>, IdentityStorageError>;
    async fn save(&self, identity: &Identity) -> Result<(), IdentityStorageError>;
}

pub struct IdentityStore {
    storage: Arc<dyn IdentityStorage>,
    clock: Arc<dyn Clock>,
}

impl IdentityStore {
    pub fn new(storage: Arc<dyn IdentityStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// 读取已有身份；首次启动时生成并持久化。
    pub async fn load_or_create(&self) -> Result<Identity, IdentityStorageError> {
        let now = self.clock.now();
        if let Some(mut identity) = self.storage.load().await? {
            identity.touch(now);
            self.storage.save(&identity).await?;
            return Ok(identity);
        }

        let identity = Identity::generate(&mut rand::rng(), now);
        self.storage.save(&identity).await?;
        tracing::info!(device_id = %identity.device_id, "生成新的设备身份");
        Ok(identity)
    }

    pub async fn touch(&self, identity: &mut Identity) -> Result<(), IdentityStorageError> {
        identity.touch(self.clock.now());
        self.storage.save(identity).await
    }

    pub async fn regenerate_display_name(
        &self,
        identity: &mut Identity,
    ) -> Result<(), IdentityStorageError> {
        identity.regenerate_display_name(&mut rand::rng());
        self.storage.save(identity).await
    }
}
