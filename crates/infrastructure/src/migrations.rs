use sqlx::migrate::Migrator;

/// 工作区根目录下 `migrations/` 中的迁移脚本，编译期嵌入。
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");
