//! 领域事件定义
//!
//! 实时总线推送的行级变更事件。每个事件都携带变更后的完整行，
//! 消费方应整体替换本地状态，而不是当作增量处理。

pub mod change_event;

// 重新导出事件类型
pub use change_event::*;
