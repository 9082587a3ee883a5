//! 实时变更总线
//!
//! 核心组件通过 [`RealtimeBus`] 发布行级变更，客户端按过滤条件订阅。
//! 订阅以显式句柄表示：丢弃 [`Subscription`] 或调用 [`SubscriptionHandle::cancel`] 即退订。

use async_trait::async_trait;
use domain::{ChangeEvent, ChangeFilter, Message, Participant, Room, RowChange};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("publish failed: {0}")]
    Publish(String),
}

impl BusError {
    pub fn publish(message: impl Into<String>) -> Self {
        Self::Publish(message.into())
    }
}

#[async_trait]
pub trait RealtimeBus: Send + Sync {
    /// 没有订阅者时发布不算错误
    async fn publish(&self, event: ChangeEvent) -> Result<(), BusError>;

    fn subscribe(&self, filter: ChangeFilter) -> Subscription;
}

/// 一个按过滤条件筛选的订阅。
pub struct Subscription {
    filter: ChangeFilter,
    receiver: broadcast::Receiver<ChangeEvent>,
    lagged: u64,
}

impl Subscription {
    pub fn new(filter: ChangeFilter, receiver: broadcast::Receiver<ChangeEvent>) -> Self {
        Self {
            filter,
            receiver,
            lagged: 0,
        }
    }

    pub fn filter(&self) -> ChangeFilter {
        self.filter
    }

    /// 因消费过慢被丢弃的事件数
    pub fn lagged(&self) -> u64 {
        self.lagged
    }

    /// 等待下一条匹配的事件；总线关闭时返回 `None`。
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// 非阻塞地取出下一条已到达的匹配事件。
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    fn record_lag(&mut self, skipped: u64) {
        self.lagged += skipped;
        tracing::warn!(
            room_id = %self.filter.room_id(),
            skipped,
            "订阅者消费过慢，部分变更事件被丢弃"
        );
    }

    /// 把事件转交给类型化的处理器，返回可取消的句柄。
    pub fn dispatch<H>(mut self, mut handler: H) -> SubscriptionHandle
    where
        H: ChangeHandler,
    {
        let task = tokio::spawn(async move {
            while let Some(event) = self.recv().await {
                handler.handle(event);
            }
        });
        SubscriptionHandle { task }
    }

    pub fn cancel(self) {
        drop(self);
    }
}

/// 类型化的变更处理器，按需覆盖感兴趣的回调。
pub trait ChangeHandler: Send + 'static {
    fn on_room_changed(&mut self, _room: Room) {}

    fn on_participant_changed(&mut self, _change: RowChange, _participant: Participant) {}

    fn on_message_inserted(&mut self, _message: Message) {}

    fn handle(&mut self, event: ChangeEvent) {
        match event {
            ChangeEvent::RoomChanged { room } => self.on_room_changed(room),
            ChangeEvent::ParticipantChanged {
                change,
                participant,
            } => self.on_participant_changed(change, participant),
            ChangeEvent::MessageInserted { message } => self.on_message_inserted(message),
        }
    }
}

/// `dispatch` 启动的转发任务句柄，取消或丢弃即停止投递。
pub struct SubscriptionHandle {
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn cancel(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
