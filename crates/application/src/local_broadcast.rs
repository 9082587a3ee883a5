// 进程内的实时总线实现
use async_trait::async_trait;
use domain::{ChangeEvent, ChangeFilter};
use tokio::sync::broadcast;

use crate::realtime::{BusError, RealtimeBus, Subscription};

#[derive(Clone)]
pub struct LocalRealtimeBus {
    sender: broadcast::Sender<ChangeEvent>,
}

impl LocalRealtimeBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalRealtimeBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl RealtimeBus for LocalRealtimeBus {
    async fn publish(&self, event: ChangeEvent) -> Result<(), BusError> {
        if self.sender.receiver_count() == 0 {
            return Ok(());
        }
        self.sender
            .send(event)
            .map_err(|err| BusError::publish(err.to_string()))?;
        Ok(())
    }

    fn subscribe(&self, filter: ChangeFilter) -> Subscription {
        Subscription::new(filter, self.sender.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::ChangeHandler;
    use domain::{Room, RoomId};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use time::OffsetDateTime;

    fn room_event(room_id: RoomId) -> ChangeEvent {
        let room = Room::new_waiting(room_id, OffsetDateTime::now_utc());
        ChangeEvent::RoomChanged { room }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = LocalRealtimeBus::new(8);
        assert!(bus.publish(room_event(RoomId::random())).await.is_ok());
    }

    #[tokio::test]
    async fn subscription_only_sees_its_room() {
        let bus = LocalRealtimeBus::new(8);
        let mine = RoomId::random();
        let mut subscription = bus.subscribe(ChangeFilter::Room(mine));

        bus.publish(room_event(RoomId::random())).await.unwrap();
        bus.publish(room_event(mine)).await.unwrap();

        let event = subscription.recv().await.unwrap();
        assert_eq!(event.room_id(), mine);
        assert!(subscription.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropped_subscription_unsubscribes() {
        let bus = LocalRealtimeBus::new(8);
        let subscription = bus.subscribe(ChangeFilter::AnyInRoom(RoomId::random()));
        assert_eq!(bus.subscriber_count(), 1);
        subscription.cancel();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_records_lag() {
        let bus = LocalRealtimeBus::new(2);
        let room_id = RoomId::random();
        let mut subscription = bus.subscribe(ChangeFilter::Room(room_id));
        for _ in 0..5 {
            bus.publish(room_event(room_id)).await.unwrap();
        }
        assert!(subscription.recv().await.is_some());
        assert_eq!(subscription.lagged(), 3);
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<RoomId>>>);

    impl ChangeHandler for Recorder {
        fn on_room_changed(&mut self, room: Room) {
            self.0.lock().unwrap().push(room.id);
        }
    }

    #[tokio::test]
    async fn dispatch_forwards_until_cancelled() {
        let bus = LocalRealtimeBus::new(8);
        let room_id = RoomId::random();
        let recorder = Recorder::default();
        let handle = bus
            .subscribe(ChangeFilter::Room(room_id))
            .dispatch(recorder.clone());

        bus.publish(room_event(room_id)).await.unwrap();
        for _ in 0..50 {
            if !recorder.0.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorder.0.lock().unwrap().as_slice(), &[room_id]);

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.subscriber_count(), 0);
    }
}
