use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

#[allow(dead_code)]
const CHANNEL_CAPACITY: usize = 256;

/// Per-room broadcast hub. Every committed event is published to the
/// room's channel; the external notification surface subscribes here to
/// learn about displacements and cancellations.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a room. Creates the channel if needed.
    #[allow(dead_code)]
    pub fn subscribe(&self, room_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, room_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&room_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel (e.g. when the room is deregistered).
    pub fn remove(&self, room_id: &Ulid) {
        self.channels.remove(room_id);
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let room_id = Ulid::new();
        let mut rx = hub.subscribe(room_id);

        let event = Event::RoomCreated {
            id: room_id,
            number: "B204".into(),
        };
        hub.send(room_id, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let room_id = Ulid::new();
        // No subscriber — should not panic
        hub.send(room_id, &Event::RoomDeleted { id: room_id });
    }

    #[tokio::test]
    async fn removed_channel_stops_delivery() {
        let hub = NotifyHub::new();
        let room_id = Ulid::new();
        let mut rx = hub.subscribe(room_id);

        hub.remove(&room_id);
        hub.send(room_id, &Event::RoomDeleted { id: room_id });

        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Closed)
        ));
    }
}
