//! The producer-side bridge to the item distributor.

use crate::itemproto::{ItemId, FINAL_ITEM_ID};
use crate::socket::{frame_as_str, PairSocket};

/// Sends work items into the distributor and collects completions.
pub struct ItemProducer {
    socket: PairSocket,
}

impl ItemProducer {
    /// Wraps the producer side of the distributor's pair socket.
    pub fn new(socket: PairSocket) -> Self {
        Self { socket }
    }

    /// Publishes a work item, optionally with a binary payload.
    ///
    /// Returns false if the distributor is gone.
    pub fn send_work_item(&self, id: ItemId, payload: &[u8]) -> bool {
        let mut message = vec![id.to_string().into_bytes()];
        if !payload.is_empty() {
            message.push(payload.to_vec());
        }
        self.socket.send(message).is_ok()
    }

    /// Publishes the end-of-stream sentinel.
    pub fn send_end_of_stream(&self) -> bool {
        self.send_work_item(FINAL_ITEM_ID, &[])
    }

    /// Retrieves one completion if available.
    pub fn try_receive_completion(&self) -> Option<ItemId> {
        let message = self.socket.try_recv()?;
        frame_as_str(message.first()?).parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::pair;

    #[test]
    fn test_work_item_framing() {
        let (producer_side, distributor_side) = pair();
        let producer = ItemProducer::new(producer_side);

        assert!(producer.send_work_item(42, b""));
        let message = distributor_side.recv().unwrap();
        assert_eq!(message.len(), 1);
        assert_eq!(frame_as_str(&message[0]), "42");

        assert!(producer.send_work_item(43, b"payload"));
        let message = distributor_side.recv().unwrap();
        assert_eq!(message.len(), 2);
        assert_eq!(&message[1], b"payload");
    }

    #[test]
    fn test_completion_parsing() {
        let (producer_side, distributor_side) = pair();
        let producer = ItemProducer::new(producer_side);

        assert!(producer.try_receive_completion().is_none());
        distributor_side.send(vec![b"7".to_vec()]).unwrap();
        assert_eq!(producer.try_receive_completion(), Some(7));
    }
}
