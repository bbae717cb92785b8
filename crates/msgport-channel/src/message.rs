use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::buffer::SharedMemory;
use crate::mailbox::Mailbox;
use crate::port::MessagePort;
use crate::value::Value;

/// A serialized value in transit between two ports.
///
/// Holds the encoded payload plus three side-tables, each indexed by the ids
/// embedded in the payload:
/// - contents of transferred exclusive buffers
/// - mailboxes of transferred ports
/// - shared memory regions referenced by the value
///
/// A message is built by [`serialize`](crate::codec::serialize) and consumed
/// exactly once by [`deserialize`](crate::codec::deserialize).
pub struct Message {
    payload: Bytes,
    buffers: Vec<Vec<u8>>,
    ports: Vec<Arc<Mailbox>>,
    shared: Vec<Arc<SharedMemory>>,
}

pub(crate) type MessageParts = (
    Bytes,
    Vec<Vec<u8>>,
    Vec<Arc<Mailbox>>,
    Vec<Arc<SharedMemory>>,
);

impl Message {
    pub(crate) fn new(
        payload: Bytes,
        buffers: Vec<Vec<u8>>,
        ports: Vec<Arc<Mailbox>>,
        shared: Vec<Arc<SharedMemory>>,
    ) -> Self {
        Self {
            payload,
            buffers,
            ports,
            shared,
        }
    }

    /// The encoded value.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Number of buffers whose contents moved with the message.
    pub fn transferred_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Number of mailboxes moved with the message.
    pub fn transferred_ports(&self) -> usize {
        self.ports.len()
    }

    /// Number of distinct shared regions the message aliases.
    pub fn shared_regions(&self) -> usize {
        self.shared.len()
    }

    /// Payload plus transferred buffer bytes.
    pub fn byte_size(&self) -> usize {
        self.payload.len() + self.buffers.iter().map(Vec::len).sum::<usize>()
    }

    pub(crate) fn into_parts(self) -> MessageParts {
        (self.payload, self.buffers, self.ports, self.shared)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("payload_len", &self.payload.len())
            .field("buffers", &self.buffers.len())
            .field("ports", &self.ports.len())
            .field("shared", &self.shared.len())
            .finish()
    }
}

/// A delivered message.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    /// The reconstructed value.
    pub data: Value,
    /// Ports that arrived with the message, in transfer-list order.
    pub ports: Vec<MessagePort>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}

    #[test]
    fn message_is_send() {
        assert_send::<Message>();
    }

    #[test]
    fn byte_size_counts_buffers() {
        let message = Message::new(
            Bytes::from_static(b"abcd"),
            vec![vec![0; 10], vec![0; 6]],
            Vec::new(),
            Vec::new(),
        );
        assert_eq!(message.byte_size(), 20);
        assert_eq!(message.transferred_buffers(), 2);
    }
}
