use crate::context::Context;
use crate::error::Result;
use crate::mailbox::Mailbox;
use crate::port::MessagePort;

/// Two entangled ports.
#[derive(Debug)]
pub struct MessageChannel {
    pub port1: MessagePort,
    pub port2: MessagePort,
}

impl MessageChannel {
    /// Create two entangled ports bound to `context`.
    pub fn new(context: &Context) -> Result<Self> {
        let (port1, port2) = create_channel(context)?;
        Ok(Self { port1, port2 })
    }

    /// Split into `(port1, port2)`.
    pub fn into_ports(self) -> (MessagePort, MessagePort) {
        (self.port1, self.port2)
    }
}

/// Create two ports whose mailboxes are entangled with each other.
pub fn create_channel(context: &Context) -> Result<(MessagePort, MessagePort)> {
    let (a, b) = Mailbox::pair();
    let port1 = MessagePort::with_mailbox(context, a)?;
    let port2 = MessagePort::with_mailbox(context, b)?;
    Ok((port1, port2))
}
