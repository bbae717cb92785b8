/// Errors that can occur when posting, receiving or managing ports.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    /// A transfer-list entry cannot be transferred in its current state.
    #[error("object is not transferable: {0}")]
    NotTransferable(String),

    /// A transfer-list entry is not an `ArrayBuffer` or a `MessagePort`, or is a
    /// port that may not be moved through this channel.
    #[error("invalid transfer list entry at index {index}: {reason}")]
    InvalidTransferEntry { index: usize, reason: String },

    /// The value references a port that is missing from the transfer list.
    #[error("MessagePort was found in message but not listed in transferList")]
    PortNotInTransferList,

    /// A moved mailbox could not be bound to a new port on the receiving side.
    #[error("failed to attach transferred port {index}: {source}")]
    PortAttachFailed {
        index: usize,
        #[source]
        source: Box<PortError>,
    },

    /// The message payload could not be decoded.
    #[error("failed to decode message: {0}")]
    Decode(String),

    /// The port is closed or its mailbox has been moved elsewhere.
    #[error("port is closed")]
    PortClosed,

    /// A runtime entry point was invoked without its required arguments.
    #[error("missing arguments: {0}")]
    MissingArguments(&'static str),

    /// The value graph cannot be cloned.
    #[error("could not clone value: {0}")]
    DataClone(String),

    /// The encoded payload exceeds the configured maximum.
    #[error("serialized payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// `reattach` was called on a port that still owns a mailbox.
    #[error("port already has a mailbox attached")]
    AlreadyAttached,

    /// The owning context no longer accepts new ports.
    #[error("context is shutting down")]
    ContextShutdown,

    /// The consumer callback reported a failure.
    #[error("message callback failed: {0}")]
    Callback(#[from] CallbackError),

    /// A worker thread could not be started.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// A worker thread could not bind its end of the channel.
    #[error("worker '{name}' failed to start: {reason}")]
    WorkerSetup { name: String, reason: String },

    /// A worker thread panicked before it could be joined.
    #[error("worker thread '{0}' panicked")]
    WorkerPanicked(String),

    /// A runtime entry point name is not recognised.
    #[error("unknown port method: {0}")]
    UnknownMethod(String),

    /// Event-loop level error.
    #[error("event loop error: {0}")]
    Loop(#[from] msgport_loop::LoopError),
}

/// Failure reported by a message callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct CallbackError(pub String);

impl CallbackError {
    /// Create a callback error from any displayable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type Result<T> = std::result::Result<T, PortError>;
