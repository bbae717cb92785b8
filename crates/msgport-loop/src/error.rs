/// Errors that can occur when talking to an event loop.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    /// The loop owning the handle has been dropped.
    #[error("event loop {0} is gone")]
    LoopGone(u64),

    /// The handle was closed before the operation.
    #[error("async handle {0} is closed")]
    HandleClosed(u64),
}

pub type Result<T> = std::result::Result<T, LoopError>;
