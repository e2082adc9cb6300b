use thiserror::Error;

/// # SystemError
///
/// Errors surfaced by the dispatcher's public entry points.
///
/// Posting to a missing, dying or shut-down object is not an error; those
/// posts are reported through the `bool` returned by `post_message` or by
/// running the cancellation callback of a delayed post.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SystemError {
    /// The command loop has stopped and can no longer accept commands
    #[error("Dispatcher has stopped")]
    Stopped,

    /// A blocking call was made from the dispatcher thread, which would wait on itself
    #[error("Blocking call on the dispatcher thread would deadlock")]
    Reentrant,

    /// Configuration rejected before start
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An OS thread could not be started
    #[error("Failed to spawn thread: {0}")]
    Spawn(String),
}

impl From<std::io::Error> for SystemError {
    fn from(error: std::io::Error) -> Self {
        Self::Spawn(error.to_string())
    }
}
