use thiserror::Error;

/// Error returned by a `RemoteClient` transport call that is not a send attempt.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection timed out")]
    Timeout,
    #[error("not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Other(String),
}

/// Classification of a `send_message` failure, dispatched on by the scheduler.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("flood wait: {0}s")]
    FloodWait(u64),
    #[error("channel is private")]
    ChannelPrivate,
    #[error("user banned in channel")]
    UserBanned,
    #[error("chat write forbidden")]
    ChatWriteForbidden,
    #[error("send failed: {0}")]
    Other(String),
}

/// Account-permanent failures that must evict the mobile from the registry and
/// mark the backing account expired.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PermanentFailure {
    #[error("user deactivated")]
    UserDeactivated,
    #[error("auth key unregistered")]
    AuthKeyUnregistered,
    #[error("session revoked")]
    SessionRevoked,
    #[error("phone banned")]
    PhoneBanned,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("registry: connection limit reached ({0} connections)")]
    LimitReached(usize),

    #[error("registry: account not found: {0}")]
    AccountNotFound(String),

    #[error("registry: account permanently failed: {0}")]
    Permanent(#[from] PermanentFailure),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("send error: {0}")]
    Send(#[from] SendError),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("notification error: {0}")]
    Notification(String),

    #[error("invariant violation: {0}")]
    Invariant(String),
}
