use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum EventBusError {
    #[error("invalid channel: {0}")]
    InvalidChannel(String),

    #[error("invalid subscription pattern: {0}")]
    InvalidPattern(String),

    #[error("event channel closed")]
    ChannelClosed,

    #[error("subscriber lagged: {0} events missed")]
    Lagged(u64),
}
