use thiserror::Error;

/// Failures surfaced by the codec, the hub, and the decoder.
///
/// None of these are fatal to the process: recipient-selection and delivery
/// errors go back to the sender, `StreamEnded` is the client's reconnect
/// trigger, and `Transport` only ends the connection it happened on.
#[derive(Debug, Error)]
pub enum Error {
    /// Data and comment were both empty, so there is nothing to put on the wire.
    #[error("message has neither data nor comment")]
    InvalidMessage,

    #[error("zone '{0}' does not exist")]
    ZoneNotFound(String),

    #[error("zone '{0}' has no connections")]
    NoConnections(String),

    /// Unicast target is unknown or its mailbox is full.
    #[error("failed to deliver message to client '{0}'")]
    DeliveryFailed(String),

    /// The packet names neither a client id nor a broadcast.
    #[error("packet selects no recipients")]
    MissingTarget,

    #[error("could not allocate a unique client id after {0} attempts")]
    DuplicateClientId(usize),

    #[error("event stream ended: {reason}")]
    StreamEnded { reason: String },

    #[error("transport write failed: {0}")]
    Transport(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
