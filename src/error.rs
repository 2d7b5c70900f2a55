//! Crate-wide error taxonomy.
//!
//! Every fallible operation in the engine returns one of these variants so
//! callers can distinguish protocol failures from transport and storage
//! failures. Variants never carry key material or plaintext.

/// Errors surfaced by session establishment, the ratchet and the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A DH public key decoded to a low-order or identity point, or a DH
    /// computation produced a non-contributory output.
    #[error("invalid DH key")]
    InvalidKey,

    /// The signed pre-key signature did not verify under the peer identity.
    #[error("pre-key signature verification failed")]
    SignatureInvalid,

    /// A session init referenced an SPK or OPK id not present locally.
    #[error("unknown pre-key id {0}")]
    UnknownPreKey(u32),

    /// AEAD tag mismatch; the message or its header was altered.
    #[error("message authentication failed")]
    AuthenticationFailed,

    /// Message counter is behind the receiving chain with no cached key.
    #[error("message replayed or delivered too late")]
    OutOfOrderOrReplay,

    /// Accepting the message would exceed the skipped-key limits.
    #[error("too many skipped messages")]
    TooManySkipped,

    /// The sender's identity key differs from the one pinned for its device.
    #[error("peer identity key mismatch for device {device_id}")]
    PeerIdentityMismatch { device_id: String },

    /// Malformed wire data: truncation, unknown type byte, bad version or a
    /// curve id that does not match the session suite.
    #[error("protocol format error: {0}")]
    ProtocolFormat(&'static str),

    /// The key server returned a failure or the transport gave up.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The persistence layer failed; the operation was rolled back.
    #[error("storage error: {0}")]
    Storage(String),

    /// A queued operation was abandoned because its bundle fetch was
    /// cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
