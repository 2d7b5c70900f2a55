//! quietwire: end-to-end encryption core for asynchronous messaging.
//!
//! Implements X3DH key agreement over published pre-key bundles and
//! per-peer Double Ratchet sessions with bounded out-of-order tolerance,
//! behind a session orchestrator that queues work across bundle fetches and
//! pins peer identities on first contact.
//!
//! The crate performs no I/O. The [`engine::Engine`] consumes and produces
//! byte blobs; persistence and the key-server transport are traits the host
//! implements. Two curve suites are available ([`crypto::C255`],
//! [`crypto::C448`]); a session is bound to one suite at creation and the
//! suites never interoperate.

pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod x3dh;

mod ratchet;

pub use config::Config;
pub use crypto::{C255, C448, CurveId, CurveSuite, IdentityKeyPair, OneTimePreKey, SignedPreKey};
pub use engine::{EncryptOutcome, Engine, EngineEvent, ServerRequest};
pub use error::{Error, Result};
pub use protocol::{ErrorCode, MessageType, PeerBundle};
pub use session::Session;
pub use storage::{MemoryStore, PeerStatus, SessionSlot, Storage};
