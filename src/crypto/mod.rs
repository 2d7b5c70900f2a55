//! Cryptographic primitives layer.
//!
//! Provides:
//! - the curve suite capability trait with its two implementations
//! - zeroizing key material containers
//! - HKDF/HMAC-SHA512 derivations and the AES-256-GCM AEAD

pub(crate) mod aead;
mod c255;
mod c448;
pub(crate) mod kdf;
mod keys;
mod suite;

pub use c255::C255;
pub use c448::C448;
pub use keys::{
    ChainKey, IdentityKeyPair, MessageKey, OneTimePreKey, RootKey, Secret, SharedAd, SignedPreKey,
};
pub use suite::{CurveId, CurveSuite};
