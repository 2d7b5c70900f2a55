//! Key material containers.
//!
//! Every secret is a fixed-size byte container that wipes itself on drop,
//! compares in constant time and never prints its value. Roles are carried
//! in the type: a chain key cannot be handed to code expecting a root key
//! even though both are 32 bytes.

use std::fmt;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::ZeroizeOnDrop;

use crate::crypto::suite::CurveSuite;
use crate::error::Result;

/// Fixed-size sensitive byte container.
///
/// Zeroizes on drop, hides its value from `Debug` and compares in constant
/// time. Construction and access stay inside the crate.
#[derive(Clone, Eq, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct Secret<const N: usize>(#[serde(with = "serde_bytes")] [u8; N]);

impl<const N: usize> Secret<N> {
    pub(crate) fn from_bytes(bytes: [u8; N]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }
}

impl<const N: usize> PartialEq for Secret<N> {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl<const N: usize> fmt::Debug for Secret<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret").field("value", &"***").finish()
    }
}

macro_rules! key_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $name(Secret<32>);

        impl $name {
            pub(crate) fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(Secret::from_bytes(bytes))
            }

            pub(crate) fn as_bytes(&self) -> &[u8; 32] {
                self.0.as_bytes()
            }
        }
    };
}

key_newtype! {
    /// Root key of a Double Ratchet session, advanced on each DH ratchet.
    RootKey
}
key_newtype! {
    /// Sending or receiving chain key, advanced once per message.
    ChainKey
}
key_newtype! {
    /// Single-use message key derived from a chain key.
    MessageKey
}
key_newtype! {
    /// Associated data shared by both ends, derived once at establishment.
    SharedAd
}

/// Long-lived identity key pair. The signing half publishes and signs
/// pre-keys; the deterministic DH conversion lets it participate in X3DH
/// without a second key.
#[derive(Clone)]
pub struct IdentityKeyPair<C: CurveSuite> {
    secret: C::SigningSecret,
    public: C::SigningPublic,
}

impl<C: CurveSuite> IdentityKeyPair<C> {
    pub fn generate() -> Self {
        let (secret, public) = C::generate_signing();
        Self { secret, public }
    }

    pub fn public(&self) -> &C::SigningPublic {
        &self.public
    }

    pub fn sign(&self, message: &[u8]) -> C::Signature {
        C::sign(&self.secret, message)
    }

    pub(crate) fn dh_secret(&self) -> C::DhSecret {
        C::signing_to_dh_secret(&self.secret)
    }

    pub(crate) fn dh_public(&self) -> Result<C::DhPublic> {
        C::signing_to_dh_public(&self.public)
    }

    pub(crate) fn secret_bytes(&self) -> zeroize::Zeroizing<Vec<u8>> {
        C::signing_secret_bytes(&self.secret)
    }

    pub(crate) fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let secret = C::signing_secret_from_bytes(bytes)?;
        let public = C::signing_public_of(&secret);
        Ok(Self { secret, public })
    }
}

/// Medium-lived DH pre-key signed by the identity key. Rotated on a
/// schedule; superseded keys are retained for a grace period to accept late
/// session inits, then erased.
#[derive(Clone)]
pub struct SignedPreKey<C: CurveSuite> {
    pub id: u32,
    secret: C::DhSecret,
    public: C::DhPublic,
    signature: C::Signature,
    pub created_at_ms: u64,
}

impl<C: CurveSuite> SignedPreKey<C> {
    /// Generate a pre-key and sign its public bytes with the identity key.
    pub fn generate(id: u32, identity: &IdentityKeyPair<C>, now_ms: u64) -> Self {
        let (secret, public) = C::generate_dh();
        let signature = identity.sign(&C::dh_public_bytes(&public));
        Self {
            id,
            secret,
            public,
            signature,
            created_at_ms: now_ms,
        }
    }

    pub fn public(&self) -> &C::DhPublic {
        &self.public
    }

    pub fn signature(&self) -> &C::Signature {
        &self.signature
    }

    pub(crate) fn secret(&self) -> &C::DhSecret {
        &self.secret
    }

    pub(crate) fn from_parts(
        id: u32,
        secret: C::DhSecret,
        public: C::DhPublic,
        signature: C::Signature,
        created_at_ms: u64,
    ) -> Self {
        Self {
            id,
            secret,
            public,
            signature,
            created_at_ms,
        }
    }
}

/// Single-use DH pre-key, erased on first successful use as session
/// initiator material.
#[derive(Clone)]
pub struct OneTimePreKey<C: CurveSuite> {
    pub id: u32,
    secret: C::DhSecret,
    public: C::DhPublic,
}

impl<C: CurveSuite> OneTimePreKey<C> {
    pub fn generate(id: u32) -> Self {
        let (secret, public) = C::generate_dh();
        Self { id, secret, public }
    }

    pub fn public(&self) -> &C::DhPublic {
        &self.public
    }

    pub(crate) fn secret(&self) -> &C::DhSecret {
        &self.secret
    }

    pub(crate) fn from_parts(id: u32, secret: C::DhSecret, public: C::DhPublic) -> Self {
        Self { id, secret, public }
    }
}
