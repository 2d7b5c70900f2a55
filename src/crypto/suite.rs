//! Curve suite capability trait.
//!
//! A session is bound to one suite at creation and every key inside it
//! belongs to that suite. The two suites never interoperate: parsers check
//! the wire curve byte against the session suite and reject mismatches.

use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Wire identifier of a curve suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum CurveId {
    /// X25519 key exchange with Ed25519 signatures.
    C255 = 0x01,
    /// X448 key exchange with Ed448 signatures.
    C448 = 0x02,
}

impl CurveId {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(CurveId::C255),
            0x02 => Ok(CurveId::C448),
            _ => Err(Error::ProtocolFormat("unknown curve id")),
        }
    }
}

/// Uniform interface over one elliptic-curve suite: DH key exchange, EdDSA
/// signatures and the deterministic signing-to-DH key conversion that lets
/// an identity key play both roles.
///
/// Byte encodings are part of the trait so wire codecs and storage records
/// stay generic over the suite.
pub trait CurveSuite: Sized + Clone + std::fmt::Debug + 'static {
    const CURVE_ID: CurveId;
    /// DH public key length in bytes.
    const DH_PUBLIC_LEN: usize;
    /// Signing (EdDSA) public key length in bytes.
    const SIGNING_PUBLIC_LEN: usize;
    const SIGNATURE_LEN: usize;
    const SHARED_SECRET_LEN: usize;

    type DhSecret: Clone;
    type DhPublic: Clone + PartialEq;
    type SigningSecret: Clone;
    type SigningPublic: Clone + PartialEq;
    type Signature: Clone;

    /// Generate a DH key pair from the system CSPRNG.
    fn generate_dh() -> (Self::DhSecret, Self::DhPublic);

    /// DH agreement. Fails with [`Error::InvalidKey`] when the remote point
    /// is low-order (non-contributory output).
    fn dh(secret: &Self::DhSecret, public: &Self::DhPublic) -> Result<Zeroizing<Vec<u8>>>;

    /// Generate a signing key pair from the system CSPRNG.
    fn generate_signing() -> (Self::SigningSecret, Self::SigningPublic);

    /// Public half of a signing secret.
    fn signing_public_of(secret: &Self::SigningSecret) -> Self::SigningPublic;

    fn sign(secret: &Self::SigningSecret, message: &[u8]) -> Self::Signature;

    fn verify(
        public: &Self::SigningPublic,
        message: &[u8],
        signature: &Self::Signature,
    ) -> Result<()>;

    /// Deterministic conversion of a signing secret to the equivalent DH
    /// secret.
    fn signing_to_dh_secret(secret: &Self::SigningSecret) -> Self::DhSecret;

    /// Deterministic conversion of a signing public key to the equivalent
    /// DH public key.
    fn signing_to_dh_public(public: &Self::SigningPublic) -> Result<Self::DhPublic>;

    fn dh_public_bytes(public: &Self::DhPublic) -> Vec<u8>;
    fn dh_public_from_bytes(bytes: &[u8]) -> Result<Self::DhPublic>;
    fn dh_secret_bytes(secret: &Self::DhSecret) -> Zeroizing<Vec<u8>>;
    fn dh_secret_from_bytes(bytes: &[u8]) -> Result<Self::DhSecret>;
    fn signing_public_bytes(public: &Self::SigningPublic) -> Vec<u8>;
    fn signing_public_from_bytes(bytes: &[u8]) -> Result<Self::SigningPublic>;
    fn signing_secret_bytes(secret: &Self::SigningSecret) -> Zeroizing<Vec<u8>>;
    fn signing_secret_from_bytes(bytes: &[u8]) -> Result<Self::SigningSecret>;
    fn signature_bytes(signature: &Self::Signature) -> Vec<u8>;
    fn signature_from_bytes(bytes: &[u8]) -> Result<Self::Signature>;
}
