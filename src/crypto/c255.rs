//! 255-bit suite: X25519 key exchange, Ed25519 signatures.
//!
//! The signing-to-DH conversion follows the standard Ed25519/X25519
//! correspondence: the DH secret is the clamped lower half of the SHA-512
//! expansion of the signing seed, and the DH public is the Montgomery form
//! of the Edwards point.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use crate::crypto::suite::{CurveId, CurveSuite};
use crate::error::{Error, Result};

/// X25519 / Ed25519 suite marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct C255;

fn array32(bytes: &[u8], what: &'static str) -> Result<[u8; 32]> {
    bytes.try_into().map_err(|_| Error::ProtocolFormat(what))
}

impl CurveSuite for C255 {
    const CURVE_ID: CurveId = CurveId::C255;
    const DH_PUBLIC_LEN: usize = 32;
    const SIGNING_PUBLIC_LEN: usize = 32;
    const SIGNATURE_LEN: usize = 64;
    const SHARED_SECRET_LEN: usize = 32;

    type DhSecret = StaticSecret;
    type DhPublic = X25519Public;
    type SigningSecret = SigningKey;
    type SigningPublic = VerifyingKey;
    type Signature = Signature;

    fn generate_dh() -> (Self::DhSecret, Self::DhPublic) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        (secret, public)
    }

    fn dh(secret: &Self::DhSecret, public: &Self::DhPublic) -> Result<Zeroizing<Vec<u8>>> {
        let shared = secret.diffie_hellman(public);
        if !shared.was_contributory() {
            return Err(Error::InvalidKey);
        }
        Ok(Zeroizing::new(shared.as_bytes().to_vec()))
    }

    fn generate_signing() -> (Self::SigningSecret, Self::SigningPublic) {
        let secret = SigningKey::generate(&mut OsRng);
        let public = secret.verifying_key();
        (secret, public)
    }

    fn signing_public_of(secret: &Self::SigningSecret) -> Self::SigningPublic {
        secret.verifying_key()
    }

    fn sign(secret: &Self::SigningSecret, message: &[u8]) -> Self::Signature {
        secret.sign(message)
    }

    fn verify(
        public: &Self::SigningPublic,
        message: &[u8],
        signature: &Self::Signature,
    ) -> Result<()> {
        public
            .verify(message, signature)
            .map_err(|_| Error::SignatureInvalid)
    }

    fn signing_to_dh_secret(secret: &Self::SigningSecret) -> Self::DhSecret {
        // RFC 8032 scalar derivation; StaticSecret clamps again, which is
        // idempotent on an already-clamped value.
        let hash = Sha512::digest(secret.as_bytes());
        let mut scalar = Zeroizing::new([0u8; 32]);
        scalar.copy_from_slice(&hash[..32]);
        StaticSecret::from(*scalar)
    }

    fn signing_to_dh_public(public: &Self::SigningPublic) -> Result<Self::DhPublic> {
        Ok(X25519Public::from(public.to_montgomery().to_bytes()))
    }

    fn dh_public_bytes(public: &Self::DhPublic) -> Vec<u8> {
        public.as_bytes().to_vec()
    }

    fn dh_public_from_bytes(bytes: &[u8]) -> Result<Self::DhPublic> {
        Ok(X25519Public::from(array32(bytes, "bad X25519 public length")?))
    }

    fn dh_secret_bytes(secret: &Self::DhSecret) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(secret.to_bytes().to_vec())
    }

    fn dh_secret_from_bytes(bytes: &[u8]) -> Result<Self::DhSecret> {
        Ok(StaticSecret::from(array32(bytes, "bad X25519 secret length")?))
    }

    fn signing_public_bytes(public: &Self::SigningPublic) -> Vec<u8> {
        public.as_bytes().to_vec()
    }

    fn signing_public_from_bytes(bytes: &[u8]) -> Result<Self::SigningPublic> {
        VerifyingKey::from_bytes(&array32(bytes, "bad Ed25519 public length")?)
            .map_err(|_| Error::InvalidKey)
    }

    fn signing_secret_bytes(secret: &Self::SigningSecret) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(secret.to_bytes().to_vec())
    }

    fn signing_secret_from_bytes(bytes: &[u8]) -> Result<Self::SigningSecret> {
        Ok(SigningKey::from_bytes(&array32(
            bytes,
            "bad Ed25519 secret length",
        )?))
    }

    fn signature_bytes(signature: &Self::Signature) -> Vec<u8> {
        signature.to_bytes().to_vec()
    }

    fn signature_from_bytes(bytes: &[u8]) -> Result<Self::Signature> {
        let arr: [u8; 64] = bytes
            .try_into()
            .map_err(|_| Error::ProtocolFormat("bad Ed25519 signature length"))?;
        Ok(Signature::from_bytes(&arr))
    }
}
