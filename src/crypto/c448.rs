//! 448-bit suite: X448 key exchange, Ed448 signatures.
//!
//! Key objects are kept as raw byte wrappers; the `x448` and
//! `ed448-goldilocks` types are built transiently at each operation. The
//! signing-to-DH conversion mirrors the 255-bit suite: the DH secret is the
//! clamped head of the RFC 8032 SHAKE256 seed expansion, the DH public is
//! the Montgomery form of the decompressed Edwards point.

use ed448_goldilocks::elliptic_curve::Generate;
use ed448_goldilocks::{CompressedEdwardsY, Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::Shake256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::suite::{CurveId, CurveSuite};
use crate::error::{Error, Result};

/// X448 / Ed448 suite marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct C448;

/// Raw X448 secret scalar. Clamping happens inside `x448` on use.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DhSecret448([u8; 56]);

/// Raw X448 public key (Montgomery u-coordinate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhPublic448([u8; 56]);

fn x448_secret(bytes: &[u8; 56]) -> Result<x448::Secret> {
    x448::Secret::from_bytes(bytes).ok_or(Error::InvalidKey)
}

fn x448_public(bytes: &[u8; 56]) -> Result<x448::PublicKey> {
    x448::PublicKey::from_bytes(bytes).ok_or(Error::InvalidKey)
}

impl CurveSuite for C448 {
    const CURVE_ID: CurveId = CurveId::C448;
    const DH_PUBLIC_LEN: usize = 56;
    const SIGNING_PUBLIC_LEN: usize = 57;
    const SIGNATURE_LEN: usize = 114;
    const SHARED_SECRET_LEN: usize = 56;

    type DhSecret = DhSecret448;
    type DhPublic = DhPublic448;
    type SigningSecret = SigningKey;
    type SigningPublic = VerifyingKey;
    type Signature = Signature;

    fn generate_dh() -> (Self::DhSecret, Self::DhPublic) {
        let mut bytes = [0u8; 56];
        OsRng.fill_bytes(&mut bytes);
        let secret = DhSecret448(bytes);
        let public = dh_public_of(&secret);
        (secret, public)
    }

    fn dh(secret: &Self::DhSecret, public: &Self::DhPublic) -> Result<Zeroizing<Vec<u8>>> {
        let secret = x448_secret(&secret.0)?;
        let public = x448_public(&public.0)?;
        // `None` means the shared point was low-order.
        let shared = secret.as_diffie_hellman(&public).ok_or(Error::InvalidKey)?;
        Ok(Zeroizing::new(shared.as_bytes().to_vec()))
    }

    fn generate_signing() -> (Self::SigningSecret, Self::SigningPublic) {
        let secret = SigningKey::generate();
        let public = secret.verifying_key();
        (secret, public)
    }

    fn signing_public_of(secret: &Self::SigningSecret) -> Self::SigningPublic {
        secret.verifying_key()
    }

    fn sign(secret: &Self::SigningSecret, message: &[u8]) -> Self::Signature {
        secret.sign_raw(message)
    }

    fn verify(
        public: &Self::SigningPublic,
        message: &[u8],
        signature: &Self::Signature,
    ) -> Result<()> {
        public
            .verify_raw(signature, message)
            .map_err(|_| Error::SignatureInvalid)
    }

    fn signing_to_dh_secret(secret: &Self::SigningSecret) -> Self::DhSecret {
        // RFC 8032 expands the 57-byte seed with SHAKE256; the first 56
        // clamped bytes are exactly an X448 scalar.
        let seed = secret.to_bytes();
        let mut hasher = Shake256::default();
        hasher.update(seed.as_slice());
        let mut reader = hasher.finalize_xof();
        let mut expanded = Zeroizing::new([0u8; 114]);
        reader.read(expanded.as_mut());

        let mut scalar = [0u8; 56];
        scalar.copy_from_slice(&expanded[..56]);
        scalar[0] &= 0xfc;
        scalar[55] |= 0x80;
        DhSecret448(scalar)
    }

    fn signing_to_dh_public(public: &Self::SigningPublic) -> Result<Self::DhPublic> {
        let compressed = CompressedEdwardsY(public.to_bytes());
        let point: Option<ed448_goldilocks::AffinePoint> = compressed.decompress().into();
        let point = point.ok_or(Error::InvalidKey)?;
        let montgomery = ed448_goldilocks::EdwardsPoint::from(point).to_montgomery();
        Ok(DhPublic448(montgomery.0))
    }

    fn dh_public_bytes(public: &Self::DhPublic) -> Vec<u8> {
        public.0.to_vec()
    }

    fn dh_public_from_bytes(bytes: &[u8]) -> Result<Self::DhPublic> {
        let arr: [u8; 56] = bytes
            .try_into()
            .map_err(|_| Error::ProtocolFormat("bad X448 public length"))?;
        Ok(DhPublic448(arr))
    }

    fn dh_secret_bytes(secret: &Self::DhSecret) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(secret.0.to_vec())
    }

    fn dh_secret_from_bytes(bytes: &[u8]) -> Result<Self::DhSecret> {
        let arr: [u8; 56] = bytes
            .try_into()
            .map_err(|_| Error::ProtocolFormat("bad X448 secret length"))?;
        Ok(DhSecret448(arr))
    }

    fn signing_public_bytes(public: &Self::SigningPublic) -> Vec<u8> {
        public.to_bytes().to_vec()
    }

    fn signing_public_from_bytes(bytes: &[u8]) -> Result<Self::SigningPublic> {
        let arr: [u8; 57] = bytes
            .try_into()
            .map_err(|_| Error::ProtocolFormat("bad Ed448 public length"))?;
        VerifyingKey::from_bytes(&arr.into()).map_err(|_| Error::InvalidKey)
    }

    fn signing_secret_bytes(secret: &Self::SigningSecret) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(secret.to_bytes().as_slice().to_vec())
    }

    fn signing_secret_from_bytes(bytes: &[u8]) -> Result<Self::SigningSecret> {
        let arr: [u8; 57] = bytes
            .try_into()
            .map_err(|_| Error::ProtocolFormat("bad Ed448 secret length"))?;
        SigningKey::try_from(arr.as_slice()).map_err(|_| Error::InvalidKey)
    }

    fn signature_bytes(signature: &Self::Signature) -> Vec<u8> {
        signature.to_bytes().to_vec()
    }

    fn signature_from_bytes(bytes: &[u8]) -> Result<Self::Signature> {
        let arr: [u8; 114] = bytes
            .try_into()
            .map_err(|_| Error::ProtocolFormat("bad Ed448 signature length"))?;
        Signature::try_from(arr.as_slice()).map_err(|_| Error::ProtocolFormat("bad Ed448 signature"))
    }
}

fn dh_public_of(secret: &DhSecret448) -> DhPublic448 {
    // Only called on secrets we generated, which are always valid scalars.
    let secret = x448::Secret::from_bytes(&secret.0).expect("56-byte scalar");
    let public = x448::PublicKey::from(&secret);
    let mut bytes = [0u8; 56];
    bytes.copy_from_slice(public.as_bytes());
    DhPublic448(bytes)
}
