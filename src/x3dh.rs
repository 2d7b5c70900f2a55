//! X3DH session establishment.
//!
//! Derives the initial root key and the shared associated data from a
//! fetched peer bundle (sender path) or from the init header carried on a
//! first inbound message (receiver path). Identity keys participate through
//! their deterministic DH conversion.

use zeroize::Zeroizing;

use crate::crypto::kdf::{self, X3DH_SK_INFO};
use crate::crypto::{
    CurveSuite, IdentityKeyPair, OneTimePreKey, RootKey, SharedAd, SignedPreKey,
};
use crate::error::{Error, Result};
use crate::protocol::PeerBundle;

/// Initialization header prepended to outgoing messages until the first
/// reply arrives.
///
/// Layout: `IK_pub || EK_pub || SPK_id(4 BE) || OPK_id(4 BE, zero when
/// absent) || has_opk(1)`.
#[derive(Clone)]
pub struct InitHeader<C: CurveSuite> {
    pub ik: C::SigningPublic,
    pub ek: C::DhPublic,
    pub spk_id: u32,
    pub opk_id: Option<u32>,
}

impl<C: CurveSuite> InitHeader<C> {
    pub(crate) fn encoded_len() -> usize {
        C::SIGNING_PUBLIC_LEN + C::DH_PUBLIC_LEN + 4 + 4 + 1
    }

    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&C::signing_public_bytes(&self.ik));
        out.extend_from_slice(&C::dh_public_bytes(&self.ek));
        out.extend_from_slice(&self.spk_id.to_be_bytes());
        out.extend_from_slice(&self.opk_id.unwrap_or(0).to_be_bytes());
        out.push(u8::from(self.opk_id.is_some()));
    }

    /// Parse from the head of `bytes`; the caller advances by
    /// [`Self::encoded_len`].
    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::encoded_len() {
            return Err(Error::ProtocolFormat("init header truncated"));
        }
        let mut pos = 0;
        let ik = C::signing_public_from_bytes(&bytes[pos..pos + C::SIGNING_PUBLIC_LEN])?;
        pos += C::SIGNING_PUBLIC_LEN;
        let ek = C::dh_public_from_bytes(&bytes[pos..pos + C::DH_PUBLIC_LEN])?;
        pos += C::DH_PUBLIC_LEN;
        let spk_id = u32::from_be_bytes(bytes[pos..pos + 4].try_into().expect("4 bytes"));
        pos += 4;
        let opk_id = u32::from_be_bytes(bytes[pos..pos + 4].try_into().expect("4 bytes"));
        pos += 4;
        let opk_id = match bytes[pos] {
            0 => None,
            1 => Some(opk_id),
            _ => return Err(Error::ProtocolFormat("bad OPK flag")),
        };
        Ok(Self {
            ik,
            ek,
            spk_id,
            opk_id,
        })
    }
}

/// Result of sender-path establishment: everything a fresh outbound session
/// needs.
pub struct SenderKeys<C: CurveSuite> {
    pub root_key: RootKey,
    pub ad: SharedAd,
    /// Remote ratchet key the first DH step runs against (the peer SPK).
    pub remote_dh: C::DhPublic,
    pub init_header: InitHeader<C>,
}

/// Sender path: establish against a fetched peer bundle.
pub fn initiate<C: CurveSuite>(
    identity: &IdentityKeyPair<C>,
    local_device_id: &str,
    bundle: &PeerBundle<C>,
) -> Result<SenderKeys<C>> {
    C::verify(
        &bundle.ik,
        &C::dh_public_bytes(&bundle.spk),
        &bundle.spk_signature,
    )?;

    let ik_self_dh = identity.dh_secret();
    let ik_peer_dh = C::signing_to_dh_public(&bundle.ik)?;
    let (ek_secret, ek_public) = C::generate_dh();

    // F || DH1 || DH2 || DH3 [|| DH4], wiped after the derivation.
    let mut ikm = Zeroizing::new(vec![0xffu8; C::DH_PUBLIC_LEN]);
    ikm.extend_from_slice(&C::dh(&ik_self_dh, &bundle.spk)?);
    ikm.extend_from_slice(&C::dh(&ek_secret, &ik_peer_dh)?);
    ikm.extend_from_slice(&C::dh(&ek_secret, &bundle.spk)?);
    if let Some((_, opk)) = &bundle.opk {
        ikm.extend_from_slice(&C::dh(&ek_secret, opk)?);
    }
    let root_key = RootKey::from_bytes(kdf::x3dh_derive32(&ikm, X3DH_SK_INFO));

    let ad = kdf::derive_shared_ad(
        &C::signing_public_bytes(identity.public()),
        &C::signing_public_bytes(&bundle.ik),
        local_device_id,
        &bundle.device_id,
    );

    let init_header = InitHeader {
        ik: identity.public().clone(),
        ek: ek_public,
        spk_id: bundle.spk_id,
        opk_id: bundle.opk.as_ref().map(|(id, _)| *id),
    };

    Ok(SenderKeys {
        root_key,
        ad,
        remote_dh: bundle.spk.clone(),
        init_header,
    })
}

/// Receiver path: mirror the derivation from a received init header and the
/// locally stored pre-keys it references.
pub fn respond<C: CurveSuite>(
    identity: &IdentityKeyPair<C>,
    local_device_id: &str,
    sender_device_id: &str,
    spk: &SignedPreKey<C>,
    opk: Option<&OneTimePreKey<C>>,
    header: &InitHeader<C>,
) -> Result<(RootKey, SharedAd)> {
    let ik_self_dh = identity.dh_secret();
    let ik_peer_dh = C::signing_to_dh_public(&header.ik)?;

    let mut ikm = Zeroizing::new(vec![0xffu8; C::DH_PUBLIC_LEN]);
    ikm.extend_from_slice(&C::dh(spk.secret(), &ik_peer_dh)?);
    ikm.extend_from_slice(&C::dh(&ik_self_dh, &header.ek)?);
    ikm.extend_from_slice(&C::dh(spk.secret(), &header.ek)?);
    if let Some(opk) = opk {
        ikm.extend_from_slice(&C::dh(opk.secret(), &header.ek)?);
    }
    let root_key = RootKey::from_bytes(kdf::x3dh_derive32(&ikm, X3DH_SK_INFO));

    // AD keeps the direction of the establishing side: the peer initiated.
    let ad = kdf::derive_shared_ad(
        &C::signing_public_bytes(&header.ik),
        &C::signing_public_bytes(identity.public()),
        sender_device_id,
        local_device_id,
    );

    Ok((root_key, ad))
}
