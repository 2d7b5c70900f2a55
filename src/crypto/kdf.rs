//! Key derivation.
//!
//! All derivations use HKDF-SHA512 restricted to a single expansion round
//! (output at most 64 bytes) with a 64-byte zero salt unless stated
//! otherwise, plus HMAC-SHA512 for the symmetric chain step.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha512;
use zeroize::Zeroizing;

use crate::crypto::keys::{ChainKey, MessageKey, RootKey, SharedAd};

type HmacSha512 = Hmac<Sha512>;

pub(crate) const X3DH_SK_INFO: &[u8] = b"X3DH-SK-info";
pub(crate) const X3DH_AD_INFO: &[u8] = b"X3DH-AD-info";
const DR_RK_INFO: &[u8] = b"DR-RK";
const DR_AEAD_INFO: &[u8] = b"DR-AEAD";

const ZERO_SALT: [u8; 64] = [0u8; 64];

/// Per-message AEAD material expanded from a message key.
pub(crate) struct AeadMaterial {
    pub key: Zeroizing<[u8; 32]>,
    pub iv: Zeroizing<[u8; 16]>,
}

fn hkdf_expand(salt: &[u8], ikm: &[u8], info: &[u8], out: &mut [u8]) {
    debug_assert!(out.len() <= 64);
    let hk = Hkdf::<Sha512>::new(Some(salt), ikm);
    hk.expand(info, out)
        .expect("output within one SHA-512 expansion round");
}

/// 32-byte X3DH derivation (SK or AD) from a concatenated input.
pub(crate) fn x3dh_derive32(ikm: &[u8], info: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    hkdf_expand(&ZERO_SALT, ikm, info, &mut out);
    out
}

/// DH ratchet step: mixes a DH output into the root key, yielding the next
/// root key and a fresh chain key.
pub(crate) fn kdf_rk(root_key: &RootKey, dh_output: &[u8]) -> (RootKey, ChainKey) {
    let mut out = Zeroizing::new([0u8; 64]);
    hkdf_expand(root_key.as_bytes(), dh_output, DR_RK_INFO, &mut out[..]);

    let mut rk = [0u8; 32];
    let mut ck = [0u8; 32];
    rk.copy_from_slice(&out[..32]);
    ck.copy_from_slice(&out[32..]);
    (RootKey::from_bytes(rk), ChainKey::from_bytes(ck))
}

/// Symmetric chain step: one message key out, chain key advanced in place.
pub(crate) fn kdf_ck(chain_key: &ChainKey) -> (MessageKey, ChainKey) {
    (
        MessageKey::from_bytes(hmac_step(chain_key, 0x01)),
        ChainKey::from_bytes(hmac_step(chain_key, 0x02)),
    )
}

fn hmac_step(chain_key: &ChainKey, constant: u8) -> [u8; 32] {
    let mut mac = HmacSha512::new_from_slice(chain_key.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(&[constant]);
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest[..32]);
    out
}

/// Expand a message key into AEAD key and IV. The IV is deterministic per
/// message key, which is itself bound to the chain position.
pub(crate) fn aead_material(message_key: &MessageKey) -> AeadMaterial {
    let mut out = Zeroizing::new([0u8; 48]);
    hkdf_expand(&ZERO_SALT, message_key.as_bytes(), DR_AEAD_INFO, &mut out[..]);

    let mut key = Zeroizing::new([0u8; 32]);
    let mut iv = Zeroizing::new([0u8; 16]);
    key.copy_from_slice(&out[..32]);
    iv.copy_from_slice(&out[32..]);
    AeadMaterial { key, iv }
}

/// Shared-AD derivation from identity keys and device identifiers, in
/// session-establishing direction.
pub(crate) fn derive_shared_ad(
    initiator_ik: &[u8],
    receiver_ik: &[u8],
    initiator_device_id: &str,
    receiver_device_id: &str,
) -> SharedAd {
    let mut input = Vec::with_capacity(
        initiator_ik.len()
            + receiver_ik.len()
            + initiator_device_id.len()
            + receiver_device_id.len(),
    );
    input.extend_from_slice(initiator_ik);
    input.extend_from_slice(receiver_ik);
    input.extend_from_slice(initiator_device_id.as_bytes());
    input.extend_from_slice(receiver_device_id.as_bytes());
    SharedAd::from_bytes(x3dh_derive32(&input, X3DH_AD_INFO))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kdf_rk_splits_and_differs() {
        let rk = RootKey::from_bytes([3u8; 32]);
        let (rk2, ck) = kdf_rk(&rk, &[5u8; 32]);
        assert_ne!(rk2.as_bytes(), rk.as_bytes());
        assert_ne!(rk2.as_bytes(), ck.as_bytes());
    }

    #[test]
    fn kdf_ck_advances() {
        let ck = ChainKey::from_bytes([9u8; 32]);
        let (mk1, ck1) = kdf_ck(&ck);
        let (mk2, _) = kdf_ck(&ck1);
        assert_ne!(mk1, mk2);
        assert_ne!(ck.as_bytes(), ck1.as_bytes());
    }

    #[test]
    fn chain_step_is_deterministic() {
        let ck = ChainKey::from_bytes([9u8; 32]);
        assert_eq!(kdf_ck(&ck).0, kdf_ck(&ck).0);
    }

    #[test]
    fn shared_ad_depends_on_direction() {
        let a = derive_shared_ad(&[1; 32], &[2; 32], "alice@1", "bob@1");
        let b = derive_shared_ad(&[2; 32], &[1; 32], "bob@1", "alice@1");
        assert_ne!(a, b);
    }
}
