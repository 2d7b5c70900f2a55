//! A single Double Ratchet session with one peer device.
//!
//! Owns the ratchet state, the shared associated data derived at
//! establishment, and the pending X3DH init header that rides on outgoing
//! messages until the peer's first reply proves the session is known on the
//! other side.
//!
//! Wire layout of an encrypted message:
//!
//! ```text
//! curve_id(1) || flags(1) || [init header] || DH_pub || PN(4 BE) || N(4 BE) || ciphertext
//! ```
//!
//! Everything before the ciphertext is bound into the AEAD as associated
//! data together with the session AD, so no header bit can be altered
//! without failing authentication.

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::crypto::{CurveSuite, SharedAd};
use crate::error::{Error, Result};
use crate::ratchet::{DoubleRatchet, MessageHeader, RatchetLimits, RatchetRecord};
use crate::x3dh::{InitHeader, SenderKeys};

/// Wire flag: an X3DH init header sits between the flags byte and the
/// ratchet DH public.
const FLAG_X3DH_INIT: u8 = 0x01;

pub struct Session<C: CurveSuite> {
    ratchet: DoubleRatchet<C>,
    ad: SharedAd,
    pending_init: Option<InitHeader<C>>,
    /// Timestamp of the most recent successful decrypt, for choosing the
    /// surviving session after crossed establishment.
    pub(crate) last_decrypt_ms: Option<u64>,
    pub(crate) created_at_ms: u64,
}

impl<C: CurveSuite> Session<C> {
    /// Sender-path session from X3DH against a fetched bundle.
    pub(crate) fn new_initiator(keys: SenderKeys<C>, config: &Config, now_ms: u64) -> Self {
        Self {
            ratchet: DoubleRatchet::new_sender(keys.root_key, keys.remote_dh, limits_of(config)),
            ad: keys.ad,
            pending_init: Some(keys.init_header),
            last_decrypt_ms: None,
            created_at_ms: now_ms,
        }
    }

    /// Receiver-path session from X3DH on a first inbound message; the local
    /// ratchet pair is the referenced SPK.
    pub(crate) fn new_receiver(
        root_key: crate::crypto::RootKey,
        ad: SharedAd,
        spk_secret: C::DhSecret,
        spk_public: C::DhPublic,
        config: &Config,
        now_ms: u64,
    ) -> Self {
        Self {
            ratchet: DoubleRatchet::new_receiver(root_key, spk_secret, spk_public, limits_of(config)),
            ad,
            pending_init: None,
            last_decrypt_ms: None,
            created_at_ms: now_ms,
        }
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let (header, message_key) = self.ratchet.next_sending()?;

        let mut wire = Vec::with_capacity(
            2 + InitHeader::<C>::encoded_len() + C::DH_PUBLIC_LEN + 8 + plaintext.len() + 16,
        );
        wire.push(C::CURVE_ID as u8);
        wire.push(if self.pending_init.is_some() {
            FLAG_X3DH_INIT
        } else {
            0
        });
        if let Some(init) = &self.pending_init {
            init.encode_into(&mut wire);
        }
        wire.extend_from_slice(&C::dh_public_bytes(&header.dh_public));
        wire.extend_from_slice(&header.pn.to_be_bytes());
        wire.extend_from_slice(&header.n.to_be_bytes());

        let mut aad = Vec::with_capacity(32 + wire.len());
        aad.extend_from_slice(self.ad.as_bytes());
        aad.extend_from_slice(&wire);

        let ciphertext = crate::crypto::aead::encrypt(&message_key, &aad, plaintext);
        wire.extend_from_slice(&ciphertext);
        Ok(wire)
    }

    /// Decrypt a parsed wire message. `wire` is the full original buffer,
    /// needed to rebuild the authenticated prefix.
    pub(crate) fn decrypt_parsed(
        &mut self,
        message: &WireMessage<C>,
        wire: &[u8],
        now_ms: u64,
    ) -> Result<Vec<u8>> {
        let mut aad = Vec::with_capacity(32 + message.prefix_len);
        aad.extend_from_slice(self.ad.as_bytes());
        aad.extend_from_slice(&wire[..message.prefix_len]);

        let plaintext = self
            .ratchet
            .decrypt(&message.header, &aad, &wire[message.prefix_len..])?;

        // The peer demonstrably holds the session; stop sending the init.
        self.pending_init = None;
        self.last_decrypt_ms = Some(now_ms);
        Ok(plaintext)
    }

    pub fn decrypt(&mut self, wire: &[u8], now_ms: u64) -> Result<Vec<u8>> {
        let message = parse_wire::<C>(wire)?;
        self.decrypt_parsed(&message, wire, now_ms)
    }

    pub(crate) fn cached_skipped_keys(&self) -> usize {
        self.ratchet.cached_skipped_keys()
    }

    pub(crate) fn to_record(&self) -> SessionRecord {
        SessionRecord {
            ratchet: self.ratchet.to_record(),
            ad: self.ad.clone(),
            pending_init: self.pending_init.as_ref().map(|init| {
                let mut bytes = Vec::with_capacity(InitHeader::<C>::encoded_len());
                init.encode_into(&mut bytes);
                bytes
            }),
            last_decrypt_ms: self.last_decrypt_ms,
            created_at_ms: self.created_at_ms,
        }
    }

    pub(crate) fn from_record(record: SessionRecord) -> Result<Self> {
        Ok(Self {
            ratchet: DoubleRatchet::from_record(record.ratchet)?,
            ad: record.ad,
            pending_init: record
                .pending_init
                .as_deref()
                .map(InitHeader::<C>::decode)
                .transpose()?,
            last_decrypt_ms: record.last_decrypt_ms,
            created_at_ms: record.created_at_ms,
        })
    }
}

/// Parsed view of an encrypted wire message.
pub(crate) struct WireMessage<C: CurveSuite> {
    pub init: Option<InitHeader<C>>,
    pub header: MessageHeader<C>,
    /// Length of the authenticated prefix; the ciphertext follows it.
    pub prefix_len: usize,
}

pub(crate) fn parse_wire<C: CurveSuite>(wire: &[u8]) -> Result<WireMessage<C>> {
    if wire.len() < 2 {
        return Err(Error::ProtocolFormat("message truncated"));
    }
    if wire[0] != C::CURVE_ID as u8 {
        return Err(Error::ProtocolFormat("curve mismatch"));
    }
    let flags = wire[1];
    if flags & !FLAG_X3DH_INIT != 0 {
        return Err(Error::ProtocolFormat("unknown header flags"));
    }

    let mut pos = 2;
    let init = if flags & FLAG_X3DH_INIT != 0 {
        let init = InitHeader::<C>::decode(&wire[pos..])?;
        pos += InitHeader::<C>::encoded_len();
        Some(init)
    } else {
        None
    };

    if wire.len() < pos + C::DH_PUBLIC_LEN + 8 {
        return Err(Error::ProtocolFormat("message truncated"));
    }
    let dh_public = C::dh_public_from_bytes(&wire[pos..pos + C::DH_PUBLIC_LEN])?;
    pos += C::DH_PUBLIC_LEN;
    let pn = u32::from_be_bytes(wire[pos..pos + 4].try_into().expect("4 bytes"));
    pos += 4;
    let n = u32::from_be_bytes(wire[pos..pos + 4].try_into().expect("4 bytes"));
    pos += 4;

    Ok(WireMessage {
        init,
        header: MessageHeader { dh_public, pn, n },
        prefix_len: pos,
    })
}

/// Serializable session state; stored as an opaque blob.
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct SessionRecord {
    ratchet: RatchetRecord,
    ad: SharedAd,
    pending_init: Option<Vec<u8>>,
    last_decrypt_ms: Option<u64>,
    created_at_ms: u64,
}

fn limits_of(config: &Config) -> RatchetLimits {
    RatchetLimits {
        max_skip: config.max_message_skip_per_chain,
        max_chains: config.max_cached_chains,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{C255, IdentityKeyPair, OneTimePreKey, SignedPreKey};
    use crate::protocol::PeerBundle;
    use crate::x3dh;

    fn connected_pair() -> (Session<C255>, Session<C255>) {
        let config = Config::default();
        let alice = IdentityKeyPair::<C255>::generate();
        let bob = IdentityKeyPair::<C255>::generate();
        let bob_spk = SignedPreKey::generate(1, &bob, 0);
        let bob_opk = OneTimePreKey::<C255>::generate(2);

        let bundle = PeerBundle {
            device_id: "bob@1".into(),
            ik: bob.public().clone(),
            spk: bob_spk.public().clone(),
            spk_id: bob_spk.id,
            spk_signature: bob_spk.signature().clone(),
            opk: Some((bob_opk.id, bob_opk.public().clone())),
        };

        let sender_keys = x3dh::initiate(&alice, "alice@1", &bundle).unwrap();
        let init = sender_keys.init_header.clone();
        let alice_session = Session::new_initiator(sender_keys, &config, 0);

        let (root, ad) =
            x3dh::respond(&bob, "bob@1", "alice@1", &bob_spk, Some(&bob_opk), &init).unwrap();
        let bob_session = Session::new_receiver(
            root,
            ad,
            bob_spk.secret().clone(),
            bob_spk.public().clone(),
            &config,
            0,
        );
        (alice_session, bob_session)
    }

    #[test]
    fn first_message_carries_init_header_then_drops_it() {
        let (mut alice, mut bob) = connected_pair();

        let m1 = alice.encrypt(b"Hello Bob").unwrap();
        assert_eq!(m1[0], 0x01);
        assert_eq!(m1[1], FLAG_X3DH_INIT);
        assert!(parse_wire::<C255>(&m1).unwrap().init.is_some());
        assert_eq!(bob.decrypt(&m1, 1).unwrap(), b"Hello Bob");

        // Still pending until a reply arrives.
        let m2 = alice.encrypt(b"again").unwrap();
        assert_eq!(m2[1], FLAG_X3DH_INIT);
        assert_eq!(bob.decrypt(&m2, 2).unwrap(), b"again");

        let reply = bob.encrypt(b"Hello Alice").unwrap();
        assert_eq!(reply[1], 0);
        assert_eq!(alice.decrypt(&reply, 3).unwrap(), b"Hello Alice");

        // The reply cleared the pending init.
        let m3 = alice.encrypt(b"done").unwrap();
        assert_eq!(m3[1], 0);
        assert_eq!(bob.decrypt(&m3, 4).unwrap(), b"done");
    }

    #[test]
    fn header_tampering_fails_authentication() {
        let (mut alice, mut bob) = connected_pair();
        let wire = alice.encrypt(b"payload").unwrap();

        // Flip one bit in each header byte position in turn.
        let prefix_len = parse_wire::<C255>(&wire).unwrap().prefix_len;
        for index in 2..prefix_len {
            let mut tampered = wire.clone();
            tampered[index] ^= 0x40;
            if let Ok(parsed) = parse_wire::<C255>(&tampered) {
                assert!(matches!(
                    bob.decrypt_parsed(&parsed, &tampered, 1),
                    Err(Error::AuthenticationFailed) | Err(Error::TooManySkipped)
                ));
            }
        }
        // State untouched: the original still decrypts.
        assert_eq!(bob.decrypt(&wire, 2).unwrap(), b"payload");
    }

    #[test]
    fn wrong_curve_byte_is_rejected() {
        let (mut alice, _) = connected_pair();
        let mut wire = alice.encrypt(b"payload").unwrap();
        wire[0] = 0x02;
        assert!(matches!(
            parse_wire::<C255>(&wire),
            Err(Error::ProtocolFormat("curve mismatch"))
        ));
    }

    #[test]
    fn session_record_round_trip() {
        let (mut alice, mut bob) = connected_pair();
        let m1 = alice.encrypt(b"one").unwrap();
        bob.decrypt(&m1, 1).unwrap();

        let blob = serde_json::to_vec(&bob.to_record()).unwrap();
        let record: SessionRecord = serde_json::from_slice(&blob).unwrap();
        let mut restored = Session::<C255>::from_record(record).unwrap();

        let m2 = alice.encrypt(b"two").unwrap();
        assert_eq!(restored.decrypt(&m2, 2).unwrap(), b"two");
    }
}
