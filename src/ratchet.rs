//! Double Ratchet state machine.
//!
//! One instance per session direction pair: a DH ratchet that mixes fresh
//! key exchanges into the root key whenever the peer's ratchet key changes,
//! and symmetric chains that advance once per message. Out-of-order
//! delivery is absorbed by a bounded skipped-key cache.
//!
//! Decryption is transactional: all mutation happens on a staged copy that
//! only replaces the live state after the AEAD accepts the message.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::crypto::kdf;
use crate::crypto::{aead, ChainKey, CurveSuite, MessageKey, RootKey};
use crate::error::{Error, Result};

/// Ratchet header fields carried on every message.
pub(crate) struct MessageHeader<C: CurveSuite> {
    pub dh_public: C::DhPublic,
    /// Length of the sender's previous sending chain.
    pub pn: u32,
    /// Counter within the current sending chain.
    pub n: u32,
}

/// Cache bounds, taken from [`crate::config::Config`] at session creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RatchetLimits {
    pub max_skip: u32,
    pub max_chains: usize,
}

#[derive(Clone)]
pub(crate) struct DoubleRatchet<C: CurveSuite> {
    dh_secret: Option<C::DhSecret>,
    dh_public: Option<C::DhPublic>,
    remote_dh: Option<C::DhPublic>,
    root_key: RootKey,
    chain_send: Option<ChainKey>,
    chain_recv: Option<ChainKey>,
    n_send: u32,
    n_recv: u32,
    pn: u32,
    skipped: SkippedKeys,
    limits: RatchetLimits,
}

impl<C: CurveSuite> DoubleRatchet<C> {
    /// Sender-path session: the remote ratchet key is the peer SPK; the
    /// local pair is generated on first send.
    pub(crate) fn new_sender(root_key: RootKey, remote_dh: C::DhPublic, limits: RatchetLimits) -> Self {
        Self {
            dh_secret: None,
            dh_public: None,
            remote_dh: Some(remote_dh),
            root_key,
            chain_send: None,
            chain_recv: None,
            n_send: 0,
            n_recv: 0,
            pn: 0,
            skipped: SkippedKeys::default(),
            limits,
        }
    }

    /// Receiver-path session: the local ratchet pair is the used SPK; the
    /// remote key arrives with the first ratchet header.
    pub(crate) fn new_receiver(
        root_key: RootKey,
        dh_secret: C::DhSecret,
        dh_public: C::DhPublic,
        limits: RatchetLimits,
    ) -> Self {
        Self {
            dh_secret: Some(dh_secret),
            dh_public: Some(dh_public),
            remote_dh: None,
            root_key,
            chain_send: None,
            chain_recv: None,
            n_send: 0,
            n_recv: 0,
            pn: 0,
            skipped: SkippedKeys::default(),
            limits,
        }
    }

    /// Advance the sending chain one step: header fields plus the message
    /// key for this position.
    pub(crate) fn next_sending(&mut self) -> Result<(MessageHeader<C>, MessageKey)> {
        if self.chain_send.is_none() {
            let remote = self
                .remote_dh
                .as_ref()
                .ok_or(Error::ProtocolFormat("session has no remote ratchet key"))?;
            if self.dh_secret.is_none() {
                let (secret, public) = C::generate_dh();
                self.dh_secret = Some(secret);
                self.dh_public = Some(public);
            }
            let secret = self
                .dh_secret
                .as_ref()
                .ok_or(Error::ProtocolFormat("session has no ratchet key"))?;
            let dh_out = C::dh(secret, remote)?;
            let (root_key, chain) = kdf::kdf_rk(&self.root_key, &dh_out);
            self.root_key = root_key;
            self.chain_send = Some(chain);
        }

        let chain = self
            .chain_send
            .as_ref()
            .ok_or(Error::ProtocolFormat("session has no sending chain"))?;
        let public = self
            .dh_public
            .clone()
            .ok_or(Error::ProtocolFormat("session has no ratchet key"))?;

        let (message_key, next) = kdf::kdf_ck(chain);
        let header = MessageHeader {
            dh_public: public,
            pn: self.pn,
            n: self.n_send,
        };
        self.chain_send = Some(next);
        self.n_send += 1;
        Ok((header, message_key))
    }

    /// Decrypt one inbound message. On any error the state is untouched.
    pub(crate) fn decrypt(
        &mut self,
        header: &MessageHeader<C>,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let mut staged = self.clone();
        let plaintext = staged.decrypt_staged(header, aad, ciphertext)?;
        *self = staged;
        Ok(plaintext)
    }

    fn decrypt_staged(
        &mut self,
        header: &MessageHeader<C>,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let header_key_bytes = C::dh_public_bytes(&header.dh_public);

        // A message from an already-closed or partially-consumed chain hits
        // the cache first.
        if let Some(message_key) = self.skipped.take(&header_key_bytes, header.n) {
            return aead::decrypt(&message_key, aad, ciphertext);
        }

        let same_chain = self
            .remote_dh
            .as_ref()
            .is_some_and(|remote| *remote == header.dh_public);
        if !same_chain {
            // Close the current receiving chain at the sender's previous
            // chain length, then turn the DH ratchet.
            self.skip_receiving(header.pn)?;
            self.dh_ratchet(&header.dh_public)?;
        }

        if header.n < self.n_recv {
            return Err(Error::OutOfOrderOrReplay);
        }
        self.skip_receiving(header.n)?;

        let chain = self
            .chain_recv
            .as_ref()
            .ok_or(Error::ProtocolFormat("session has no receiving chain"))?;
        let (message_key, next) = kdf::kdf_ck(chain);
        let plaintext = aead::decrypt(&message_key, aad, ciphertext)?;
        self.chain_recv = Some(next);
        self.n_recv = header.n + 1;
        Ok(plaintext)
    }

    /// Advance the receiving chain to `until`, caching the keys in between.
    fn skip_receiving(&mut self, until: u32) -> Result<()> {
        if until <= self.n_recv {
            return Ok(());
        }
        let (Some(remote), Some(chain)) = (&self.remote_dh, &self.chain_recv) else {
            // No receiving chain was ever started; nothing to close out.
            return Ok(());
        };
        if until - self.n_recv > self.limits.max_skip {
            return Err(Error::TooManySkipped);
        }

        let remote_bytes = C::dh_public_bytes(remote);
        let mut chain = chain.clone();
        while self.n_recv < until {
            let (message_key, next) = kdf::kdf_ck(&chain);
            self.skipped
                .insert(&remote_bytes, self.n_recv, message_key, &self.limits);
            chain = next;
            self.n_recv += 1;
        }
        self.chain_recv = Some(chain);
        Ok(())
    }

    /// DH ratchet step on a new remote key: derive the receiving chain for
    /// it, then a fresh local pair and the next sending chain. The previous
    /// chain keys are overwritten.
    fn dh_ratchet(&mut self, remote: &C::DhPublic) -> Result<()> {
        let secret = self
            .dh_secret
            .as_ref()
            .ok_or(Error::ProtocolFormat("session has no ratchet key"))?;

        let dh_recv = C::dh(secret, remote)?;
        let (root_key, chain_recv) = kdf::kdf_rk(&self.root_key, &dh_recv);
        self.root_key = root_key;
        self.chain_recv = Some(chain_recv);
        self.remote_dh = Some(remote.clone());
        self.pn = self.n_send;
        self.n_send = 0;
        self.n_recv = 0;

        let (new_secret, new_public) = C::generate_dh();
        let dh_send = C::dh(&new_secret, remote)?;
        let (root_key, chain_send) = kdf::kdf_rk(&self.root_key, &dh_send);
        self.root_key = root_key;
        self.chain_send = Some(chain_send);
        self.dh_secret = Some(new_secret);
        self.dh_public = Some(new_public);

        tracing::debug!(
            remote = %hex::encode(&C::dh_public_bytes(remote)[..8]),
            "DH ratchet step"
        );
        Ok(())
    }

    pub(crate) fn cached_skipped_keys(&self) -> usize {
        self.skipped.total()
    }

    pub(crate) fn to_record(&self) -> RatchetRecord {
        RatchetRecord {
            dh_secret: self.dh_secret.as_ref().map(|s| C::dh_secret_bytes(s).to_vec()),
            dh_public: self.dh_public.as_ref().map(|p| C::dh_public_bytes(p)),
            remote_dh: self.remote_dh.as_ref().map(|p| C::dh_public_bytes(p)),
            root_key: self.root_key.clone(),
            chain_send: self.chain_send.clone(),
            chain_recv: self.chain_recv.clone(),
            n_send: self.n_send,
            n_recv: self.n_recv,
            pn: self.pn,
            skipped: self.skipped.clone(),
            limits: self.limits.clone(),
        }
    }

    pub(crate) fn from_record(record: RatchetRecord) -> Result<Self> {
        let dh_secret = record
            .dh_secret
            .as_deref()
            .map(C::dh_secret_from_bytes)
            .transpose()?;
        let dh_public = record
            .dh_public
            .as_deref()
            .map(C::dh_public_from_bytes)
            .transpose()?;
        let remote_dh = record
            .remote_dh
            .as_deref()
            .map(C::dh_public_from_bytes)
            .transpose()?;
        Ok(Self {
            dh_secret,
            dh_public,
            remote_dh,
            root_key: record.root_key,
            chain_send: record.chain_send,
            chain_recv: record.chain_recv,
            n_send: record.n_send,
            n_recv: record.n_recv,
            pn: record.pn,
            skipped: record.skipped,
            limits: record.limits,
        })
    }

    #[cfg(test)]
    pub(crate) fn sending_chain(&self) -> Option<&ChainKey> {
        self.chain_send.as_ref()
    }
}

/// Bounded cache of message keys for not-yet-delivered messages, keyed by
/// `(remote ratchet key, counter)`. Oldest chains and oldest keys are
/// evicted first.
#[derive(Clone, Default, Serialize, Deserialize)]
struct SkippedKeys {
    chains: VecDeque<SkippedChain>,
}

#[derive(Clone, Serialize, Deserialize)]
struct SkippedChain {
    #[serde(with = "serde_bytes")]
    dh_public: Vec<u8>,
    keys: Vec<(u32, MessageKey)>,
}

impl SkippedKeys {
    fn insert(&mut self, dh_public: &[u8], n: u32, key: MessageKey, limits: &RatchetLimits) {
        let chain = match self
            .chains
            .iter_mut()
            .position(|c| c.dh_public == dh_public)
        {
            Some(index) => &mut self.chains[index],
            None => {
                self.chains.push_back(SkippedChain {
                    dh_public: dh_public.to_vec(),
                    keys: Vec::new(),
                });
                while self.chains.len() > limits.max_chains {
                    self.chains.pop_front();
                }
                self.chains
                    .back_mut()
                    .expect("chain pushed above")
            }
        };
        chain.keys.push((n, key));
        while chain.keys.len() > limits.max_skip as usize {
            chain.keys.remove(0);
        }
    }

    fn take(&mut self, dh_public: &[u8], n: u32) -> Option<MessageKey> {
        let chain_index = self.chains.iter().position(|c| c.dh_public == dh_public)?;
        let chain = &mut self.chains[chain_index];
        let key_index = chain.keys.iter().position(|(counter, _)| *counter == n)?;
        let (_, key) = chain.keys.remove(key_index);
        if chain.keys.is_empty() {
            self.chains.remove(chain_index);
        }
        Some(key)
    }

    fn total(&self) -> usize {
        self.chains.iter().map(|c| c.keys.len()).sum()
    }
}

/// Serializable ratchet state for the opaque session blob.
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct RatchetRecord {
    dh_secret: Option<Vec<u8>>,
    dh_public: Option<Vec<u8>>,
    remote_dh: Option<Vec<u8>>,
    root_key: RootKey,
    chain_send: Option<ChainKey>,
    chain_recv: Option<ChainKey>,
    n_send: u32,
    n_recv: u32,
    pn: u32,
    skipped: SkippedKeys,
    limits: RatchetLimits,
}
