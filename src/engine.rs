//! Session orchestrator.
//!
//! One engine instance per local device. It owns the per-peer session cache
//! (at most an active and a draining session per peer), pins peer identity
//! keys on first encounter, queues encrypts behind in-flight bundle
//! fetches, and drives X3DH establishment in both directions.
//!
//! The engine performs no I/O. Requests to the key server leave through an
//! outbox of opaque blobs ([`Engine::next_server_request`]); responses come
//! back through [`Engine::handle_server_response`]. Results of deferred
//! work surface as [`EngineEvent`]s.

use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::crypto::{CurveSuite, IdentityKeyPair, OneTimePreKey, SignedPreKey};
use crate::error::{Error, Result};
use crate::protocol::{self, ErrorCode, MessageType, PeerBundle, Response};
use crate::session::{parse_wire, Session, WireMessage};
use crate::storage::{
    LocalUserRecord, OpkRecord, PeerRecord, PeerStatus, SessionSlot, SpkRecord, Storage, StorageTx,
};
use crate::x3dh;

/// Result of an encrypt call.
pub enum EncryptOutcome {
    /// A session existed; here is the wire message.
    Ready(Vec<u8>),
    /// No session yet: a bundle fetch is in flight and the message will
    /// surface as [`EngineEvent::MessageEncrypted`] once it completes.
    Queued,
}

/// Deferred results and lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    MessageEncrypted {
        peer_device_id: String,
        wire: Vec<u8>,
    },
    EncryptFailed {
        peer_device_id: String,
        error: Error,
    },
    SessionEstablished {
        peer_device_id: String,
    },
    UserRegistered,
    SpkPublished {
        spk_id: u32,
    },
    OpksPublished {
        count: u16,
    },
    UserDeleted,
}

/// Opaque request blob for the key server, correlated by id.
pub struct ServerRequest {
    pub request_id: u64,
    pub body: Vec<u8>,
}

enum PendingKind {
    Register,
    DeleteUser,
    PostSpk { spk_id: u32 },
    PostOpks { count: u16 },
    Fetch { peer_device_id: String },
}

struct PeerSessions<C: CurveSuite> {
    active: Option<Session<C>>,
    draining: Option<Session<C>>,
}

impl<C: CurveSuite> Default for PeerSessions<C> {
    fn default() -> Self {
        Self {
            active: None,
            draining: None,
        }
    }
}

pub struct Engine<C: CurveSuite, S: Storage> {
    device_id: String,
    config: Config,
    store: S,
    identity: Option<IdentityKeyPair<C>>,
    sessions: HashMap<String, PeerSessions<C>>,
    /// Plaintexts waiting for a bundle fetch, in submission order.
    fetch_queues: HashMap<String, VecDeque<Vec<u8>>>,
    fetch_requests: HashMap<String, u64>,
    pending: HashMap<u64, PendingKind>,
    outbox: VecDeque<ServerRequest>,
    next_request_id: u64,
}

impl<C: CurveSuite, S: Storage> Engine<C, S> {
    /// Open an engine over an existing store, loading the local identity if
    /// one was provisioned before.
    pub fn new(device_id: impl Into<String>, config: Config, mut store: S) -> Result<Self> {
        let identity = store
            .transaction(|tx| tx.local_user())?
            .map(|record| IdentityKeyPair::<C>::from_secret_bytes(&record.identity_secret))
            .transpose()?;
        Ok(Self {
            device_id: device_id.into(),
            config,
            store,
            identity,
            sessions: HashMap::new(),
            fetch_queues: HashMap::new(),
            fetch_requests: HashMap::new(),
            pending: HashMap::new(),
            outbox: VecDeque::new(),
            next_request_id: 0,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Next request blob to post to the key server, if any.
    pub fn next_server_request(&mut self) -> Option<ServerRequest> {
        self.outbox.pop_front()
    }

    /// Create the local identity and emit the registration request.
    pub fn register_user(&mut self) -> Result<()> {
        if self.identity.is_some() {
            return Err(Error::Storage("local user already exists".into()));
        }
        let identity = IdentityKeyPair::<C>::generate();
        let record = LocalUserRecord {
            device_id: self.device_id.clone(),
            identity_secret: identity.secret_bytes().to_vec(),
            registered: false,
        };
        self.store.transaction(|tx| tx.put_local_user(&record))?;
        let body = protocol::encode_register_user::<C>(identity.public());
        self.identity = Some(identity);
        self.push_request(PendingKind::Register, body);
        info!(device = %self.device_id, "registering user");
        Ok(())
    }

    /// Emit a user deletion request; local state is wiped on the ack.
    pub fn delete_user(&mut self) -> Result<()> {
        self.identity()?;
        let body = protocol::encode_delete_user::<C>();
        self.push_request(PendingKind::DeleteUser, body);
        Ok(())
    }

    /// Encrypt to a peer device, fetching its bundle first when no session
    /// exists yet. Encrypts to the same peer stay in submission order.
    pub fn encrypt(&mut self, peer_device_id: &str, plaintext: &[u8]) -> Result<EncryptOutcome> {
        self.identity()?;
        if let Some(record) = self.store.transaction(|tx| tx.peer(peer_device_id))? {
            if record.status == PeerStatus::UntrustedMismatch {
                return Err(Error::PeerIdentityMismatch {
                    device_id: peer_device_id.into(),
                });
            }
        }

        if self.fetch_requests.contains_key(peer_device_id) {
            self.fetch_queues
                .entry(peer_device_id.to_string())
                .or_default()
                .push_back(plaintext.to_vec());
            return Ok(EncryptOutcome::Queued);
        }

        self.load_sessions(peer_device_id)?;
        let mut entry = self.sessions.remove(peer_device_id).unwrap_or_default();
        let encrypted = entry.active.as_mut().map(|session| session.encrypt(plaintext));
        if let Some(encrypted) = encrypted {
            let result = encrypted.and_then(|wire| {
                self.commit_sessions(peer_device_id, &entry, CommitExtras::default())
                    .map(|_| wire)
            });
            self.sessions.insert(peer_device_id.to_string(), entry);
            return result.map(EncryptOutcome::Ready);
        }
        self.sessions.insert(peer_device_id.to_string(), entry);

        // No session anywhere: fetch the bundle and queue behind it.
        let body = protocol::encode_get_peer_bundles::<C>(&[peer_device_id]);
        let request_id = self.push_request(
            PendingKind::Fetch {
                peer_device_id: peer_device_id.to_string(),
            },
            body,
        );
        self.fetch_requests
            .insert(peer_device_id.to_string(), request_id);
        self.fetch_queues
            .entry(peer_device_id.to_string())
            .or_default()
            .push_back(plaintext.to_vec());
        debug!(peer = %peer_device_id, request_id, "bundle fetch started");
        Ok(EncryptOutcome::Queued)
    }

    /// Decrypt an inbound wire message from a peer device.
    pub fn decrypt(&mut self, sender_device_id: &str, wire: &[u8]) -> Result<Vec<u8>> {
        self.identity()?;
        let now = now_ms();
        let message = parse_wire::<C>(wire)?;

        let peer_record = self.store.transaction(|tx| tx.peer(sender_device_id))?;
        if let Some(record) = &peer_record {
            if record.status == PeerStatus::UntrustedMismatch {
                return Err(Error::PeerIdentityMismatch {
                    device_id: sender_device_id.into(),
                });
            }
        }

        // An init header pins the claimed identity before anything else; a
        // mismatch marks the device and creates no session.
        if let (Some(init), Some(record)) = (&message.init, &peer_record) {
            let claimed = C::signing_public_bytes(&init.ik);
            if record.identity_key != claimed {
                let mut marked = record.clone();
                marked.status = PeerStatus::UntrustedMismatch;
                self.store.transaction(|tx| tx.put_peer(&marked))?;
                warn!(peer = %sender_device_id, "identity key mismatch");
                return Err(Error::PeerIdentityMismatch {
                    device_id: sender_device_id.into(),
                });
            }
        }

        self.load_sessions(sender_device_id)?;
        let mut entry = self.sessions.remove(sender_device_id).unwrap_or_default();
        let result = self.decrypt_with(&mut entry, sender_device_id, &message, wire, now);
        self.sessions.insert(sender_device_id.to_string(), entry);
        result
    }

    fn decrypt_with(
        &mut self,
        entry: &mut PeerSessions<C>,
        sender: &str,
        message: &WireMessage<C>,
        wire: &[u8],
        now: u64,
    ) -> Result<Vec<u8>> {
        // Active session first.
        if let Some(session) = entry.active.as_mut() {
            match session.decrypt_parsed(message, wire, now) {
                Ok(plaintext) => {
                    self.commit_sessions(sender, entry, CommitExtras::default())?;
                    return Ok(plaintext);
                }
                Err(Error::AuthenticationFailed) => {}
                Err(error) => return Err(error),
            }
        }

        // Then the draining session.
        if let Some(session) = entry.draining.as_mut() {
            match session.decrypt_parsed(message, wire, now) {
                Ok(plaintext) => {
                    // This decrypt is now the most recent one, so the
                    // sessions swap roles and the demotion clock restarts.
                    std::mem::swap(&mut entry.active, &mut entry.draining);
                    info!(peer = %sender, "promoted draining session");
                    self.commit_sessions(
                        sender,
                        entry,
                        CommitExtras {
                            draining_since: Some(Some(now)),
                            ..CommitExtras::default()
                        },
                    )?;
                    return Ok(plaintext);
                }
                Err(Error::AuthenticationFailed) => {}
                Err(error) => return Err(error),
            }
        }

        // Neither matched: a first message carrying an init header starts a
        // fresh receiver-path session.
        if message.init.is_some() {
            self.establish_inbound(entry, sender, message, wire, now)
        } else {
            Err(Error::AuthenticationFailed)
        }
    }

    fn establish_inbound(
        &mut self,
        entry: &mut PeerSessions<C>,
        sender: &str,
        message: &WireMessage<C>,
        wire: &[u8],
        now: u64,
    ) -> Result<Vec<u8>> {
        let init = message
            .init
            .as_ref()
            .ok_or(Error::ProtocolFormat("missing init header"))?;
        let identity = self.identity()?.clone();

        let (spk_record, opk_record) = self.store.transaction(|tx| {
            Ok((
                tx.spk(init.spk_id)?,
                match init.opk_id {
                    Some(id) => tx.opk(id)?,
                    None => None,
                },
            ))
        })?;
        let spk_record = spk_record.ok_or(Error::UnknownPreKey(init.spk_id))?;
        let spk = spk_from_record::<C>(&spk_record)?;
        let opk = match init.opk_id {
            Some(id) => Some(opk_from_record::<C>(
                &opk_record.ok_or(Error::UnknownPreKey(id))?,
            )?),
            None => None,
        };

        let (root_key, ad) = x3dh::respond(
            &identity,
            &self.device_id,
            sender,
            &spk,
            opk.as_ref(),
            init,
        )?;
        let mut session = Session::new_receiver(
            root_key,
            ad,
            spk.secret().clone(),
            spk.public().clone(),
            &self.config,
            now,
        );

        // Nothing commits unless the very first message decrypts.
        let plaintext = session.decrypt_parsed(message, wire, now)?;

        let had_active = entry.active.is_some();
        entry.draining = entry.active.take();
        entry.active = Some(session);

        self.commit_sessions(
            sender,
            entry,
            CommitExtras {
                pin_identity: Some(C::signing_public_bytes(&init.ik)),
                erase_opk: init.opk_id,
                draining_since: had_active.then_some(Some(now)),
            },
        )?;
        info!(peer = %sender, "inbound session established");
        Ok(plaintext)
    }

    /// Handle a response blob from the key server.
    pub fn handle_server_response(
        &mut self,
        request_id: u64,
        body: &[u8],
    ) -> Result<Vec<EngineEvent>> {
        let kind = self
            .pending
            .remove(&request_id)
            .ok_or_else(|| Error::TransportError("response for unknown request".into()))?;
        let response = protocol::parse_response::<C>(body)?;

        match (kind, response) {
            (PendingKind::Register, Response::Ack(MessageType::RegisterUser)) => {
                self.finish_registration()
            }
            (
                PendingKind::Register,
                Response::Error {
                    code: ErrorCode::UserAlreadyIn,
                    message,
                },
            ) => {
                // The server knows this user: drop the locally created one.
                self.identity = None;
                self.store.transaction(|tx| tx.delete_local_user())?;
                Err(Error::TransportError(format!(
                    "user already registered: {message}"
                )))
            }
            (PendingKind::DeleteUser, Response::Ack(MessageType::DeleteUser)) => {
                self.identity = None;
                self.sessions.clear();
                self.store.transaction(|tx| {
                    tx.delete_local_user()?;
                    for spk in tx.spks()? {
                        tx.delete_spk(spk.id)?;
                    }
                    for opk in tx.opks()? {
                        tx.delete_opk(opk.id)?;
                    }
                    for peer in tx.peers()? {
                        tx.delete_peer(&peer.device_id)?;
                    }
                    Ok(())
                })?;
                Ok(vec![EngineEvent::UserDeleted])
            }
            (PendingKind::PostSpk { spk_id }, Response::Ack(MessageType::PostSpk)) => {
                Ok(vec![EngineEvent::SpkPublished { spk_id }])
            }
            (PendingKind::PostOpks { count }, Response::Ack(MessageType::PostOpks)) => {
                Ok(vec![EngineEvent::OpksPublished { count }])
            }
            (PendingKind::Fetch { peer_device_id }, Response::PeerBundles(bundles)) => {
                self.finish_fetch(&peer_device_id, bundles)
            }
            (PendingKind::Fetch { peer_device_id }, Response::Error { code, message }) => {
                Ok(self.fail_fetch(
                    &peer_device_id,
                    Error::TransportError(format!("bundle fetch failed: {code:?}: {message}")),
                ))
            }
            (_, Response::Error { code, message }) => {
                Err(Error::TransportError(format!("{code:?}: {message}")))
            }
            (_, _) => Err(Error::TransportError("unexpected response type".into())),
        }
    }

    /// Report a transport failure (timeout, non-200) for an emitted request.
    pub fn server_request_failed(&mut self, request_id: u64, reason: &str) -> Vec<EngineEvent> {
        match self.pending.remove(&request_id) {
            Some(PendingKind::Fetch { peer_device_id }) => self.fail_fetch(
                &peer_device_id,
                Error::TransportError(reason.to_string()),
            ),
            _ => Vec::new(),
        }
    }

    /// Cancel an in-flight bundle fetch; queued encrypts fail `Cancelled`.
    pub fn cancel_fetch(&mut self, peer_device_id: &str) -> Vec<EngineEvent> {
        if let Some(request_id) = self.fetch_requests.get(peer_device_id).copied() {
            self.pending.remove(&request_id);
        }
        self.fail_fetch(peer_device_id, Error::Cancelled)
    }

    fn fail_fetch(&mut self, peer_device_id: &str, error: Error) -> Vec<EngineEvent> {
        self.fetch_requests.remove(peer_device_id);
        let queue = self.fetch_queues.remove(peer_device_id).unwrap_or_default();
        queue
            .into_iter()
            .map(|_| EngineEvent::EncryptFailed {
                peer_device_id: peer_device_id.to_string(),
                error: error.clone(),
            })
            .collect()
    }

    fn finish_registration(&mut self) -> Result<Vec<EngineEvent>> {
        let identity = self.identity()?.clone();
        let now = now_ms();

        let spk = SignedPreKey::generate(1, &identity, now);
        let opks: Vec<OneTimePreKey<C>> = (1..=u32::from(self.config.opk_batch_size))
            .map(OneTimePreKey::generate)
            .collect();

        let spk_record = spk_to_record::<C>(&spk);
        let opk_records: Vec<OpkRecord> = opks.iter().map(|o| opk_to_record::<C>(o)).collect();
        let device_id = self.device_id.clone();
        self.store.transaction(|tx| {
            let mut user = tx
                .local_user()?
                .ok_or_else(|| Error::Storage("local user disappeared".into()))?;
            debug_assert_eq!(user.device_id, device_id);
            user.registered = true;
            tx.put_local_user(&user)?;
            tx.put_spk(&spk_record)?;
            for record in &opk_records {
                tx.put_opk(record)?;
            }
            Ok(())
        })?;

        let spk_body = protocol::encode_post_spk::<C>(&spk);
        let opk_body = protocol::encode_post_opks::<C>(&opks);
        self.push_request(PendingKind::PostSpk { spk_id: spk.id }, spk_body);
        self.push_request(
            PendingKind::PostOpks {
                count: opks.len() as u16,
            },
            opk_body,
        );
        info!(device = %self.device_id, "user registered, publishing pre-keys");
        Ok(vec![EngineEvent::UserRegistered])
    }

    fn finish_fetch(
        &mut self,
        peer_device_id: &str,
        bundles: Vec<PeerBundle<C>>,
    ) -> Result<Vec<EngineEvent>> {
        self.fetch_requests.remove(peer_device_id);
        let queue = self.fetch_queues.remove(peer_device_id).unwrap_or_default();
        let mut events = Vec::new();

        let Some(bundle) = bundles.iter().find(|b| b.device_id == peer_device_id) else {
            for _ in &queue {
                events.push(EngineEvent::EncryptFailed {
                    peer_device_id: peer_device_id.to_string(),
                    error: Error::TransportError("no bundle for device".into()),
                });
            }
            return Ok(events);
        };

        match self.establish_outbound(bundle) {
            Ok(fresh) => {
                if fresh {
                    events.push(EngineEvent::SessionEstablished {
                        peer_device_id: peer_device_id.to_string(),
                    });
                }
                for plaintext in queue {
                    let mut entry = self.sessions.remove(peer_device_id).unwrap_or_default();
                    let encrypted = entry
                        .active
                        .as_mut()
                        .map(|session| session.encrypt(&plaintext));
                    let outcome = match encrypted {
                        Some(result) => result.and_then(|wire| {
                            self.commit_sessions(peer_device_id, &entry, CommitExtras::default())
                                .map(|_| wire)
                        }),
                        None => Err(Error::Storage("session vanished after establish".into())),
                    };
                    self.sessions.insert(peer_device_id.to_string(), entry);
                    events.push(match outcome {
                        Ok(wire) => EngineEvent::MessageEncrypted {
                            peer_device_id: peer_device_id.to_string(),
                            wire,
                        },
                        Err(error) => EngineEvent::EncryptFailed {
                            peer_device_id: peer_device_id.to_string(),
                            error,
                        },
                    });
                }
            }
            Err(error) => {
                for _ in &queue {
                    events.push(EngineEvent::EncryptFailed {
                        peer_device_id: peer_device_id.to_string(),
                        error: error.clone(),
                    });
                }
            }
        }

        // The fetch may have returned bundles for further devices of the
        // same user; establish sessions for them as well.
        for other in bundles.iter().filter(|b| b.device_id != peer_device_id) {
            match self.establish_outbound(other) {
                Ok(true) => events.push(EngineEvent::SessionEstablished {
                    peer_device_id: other.device_id.clone(),
                }),
                Ok(false) => {}
                Err(error) => {
                    warn!(peer = %other.device_id, %error, "skipping bundle");
                }
            }
        }
        Ok(events)
    }

    /// Sender-path establishment. Returns false when an existing session is
    /// kept because the fresh bundle carried no OPK.
    fn establish_outbound(&mut self, bundle: &PeerBundle<C>) -> Result<bool> {
        let identity = self.identity()?.clone();
        let now = now_ms();

        self.store_peer_device(&bundle.device_id, &C::signing_public_bytes(&bundle.ik))?;

        self.load_sessions(&bundle.device_id)?;
        let mut entry = self.sessions.remove(&bundle.device_id).unwrap_or_default();

        if entry.active.is_some() && bundle.opk.is_none() {
            // No forward-secrecy gain over what we already have.
            self.sessions.insert(bundle.device_id.clone(), entry);
            return Ok(false);
        }

        let result = x3dh::initiate(&identity, &self.device_id, bundle).map(|keys| {
            let had_active = entry.active.is_some();
            entry.draining = entry.active.take();
            entry.active = Some(Session::new_initiator(keys, &self.config, now));
            had_active
        });

        match result {
            Ok(had_active) => {
                // The new session itself is persisted on first use; only a
                // demoted predecessor must move slots now.
                if had_active {
                    self.commit_sessions(
                        &bundle.device_id,
                        &entry,
                        CommitExtras {
                            draining_since: Some(Some(now)),
                            ..CommitExtras::default()
                        },
                    )?;
                }
                self.sessions.insert(bundle.device_id.clone(), entry);
                info!(peer = %bundle.device_id, "outbound session established");
                Ok(true)
            }
            Err(error) => {
                self.sessions.insert(bundle.device_id.clone(), entry);
                Err(error)
            }
        }
    }

    /// Pin-or-check a peer identity; returns the stable row id.
    pub fn store_peer_device(&mut self, device_id: &str, identity_key: &[u8]) -> Result<u64> {
        enum Pin {
            Ok(u64),
            Mismatch,
        }
        let outcome = self.store.transaction(|tx| match tx.peer(device_id)? {
            Some(mut record) => {
                if record.identity_key != identity_key {
                    record.status = PeerStatus::UntrustedMismatch;
                    tx.put_peer(&record)?;
                    Ok(Pin::Mismatch)
                } else if record.status == PeerStatus::UntrustedMismatch {
                    Ok(Pin::Mismatch)
                } else {
                    Ok(Pin::Ok(record.row_id))
                }
            }
            None => {
                let row_id = tx.put_peer(&PeerRecord {
                    device_id: device_id.to_string(),
                    identity_key: identity_key.to_vec(),
                    status: PeerStatus::Untrusted,
                    row_id: 0,
                    draining_since_ms: None,
                })?;
                Ok(Pin::Ok(row_id))
            }
        })?;
        match outcome {
            Pin::Ok(row_id) => Ok(row_id),
            Pin::Mismatch => Err(Error::PeerIdentityMismatch {
                device_id: device_id.into(),
            }),
        }
    }

    /// Refill the server's OPK pool when it reports a low remaining count.
    pub fn update_server_opk_count(&mut self, remaining: u16) -> Result<()> {
        self.identity()?;
        if remaining >= self.config.opk_server_low_limit {
            return Ok(());
        }
        let first_id = self.store.transaction(|tx| tx.max_opk_id())? + 1;
        let opks: Vec<OneTimePreKey<C>> = (first_id..first_id + u32::from(self.config.opk_batch_size))
            .map(OneTimePreKey::generate)
            .collect();
        let records: Vec<OpkRecord> = opks.iter().map(|o| opk_to_record::<C>(o)).collect();
        self.store.transaction(|tx| {
            for record in &records {
                tx.put_opk(record)?;
            }
            Ok(())
        })?;
        let body = protocol::encode_post_opks::<C>(&opks);
        self.push_request(
            PendingKind::PostOpks {
                count: opks.len() as u16,
            },
            body,
        );
        info!(count = opks.len(), "refilling one-time pre-keys");
        Ok(())
    }

    /// Periodic housekeeping: SPK rotation, expired-SPK erasure and
    /// draining-session cleanup. Publications land in the outbox.
    pub fn maintenance(&mut self, now_ms: u64) -> Result<()> {
        if let Some(identity) = self.identity.clone() {
            let registered = self
                .store
                .transaction(|tx| tx.local_user())?
                .is_some_and(|user| user.registered);
            if registered {
                let spks = self.store.transaction(|tx| tx.spks())?;
                let newest = spks.iter().map(|s| s.created_at_ms).max().unwrap_or(0);
                if now_ms.saturating_sub(newest) >= self.config.spk_lifetime_ms {
                    let next_id = spks.iter().map(|s| s.id).max().unwrap_or(0) + 1;
                    let spk = SignedPreKey::generate(next_id, &identity, now_ms);
                    let record = spk_to_record::<C>(&spk);
                    self.store.transaction(|tx| tx.put_spk(&record))?;
                    let body = protocol::encode_post_spk::<C>(&spk);
                    self.push_request(PendingKind::PostSpk { spk_id: spk.id }, body);
                    info!(spk_id = next_id, "rotating signed pre-key");
                }

                // Superseded SPKs past their grace period are erased.
                let cutoff = self.config.spk_lifetime_ms + self.config.spk_grace_ms;
                let newest_id = spks
                    .iter()
                    .max_by_key(|s| s.created_at_ms)
                    .map(|s| s.id);
                let expired: Vec<u32> = spks
                    .iter()
                    .filter(|s| {
                        Some(s.id) != newest_id
                            && now_ms.saturating_sub(s.created_at_ms) >= cutoff
                    })
                    .map(|s| s.id)
                    .collect();
                if !expired.is_empty() {
                    self.store.transaction(|tx| {
                        for id in &expired {
                            tx.delete_spk(*id)?;
                        }
                        Ok(())
                    })?;
                }
            }
        }

        // Draining sessions past their grace period are erased.
        let peers = self.store.transaction(|tx| tx.peers())?;
        for peer in peers {
            let Some(since) = peer.draining_since_ms else {
                continue;
            };
            if now_ms.saturating_sub(since) < self.config.session_draining_grace_ms {
                continue;
            }
            let mut cleared = peer.clone();
            cleared.draining_since_ms = None;
            self.store.transaction(|tx| {
                tx.delete_session(&peer.device_id, SessionSlot::Draining)?;
                tx.put_peer(&cleared)?;
                Ok(())
            })?;
            if let Some(entry) = self.sessions.get_mut(&peer.device_id) {
                entry.draining = None;
            }
            debug!(peer = %peer.device_id, "erased drained session");
        }

        Ok(())
    }

    /// Whether a session occupies the given slot for this peer.
    pub fn has_session(&mut self, peer_device_id: &str, slot: SessionSlot) -> Result<bool> {
        self.load_sessions(peer_device_id)?;
        Ok(self.sessions.get(peer_device_id).is_some_and(|e| match slot {
            SessionSlot::Active => e.active.is_some(),
            SessionSlot::Draining => e.draining.is_some(),
        }))
    }

    /// Number of skipped message keys currently cached for a peer's active
    /// session. Diagnostic.
    pub fn cached_skipped_keys(&self, peer_device_id: &str) -> usize {
        self.sessions
            .get(peer_device_id)
            .and_then(|e| e.active.as_ref())
            .map_or(0, |s| s.cached_skipped_keys())
    }

    pub fn peer_record(&mut self, device_id: &str) -> Result<Option<PeerRecord>> {
        self.store.transaction(|tx| tx.peer(device_id))
    }

    fn identity(&self) -> Result<&IdentityKeyPair<C>> {
        self.identity
            .as_ref()
            .ok_or_else(|| Error::Storage("local user not provisioned".into()))
    }

    fn push_request(&mut self, kind: PendingKind, body: Vec<u8>) -> u64 {
        self.next_request_id += 1;
        let request_id = self.next_request_id;
        self.pending.insert(request_id, kind);
        self.outbox.push_back(ServerRequest { request_id, body });
        request_id
    }

    fn load_sessions(&mut self, peer_device_id: &str) -> Result<()> {
        if self.sessions.contains_key(peer_device_id) {
            return Ok(());
        }
        let (active_blob, draining_blob) = self.store.transaction(|tx| {
            Ok((
                tx.session(peer_device_id, SessionSlot::Active)?,
                tx.session(peer_device_id, SessionSlot::Draining)?,
            ))
        })?;
        if active_blob.is_none() && draining_blob.is_none() {
            return Ok(());
        }
        let entry = PeerSessions {
            active: active_blob.as_deref().map(session_from_blob).transpose()?,
            draining: draining_blob.as_deref().map(session_from_blob).transpose()?,
        };
        self.sessions.insert(peer_device_id.to_string(), entry);
        Ok(())
    }

    /// Persist both session slots plus any establishment side effects in a
    /// single transaction.
    fn commit_sessions(
        &mut self,
        peer_device_id: &str,
        entry: &PeerSessions<C>,
        extras: CommitExtras,
    ) -> Result<()> {
        let active_blob = entry.active.as_ref().map(session_to_blob).transpose()?;
        let draining_blob = entry.draining.as_ref().map(session_to_blob).transpose()?;
        self.store.transaction(|tx| {
            if let Some(identity_key) = &extras.pin_identity {
                match tx.peer(peer_device_id)? {
                    Some(record) => {
                        if record.identity_key != *identity_key {
                            return Err(Error::PeerIdentityMismatch {
                                device_id: peer_device_id.into(),
                            });
                        }
                    }
                    None => {
                        tx.put_peer(&PeerRecord {
                            device_id: peer_device_id.to_string(),
                            identity_key: identity_key.clone(),
                            status: PeerStatus::Untrusted,
                            row_id: 0,
                            draining_since_ms: None,
                        })?;
                    }
                }
            }
            if let Some(opk_id) = extras.erase_opk {
                tx.delete_opk(opk_id)?;
            }
            if let Some(draining_since) = extras.draining_since {
                if let Some(mut record) = tx.peer(peer_device_id)? {
                    record.draining_since_ms = draining_since;
                    tx.put_peer(&record)?;
                }
            }
            match &active_blob {
                Some(blob) => tx.put_session(peer_device_id, SessionSlot::Active, blob)?,
                None => tx.delete_session(peer_device_id, SessionSlot::Active)?,
            }
            match &draining_blob {
                Some(blob) => tx.put_session(peer_device_id, SessionSlot::Draining, blob)?,
                None => tx.delete_session(peer_device_id, SessionSlot::Draining)?,
            }
            Ok(())
        })
    }
}

/// Optional side effects committed together with a session write.
#[derive(Default)]
struct CommitExtras {
    pin_identity: Option<Vec<u8>>,
    erase_opk: Option<u32>,
    /// `Some(value)` updates the peer's draining timestamp to `value`.
    draining_since: Option<Option<u64>>,
}

fn session_to_blob<C: CurveSuite>(session: &Session<C>) -> Result<Vec<u8>> {
    serde_json::to_vec(&session.to_record()).map_err(|e| Error::Storage(e.to_string()))
}

fn session_from_blob<C: CurveSuite>(blob: &[u8]) -> Result<Session<C>> {
    let record = serde_json::from_slice(blob).map_err(|e| Error::Storage(e.to_string()))?;
    Session::from_record(record)
}

fn spk_to_record<C: CurveSuite>(spk: &SignedPreKey<C>) -> SpkRecord {
    SpkRecord {
        id: spk.id,
        secret: C::dh_secret_bytes(spk.secret()).to_vec(),
        public: C::dh_public_bytes(spk.public()),
        signature: C::signature_bytes(spk.signature()),
        created_at_ms: spk.created_at_ms,
    }
}

fn spk_from_record<C: CurveSuite>(record: &SpkRecord) -> Result<SignedPreKey<C>> {
    Ok(SignedPreKey::from_parts(
        record.id,
        C::dh_secret_from_bytes(&record.secret)?,
        C::dh_public_from_bytes(&record.public)?,
        C::signature_from_bytes(&record.signature)?,
        record.created_at_ms,
    ))
}

fn opk_to_record<C: CurveSuite>(opk: &OneTimePreKey<C>) -> OpkRecord {
    OpkRecord {
        id: opk.id,
        secret: C::dh_secret_bytes(opk.secret()).to_vec(),
        public: C::dh_public_bytes(opk.public()),
    }
}

fn opk_from_record<C: CurveSuite>(record: &OpkRecord) -> Result<OneTimePreKey<C>> {
    Ok(OneTimePreKey::from_parts(
        record.id,
        C::dh_secret_from_bytes(&record.secret)?,
        C::dh_public_from_bytes(&record.public)?,
    ))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::C255;
    use crate::protocol::{encode_ack, encode_error, encode_peer_bundles};
    use crate::storage::MemoryStore;

    type TestEngine = Engine<C255, MemoryStore>;

    fn engine(device_id: &str) -> TestEngine {
        Engine::new(device_id, Config::default(), MemoryStore::new()).unwrap()
    }

    /// Drive registration to completion by acking every emitted request.
    fn registered_engine(device_id: &str) -> TestEngine {
        let mut engine = engine(device_id);
        engine.register_user().unwrap();
        let register = engine.next_server_request().unwrap();
        let events = engine
            .handle_server_response(
                register.request_id,
                &encode_ack::<C255>(MessageType::RegisterUser),
            )
            .unwrap();
        assert_eq!(events, vec![EngineEvent::UserRegistered]);

        let post_spk = engine.next_server_request().unwrap();
        engine
            .handle_server_response(post_spk.request_id, &encode_ack::<C255>(MessageType::PostSpk))
            .unwrap();
        let post_opks = engine.next_server_request().unwrap();
        engine
            .handle_server_response(
                post_opks.request_id,
                &encode_ack::<C255>(MessageType::PostOpks),
            )
            .unwrap();
        engine
    }

    /// Read this engine's published bundle straight out of its store.
    fn bundle_of(engine: &mut TestEngine, take_opk: bool) -> PeerBundle<C255> {
        let identity = engine.identity().unwrap().clone();
        let (spk_record, opk_record) = engine
            .store
            .transaction(|tx| {
                let spk = tx.spks()?.into_iter().next();
                let opk = tx.opk(1)?;
                Ok((spk, opk))
            })
            .unwrap();
        let spk_record = spk_record.unwrap();
        PeerBundle {
            device_id: engine.device_id().to_string(),
            ik: identity.public().clone(),
            spk: C255::dh_public_from_bytes(&spk_record.public).unwrap(),
            spk_id: spk_record.id,
            spk_signature: C255::signature_from_bytes(&spk_record.signature).unwrap(),
            opk: if take_opk {
                let opk_record = opk_record.unwrap();
                Some((
                    opk_record.id,
                    C255::dh_public_from_bytes(&opk_record.public).unwrap(),
                ))
            } else {
                None
            },
        }
    }

    #[test]
    fn registration_publishes_prekeys() {
        let mut engine = engine("alice@1");
        engine.register_user().unwrap();
        let register = engine.next_server_request().unwrap();
        engine
            .handle_server_response(
                register.request_id,
                &encode_ack::<C255>(MessageType::RegisterUser),
            )
            .unwrap();

        let post_spk = engine.next_server_request().unwrap();
        match protocol::parse_request::<C255>(&post_spk.body).unwrap() {
            protocol::Request::PostSpk { spk_id, .. } => assert_eq!(spk_id, 1),
            _ => panic!("expected SPK publication"),
        }
        let post_opks = engine.next_server_request().unwrap();
        match protocol::parse_request::<C255>(&post_opks.body).unwrap() {
            protocol::Request::PostOpks { opks } => assert_eq!(opks.len(), 100),
            _ => panic!("expected OPK publication"),
        }
    }

    #[test]
    fn user_already_in_deletes_local_user() {
        let mut engine = engine("alice@1");
        engine.register_user().unwrap();
        let register = engine.next_server_request().unwrap();
        let result = engine.handle_server_response(
            register.request_id,
            &encode_error::<C255>(ErrorCode::UserAlreadyIn, "exists"),
        );
        assert!(matches!(result, Err(Error::TransportError(_))));

        // The locally created user is gone; a fresh registration works.
        assert!(engine.store.transaction(|tx| tx.local_user()).unwrap().is_none());
        engine.register_user().unwrap();
    }

    #[test]
    fn opk_refill_extends_ids() {
        let mut engine = registered_engine("alice@1");
        engine.update_server_opk_count(80).unwrap();
        assert!(engine.next_server_request().is_none());

        engine.update_server_opk_count(79).unwrap();
        let refill = engine.next_server_request().unwrap();
        match protocol::parse_request::<C255>(&refill.body).unwrap() {
            protocol::Request::PostOpks { opks } => {
                assert_eq!(opks.len(), 100);
                assert_eq!(opks[0].0, 101);
            }
            _ => panic!("expected OPK publication"),
        }
    }

    #[test]
    fn spk_rotation_and_grace_erasure() {
        let mut engine = registered_engine("alice@1");
        let config = Config::default();
        let base = now_ms();

        engine.maintenance(base + config.spk_lifetime_ms).unwrap();
        let rotate = engine.next_server_request().unwrap();
        match protocol::parse_request::<C255>(&rotate.body).unwrap() {
            protocol::Request::PostSpk { spk_id, .. } => assert_eq!(spk_id, 2),
            _ => panic!("expected SPK publication"),
        }
        let count = engine.store.transaction(|tx| Ok(tx.spks()?.len())).unwrap();
        assert_eq!(count, 2);

        // The superseded SPK survives its grace period, then is erased.
        engine
            .maintenance(base + config.spk_lifetime_ms + config.spk_grace_ms)
            .unwrap();
        let ids: Vec<u32> = engine
            .store
            .transaction(|tx| Ok(tx.spks()?.into_iter().map(|s| s.id).collect()))
            .unwrap();
        assert!(!ids.contains(&1));
        assert!(ids.contains(&2));
    }

    #[test]
    fn cancelled_fetch_fails_queued_encrypts() {
        let mut alice = registered_engine("alice@1");
        assert!(matches!(
            alice.encrypt("bob@1", b"one").unwrap(),
            EncryptOutcome::Queued
        ));
        assert!(matches!(
            alice.encrypt("bob@1", b"two").unwrap(),
            EncryptOutcome::Queued
        ));

        let events = alice.cancel_fetch("bob@1");
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|event| matches!(
            event,
            EngineEvent::EncryptFailed {
                error: Error::Cancelled,
                ..
            }
        )));
    }

    #[test]
    fn transport_failure_fails_queued_encrypts() {
        let mut alice = registered_engine("alice@1");
        alice.encrypt("bob@1", b"one").unwrap();
        let fetch = alice.next_server_request().unwrap();
        let events = alice.server_request_failed(fetch.request_id, "timeout");
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            EngineEvent::EncryptFailed {
                error: Error::TransportError(_),
                ..
            }
        ));
    }

    #[test]
    fn used_opk_is_erased_and_rejected_on_reuse() {
        let mut bob = registered_engine("bob@1");
        let bundle = bundle_of(&mut bob, true);
        let opk_id = bundle.opk.as_ref().unwrap().0;

        // First initiator consumes the OPK.
        let alice = IdentityKeyPair::<C255>::generate();
        let keys = x3dh::initiate(&alice, "alice@1", &bundle).unwrap();
        let mut session = Session::new_initiator(keys, &Config::default(), 0);
        let wire = session.encrypt(b"hello").unwrap();
        assert_eq!(bob.decrypt("alice@1", &wire).unwrap(), b"hello");
        assert!(bob.store.transaction(|tx| tx.opk(opk_id)).unwrap().is_none());

        // A second init referencing the same OPK id is rejected.
        let mallory = IdentityKeyPair::<C255>::generate();
        let keys = x3dh::initiate(&mallory, "mallory@1", &bundle).unwrap();
        let mut session = Session::new_initiator(keys, &Config::default(), 0);
        let wire = session.encrypt(b"again").unwrap();
        assert_eq!(
            bob.decrypt("mallory@1", &wire),
            Err(Error::UnknownPreKey(opk_id))
        );
    }

    #[test]
    fn unknown_spk_id_is_rejected() {
        let mut bob = registered_engine("bob@1");
        let mut bundle = bundle_of(&mut bob, false);
        bundle.spk_id = 999;

        let alice = IdentityKeyPair::<C255>::generate();
        let keys = x3dh::initiate(&alice, "alice@1", &bundle).unwrap();
        let mut session = Session::new_initiator(keys, &Config::default(), 0);
        let wire = session.encrypt(b"hello").unwrap();
        assert_eq!(bob.decrypt("alice@1", &wire), Err(Error::UnknownPreKey(999)));
    }

    #[test]
    fn outbound_without_opk_keeps_existing_session() {
        let mut bob = registered_engine("bob@1");
        let mut alice = registered_engine("alice@1");

        let with_opk = bundle_of(&mut bob, true);
        assert!(alice.establish_outbound(&with_opk).unwrap());
        // A bundle without an OPK offers no forward-secrecy gain.
        let without_opk = bundle_of(&mut bob, false);
        assert!(!alice.establish_outbound(&without_opk).unwrap());
        // One with an OPK replaces the session and demotes the old one.
        assert!(alice.establish_outbound(&with_opk).unwrap());
        assert!(alice.has_session("bob@1", SessionSlot::Draining).unwrap());
    }

    #[test]
    fn response_to_unknown_request_is_rejected() {
        let mut alice = registered_engine("alice@1");
        let result =
            alice.handle_server_response(4242, &encode_peer_bundles::<C255>(&[]));
        assert!(matches!(result, Err(Error::TransportError(_))));
    }
}
