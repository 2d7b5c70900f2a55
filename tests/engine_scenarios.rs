//! End-to-end scenarios over two engines and a simulated key server.
//!
//! The server speaks the real wire codec: it parses the engines' request
//! blobs and answers with encoded responses, so these tests cover the whole
//! path from registration through establishment to ratcheted messaging.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use quietwire::protocol::{self, ErrorCode, MessageType, Request};
use quietwire::{
    C255, Config, CurveSuite, EncryptOutcome, Engine, EngineEvent, Error, MemoryStore, PeerBundle,
    PeerStatus, SessionSlot,
};

type Suite = C255;
type TestEngine = Engine<Suite, MemoryStore>;

struct ServerUser {
    ik: <Suite as CurveSuite>::SigningPublic,
    spk: Option<(u32, <Suite as CurveSuite>::DhPublic, <Suite as CurveSuite>::Signature)>,
    opks: Vec<(u32, <Suite as CurveSuite>::DhPublic)>,
}

/// Minimal key server: registration, pre-key publication and bundle
/// fetches, with one-time pre-keys handed out exactly once.
#[derive(Default)]
struct KeyServer {
    users: HashMap<String, ServerUser>,
}

impl KeyServer {
    fn handle(&mut self, from_device: &str, body: &[u8]) -> Vec<u8> {
        match protocol::parse_request::<Suite>(body).expect("well-formed request") {
            Request::RegisterUser { ik } => {
                if self.users.contains_key(from_device) {
                    return protocol::encode_error::<Suite>(
                        ErrorCode::UserAlreadyIn,
                        "already registered",
                    );
                }
                self.users.insert(
                    from_device.to_string(),
                    ServerUser {
                        ik,
                        spk: None,
                        opks: Vec::new(),
                    },
                );
                protocol::encode_ack::<Suite>(MessageType::RegisterUser)
            }
            Request::DeleteUser => {
                self.users.remove(from_device);
                protocol::encode_ack::<Suite>(MessageType::DeleteUser)
            }
            Request::PostSpk {
                spk,
                signature,
                spk_id,
            } => {
                let user = self.users.get_mut(from_device).expect("registered");
                user.spk = Some((spk_id, spk, signature));
                protocol::encode_ack::<Suite>(MessageType::PostSpk)
            }
            Request::PostOpks { opks } => {
                let user = self.users.get_mut(from_device).expect("registered");
                user.opks.extend(opks);
                protocol::encode_ack::<Suite>(MessageType::PostOpks)
            }
            Request::GetPeerBundles { device_ids } => {
                let bundles: Vec<PeerBundle<Suite>> = device_ids
                    .iter()
                    .filter_map(|device_id| {
                        let user = self.users.get_mut(device_id)?;
                        let (spk_id, spk, signature) = user.spk.clone()?;
                        let opk = if user.opks.is_empty() {
                            None
                        } else {
                            Some(user.opks.remove(0))
                        };
                        Some(PeerBundle {
                            device_id: device_id.clone(),
                            ik: user.ik.clone(),
                            spk,
                            spk_id,
                            spk_signature: signature,
                            opk,
                        })
                    })
                    .collect();
                protocol::encode_peer_bundles::<Suite>(&bundles)
            }
        }
    }
}

/// Post every outbox request to the server and feed the responses back.
fn pump(engine: &mut TestEngine, server: &mut KeyServer) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    let device = engine.device_id().to_string();
    while let Some(request) = engine.next_server_request() {
        let response = server.handle(&device, &request.body);
        events.extend(
            engine
                .handle_server_response(request.request_id, &response)
                .expect("response handled"),
        );
    }
    events
}

fn registered(device_id: &str, server: &mut KeyServer) -> TestEngine {
    let mut engine = Engine::new(device_id, Config::default(), MemoryStore::new()).unwrap();
    engine.register_user().unwrap();
    pump(&mut engine, server);
    engine
}

fn encrypted_wires(events: &[EngineEvent]) -> Vec<Vec<u8>> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::MessageEncrypted { wire, .. } => Some(wire.clone()),
            _ => None,
        })
        .collect()
}

fn ready(outcome: EncryptOutcome) -> Vec<u8> {
    match outcome {
        EncryptOutcome::Ready(wire) => wire,
        EncryptOutcome::Queued => panic!("expected an established session"),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

const HOUR_MS: u64 = 60 * 60 * 1000;

#[test]
fn first_message_establishes_and_decrypts() {
    let mut server = KeyServer::default();
    let mut alice = registered("alice@1", &mut server);
    let mut bob = registered("bob@1", &mut server);

    // No prior session: the engine fetches the bundle and queues.
    assert!(matches!(
        alice.encrypt("bob@1", b"Hello Bob").unwrap(),
        EncryptOutcome::Queued
    ));
    let events = pump(&mut alice, &mut server);
    assert!(events.contains(&EngineEvent::SessionEstablished {
        peer_device_id: "bob@1".into()
    }));
    let wires = encrypted_wires(&events);
    assert_eq!(wires.len(), 1);

    // Curve byte, then the init flag on the first message.
    assert_eq!(wires[0][0], 0x01);
    assert_eq!(wires[0][1], 0x01);

    assert_eq!(bob.decrypt("alice@1", &wires[0]).unwrap(), b"Hello Bob");

    let reply = ready(bob.encrypt("alice@1", b"Hello Alice").unwrap());
    assert_eq!(alice.decrypt("bob@1", &reply).unwrap(), b"Hello Alice");
}

#[test]
fn queued_encrypts_preserve_submission_order() {
    let mut server = KeyServer::default();
    let mut alice = registered("alice@1", &mut server);
    let mut bob = registered("bob@1", &mut server);

    for text in ["one", "two", "three"] {
        assert!(matches!(
            alice.encrypt("bob@1", text.as_bytes()).unwrap(),
            EncryptOutcome::Queued
        ));
    }
    let wires = encrypted_wires(&pump(&mut alice, &mut server));
    assert_eq!(wires.len(), 3);
    for (wire, text) in wires.iter().zip(["one", "two", "three"]) {
        assert_eq!(bob.decrypt("alice@1", wire).unwrap(), text.as_bytes());
    }
}

#[test]
fn odd_even_reordering_decrypts_each_exactly_once() {
    let mut server = KeyServer::default();
    let mut alice = registered("alice@1", &mut server);
    let mut bob = registered("bob@1", &mut server);

    // M1..M10, M1 via the fetch queue, the rest directly.
    alice.encrypt("bob@1", b"M1").unwrap();
    let mut wires = encrypted_wires(&pump(&mut alice, &mut server));
    for i in 2..=10 {
        wires.push(ready(
            alice.encrypt("bob@1", format!("M{i}").as_bytes()).unwrap(),
        ));
    }

    // Odd messages first, then the evens newest-first.
    for index in [0usize, 2, 4, 6, 8] {
        let expected = format!("M{}", index + 1);
        assert_eq!(
            bob.decrypt("alice@1", &wires[index]).unwrap(),
            expected.as_bytes()
        );
        assert!(bob.cached_skipped_keys("alice@1") <= 5);
    }
    for index in [9usize, 7, 5, 3, 1] {
        let expected = format!("M{}", index + 1);
        assert_eq!(
            bob.decrypt("alice@1", &wires[index]).unwrap(),
            expected.as_bytes()
        );
        assert!(bob.cached_skipped_keys("alice@1") <= 5);
    }

    // Each message decrypts exactly once.
    assert_eq!(
        bob.decrypt("alice@1", &wires[3]),
        Err(Error::OutOfOrderOrReplay)
    );
    assert_eq!(bob.cached_skipped_keys("alice@1"), 0);
}

#[test]
fn skipping_beyond_the_chain_limit_fails() {
    let mut server = KeyServer::default();
    let mut alice = registered("alice@1", &mut server);
    let mut bob = registered("bob@1", &mut server);

    alice.encrypt("bob@1", b"M1").unwrap();
    let wires = encrypted_wires(&pump(&mut alice, &mut server));
    assert_eq!(bob.decrypt("alice@1", &wires[0]).unwrap(), b"M1");

    // Bob replies, but Alice never receives it, so her chain keeps going.
    let _lost_reply = ready(bob.encrypt("alice@1", b"R1").unwrap());

    let limit = Config::default().max_message_skip_per_chain as usize;
    let mut last = Vec::new();
    for i in 0..=limit + 1 {
        last = ready(alice.encrypt("bob@1", format!("M{}", i + 2).as_bytes()).unwrap());
    }

    // The gap now exceeds the per-chain skip limit.
    assert_eq!(bob.decrypt("alice@1", &last), Err(Error::TooManySkipped));
}

#[test]
fn crossed_establishment_demotes_then_expires_the_loser() {
    let mut server = KeyServer::default();
    let mut alice = registered("alice@1", &mut server);
    let mut bob = registered("bob@1", &mut server);

    // Both initiate simultaneously.
    alice.encrypt("bob@1", b"from alice").unwrap();
    bob.encrypt("alice@1", b"from bob").unwrap();
    let alice_wires = encrypted_wires(&pump(&mut alice, &mut server));
    let bob_wires = encrypted_wires(&pump(&mut bob, &mut server));

    // Each side accepts the other's init; its own initiated session is
    // demoted to draining.
    assert_eq!(alice.decrypt("bob@1", &bob_wires[0]).unwrap(), b"from bob");
    assert_eq!(bob.decrypt("alice@1", &alice_wires[0]).unwrap(), b"from alice");
    assert!(alice.has_session("bob@1", SessionSlot::Draining).unwrap());
    assert!(bob.has_session("alice@1", SessionSlot::Draining).unwrap());

    // Traffic converges onto one session.
    let m = ready(alice.encrypt("bob@1", b"settling").unwrap());
    assert_eq!(bob.decrypt("alice@1", &m).unwrap(), b"settling");
    let reply = ready(bob.encrypt("alice@1", b"settled").unwrap());
    assert_eq!(alice.decrypt("bob@1", &reply).unwrap(), b"settled");

    // 25 hours later the losers are erased.
    let later = now_ms() + 25 * HOUR_MS;
    alice.maintenance(later).unwrap();
    bob.maintenance(later).unwrap();
    assert!(!alice.has_session("bob@1", SessionSlot::Draining).unwrap());
    assert!(!bob.has_session("alice@1", SessionSlot::Draining).unwrap());

    // And messaging still works.
    let m = ready(alice.encrypt("bob@1", b"after cleanup").unwrap());
    assert_eq!(bob.decrypt("alice@1", &m).unwrap(), b"after cleanup");
}

#[test]
fn tampered_ciphertext_fails_then_original_succeeds() {
    let mut server = KeyServer::default();
    let mut alice = registered("alice@1", &mut server);
    let mut bob = registered("bob@1", &mut server);

    alice.encrypt("bob@1", b"intact").unwrap();
    let wires = encrypted_wires(&pump(&mut alice, &mut server));

    let mut tampered = wires[0].clone();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    assert_eq!(
        bob.decrypt("alice@1", &tampered),
        Err(Error::AuthenticationFailed)
    );

    // State unchanged: the original bytes still decrypt.
    assert_eq!(bob.decrypt("alice@1", &wires[0]).unwrap(), b"intact");
}

#[test]
fn identity_key_mismatch_is_pinned_and_sticky() {
    let mut server = KeyServer::default();
    let mut alice = registered("alice@1", &mut server);
    let mut bob = registered("bob@1", &mut server);

    // Pin bob's identity through a normal exchange.
    alice.encrypt("bob@1", b"hello").unwrap();
    let wires = encrypted_wires(&pump(&mut alice, &mut server));
    assert_eq!(bob.decrypt("alice@1", &wires[0]).unwrap(), b"hello");
    let real_reply = ready(bob.encrypt("alice@1", b"reply").unwrap());

    // A different identity claims to be bob@1.
    let mut mallory = registered("mallory@1", &mut server);
    mallory.encrypt("alice@1", b"trust me").unwrap();
    let mallory_wires = encrypted_wires(&pump(&mut mallory, &mut server));

    assert_eq!(
        alice.decrypt("bob@1", &mallory_wires[0]),
        Err(Error::PeerIdentityMismatch {
            device_id: "bob@1".into()
        })
    );
    assert_eq!(
        alice.peer_record("bob@1").unwrap().unwrap().status,
        PeerStatus::UntrustedMismatch
    );

    // From now on everything from that device surfaces the mismatch, even
    // messages from the genuine peer.
    assert_eq!(
        alice.decrypt("bob@1", &real_reply),
        Err(Error::PeerIdentityMismatch {
            device_id: "bob@1".into()
        })
    );
    assert!(matches!(
        alice.encrypt("bob@1", b"blocked"),
        Err(Error::PeerIdentityMismatch { .. })
    ));
}

#[test]
fn one_time_prekeys_are_consumed_per_fetch() {
    let mut server = KeyServer::default();
    let mut alice = registered("alice@1", &mut server);
    let mut carol = registered("carol@1", &mut server);
    let mut bob = registered("bob@1", &mut server);

    let before = server.users["bob@1"].opks.len();

    alice.encrypt("bob@1", b"from alice").unwrap();
    let alice_wires = encrypted_wires(&pump(&mut alice, &mut server));
    carol.encrypt("bob@1", b"from carol").unwrap();
    let carol_wires = encrypted_wires(&pump(&mut carol, &mut server));

    // Two fetches, two distinct OPKs handed out.
    assert_eq!(server.users["bob@1"].opks.len(), before - 2);
    assert_eq!(bob.decrypt("alice@1", &alice_wires[0]).unwrap(), b"from alice");
    assert_eq!(bob.decrypt("carol@1", &carol_wires[0]).unwrap(), b"from carol");
}
