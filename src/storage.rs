//! Persistence interface.
//!
//! The engine sees a set of named relations (local user, SPKs, OPKs, peer
//! devices, sessions) behind a transactional trait; concrete schemas are the
//! host's choice. Session state crosses this boundary only as opaque blobs.
//!
//! [`MemoryStore`] is the in-process implementation used by tests and by
//! hosts that persist elsewhere: a transaction runs against a scratch copy
//! of the state that replaces the live copy only when the closure succeeds.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Trust state of a pinned peer device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    /// Pinned on first encounter, not yet verified by the user.
    Untrusted,
    /// Verified out of band.
    Trusted,
    /// A later message claimed a different identity key.
    UntrustedMismatch,
}

/// Pinned peer device record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub device_id: String,
    #[serde(with = "serde_bytes")]
    pub identity_key: Vec<u8>,
    pub status: PeerStatus,
    /// Stable storage row id, assigned on first insert.
    pub row_id: u64,
    /// When the draining session for this peer was demoted, if any.
    pub draining_since_ms: Option<u64>,
}

/// Local user identity and registration state.
#[derive(Clone, Serialize, Deserialize)]
pub struct LocalUserRecord {
    pub device_id: String,
    #[serde(with = "serde_bytes")]
    pub identity_secret: Vec<u8>,
    /// Set once the key server acknowledged registration.
    pub registered: bool,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SpkRecord {
    pub id: u32,
    #[serde(with = "serde_bytes")]
    pub secret: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub public: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
    pub created_at_ms: u64,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct OpkRecord {
    pub id: u32,
    #[serde(with = "serde_bytes")]
    pub secret: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub public: Vec<u8>,
}

/// Which of the at-most-two sessions per peer a blob belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionSlot {
    Active,
    Draining,
}

/// Operations available inside a transaction.
pub trait StorageTx {
    fn local_user(&self) -> Result<Option<LocalUserRecord>>;
    fn put_local_user(&mut self, record: &LocalUserRecord) -> Result<()>;
    fn delete_local_user(&mut self) -> Result<()>;

    fn spks(&self) -> Result<Vec<SpkRecord>>;
    fn spk(&self, id: u32) -> Result<Option<SpkRecord>>;
    fn put_spk(&mut self, record: &SpkRecord) -> Result<()>;
    fn delete_spk(&mut self, id: u32) -> Result<()>;

    fn opks(&self) -> Result<Vec<OpkRecord>>;
    fn opk(&self, id: u32) -> Result<Option<OpkRecord>>;
    fn put_opk(&mut self, record: &OpkRecord) -> Result<()>;
    fn delete_opk(&mut self, id: u32) -> Result<()>;
    /// Highest OPK id ever assigned, zero when none.
    fn max_opk_id(&self) -> Result<u32>;

    fn peers(&self) -> Result<Vec<PeerRecord>>;
    fn peer(&self, device_id: &str) -> Result<Option<PeerRecord>>;
    /// Insert or update; assigns and returns the row id when the record
    /// carries zero.
    fn put_peer(&mut self, record: &PeerRecord) -> Result<u64>;
    fn delete_peer(&mut self, device_id: &str) -> Result<()>;

    fn session(&self, device_id: &str, slot: SessionSlot) -> Result<Option<Vec<u8>>>;
    fn put_session(&mut self, device_id: &str, slot: SessionSlot, blob: &[u8]) -> Result<()>;
    fn delete_session(&mut self, device_id: &str, slot: SessionSlot) -> Result<()>;
}

/// Transactional store: all writes of one engine operation commit together
/// or not at all.
pub trait Storage {
    type Tx: StorageTx;

    fn transaction<R>(&mut self, f: impl FnOnce(&mut Self::Tx) -> Result<R>) -> Result<R>;
}

#[derive(Clone, Default)]
struct MemoryState {
    local_user: Option<LocalUserRecord>,
    spks: BTreeMap<u32, SpkRecord>,
    opks: BTreeMap<u32, OpkRecord>,
    peers: HashMap<String, PeerRecord>,
    sessions: HashMap<(String, SessionSlot), Vec<u8>>,
    next_peer_row: u64,
}

/// In-memory store with copy-on-write transactions.
#[derive(Default)]
pub struct MemoryStore {
    state: MemoryState,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A scratch copy of the store state; dropped on failure, swapped in on
/// success.
pub struct MemoryTx {
    state: MemoryState,
}

impl Storage for MemoryStore {
    type Tx = MemoryTx;

    fn transaction<R>(&mut self, f: impl FnOnce(&mut Self::Tx) -> Result<R>) -> Result<R> {
        let mut tx = MemoryTx {
            state: self.state.clone(),
        };
        let result = f(&mut tx)?;
        self.state = tx.state;
        Ok(result)
    }
}

impl StorageTx for MemoryTx {
    fn local_user(&self) -> Result<Option<LocalUserRecord>> {
        Ok(self.state.local_user.clone())
    }

    fn put_local_user(&mut self, record: &LocalUserRecord) -> Result<()> {
        self.state.local_user = Some(record.clone());
        Ok(())
    }

    fn delete_local_user(&mut self) -> Result<()> {
        self.state.local_user = None;
        Ok(())
    }

    fn spks(&self) -> Result<Vec<SpkRecord>> {
        Ok(self.state.spks.values().cloned().collect())
    }

    fn spk(&self, id: u32) -> Result<Option<SpkRecord>> {
        Ok(self.state.spks.get(&id).cloned())
    }

    fn put_spk(&mut self, record: &SpkRecord) -> Result<()> {
        self.state.spks.insert(record.id, record.clone());
        Ok(())
    }

    fn delete_spk(&mut self, id: u32) -> Result<()> {
        self.state.spks.remove(&id);
        Ok(())
    }

    fn opks(&self) -> Result<Vec<OpkRecord>> {
        Ok(self.state.opks.values().cloned().collect())
    }

    fn opk(&self, id: u32) -> Result<Option<OpkRecord>> {
        Ok(self.state.opks.get(&id).cloned())
    }

    fn put_opk(&mut self, record: &OpkRecord) -> Result<()> {
        self.state.opks.insert(record.id, record.clone());
        Ok(())
    }

    fn delete_opk(&mut self, id: u32) -> Result<()> {
        self.state.opks.remove(&id);
        Ok(())
    }

    fn max_opk_id(&self) -> Result<u32> {
        Ok(self.state.opks.keys().next_back().copied().unwrap_or(0))
    }

    fn peers(&self) -> Result<Vec<PeerRecord>> {
        Ok(self.state.peers.values().cloned().collect())
    }

    fn peer(&self, device_id: &str) -> Result<Option<PeerRecord>> {
        Ok(self.state.peers.get(device_id).cloned())
    }

    fn put_peer(&mut self, record: &PeerRecord) -> Result<u64> {
        let mut record = record.clone();
        if record.row_id == 0 {
            self.state.next_peer_row += 1;
            record.row_id = self.state.next_peer_row;
        }
        let row_id = record.row_id;
        self.state.peers.insert(record.device_id.clone(), record);
        Ok(row_id)
    }

    fn delete_peer(&mut self, device_id: &str) -> Result<()> {
        self.state.peers.remove(device_id);
        self.state
            .sessions
            .retain(|(peer, _), _| peer != device_id);
        Ok(())
    }

    fn session(&self, device_id: &str, slot: SessionSlot) -> Result<Option<Vec<u8>>> {
        Ok(self
            .state
            .sessions
            .get(&(device_id.to_string(), slot))
            .cloned())
    }

    fn put_session(&mut self, device_id: &str, slot: SessionSlot, blob: &[u8]) -> Result<()> {
        self.state
            .sessions
            .insert((device_id.to_string(), slot), blob.to_vec());
        Ok(())
    }

    fn delete_session(&mut self, device_id: &str, slot: SessionSlot) -> Result<()> {
        self.state.sessions.remove(&(device_id.to_string(), slot));
        Ok(())
    }
}
