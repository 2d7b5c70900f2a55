//! Engine tunables.

/// Milliseconds per day, used by the rotation defaults.
const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Configuration of pre-key management and session limits.
///
/// The defaults match the protocol recommendations; hosts override fields
/// before constructing the engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// One-time pre-keys generated per refill batch.
    pub opk_batch_size: u16,
    /// Refill when the server reports fewer remaining OPKs than this.
    pub opk_server_low_limit: u16,
    /// Rotate the signed pre-key after this many milliseconds.
    pub spk_lifetime_ms: u64,
    /// Keep rotated-out SPKs for this long to accept late session inits.
    pub spk_grace_ms: u64,
    /// Maximum message keys cached per receiving chain.
    pub max_message_skip_per_chain: u32,
    /// Maximum receiving chains retained in the skipped-key cache.
    pub max_cached_chains: usize,
    /// Keep superseded sessions decrypt-only for this long before erasing.
    pub session_draining_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            opk_batch_size: 100,
            opk_server_low_limit: 80,
            spk_lifetime_ms: 7 * DAY_MS,
            spk_grace_ms: 14 * DAY_MS,
            max_message_skip_per_chain: 1024,
            max_cached_chains: 5,
            session_draining_grace_ms: DAY_MS,
        }
    }
}
