//! Shard-KV server -- data model and shard-state transition rules.

use std::collections::HashMap;

use crate::consensus::LogIndex;
use crate::ctrl::{Config, ConfigNum, Gid};
use crate::utils::{key_to_shard, N_SHARDS};

use serde::{Deserialize, Serialize};

use tokio::sync::oneshot;

/// Server replica ID type (position within its group).
pub type ReplicaId = u8;

/// Client ID type, assigned by the client library.
pub type ClientId = u64;

/// Per-client operation sequence number type.
pub type SeqNum = u64;

/// Kind of a client operation.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum OpKind {
    /// Read the value of a key.
    Get,

    /// Overwrite the value of a key.
    Put,

    /// Concatenate to the value of a key (treated as empty if absent).
    Append,
}

/// Ownership state of one shard on this replica group.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum ShardState {
    /// Owned in the current epoch with all data present.
    Serving,

    /// Not owned in the current epoch.
    NotServing,

    /// Owned in the current epoch, data not yet obtained from the
    /// previous owner.
    Pulling,

    /// Owned in the previous epoch, data held awaiting pickup by the new
    /// owner.
    BePulled,
}

impl Default for ShardState {
    fn default() -> Self {
        Self::NotServing
    }
}

/// A client Get/Put/Append operation as proposed to the log.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ClientOp {
    /// Originating client.
    pub client_id: ClientId,

    /// Client's sequence number for this operation.
    pub seq: SeqNum,

    /// Key operated on.
    pub key: String,

    /// Value for Put/Append; empty for Get.
    pub value: String,

    /// Operation kind.
    pub kind: OpKind,
}

/// Command carried in a consensus log entry. The apply loop is the only
/// consumer; every state mutation happens through one of these.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Command {
    /// A client operation against a single key.
    ClientOp(ClientOp),

    /// Installation of the next configuration epoch.
    ConfigInstall(Config),

    /// Installation of a shard's data fetched from its previous owner.
    ShardInstall {
        /// Epoch this install belongs to.
        config_num: ConfigNum,

        /// Index of the installed shard.
        shard: usize,

        /// Key-value pairs of the shard.
        kv: HashMap<String, String>,

        /// The previous owner's dedup table, merged by per-client max.
        client_seq: HashMap<ClientId, SeqNum>,
    },

    /// Relinquishment of a shard confirmed installed by its new owner.
    ShardRelease {
        /// Epoch this release belongs to.
        config_num: ConfigNum,

        /// Index of the released shard.
        shard: usize,
    },

    /// Log filler carrying no state change; lets a fresh leader commit
    /// entries of its own term.
    NoOp,
}

/// Notification delivered to the waiter registered at a log index once
/// the entry at that index has been applied.
#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) enum ApplyNotice {
    /// The entry was the client op itself; carries the Get value.
    ClientOp {
        client_id: ClientId,
        seq: SeqNum,
        value: String,
    },

    /// The entry was a client op whose shard this group no longer (or
    /// not yet) serves; nothing was applied.
    NotOwned,

    /// A non-client entry occupied this index.
    Reconfig,
}

/// The replicated per-replica state, guarded by the server's big lock and
/// mutated only by the apply loop.
pub(crate) struct ReplicaState {
    /// Key-value map. Keys present belong only to shards in Serving or
    /// BePulled state.
    pub kv: HashMap<String, String>,

    /// Dedup table: highest applied sequence number per client.
    pub client_seq: HashMap<ClientId, SeqNum>,

    /// Ownership state of every shard.
    pub shard_states: [ShardState; N_SHARDS],

    /// Current configuration epoch.
    pub config: Config,

    /// Previous configuration epoch.
    pub prev_config: Config,

    /// Transient waiter table: log index -> single-shot notification
    /// channel of the request that proposed the entry there.
    pub waiters: HashMap<LogIndex, oneshot::Sender<ApplyNotice>>,

    /// Highest log index already reflected in this state.
    pub last_applied: LogIndex,
}

impl ReplicaState {
    /// Creates the state of a fresh replica at epoch 0.
    pub fn new() -> Self {
        ReplicaState {
            kv: HashMap::new(),
            client_seq: HashMap::new(),
            shard_states: [ShardState::NotServing; N_SHARDS],
            config: Config::default(),
            prev_config: Config::default(),
            waiters: HashMap::new(),
            last_applied: 0,
        }
    }

    /// True iff every shard is either Serving or NotServing, the
    /// precondition for accepting the next configuration.
    pub fn quiescent(&self) -> bool {
        self.shard_states.iter().all(|s| {
            matches!(s, ShardState::Serving | ShardState::NotServing)
        })
    }

    /// Shard indices currently in the given state.
    pub fn shards_in(&self, state: ShardState) -> Vec<usize> {
        (0..N_SHARDS)
            .filter(|&i| self.shard_states[i] == state)
            .collect()
    }

    /// Key-value pairs belonging to the given shard.
    pub fn extract_shard(&self, shard: usize) -> HashMap<String, String> {
        self.kv
            .iter()
            .filter(|(k, _)| key_to_shard(k) == shard)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Recomputes every shard's state after a configuration swap, from
    /// the (previous owner, new owner) pair of that shard.
    pub fn transition_shards(&mut self, gid: Gid) {
        if self.prev_config.num == 0 {
            // first real epoch: owned shards start with no data to pull
            for i in 0..N_SHARDS {
                if self.config.owns(gid, i) {
                    self.shard_states[i] = ShardState::Serving;
                }
            }
            return;
        }

        for i in 0..N_SHARDS {
            let owned = self.config.owns(gid, i);
            let was_owned = self.prev_config.owns(gid, i);
            self.shard_states[i] = match (was_owned, owned) {
                (true, true) => ShardState::Serving,
                (false, true) => ShardState::Pulling,
                (true, false) => ShardState::BePulled,
                (false, false) => ShardState::NotServing,
            };
        }
    }
}
