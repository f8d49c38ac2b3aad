//! Shard-KV server replica module.
//!
//! One `ShardServer` is a single replica of one group of a sharded,
//! linearizable key-value store. External events (client RPCs, peer
//! RPCs, controller polls, timer ticks) become proposed log entries;
//! the apply loop is the single linearization point that mutates state
//! and wakes waiters.

mod execution;
mod messages;
mod migration;
mod request;
mod snapshot;
mod state;
mod watcher;

pub use messages::{
    ConfirmShardArgs, ConfirmShardReply, FetchShardArgs, FetchShardReply,
    GroupRpc,
};
pub use request::{GetArgs, GetReply, PutAppendArgs, PutAppendReply, RpcErr};
pub use state::{
    ClientId, ClientOp, Command, OpKind, ReplicaId, SeqNum, ShardState,
};

use state::ReplicaState;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::consensus::{ApplyMsg, RaftHandle};
use crate::ctrl::{ConfigNum, ConfigService, Gid};
use crate::utils::{ShardsetError, N_SHARDS};

use rand::Rng;

use serde::Deserialize;

use tokio::sync::mpsc;
use tokio::time::{self, Duration};

/// Configuration parameters struct.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Snapshot once the consensus state exceeds this many bytes.
    /// 0 disables snapshotting.
    pub snapshot_threshold: usize,

    /// Controller polling cadence of the config watcher in millisecs.
    pub poll_interval_ms: u64,

    /// Shard puller cadence in millisecs.
    pub pull_interval_ms: u64,

    /// Release confirmer cadence in millisecs.
    pub confirm_interval_ms: u64,

    /// Liveness nudger cadence in millisecs.
    pub noop_interval_ms: u64,

    /// How long a client request waits for its entry to apply before
    /// giving up with `WrongLeader`, in millisecs.
    pub client_wait_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            snapshot_threshold: 0,
            poll_interval_ms: 100,
            pull_interval_ms: 100,
            confirm_interval_ms: 100,
            noop_interval_ms: 500,
            client_wait_ms: 700,
        }
    }
}

/// Shard-KV server replica.
pub struct ShardServer {
    /// ID of the replica group this server belongs to.
    gid: Gid,

    /// Replica ID within the group.
    id: ReplicaId,

    /// Log line prefix, `"gid-id"`.
    tag: String,

    /// Configuration parameters struct.
    config: ServerConfig,

    /// Handle to the consensus module.
    raft: Arc<dyn RaftHandle<Command>>,

    /// Query stub to the configuration controller.
    ctrl: Arc<dyn ConfigService>,

    /// Outbound transport for inter-group RPCs.
    rpc: Arc<dyn GroupRpc>,

    /// Replicated state under the big lock; mutated only by the apply
    /// loop.
    state: Mutex<ReplicaState>,

    /// Kill flag checked by every background actor at each tick.
    dead: AtomicBool,
}

// ShardServer public API implementation
impl ShardServer {
    /// Creates a new shard-KV replica, restores the latest snapshot if
    /// one exists, and spawns the apply loop plus the four background
    /// actors. `apply_rx` is the consensus module's apply stream.
    /// `config_str` optionally overlays `ServerConfig` fields from TOML.
    pub async fn new_and_setup(
        gid: Gid,
        id: ReplicaId,
        raft: Arc<dyn RaftHandle<Command>>,
        apply_rx: mpsc::Receiver<ApplyMsg<Command>>,
        ctrl: Arc<dyn ConfigService>,
        rpc: Arc<dyn GroupRpc>,
        config_str: Option<&str>,
    ) -> Result<Arc<Self>, ShardsetError> {
        let config = parsed_config!(config_str => ServerConfig;
                                    snapshot_threshold, poll_interval_ms,
                                    pull_interval_ms, confirm_interval_ms,
                                    noop_interval_ms, client_wait_ms)?;
        let tag = format!("{}-{}", gid, id);
        if config.poll_interval_ms == 0
            || config.pull_interval_ms == 0
            || config.confirm_interval_ms == 0
            || config.noop_interval_ms == 0
        {
            return logged_err!(tag; "invalid zero actor cadence");
        }
        if config.client_wait_ms == 0 {
            return logged_err!(tag; "invalid client_wait_ms {}",
                                    config.client_wait_ms);
        }

        let mut state = ReplicaState::new();
        let blob = raft.load_snapshot();
        if !blob.is_empty() {
            state.restore_snapshot(&blob, &tag);
            pf_info!(tag; "restored from snapshot: epoch {}, shards {:?}",
                          state.config.num, state.shard_states);
        }

        let server = Arc::new(ShardServer {
            gid,
            id,
            tag,
            config,
            raft,
            ctrl,
            rpc,
            state: Mutex::new(state),
            dead: AtomicBool::new(false),
        });

        tokio::spawn(server.clone().run_apply_loop(apply_rx));
        tokio::spawn(server.clone().run_config_watcher());
        tokio::spawn(server.clone().run_shard_puller());
        tokio::spawn(server.clone().run_release_confirmer());
        tokio::spawn(server.clone().run_liveness_nudger());

        pf_info!(server.tag; "shard-kv replica started");
        Ok(server)
    }

    /// Stops every background actor at its next tick and fails all
    /// outstanding client waits.
    pub fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
        // dropping the senders resolves pending waits with WrongLeader
        self.guard().waiters.clear();
        pf_info!(self.tag; "shard-kv replica killed");
    }

    /// Whether `kill()` has been called.
    pub fn killed(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// ID of the replica group this server belongs to.
    pub fn gid(&self) -> Gid {
        self.gid
    }

    /// Replica ID within the group.
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// Current configuration epoch number, for introspection.
    pub fn config_num(&self) -> ConfigNum {
        self.guard().config.num
    }

    /// Current per-shard ownership states, for introspection.
    pub fn shard_states(&self) -> [ShardState; N_SHARDS] {
        self.guard().shard_states
    }
}

// ShardServer internal helpers
impl ShardServer {
    /// Acquires the big lock. A poisoned lock is taken over as-is; the
    /// apply handlers keep state consistent entry-by-entry.
    pub(crate) fn guard(&self) -> MutexGuard<'_, ReplicaState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleeps for roughly the given interval, jittered by up to 10% so
    /// co-located actors do not tick in lockstep.
    async fn sleep_jittered(&self, base_ms: u64) {
        let jitter = rand::thread_rng().gen_range(0..=base_ms / 10);
        time::sleep(Duration::from_millis(base_ms + jitter)).await;
    }
}
