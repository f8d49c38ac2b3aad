//! Shard-KV server -- inter-group RPCs.
//!
//! Declares the shard-pull and shard-confirm RPC shapes, the outbound
//! transport trait, and the inbound handlers. Handlers are read-only
//! against the apply loop's state under the big lock; any mutation they
//! lead to goes through a proposed log entry on the caller's side.

use super::*;

use std::collections::HashMap;

use crate::ctrl::{ConfigNum, Gid};
use crate::server::state::{ClientId, SeqNum};
use crate::utils::ShardsetError;

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

/// Request for a shard's contents from its previous owner.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct FetchShardArgs {
    /// Caller's configuration epoch.
    pub config_num: ConfigNum,

    /// Shard being fetched.
    pub shard: usize,

    /// Caller's group ID.
    pub gid: Gid,
}

/// Reply carrying a shard's contents.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct FetchShardReply {
    /// Outcome of the request.
    pub err: RpcErr,

    /// Callee's configuration epoch.
    pub config_num: ConfigNum,

    /// Shard the payload belongs to.
    pub shard: usize,

    /// Key-value pairs of the shard.
    pub kv: HashMap<String, String>,

    /// Callee's full dedup table, for per-client max merging.
    pub client_seq: HashMap<ClientId, SeqNum>,
}

impl FetchShardReply {
    /// An empty reply carrying only an error kind.
    fn err(err: RpcErr, config_num: ConfigNum, shard: usize) -> Self {
        FetchShardReply {
            err,
            config_num,
            shard,
            kv: HashMap::new(),
            client_seq: HashMap::new(),
        }
    }
}

/// Probe asking a shard's new owner whether it has installed the shard.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ConfirmShardArgs {
    /// Caller's configuration epoch.
    pub config_num: ConfigNum,

    /// Shard being confirmed.
    pub shard: usize,
}

/// Reply to a shard-confirm probe.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ConfirmShardReply {
    /// Outcome of the probe; `Ok` iff the callee serves the shard at an
    /// equal-or-greater epoch.
    pub err: RpcErr,

    /// Callee's configuration epoch.
    pub config_num: ConfigNum,

    /// Shard probed.
    pub shard: usize,
}

/// Outbound transport for inter-group RPCs, addressed to a named server
/// endpoint taken from a configuration's group list.
#[async_trait]
pub trait GroupRpc: Send + Sync {
    /// Sends a FetchShard request to one server of a peer group.
    async fn fetch_shard(
        &self,
        server: &str,
        args: FetchShardArgs,
    ) -> Result<FetchShardReply, ShardsetError>;

    /// Sends a ConfirmShard probe to one server of a peer group.
    async fn confirm_shard(
        &self,
        server: &str,
        args: ConfirmShardArgs,
    ) -> Result<ConfirmShardReply, ShardsetError>;
}

// ShardServer inter-group RPC handlers
impl ShardServer {
    /// Handler of FetchShard from the new owner of one of our shards.
    /// Hands out the shard's data plus the full dedup table once we are
    /// at the same epoch and the shard awaits pickup.
    pub fn handle_fetch_shard(
        &self,
        args: &FetchShardArgs,
    ) -> FetchShardReply {
        if !self.raft.get_state().1 {
            return FetchShardReply::err(
                RpcErr::WrongLeader,
                0,
                args.shard,
            );
        }

        let state = self.guard();
        if args.config_num != state.config.num {
            pf_debug!(self.tag; "fetch of shard {} at epoch {} != ours {}",
                                args.shard, args.config_num,
                                state.config.num);
            return FetchShardReply::err(
                RpcErr::WrongConfig,
                state.config.num,
                args.shard,
            );
        }
        if state.shard_states[args.shard] != ShardState::BePulled {
            return FetchShardReply::err(
                RpcErr::WrongGroup,
                state.config.num,
                args.shard,
            );
        }

        pf_debug!(self.tag; "handing shard {} to group {}",
                            args.shard, args.gid);
        FetchShardReply {
            err: RpcErr::Ok,
            config_num: state.config.num,
            shard: args.shard,
            kv: state.extract_shard(args.shard),
            client_seq: state.client_seq.clone(),
        }
    }

    /// Handler of ConfirmShard from the previous owner of one of our
    /// shards. `Ok` only once we serve the shard at an equal epoch, or
    /// have already moved past the caller's epoch entirely.
    pub fn handle_confirm_shard(
        &self,
        args: &ConfirmShardArgs,
    ) -> ConfirmShardReply {
        if !self.raft.get_state().1 {
            return ConfirmShardReply {
                err: RpcErr::WrongLeader,
                config_num: 0,
                shard: args.shard,
            };
        }

        let state = self.guard();
        if state.config.num < args.config_num {
            return ConfirmShardReply {
                err: RpcErr::WrongConfig,
                config_num: state.config.num,
                shard: args.shard,
            };
        }

        let installed = state.config.num > args.config_num
            || state.shard_states[args.shard] == ShardState::Serving;
        ConfirmShardReply {
            // not installed yet: the caller treats this like a leader
            // miss and retries next tick
            err: if installed {
                RpcErr::Ok
            } else {
                RpcErr::WrongLeader
            },
            config_num: state.config.num,
            shard: args.shard,
        }
    }
}
