//! Public interface to the shardset library: one replica of a sharded,
//! linearizable key-value store layered on top of an external Raft-style
//! consensus module.
//!
//! The crate implements the per-replica shard-KV server only. Consensus,
//! the configuration controller, and the inter-group RPC transport are
//! collaborators reached through the traits in `consensus`, `ctrl`, and
//! `server`.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
mod utils;

mod consensus;
mod ctrl;
mod server;

pub use crate::consensus::{ApplyMsg, LogIndex, RaftHandle, Term};
pub use crate::ctrl::{Config, ConfigNum, ConfigService, Gid};
pub use crate::server::{
    ClientId, ClientOp, Command, ConfirmShardArgs, ConfirmShardReply,
    FetchShardArgs, FetchShardReply, GetArgs, GetReply, GroupRpc, OpKind,
    PutAppendArgs, PutAppendReply, ReplicaId, RpcErr, SeqNum, ServerConfig,
    ShardServer, ShardState,
};
pub use crate::utils::{key_to_shard, ShardsetError, N_SHARDS};
