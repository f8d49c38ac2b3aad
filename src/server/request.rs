//! Shard-KV server -- client request entrance.
//!
//! Implements the Get/PutAppend front-end: route checks, proposing a
//! `ClientOp` entry, and awaiting the apply-loop notification for that
//! entry's log index. Every internal failure mode (not leader, mismatch
//! at the committed slot, timeout, kill) surfaces as `WrongLeader` so
//! the client library's retry loop re-discovers the leader; a shard not
//! owned surfaces as `WrongGroup` so it re-fetches the configuration.

use super::*;

use crate::server::state::{ApplyNotice, ClientId, ClientOp, SeqNum};
use crate::utils::key_to_shard;

use serde::{Deserialize, Serialize};

use tokio::sync::oneshot;
use tokio::time::{self, Duration};

/// Error kind carried in every RPC reply.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum RpcErr {
    /// Success. A Get on an absent key is `Ok` with an empty value.
    Ok,

    /// This replica is not the leader of its group, or could not see the
    /// operation commit; retry (possibly elsewhere).
    WrongLeader,

    /// This group does not own the key's shard in the current epoch.
    WrongGroup,

    /// Configuration epochs of caller and callee disagree.
    WrongConfig,
}

/// Get request from a client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct GetArgs {
    /// Key to read.
    pub key: String,

    /// Originating client.
    pub client_id: ClientId,

    /// Client's sequence number for this operation.
    pub seq: SeqNum,
}

/// Reply to a Get request.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct GetReply {
    /// Outcome of the request.
    pub err: RpcErr,

    /// Value read; empty if the key is absent or on error.
    pub value: String,
}

/// Put or Append request from a client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct PutAppendArgs {
    /// Key to mutate.
    pub key: String,

    /// Value to put or append.
    pub value: String,

    /// Which mutation this is (`Put` or `Append`).
    pub kind: OpKind,

    /// Originating client.
    pub client_id: ClientId,

    /// Client's sequence number for this operation.
    pub seq: SeqNum,
}

/// Reply to a Put/Append request.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct PutAppendReply {
    /// Outcome of the request.
    pub err: RpcErr,
}

// ShardServer client requests entrance
impl ShardServer {
    /// Serves a client Get.
    pub async fn get(&self, args: GetArgs) -> GetReply {
        let op = ClientOp {
            client_id: args.client_id,
            seq: args.seq,
            key: args.key,
            value: String::new(),
            kind: OpKind::Get,
        };
        match self.submit_client_op(op).await {
            Ok(value) => GetReply {
                err: RpcErr::Ok,
                value,
            },
            Err(err) => GetReply {
                err,
                value: String::new(),
            },
        }
    }

    /// Serves a client Put or Append.
    pub async fn put_append(&self, args: PutAppendArgs) -> PutAppendReply {
        let op = ClientOp {
            client_id: args.client_id,
            seq: args.seq,
            key: args.key,
            value: args.value,
            kind: args.kind,
        };
        PutAppendReply {
            err: match self.submit_client_op(op).await {
                Ok(_) => RpcErr::Ok,
                Err(err) => err,
            },
        }
    }

    /// True iff the current configuration assigns the shard elsewhere.
    fn wrong_group(&self, shard: usize) -> bool {
        !self.guard().config.owns(self.gid, shard)
    }

    /// Proposes a client op and waits for its apply notification.
    /// Returns the Get value (empty for mutations) on success.
    async fn submit_client_op(
        &self,
        op: ClientOp,
    ) -> Result<String, RpcErr> {
        if !self.raft.get_state().1 {
            return Err(RpcErr::WrongLeader);
        }
        let shard = key_to_shard(&op.key);
        if self.wrong_group(shard) {
            return Err(RpcErr::WrongGroup);
        }

        let (client_id, seq) = (op.client_id, op.seq);
        let (index, _term, is_leader) =
            self.raft.propose(Command::ClientOp(op)).await;
        if !is_leader {
            return Err(RpcErr::WrongLeader);
        }
        // the configuration may have advanced between the leader check
        // and the propose; re-check before committing to the wait
        if self.wrong_group(shard) {
            return Err(RpcErr::WrongGroup);
        }
        pf_trace!(self.tag; "proposed c{} seq {} at index {}",
                            client_id, seq, index);

        // register a fresh waiter at the entry's index; an older waiter
        // lingering there belongs to a superseded leader's request
        let rx = {
            let (tx, rx) = oneshot::channel();
            self.guard().waiters.insert(index, tx);
            rx
        };

        let outcome = time::timeout(
            Duration::from_millis(self.config.client_wait_ms),
            rx,
        )
        .await;

        // always deregister on the way out; the apply loop has either
        // consumed the slot already or never will
        self.guard().waiters.remove(&index);

        match outcome {
            Ok(Ok(ApplyNotice::ClientOp {
                client_id: applied_client,
                seq: applied_seq,
                value,
            })) if applied_client == client_id && applied_seq == seq => {
                Ok(value)
            }
            Ok(Ok(ApplyNotice::NotOwned)) => Err(RpcErr::WrongGroup),
            // a different entry was committed at this slot: the leader
            // has likely changed under us
            Ok(Ok(_)) => Err(RpcErr::WrongLeader),
            // waiter channel dropped (killed or displaced)
            Ok(Err(_)) => Err(RpcErr::WrongLeader),
            // timed out waiting for the commit
            Err(_) => Err(RpcErr::WrongLeader),
        }
    }
}
