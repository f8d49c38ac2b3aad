//! Shard-KV server -- apply loop and per-kind command handlers.
//!
//! The apply loop is the sole writer of replicated state. Every handler
//! is a deterministic function of committed state only; waiters are
//! notified after the fact and never consulted for a decision.

use super::*;

use crate::consensus::{ApplyMsg, LogIndex};
use crate::ctrl::{Config, ConfigNum, Gid};
use crate::server::state::{
    ApplyNotice, ClientId, ClientOp, OpKind, ReplicaState, SeqNum,
};
use crate::utils::{key_to_shard, ShardsetError};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

// ReplicaState command application (pure, deterministic)
impl ReplicaState {
    /// Applies a client operation. Ops against a shard not currently in
    /// Serving state are skipped without mutation; duplicates (seq at or
    /// below the dedup watermark) are acknowledged without re-applying,
    /// though a Get still re-reads the current value.
    pub fn apply_client_op(&mut self, op: &ClientOp) -> ApplyNotice {
        let shard = key_to_shard(&op.key);
        if self.shard_states[shard] != ShardState::Serving {
            return ApplyNotice::NotOwned;
        }

        let applied_before = self
            .client_seq
            .get(&op.client_id)
            .is_some_and(|&high| high >= op.seq);
        if !applied_before {
            match op.kind {
                OpKind::Get => {}
                OpKind::Put => {
                    self.kv.insert(op.key.clone(), op.value.clone());
                }
                OpKind::Append => {
                    self.kv
                        .entry(op.key.clone())
                        .or_default()
                        .push_str(&op.value);
                }
            }
            self.client_seq.insert(op.client_id, op.seq);
        }

        let value = if op.kind == OpKind::Get {
            self.kv.get(&op.key).cloned().unwrap_or_default()
        } else {
            String::new()
        };
        ApplyNotice::ClientOp {
            client_id: op.client_id,
            seq: op.seq,
            value,
        }
    }

    /// Installs the next configuration epoch. Accepts only the immediate
    /// successor epoch (or any epoch when still at 0), and only while
    /// every shard is quiescent. Returns whether the install took effect.
    pub fn apply_config_install(&mut self, gid: Gid, new: &Config) -> bool {
        let successor =
            self.config.num == 0 || new.num == self.config.num + 1;
        if !successor || !self.quiescent() {
            return false;
        }
        self.prev_config =
            std::mem::replace(&mut self.config, new.clone());
        self.transition_shards(gid);
        true
    }

    /// Installs a shard's data pulled from its previous owner. Accepted
    /// only at the matching epoch and only while the shard is Pulling.
    /// Returns whether the install took effect.
    pub fn apply_shard_install(
        &mut self,
        config_num: ConfigNum,
        shard: usize,
        kv: HashMap<String, String>,
        client_seq: HashMap<ClientId, SeqNum>,
    ) -> bool {
        if config_num != self.config.num
            || self.shard_states[shard] != ShardState::Pulling
        {
            return false;
        }

        self.kv.extend(kv);
        // merge by max so the dedup watermark never goes backwards
        for (client, seq) in client_seq {
            let high = self.client_seq.entry(client).or_insert(0);
            if *high < seq {
                *high = seq;
            }
        }
        self.shard_states[shard] = ShardState::Serving;
        true
    }

    /// Drops a shard whose new owner confirmed installation. Accepted
    /// only at the matching epoch and only while the shard is BePulled.
    /// Returns whether the release took effect.
    pub fn apply_shard_release(
        &mut self,
        config_num: ConfigNum,
        shard: usize,
    ) -> bool {
        if config_num != self.config.num
            || self.shard_states[shard] != ShardState::BePulled
        {
            return false;
        }

        self.kv.retain(|key, _| key_to_shard(key) != shard);
        self.shard_states[shard] = ShardState::NotServing;
        true
    }
}

// ShardServer apply loop
impl ShardServer {
    /// Sole consumer of the consensus apply stream. Exits when the
    /// stream closes or the replica is killed.
    pub(super) async fn run_apply_loop(
        self: Arc<Self>,
        mut apply_rx: mpsc::Receiver<ApplyMsg<Command>>,
    ) {
        pf_debug!(self.tag; "apply loop starts");
        while let Some(msg) = apply_rx.recv().await {
            if self.killed() {
                break;
            }
            if let Err(e) = self.handle_apply_msg(msg) {
                pf_error!(self.tag; "error handling apply msg: {}", e);
            }
        }
        pf_debug!(self.tag; "apply loop exits");
    }

    /// Handles one delivery from the apply stream.
    fn handle_apply_msg(
        &self,
        msg: ApplyMsg<Command>,
    ) -> Result<(), ShardsetError> {
        match msg {
            ApplyMsg::Snapshot { term, index, data } => {
                let mut state = self.guard();
                if self.raft.cond_install_snapshot(term, index, &data) {
                    state.restore_snapshot(&data, &self.tag);
                    state.last_applied = index;
                    pf_debug!(self.tag; "installed snapshot at index {}",
                                        index);
                }
                Ok(())
            }
            ApplyMsg::Command { index, command } => {
                self.handle_committed_entry(index, command)
            }
        }
    }

    /// Dispatches one committed command, reconsiders snapshotting, and
    /// notifies the waiter registered at the entry's index (if any).
    fn handle_committed_entry(
        &self,
        index: LogIndex,
        command: Command,
    ) -> Result<(), ShardsetError> {
        let mut state = self.guard();

        // already covered by an installed snapshot
        if index <= state.last_applied {
            return Ok(());
        }
        state.last_applied = index;

        let notice = match command {
            Command::ClientOp(op) => {
                pf_trace!(self.tag; "apply idx {} op {:?} c{} seq {}",
                                    index, op.kind, op.client_id, op.seq);
                state.apply_client_op(&op)
            }
            Command::ConfigInstall(config) => {
                if state.apply_config_install(self.gid, &config) {
                    pf_info!(self.tag; "entered epoch {}, shards {:?}",
                                       config.num, state.shard_states);
                } else {
                    pf_debug!(self.tag; "rejected config install num {} at \
                                         epoch {}",
                                        config.num, state.config.num);
                }
                ApplyNotice::Reconfig
            }
            Command::ShardInstall {
                config_num,
                shard,
                kv,
                client_seq,
            } => {
                if state.apply_shard_install(config_num, shard, kv, client_seq)
                {
                    pf_info!(self.tag; "installed shard {} at epoch {}",
                                       shard, config_num);
                } else {
                    pf_debug!(self.tag; "rejected install of shard {} for \
                                         epoch {}",
                                        shard, config_num);
                }
                ApplyNotice::Reconfig
            }
            Command::ShardRelease { config_num, shard } => {
                if state.apply_shard_release(config_num, shard) {
                    pf_info!(self.tag; "released shard {} at epoch {}",
                                       shard, config_num);
                } else {
                    pf_debug!(self.tag; "rejected release of shard {} for \
                                         epoch {}",
                                        shard, config_num);
                }
                ApplyNotice::Reconfig
            }
            Command::NoOp => ApplyNotice::Reconfig,
        };

        // emit a snapshot if the consensus state has outgrown the
        // configured threshold
        if self.config.snapshot_threshold > 0
            && self.raft.state_size() > self.config.snapshot_threshold
        {
            let blob = state.to_snapshot()?;
            self.raft.snapshot(index, blob);
            pf_debug!(self.tag; "took snapshot at index {}", index);
        }

        // deliver the notice outside the lock; best effort, a dropped
        // receiver just means the request gave up waiting
        let waiter = state.waiters.remove(&index);
        drop(state);
        if let Some(tx) = waiter {
            let _ = tx.send(notice);
        }
        Ok(())
    }
}
