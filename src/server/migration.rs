//! Shard-KV server -- shard puller and release confirmer.
//!
//! Two leader-only background actors drive an epoch's migrations to
//! completion: the puller imports every shard in Pulling state from its
//! previous owner, and the confirmer relinquishes every shard in
//! BePulled state once its new owner acknowledges installation. Both
//! snapshot their inputs under the lock, release it, and perform all
//! RPCs lock-free; results re-enter the replica through proposed log
//! entries, so failures of any kind simply mean a retry next tick.

use super::*;

use std::sync::Arc;

use crate::ctrl::ConfigNum;

// ShardServer shard pulling
impl ShardServer {
    /// Ticks the shard puller until killed.
    pub(super) async fn run_shard_puller(self: Arc<Self>) {
        pf_debug!(self.tag; "shard puller starts");
        while !self.killed() {
            self.sleep_jittered(self.config.pull_interval_ms).await;
            if !self.raft.get_state().1 {
                continue;
            }

            // snapshot the pulling set and the previous owners' server
            // lists, then release the lock before any RPC
            let (config_num, targets) = {
                let state = self.guard();
                let targets: Vec<(usize, Vec<String>)> = state
                    .shards_in(ShardState::Pulling)
                    .into_iter()
                    .filter_map(|shard| {
                        let owner = state.prev_config.shards[shard];
                        state
                            .prev_config
                            .groups
                            .get(&owner)
                            .map(|servers| (shard, servers.clone()))
                    })
                    .collect();
                (state.config.num, targets)
            };

            // distinct shards pull concurrently
            for (shard, servers) in targets {
                tokio::spawn(self.clone().pull_shard(
                    config_num,
                    shard,
                    servers,
                ));
            }
        }
        pf_debug!(self.tag; "shard puller exits");
    }

    /// Fetches one shard from its previous owner group and proposes its
    /// installation. Tries the group's servers in turn until one
    /// answers affirmatively; gives up until the next tick otherwise.
    async fn pull_shard(
        self: Arc<Self>,
        config_num: ConfigNum,
        shard: usize,
        servers: Vec<String>,
    ) {
        let args = FetchShardArgs {
            config_num,
            shard,
            gid: self.gid,
        };
        for server in &servers {
            let reply = match self
                .rpc
                .fetch_shard(server, args.clone())
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    pf_trace!(self.tag; "fetch shard {} from '{}' failed: {}",
                                        shard, server, e);
                    continue;
                }
            };
            if reply.err != RpcErr::Ok
                || reply.shard != shard
                || reply.config_num != config_num
            {
                continue;
            }

            // the epoch may have moved on while we were fetching
            let stale = {
                let state = self.guard();
                state.config.num != config_num
                    || state.shard_states[shard] != ShardState::Pulling
            };
            if stale {
                return;
            }

            pf_debug!(self.tag; "pulled shard {} ({} keys), proposing \
                                 install",
                                shard, reply.kv.len());
            self.raft
                .propose(Command::ShardInstall {
                    config_num,
                    shard,
                    kv: reply.kv,
                    client_seq: reply.client_seq,
                })
                .await;
            return;
        }
    }
}

// ShardServer shard release confirmation
impl ShardServer {
    /// Ticks the release confirmer until killed.
    pub(super) async fn run_release_confirmer(self: Arc<Self>) {
        pf_debug!(self.tag; "release confirmer starts");
        while !self.killed() {
            self.sleep_jittered(self.config.confirm_interval_ms).await;
            if !self.raft.get_state().1 {
                continue;
            }

            let (config_num, targets) = {
                let state = self.guard();
                let targets: Vec<(usize, Vec<String>)> = state
                    .shards_in(ShardState::BePulled)
                    .into_iter()
                    .filter_map(|shard| {
                        let new_owner = state.config.shards[shard];
                        state
                            .config
                            .groups
                            .get(&new_owner)
                            .map(|servers| (shard, servers.clone()))
                    })
                    .collect();
                (state.config.num, targets)
            };

            for (shard, servers) in targets {
                tokio::spawn(self.clone().confirm_release(
                    config_num,
                    shard,
                    servers,
                ));
            }
        }
        pf_debug!(self.tag; "release confirmer exits");
    }

    /// Probes one shard's new owner and proposes the release once the
    /// owner reports the shard installed at an equal-or-newer epoch.
    async fn confirm_release(
        self: Arc<Self>,
        config_num: ConfigNum,
        shard: usize,
        servers: Vec<String>,
    ) {
        let args = ConfirmShardArgs { config_num, shard };
        for server in &servers {
            let reply = match self
                .rpc
                .confirm_shard(server, args.clone())
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    pf_trace!(self.tag; "confirm shard {} at '{}' failed: {}",
                                        shard, server, e);
                    continue;
                }
            };
            if reply.err != RpcErr::Ok || reply.config_num < config_num {
                continue;
            }

            let stale = {
                let state = self.guard();
                state.config.num != config_num
                    || state.shard_states[shard] != ShardState::BePulled
            };
            if stale {
                return;
            }

            pf_debug!(self.tag; "shard {} confirmed installed by new \
                                 owner, proposing release",
                                shard);
            self.raft
                .propose(Command::ShardRelease { config_num, shard })
                .await;
            return;
        }
    }
}
