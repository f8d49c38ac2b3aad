//! Shard-KV server -- configuration watcher and liveness nudger.

use super::*;

use std::sync::Arc;

// ShardServer configuration watching
impl ShardServer {
    /// Leader-only poller of the controller. Once the controller has
    /// published an epoch beyond ours and every shard is quiescent,
    /// fetches exactly the successor epoch and proposes its
    /// installation. Epochs are never skipped; a superseded proposal is
    /// rejected at apply time.
    pub(super) async fn run_config_watcher(self: Arc<Self>) {
        pf_debug!(self.tag; "config watcher starts");
        while !self.killed() {
            self.sleep_jittered(self.config.poll_interval_ms).await;
            if !self.raft.get_state().1 {
                continue;
            }

            let latest = match self.ctrl.query(None).await {
                Ok(config) => config,
                Err(e) => {
                    pf_warn!(self.tag; "controller query failed: {}", e);
                    continue;
                }
            };

            let (current_num, ready) = {
                let state = self.guard();
                (state.config.num, state.quiescent())
            };
            if latest.num <= current_num || !ready {
                continue;
            }

            let next = match self.ctrl.query(Some(current_num + 1)).await {
                Ok(config) => config,
                Err(e) => {
                    pf_warn!(self.tag; "controller query failed: {}", e);
                    continue;
                }
            };
            if next.num != current_num + 1 {
                continue;
            }

            // leadership may have moved while we were querying
            if !self.raft.get_state().1 {
                continue;
            }
            pf_info!(self.tag; "proposing config epoch {}", next.num);
            self.raft.propose(Command::ConfigInstall(next)).await;
        }
        pf_debug!(self.tag; "config watcher exits");
    }
}

// ShardServer liveness nudging
impl ShardServer {
    /// Proposes a no-op whenever the log lacks an entry of the current
    /// leader term, so ops committed around a leader handover become
    /// externally observable.
    pub(super) async fn run_liveness_nudger(self: Arc<Self>) {
        pf_debug!(self.tag; "liveness nudger starts");
        while !self.killed() {
            self.sleep_jittered(self.config.noop_interval_ms).await;
            if self.raft.need_no_op() {
                pf_debug!(self.tag; "nudging log with a no-op");
                self.raft.propose(Command::NoOp).await;
            }
        }
        pf_debug!(self.tag; "liveness nudger exits");
    }
}
