//! Interface to the underlying consensus module.
//!
//! The shard-KV server is layered on top of a Raft-style replicated log
//! owned by an external module. That module is reached through the
//! `RaftHandle` trait below plus an apply stream (a `tokio::sync::mpsc`
//! receiver of `ApplyMsg`s handed to the server at construction), which
//! delivers committed entries in index order.

use async_trait::async_trait;

use bytes::Bytes;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Consensus term number type.
pub type Term = u64;

/// Consensus log index type.
pub type LogIndex = u64;

/// One delivery on the apply stream: either a committed command at its
/// log index, or a snapshot that supersedes a prefix of the log.
#[derive(Debug, Clone)]
pub enum ApplyMsg<Cmd> {
    /// A committed log entry.
    Command {
        /// Index this command was committed at.
        index: LogIndex,

        /// The proposed command itself.
        command: Cmd,
    },

    /// A snapshot installed from the leader. Must be validated through
    /// `RaftHandle::cond_install_snapshot` before being restored.
    Snapshot {
        /// Term of the last entry covered by the snapshot.
        term: Term,

        /// Index of the last entry covered by the snapshot.
        index: LogIndex,

        /// Opaque snapshot blob, as previously produced by the state
        /// machine layer.
        data: Bytes,
    },
}

/// Handle to the consensus module, generic over the command type carried
/// in log entries.
#[async_trait]
pub trait RaftHandle<Cmd>: Send + Sync
where
    Cmd: Serialize + DeserializeOwned + Send + 'static,
{
    /// Appends a command to the log. Returns the index the entry will
    /// occupy if committed, the current term, and whether this replica
    /// believes itself leader. Proposals on a non-leader are no-ops.
    async fn propose(
        &self,
        command: Cmd,
    ) -> (LogIndex, Term, bool);

    /// Returns the current term and whether this replica is leader.
    fn get_state(&self) -> (Term, bool);

    /// Instructs consensus to truncate its log through `index`, durably
    /// saving `data` as the covering snapshot.
    fn snapshot(&self, index: LogIndex, data: Bytes);

    /// Offers an inbound snapshot for installation. Returns `false` if
    /// the snapshot is already superseded and must be ignored.
    fn cond_install_snapshot(
        &self,
        term: Term,
        index: LogIndex,
        data: &Bytes,
    ) -> bool;

    /// Current size in bytes of the persisted consensus state, used to
    /// decide when to snapshot.
    fn state_size(&self) -> usize;

    /// True iff the log contains no entry proposed in the current leader
    /// term, i.e. a no-op is needed to unblock commitment.
    fn need_no_op(&self) -> bool;

    /// Loads the latest durable snapshot blob; empty if none was taken.
    fn load_snapshot(&self) -> Bytes;
}
