//! Shard-KV server -- snapshot codec.
//!
//! The snapshot blob is an opaque byte string handed to/from the
//! consensus module; its decoded contents are the tuple (kv map, dedup
//! table, shard states, current config, previous config) in that order.
//! The shard states alone encode whether pulling/releasing must resume
//! after a restore, so no extra migration metadata is persisted.

use std::collections::HashMap;

use super::state::{ClientId, ReplicaState, SeqNum, ShardState};
use crate::ctrl::Config;
use crate::utils::{ShardsetError, N_SHARDS};

use bytes::Bytes;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

/// Decoded snapshot contents, field order fixed by the wire layout.
type SnapshotTuple = (
    HashMap<String, String>,
    HashMap<ClientId, SeqNum>,
    [ShardState; N_SHARDS],
    Config,
    Config,
);

impl ReplicaState {
    /// Serializes the persisted portion of the state into an opaque blob.
    pub fn to_snapshot(&self) -> Result<Bytes, ShardsetError> {
        let blob = encode_to_vec(&(
            &self.kv,
            &self.client_seq,
            &self.shard_states,
            &self.config,
            &self.prev_config,
        ))?;
        Ok(Bytes::from(blob))
    }

    /// Restores the persisted portion of the state from a snapshot blob.
    ///
    /// A decode failure leaves the state untouched, which at startup is
    /// the fresh epoch-0 default.
    pub fn restore_snapshot(&mut self, data: &Bytes, tag: &str) {
        if data.is_empty() {
            return;
        }
        match decode_from_slice::<SnapshotTuple>(data) {
            Ok((kv, client_seq, shard_states, config, prev_config)) => {
                self.kv = kv;
                self.client_seq = client_seq;
                self.shard_states = shard_states;
                self.config = config;
                self.prev_config = prev_config;
                pf_debug!(tag; "restored snapshot at epoch {}",
                               self.config.num);
            }
            Err(e) => {
                pf_warn!(tag; "snapshot decode failed, starting fresh: {}",
                              e);
            }
        }
    }
}
