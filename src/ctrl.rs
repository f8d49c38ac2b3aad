//! Interface to the configuration controller.
//!
//! The controller is an external service that publishes monotonically
//! numbered configurations mapping every shard to an owning replica
//! group. Replicas only ever consume configurations; producing them is
//! the controller's business.

use std::collections::HashMap;

use crate::utils::{ShardsetError, N_SHARDS};

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

/// Replica group ID type. Gid 0 means "no group".
pub type Gid = u64;

/// Configuration epoch number type.
pub type ConfigNum = u64;

/// A numbered shard assignment. Epoch 0 is the empty configuration in
/// which no group owns any shard.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Monotonic configuration epoch, starting at 0.
    pub num: ConfigNum,

    /// Owning group of each shard index.
    pub shards: [Gid; N_SHARDS],

    /// Map from group ID -> list of server endpoints of that group.
    pub groups: HashMap<Gid, Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            num: 0,
            shards: [0; N_SHARDS],
            groups: HashMap::new(),
        }
    }
}

impl Config {
    /// Returns whether this configuration assigns `shard` to `gid`.
    pub fn owns(&self, gid: Gid, shard: usize) -> bool {
        self.shards[shard] == gid
    }
}

/// Query access to the controller.
#[async_trait]
pub trait ConfigService: Send + Sync {
    /// Fetches the configuration with the given epoch number, or the
    /// latest one if `num` is `None`. Querying past the newest epoch
    /// returns the newest.
    async fn query(
        &self,
        num: Option<ConfigNum>,
    ) -> Result<Config, ShardsetError>;
}
