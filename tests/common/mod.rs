//! In-process cluster harness for integration tests.
//!
//! Wires `ShardServer` replicas to a single-voter local consensus log
//! (with a persister surviving restarts), a local configuration
//! controller, and a local inter-group network whose endpoints can be
//! taken offline. Groups here run one replica each; consensus-side
//! fault tolerance belongs to the consensus module, not to the layer
//! under test.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use bytes::Bytes;

use shardset::{
    key_to_shard, ApplyMsg, ClientId, Command, Config, ConfigNum,
    ConfigService, ConfirmShardArgs, ConfirmShardReply, FetchShardArgs,
    FetchShardReply, GetArgs, Gid, GroupRpc, LogIndex, OpKind,
    PutAppendArgs, RaftHandle, ReplicaId, RpcErr, SeqNum, ShardServer,
    ShardsetError, Term, N_SHARDS,
};

use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant};

/// Server config overlay used by every test replica: tight cadences and
/// a low snapshot threshold so migrations and snapshots happen fast.
pub const TEST_SERVER_CONFIG: &str = "snapshot_threshold = 64\n\
                                      poll_interval_ms = 20\n\
                                      pull_interval_ms = 20\n\
                                      confirm_interval_ms = 20\n\
                                      noop_interval_ms = 100\n\
                                      client_wait_ms = 300";

/// Initializes the env_logger backend once per test binary.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Durable state of one group's consensus module, surviving restarts.
#[derive(Default)]
pub struct Persister {
    inner: Mutex<PersistState>,
}

#[derive(Default)]
struct PersistState {
    /// Latest snapshot blob handed over by the state machine.
    snapshot: Bytes,

    /// Index of the last entry the snapshot covers.
    snapshot_index: LogIndex,

    /// Retained log entries above the snapshot index, with their
    /// encoded sizes.
    log: Vec<(LogIndex, Command, usize)>,

    /// Last leader term used; bumped on every restart.
    term: Term,
}

/// Single-voter consensus log driving one test group. Commits every
/// proposal immediately and delivers it on the apply stream in propose
/// order through a dedicated delivery task, mirroring a real Raft
/// applier.
pub struct LocalRaft {
    persister: Arc<Persister>,
    inner: Mutex<RaftInner>,
}

struct RaftInner {
    next_index: LogIndex,
    term: Term,
    is_leader: bool,
    /// Whether the log holds an entry proposed in the current term.
    has_term_entry: bool,
    queue_tx: mpsc::UnboundedSender<ApplyMsg<Command>>,
}

impl LocalRaft {
    /// Boots (or reboots) a consensus instance on the given persister.
    /// Returns the handle plus the apply stream to hand to the server;
    /// entries retained above the snapshot index are re-delivered first.
    pub fn start(
        persister: Arc<Persister>,
    ) -> (Arc<LocalRaft>, mpsc::Receiver<ApplyMsg<Command>>) {
        let (apply_tx, apply_rx) = mpsc::channel(4096);
        let (queue_tx, mut queue_rx) =
            mpsc::unbounded_channel::<ApplyMsg<Command>>();
        tokio::spawn(async move {
            while let Some(msg) = queue_rx.recv().await {
                if apply_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let (next_index, term) = {
            let mut durable = persister.inner.lock().unwrap();
            durable.term += 1;
            for (index, command, _) in durable.log.iter() {
                let _ = queue_tx.send(ApplyMsg::Command {
                    index: *index,
                    command: command.clone(),
                });
            }
            let next_index = durable
                .log
                .last()
                .map(|(index, _, _)| *index)
                .unwrap_or(durable.snapshot_index);
            (next_index, durable.term)
        };

        let raft = Arc::new(LocalRaft {
            persister,
            inner: Mutex::new(RaftInner {
                next_index,
                term,
                is_leader: true,
                has_term_entry: false,
                queue_tx,
            }),
        });
        (raft, apply_rx)
    }

    /// Toggles this instance's notion of leadership, bumping the term
    /// on a step-up like a real election would.
    pub fn set_leader(&self, is_leader: bool) {
        let mut inner = self.inner.lock().unwrap();
        if is_leader && !inner.is_leader {
            inner.term += 1;
            inner.has_term_entry = false;
        }
        inner.is_leader = is_leader;
    }
}

#[async_trait]
impl RaftHandle<Command> for LocalRaft {
    async fn propose(&self, command: Command) -> (LogIndex, Term, bool) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.is_leader {
            return (0, inner.term, false);
        }
        inner.next_index += 1;
        inner.has_term_entry = true;
        let index = inner.next_index;
        let term = inner.term;

        let size = rmp_serde::encode::to_vec(&command)
            .map(|blob| blob.len())
            .unwrap_or(0);
        self.persister.inner.lock().unwrap().log.push((
            index,
            command.clone(),
            size,
        ));

        // enqueue under the lock so indices reach the stream in order
        let _ = inner.queue_tx.send(ApplyMsg::Command { index, command });
        (index, term, true)
    }

    fn get_state(&self) -> (Term, bool) {
        let inner = self.inner.lock().unwrap();
        (inner.term, inner.is_leader)
    }

    fn snapshot(&self, index: LogIndex, data: Bytes) {
        let mut durable = self.persister.inner.lock().unwrap();
        if index <= durable.snapshot_index {
            return;
        }
        durable.snapshot = data;
        durable.snapshot_index = index;
        durable.log.retain(|(i, _, _)| *i > index);
    }

    fn cond_install_snapshot(
        &self,
        _term: Term,
        index: LogIndex,
        data: &Bytes,
    ) -> bool {
        let mut durable = self.persister.inner.lock().unwrap();
        if index <= durable.snapshot_index {
            return false;
        }
        durable.snapshot = data.clone();
        durable.snapshot_index = index;
        durable.log.retain(|(i, _, _)| *i > index);
        true
    }

    fn state_size(&self) -> usize {
        let durable = self.persister.inner.lock().unwrap();
        durable.log.iter().map(|(_, _, size)| size).sum()
    }

    fn need_no_op(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.is_leader && !inner.has_term_entry
    }

    fn load_snapshot(&self) -> Bytes {
        self.persister.inner.lock().unwrap().snapshot.clone()
    }
}

/// Local configuration controller: an append-only list of epochs.
#[derive(Default)]
pub struct LocalCtrl {
    configs: Mutex<Vec<Config>>,
    queried: Mutex<Vec<ConfigNum>>,
}

impl LocalCtrl {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalCtrl {
            configs: Mutex::new(vec![Config::default()]),
            queried: Mutex::new(Vec::new()),
        })
    }

    /// Publishes the next epoch with the given shard assignment. Group
    /// server lists are named by `server_name` convention.
    pub fn push(
        &self,
        shards: [Gid; N_SHARDS],
        group_sizes: &HashMap<Gid, u8>,
    ) -> ConfigNum {
        let mut configs = self.configs.lock().unwrap();
        let num = configs.len() as ConfigNum;
        let groups = group_sizes
            .iter()
            .map(|(&gid, &n)| {
                (gid, (0..n).map(|id| server_name(gid, id)).collect())
            })
            .collect();
        configs.push(Config {
            num,
            shards,
            groups,
        });
        num
    }

    /// Epoch numbers of every explicitly numbered query received.
    pub fn explicit_queries(&self) -> Vec<ConfigNum> {
        self.queried.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConfigService for LocalCtrl {
    async fn query(
        &self,
        num: Option<ConfigNum>,
    ) -> Result<Config, ShardsetError> {
        if let Some(num) = num {
            self.queried.lock().unwrap().push(num);
        }
        let configs = self.configs.lock().unwrap();
        let pick = match num {
            None => configs.len() - 1,
            Some(num) => (num as usize).min(configs.len() - 1),
        };
        Ok(configs[pick].clone())
    }
}

/// Local inter-group network: a registry of named server endpoints.
/// Unregistered endpoints behave like an unreachable host.
#[derive(Default)]
pub struct LocalNet {
    servers: Mutex<HashMap<String, Arc<ShardServer>>>,
}

impl LocalNet {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalNet::default())
    }

    pub fn register(&self, name: &str, server: Arc<ShardServer>) {
        self.servers
            .lock()
            .unwrap()
            .insert(name.to_string(), server);
    }

    pub fn unregister(&self, name: &str) {
        self.servers.lock().unwrap().remove(name);
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<ShardServer>> {
        self.servers.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl GroupRpc for LocalNet {
    async fn fetch_shard(
        &self,
        server: &str,
        args: FetchShardArgs,
    ) -> Result<FetchShardReply, ShardsetError> {
        let target = self
            .lookup(server)
            .ok_or_else(|| ShardsetError::msg("endpoint unreachable"))?;
        Ok(target.handle_fetch_shard(&args))
    }

    async fn confirm_shard(
        &self,
        server: &str,
        args: ConfirmShardArgs,
    ) -> Result<ConfirmShardReply, ShardsetError> {
        let target = self
            .lookup(server)
            .ok_or_else(|| ShardsetError::msg("endpoint unreachable"))?;
        Ok(target.handle_confirm_shard(&args))
    }
}

/// Endpoint naming convention shared by controller configs and the net.
pub fn server_name(gid: Gid, id: ReplicaId) -> String {
    format!("srv-{}-{}", gid, id)
}

/// One running replica plus the pieces needed to crash and restart it.
pub struct Node {
    pub gid: Gid,
    pub id: ReplicaId,
    pub server: Arc<ShardServer>,
    pub raft: Arc<LocalRaft>,
    pub persister: Arc<Persister>,
}

impl Node {
    /// Starts a replica of group `gid` on the given (possibly already
    /// used) persister and registers it with the net.
    pub async fn start(
        gid: Gid,
        id: ReplicaId,
        persister: Arc<Persister>,
        ctrl: Arc<LocalCtrl>,
        net: Arc<LocalNet>,
    ) -> Node {
        let (raft, apply_rx) = LocalRaft::start(persister.clone());
        let server = ShardServer::new_and_setup(
            gid,
            id,
            raft.clone(),
            apply_rx,
            ctrl,
            net.clone(),
            Some(TEST_SERVER_CONFIG),
        )
        .await
        .expect("server setup failed");
        net.register(&server_name(gid, id), server.clone());
        Node {
            gid,
            id,
            server,
            raft,
            persister,
        }
    }

    /// Crashes this replica: kills the server and takes its endpoint
    /// off the net. Durable state stays in the persister.
    pub fn crash(&self, net: &LocalNet) {
        self.server.kill();
        net.unregister(&server_name(self.gid, self.id));
    }
}

/// Minimal client clerk: routes by the latest configuration, retries on
/// WrongLeader/WrongGroup, and reuses the sequence number across
/// retries of one operation so dedup is actually exercised.
pub struct Clerk {
    id: ClientId,
    seq: SeqNum,
    ctrl: Arc<LocalCtrl>,
    net: Arc<LocalNet>,
    config: Config,
}

impl Clerk {
    pub fn new(id: ClientId, ctrl: Arc<LocalCtrl>, net: Arc<LocalNet>) -> Self {
        Clerk {
            id,
            seq: 0,
            ctrl,
            net,
            config: Config::default(),
        }
    }

    pub async fn get(&mut self, key: &str) -> String {
        self.seq += 1;
        let (seq, id) = (self.seq, self.id);
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            assert!(Instant::now() < deadline, "get('{}') timed out", key);
            if let Some(server) = self.route(key).await {
                let reply = server
                    .get(GetArgs {
                        key: key.to_string(),
                        client_id: id,
                        seq,
                    })
                    .await;
                match reply.err {
                    RpcErr::Ok => return reply.value,
                    RpcErr::WrongGroup => self.refresh().await,
                    _ => {}
                }
            } else {
                self.refresh().await;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn put(&mut self, key: &str, value: &str) {
        self.put_append(key, value, OpKind::Put).await;
    }

    pub async fn append(&mut self, key: &str, value: &str) {
        self.put_append(key, value, OpKind::Append).await;
    }

    async fn put_append(&mut self, key: &str, value: &str, kind: OpKind) {
        self.seq += 1;
        let (seq, id) = (self.seq, self.id);
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            assert!(
                Instant::now() < deadline,
                "{:?}('{}') timed out",
                kind,
                key
            );
            if let Some(server) = self.route(key).await {
                let reply = server
                    .put_append(PutAppendArgs {
                        key: key.to_string(),
                        value: value.to_string(),
                        kind,
                        client_id: id,
                        seq,
                    })
                    .await;
                match reply.err {
                    RpcErr::Ok => return,
                    RpcErr::WrongGroup => self.refresh().await,
                    _ => {}
                }
            } else {
                self.refresh().await;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Picks a registered server of the group owning the key's shard.
    async fn route(&mut self, key: &str) -> Option<Arc<ShardServer>> {
        if self.config.num == 0 {
            self.refresh().await;
        }
        let gid = self.config.shards[key_to_shard(key)];
        let servers = self.config.groups.get(&gid)?;
        servers.iter().find_map(|name| self.net.lookup(name))
    }

    async fn refresh(&mut self) {
        if let Ok(latest) = self.ctrl.query(None).await {
            self.config = latest;
        }
    }
}

/// Polls until `cond` holds, panicking after `secs` seconds.
pub async fn wait_until<F>(secs: u64, what: &str, mut cond: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(secs);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        time::sleep(Duration::from_millis(20)).await;
    }
}
