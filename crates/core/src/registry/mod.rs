// Cluster-wide dependency ownership

mod peer;
mod store;

pub use peer::{ExcludePayload, NoPeers, PeerClient, PingPayload};
pub use store::{
    MemoryOwnershipStore, OwnershipDocument, OwnershipRecord, OwnershipStore, OWNERSHIP_DOCUMENT,
};

use crate::error::{ClaimError, StoreError};
use crate::types::RunId;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};

/// Result of claiming one dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Newly owned by this run; the caller should start it
    Owned,
    /// This run already owns it
    AlreadyOwned,
    /// A live process in the namespace owns it
    OwnedByOtherInstance,
    /// Claiming it would close a dependency cycle
    Cyclic,
}

impl Claim {
    pub fn is_owned(&self) -> bool {
        matches!(self, Claim::Owned | Claim::AlreadyOwned)
    }
}

/// Answer to an inbound exclude request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcludeDecision {
    Released,
    Refused,
    UnknownRun,
}

/// Tunables of the claim protocol
#[derive(Debug, Clone)]
pub struct ClaimPolicy {
    /// Retries after a lost write race
    pub max_retries: u32,
    pub ping_timeout: Duration,
    pub exclude_timeout: Duration,
    pub retry_backoff: Duration,
    /// Whether this process releases dependencies when asked to
    pub allow_takeover: bool,
}

impl Default for ClaimPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            ping_timeout: Duration::from_secs(2),
            exclude_timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_millis(50),
            allow_takeover: true,
        }
    }
}

/// Which dependency claimed which; used to detect cycles
#[derive(Debug, Default)]
struct DependencyGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    fn node(&mut self, name: &str) -> NodeIndex {
        if let Some(idx) = self.index.get(name) {
            return *idx;
        }
        let idx = self.graph.add_node(name.to_string());
        self.index.insert(name.to_string(), idx);
        idx
    }

    /// Record that `from` depends on `to`; false if that would close a cycle
    fn link(&mut self, from: &str, to: &str) -> bool {
        if from == to {
            return false;
        }
        let from = self.node(from);
        let to = self.node(to);
        if self.graph.find_edge(from, to).is_some() {
            return true;
        }
        if petgraph::algo::has_path_connecting(&self.graph, to, from, None) {
            return false;
        }
        self.graph.add_edge(from, to, ());
        true
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    claimed: BTreeMap<String, Claim>,
    graph: DependencyGraph,
}

enum WriteOutcome {
    Written,
    Conflict,
}

/// Grants this run best-effort exclusive ownership of named dependencies.
///
/// Without a store every claim succeeds locally (offline mode). With a
/// store, ownership is recorded in a shared document and contested
/// records are resolved by pinging the recorded owner.
pub struct DependencyRegistry {
    run_id: RunId,
    root: String,
    server: RwLock<String>,
    store: Option<Arc<dyn OwnershipStore>>,
    peers: Arc<dyn PeerClient>,
    policy: ClaimPolicy,
    state: Mutex<RegistryState>,
    released: broadcast::Sender<String>,
}

impl DependencyRegistry {
    pub fn new(
        run_id: RunId,
        root: impl Into<String>,
        store: Option<Arc<dyn OwnershipStore>>,
        peers: Arc<dyn PeerClient>,
        policy: ClaimPolicy,
    ) -> Self {
        let root = root.into();
        let (released, _) = broadcast::channel(16);
        let mut graph = DependencyGraph::default();
        graph.node(&root);

        Self {
            run_id,
            root,
            server: RwLock::new(String::new()),
            store,
            peers,
            policy,
            state: Mutex::new(RegistryState {
                claimed: BTreeMap::new(),
                graph,
            }),
            released,
        }
    }

    /// Registry without a cluster: every dependency is trivially owned
    pub fn offline(run_id: RunId, root: impl Into<String>) -> Self {
        Self::new(run_id, root, None, Arc::new(NoPeers), ClaimPolicy::default())
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn is_distributed(&self) -> bool {
        self.store.is_some()
    }

    pub fn policy(&self) -> &ClaimPolicy {
        &self.policy
    }

    /// Callback address peers use to reach this process
    pub async fn set_server(&self, server: impl Into<String>) {
        *self.server.write().await = server.into();
    }

    pub async fn server(&self) -> String {
        self.server.read().await.clone()
    }

    /// Names released to other processes through inbound exclude requests
    pub fn subscribe_released(&self) -> broadcast::Receiver<String> {
        self.released.subscribe()
    }

    /// Claim `names` on behalf of `from` (a dependency or the root project).
    ///
    /// With `force`, live owners are asked to release the dependency.
    pub async fn claim_dependencies(
        &self,
        from: &str,
        names: &[String],
        force: bool,
    ) -> Result<BTreeMap<String, Claim>, ClaimError> {
        let mut state = self.state.lock().await;
        let mut claims = BTreeMap::new();

        for name in names {
            let is_root_claim = from == self.root && name == &self.root && force;
            let claim = if !is_root_claim && !state.graph.link(from, name) {
                Claim::Cyclic
            } else {
                state.claimed.get(name).copied().unwrap_or(Claim::Owned)
            };
            claims.insert(name.clone(), claim);
        }

        if let Some(store) = &self.store {
            self.write_claims(store.as_ref(), &mut claims, force).await?;
        }

        for (name, claim) in &claims {
            let remembered = match claim {
                Claim::Owned | Claim::Cyclic => Claim::AlreadyOwned,
                other => *other,
            };
            state.claimed.insert(name.clone(), remembered);
        }

        tracing::debug!(from = %from, "Claimed dependencies: {:?}", claims);
        Ok(claims)
    }

    /// Drop the local belief that this run owns `name`
    pub async fn force_exclude(&self, name: &str) -> bool {
        self.state.lock().await.claimed.remove(name).is_some()
    }

    /// Inbound ping: is `run_id` this run?
    pub fn handle_ping(&self, run_id: &str) -> bool {
        run_id == self.run_id.to_string()
    }

    /// Inbound exclude request from a process taking over `name`
    pub async fn handle_exclude(&self, run_id: &str, name: &str) -> ExcludeDecision {
        if run_id != self.run_id.to_string() {
            return ExcludeDecision::UnknownRun;
        }
        if !self.policy.allow_takeover {
            tracing::info!(dependency = %name, "Refused to release dependency to another session");
            return ExcludeDecision::Refused;
        }

        self.force_exclude(name).await;
        tracing::info!(dependency = %name, "Released dependency to another session");
        // No subscribers is fine
        let _ = self.released.send(name.to_string());
        ExcludeDecision::Released
    }

    async fn write_claims(
        &self,
        store: &dyn OwnershipStore,
        claims: &mut BTreeMap<String, Claim>,
        force: bool,
    ) -> Result<(), ClaimError> {
        let mut failed_pings = HashSet::new();
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self
                .try_write(store, claims, force, &mut failed_pings)
                .await?
            {
                WriteOutcome::Written => return Ok(()),
                WriteOutcome::Conflict if attempts > self.policy.max_retries => {
                    let names = claims
                        .iter()
                        .filter(|(_, claim)| **claim == Claim::Owned)
                        .map(|(name, _)| name.clone())
                        .collect();
                    return Err(ClaimError::RetriesExhausted { names, attempts });
                }
                WriteOutcome::Conflict => {
                    tracing::debug!(
                        "Ownership document changed concurrently, retrying (attempt {})",
                        attempts
                    );
                    tokio::time::sleep(self.policy.retry_backoff * attempts).await;
                }
            }
        }
    }

    async fn try_write(
        &self,
        store: &dyn OwnershipStore,
        claims: &mut BTreeMap<String, Claim>,
        force: bool,
        failed_pings: &mut HashSet<String>,
    ) -> Result<WriteOutcome, ClaimError> {
        if !claims.values().any(|claim| *claim == Claim::Owned) {
            return Ok(WriteOutcome::Written);
        }

        let own = OwnershipRecord {
            server: self.server().await,
            run_id: self.run_id.to_string(),
        };
        let encoded = own.encode().map_err(|source| ClaimError::Encode {
            name: self.root.clone(),
            source,
        })?;

        let Some(document) = store.get().await.map_err(store_failure)? else {
            let data = claims
                .iter()
                .filter(|(_, claim)| **claim == Claim::Owned)
                .map(|(name, _)| (name.clone(), encoded.clone()))
                .collect();

            return match store.create(data).await {
                Ok(_) => Ok(WriteOutcome::Written),
                Err(StoreError::AlreadyExists) => Ok(WriteOutcome::Conflict),
                Err(err) => Err(store_failure(err)),
            };
        };

        let mut changes = BTreeMap::new();
        for (name, claim) in claims.iter_mut() {
            if *claim != Claim::Owned {
                continue;
            }

            let owner = match document.data.get(name).filter(|raw| !raw.is_empty()) {
                None => None,
                Some(raw) => match OwnershipRecord::decode(raw) {
                    Ok(record) if record.is_complete() => Some(record),
                    Ok(_) => {
                        tracing::debug!(dependency = %name, "Incomplete ownership record");
                        None
                    }
                    Err(err) => {
                        tracing::debug!(dependency = %name, "Error decoding ownership record: {}", err);
                        None
                    }
                },
            };

            let Some(owner) = owner else {
                changes.insert(name.clone(), encoded.clone());
                continue;
            };

            if owner.run_id == own.run_id {
                *claim = Claim::AlreadyOwned;
                continue;
            }

            if failed_pings.contains(&owner.server) || !self.ping(&owner).await {
                failed_pings.insert(owner.server.clone());
                changes.insert(name.clone(), encoded.clone());
                continue;
            }

            if force && self.request_release(&owner, name).await {
                changes.insert(name.clone(), encoded.clone());
                continue;
            }

            *claim = Claim::OwnedByOtherInstance;
        }

        if changes.is_empty() {
            return Ok(WriteOutcome::Written);
        }

        match store.update(changes, &document.resource_version).await {
            Ok(_) => Ok(WriteOutcome::Written),
            Err(StoreError::Conflict) => Ok(WriteOutcome::Conflict),
            Err(err) => Err(store_failure(err)),
        }
    }

    async fn ping(&self, owner: &OwnershipRecord) -> bool {
        let payload = PingPayload {
            run_id: owner.run_id.clone(),
        };
        match tokio::time::timeout(
            self.policy.ping_timeout,
            self.peers.ping(&owner.server, &payload),
        )
        .await
        {
            Ok(Ok(alive)) => alive,
            Ok(Err(err)) => {
                tracing::debug!("Error pinging {}: {:#}", owner.server, err);
                false
            }
            Err(_) => {
                tracing::debug!("Ping to {} timed out", owner.server);
                false
            }
        }
    }

    /// Ask a live owner to release; a failed request counts as consent
    async fn request_release(&self, owner: &OwnershipRecord, name: &str) -> bool {
        let payload = ExcludePayload {
            run_id: owner.run_id.clone(),
            dependency_name: name.to_string(),
        };
        match tokio::time::timeout(
            self.policy.exclude_timeout,
            self.peers.exclude_dependency(&owner.server, &payload),
        )
        .await
        {
            Ok(Ok(released)) => released,
            Ok(Err(err)) => {
                tracing::debug!(dependency = %name, "Error taking over dependency: {:#}", err);
                true
            }
            Err(_) => {
                tracing::debug!(dependency = %name, "Exclude request to {} timed out", owner.server);
                true
            }
        }
    }
}

fn store_failure(err: StoreError) -> ClaimError {
    ClaimError::Store(err.into())
}
