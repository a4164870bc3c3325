use crate::error::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Name of the shared ownership document
pub const OWNERSHIP_DOCUMENT: &str = "devspace-dependencies";

/// Who owns one dependency: the owner's callback address and run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    #[serde(default)]
    pub server: String,
    #[serde(rename = "runID", default)]
    pub run_id: String,
}

impl OwnershipRecord {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// A record missing either field cannot identify an owner
    pub fn is_complete(&self) -> bool {
        !self.server.is_empty() && !self.run_id.is_empty()
    }
}

/// Snapshot of the ownership document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnershipDocument {
    pub data: BTreeMap<String, String>,
    /// Opaque version used as the optimistic-concurrency precondition
    pub resource_version: String,
}

/// Key/value document shared by every process in a namespace
#[async_trait]
pub trait OwnershipStore: Send + Sync {
    /// Current document, `None` if it does not exist yet
    async fn get(&self) -> Result<Option<OwnershipDocument>, StoreError>;

    /// Create the document; `AlreadyExists` if someone else was first
    async fn create(&self, data: BTreeMap<String, String>) -> Result<OwnershipDocument, StoreError>;

    /// Write only `changes`, provided the document is still at `resource_version`
    async fn update(
        &self,
        changes: BTreeMap<String, String>,
        resource_version: &str,
    ) -> Result<OwnershipDocument, StoreError>;
}

/// In-process store with injectable write races
#[derive(Debug, Default)]
pub struct MemoryOwnershipStore {
    document: Mutex<Option<OwnershipDocument>>,
    version: AtomicU64,
    conflicts: AtomicU32,
    create_races: AtomicU32,
    writes: AtomicU32,
}

impl MemoryOwnershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` updates lose against a simulated concurrent writer
    pub fn inject_conflicts(&self, count: u32) {
        self.conflicts.store(count, Ordering::SeqCst);
    }

    /// The next `count` creates find a document created by someone else
    pub fn inject_create_races(&self, count: u32) {
        self.create_races.store(count, Ordering::SeqCst);
    }

    pub async fn snapshot(&self) -> Option<OwnershipDocument> {
        self.document.lock().await.clone()
    }

    pub async fn record(&self, name: &str) -> Option<OwnershipRecord> {
        let document = self.document.lock().await;
        document
            .as_ref()
            .and_then(|doc| doc.data.get(name))
            .and_then(|raw| OwnershipRecord::decode(raw).ok())
    }

    /// Seed a raw entry, creating the document when needed
    pub async fn put_raw(&self, name: &str, raw: &str) {
        let mut document = self.document.lock().await;
        let version = self.next_version();
        let doc = document.get_or_insert_with(OwnershipDocument::default);
        doc.data.insert(name.to_string(), raw.to_string());
        doc.resource_version = version;
    }

    /// Number of successful creates and updates
    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn take_injected(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl OwnershipStore for MemoryOwnershipStore {
    async fn get(&self) -> Result<Option<OwnershipDocument>, StoreError> {
        Ok(self.document.lock().await.clone())
    }

    async fn create(&self, data: BTreeMap<String, String>) -> Result<OwnershipDocument, StoreError> {
        let mut document = self.document.lock().await;

        if Self::take_injected(&self.create_races) && document.is_none() {
            *document = Some(OwnershipDocument {
                data: BTreeMap::new(),
                resource_version: self.next_version(),
            });
            return Err(StoreError::AlreadyExists);
        }
        if document.is_some() {
            return Err(StoreError::AlreadyExists);
        }

        let created = OwnershipDocument {
            data,
            resource_version: self.next_version(),
        };
        *document = Some(created.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn update(
        &self,
        changes: BTreeMap<String, String>,
        resource_version: &str,
    ) -> Result<OwnershipDocument, StoreError> {
        let mut document = self.document.lock().await;
        let version = self.next_version();
        let Some(doc) = document.as_mut() else {
            return Err(StoreError::Other(anyhow::anyhow!(
                "{} does not exist",
                OWNERSHIP_DOCUMENT
            )));
        };

        if Self::take_injected(&self.conflicts) {
            // Someone else wrote in between
            doc.resource_version = version;
            return Err(StoreError::Conflict);
        }
        if doc.resource_version != resource_version {
            return Err(StoreError::Conflict);
        }

        doc.data.extend(changes);
        doc.resource_version = version;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(doc.clone())
    }
}
