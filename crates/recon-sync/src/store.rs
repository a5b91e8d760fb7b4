//! Local record persistence boundary.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use recon_core::{
    normalize_domain, normalize_url, Attributes, Identifier, Identifiers, LocalRecord, RecordKind,
    WorkspaceId,
};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("record {0} not found")]
    NotFound(String),
    #[error("record {0} was modified concurrently")]
    Conflict(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// How the caller wants a record located.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKey {
    Id(String),
    /// First record matching any identifier, tried in match priority order.
    Identifiers(Identifiers),
}

/// Replacement values for the enrichment-owned parts of a record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpdate {
    pub attributes: Attributes,
    pub custom_fields: JsonValue,
    /// The write is rejected with [`StoreError::Conflict`] unless the stored
    /// record still carries this timestamp.
    pub expected_updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Soft-deleted records and records outside `workspace_id` are never
    /// returned.
    async fn find_local_record(
        &self,
        workspace_id: &WorkspaceId,
        kind: RecordKind,
        key: &RecordKey,
    ) -> Result<Option<LocalRecord>, StoreError>;

    /// Writes typed attributes and the attribute bag together or not at all.
    async fn update_local_record(
        &self,
        workspace_id: &WorkspaceId,
        kind: RecordKind,
        id: &str,
        update: RecordUpdate,
    ) -> Result<LocalRecord, StoreError>;
}

#[async_trait]
pub trait RecordFeed: Send + Sync {
    /// Live record ids ordered ascending, strictly after `after`.
    async fn list_record_ids(
        &self,
        workspace_id: &WorkspaceId,
        kind: RecordKind,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;
}

/// Whether `record` carries `identifier`, compared on normalized values.
pub fn record_matches(record: &LocalRecord, identifier: &Identifier) -> bool {
    let eq_ci = |stored: &Option<String>, wanted: &str| {
        stored
            .as_deref()
            .map(|s| s.trim().to_lowercase() == wanted)
            .unwrap_or(false)
    };
    match identifier {
        Identifier::LinkedinUrl(_) => record
            .attributes
            .linkedin_url
            .as_deref()
            .map(|url| normalize_url(url) == identifier.query_value())
            .unwrap_or(false),
        Identifier::Email(_) => eq_ci(&record.attributes.email, &identifier.query_value()),
        Identifier::Website(_) => record
            .attributes
            .website
            .as_deref()
            .map(|site| normalize_domain(site) == identifier.query_value())
            .unwrap_or(false),
        Identifier::NameAndCompany { name, company } => {
            record.name.trim().to_lowercase() == name.trim().to_lowercase()
                && match company {
                    Some(company) => eq_ci(&record.company_name, &company.trim().to_lowercase()),
                    None => true,
                }
        }
    }
}

type MemoryKey = (WorkspaceId, RecordKind, String);

/// In-process store used by tests and fixture runs.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<MemoryKey, LocalRecord>>,
    failing_updates: AtomicUsize,
    update_calls: AtomicUsize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: LocalRecord) {
        let key = (record.workspace_id.clone(), record.kind, record.id.clone());
        self.records.lock().await.insert(key, record);
    }

    /// Raw access, including soft-deleted records.
    pub async fn get(&self, workspace_id: &WorkspaceId, kind: RecordKind, id: &str) -> Option<LocalRecord> {
        self.records
            .lock()
            .await
            .get(&(workspace_id.clone(), kind, id.to_string()))
            .cloned()
    }

    /// The next `count` updates fail with a backend error and change nothing.
    pub fn fail_next_updates(&self, count: usize) {
        self.failing_updates.store(count, Ordering::SeqCst);
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }
}

fn live(record: &LocalRecord, workspace_id: &WorkspaceId, kind: RecordKind) -> bool {
    &record.workspace_id == workspace_id && record.kind == kind && record.deleted_at.is_none()
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn find_local_record(
        &self,
        workspace_id: &WorkspaceId,
        kind: RecordKind,
        key: &RecordKey,
    ) -> Result<Option<LocalRecord>, StoreError> {
        let records = self.records.lock().await;
        let found = match key {
            RecordKey::Id(id) => records
                .get(&(workspace_id.clone(), kind, id.clone()))
                .filter(|r| live(r, workspace_id, kind))
                .cloned(),
            RecordKey::Identifiers(identifiers) => identifiers.ordered(kind).iter().find_map(|identifier| {
                records
                    .values()
                    .filter(|r| live(r, workspace_id, kind))
                    .find(|r| record_matches(r, identifier))
                    .cloned()
            }),
        };
        Ok(found)
    }

    async fn update_local_record(
        &self,
        workspace_id: &WorkspaceId,
        kind: RecordKind,
        id: &str,
        update: RecordUpdate,
    ) -> Result<LocalRecord, StoreError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let consumed = self
            .failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(StoreError::Backend("injected write failure".to_string()));
        }

        let mut records = self.records.lock().await;
        let record = records
            .get_mut(&(workspace_id.clone(), kind, id.to_string()))
            .filter(|r| r.deleted_at.is_none())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if record.updated_at != update.expected_updated_at {
            return Err(StoreError::Conflict(id.to_string()));
        }

        record.attributes = update.attributes;
        record.custom_fields = update.custom_fields;
        record.updated_at = Utc::now().max(record.updated_at + Duration::microseconds(1));
        Ok(record.clone())
    }
}

#[async_trait]
impl RecordFeed for MemoryRecordStore {
    async fn list_record_ids(
        &self,
        workspace_id: &WorkspaceId,
        kind: RecordKind,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let records = self.records.lock().await;
        Ok(records
            .values()
            .filter(|r| live(r, workspace_id, kind))
            .filter(|r| after.map_or(true, |after| r.id.as_str() > after))
            .take(limit)
            .map(|r| r.id.clone())
            .collect())
    }
}
