//! One-shot migration of legacy enrichment keys into the canonical bag.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use recon_core::bag::normalize_legacy;
use recon_core::{RecordKind, WorkspaceId};
use serde::Serialize;
use tracing::{info, warn};

use crate::store::{RecordFeed, RecordKey, RecordStore, RecordUpdate};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NormalizeSummary {
    pub scanned: usize,
    pub migrated: Vec<String>,
    pub failed: Vec<String>,
}

/// Rewrites every record in the workspace whose `custom_fields` still carry
/// legacy keys. Typed attributes are written back unchanged.
pub async fn normalize_workspace(
    store: Arc<dyn RecordStore>,
    feed: Arc<dyn RecordFeed>,
    workspace_id: &WorkspaceId,
    kind: RecordKind,
    page_size: usize,
) -> Result<NormalizeSummary> {
    let mut summary = NormalizeSummary::default();
    let mut cursor: Option<String> = None;

    loop {
        let ids = feed
            .list_record_ids(workspace_id, kind, cursor.as_deref(), page_size.max(1))
            .await
            .with_context(|| format!("listing {kind} records for {workspace_id}"))?;
        let Some(last) = ids.last().cloned() else {
            break;
        };

        for id in ids {
            summary.scanned += 1;
            let record = match store
                .find_local_record(workspace_id, kind, &RecordKey::Id(id.clone()))
                .await
            {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(err) => {
                    warn!(record_id = %id, error = %err, "could not load record");
                    summary.failed.push(id);
                    continue;
                }
            };
            let Some(custom_fields) = normalize_legacy(&record.custom_fields, Utc::now()) else {
                continue;
            };

            let update = RecordUpdate {
                attributes: record.attributes.clone(),
                custom_fields,
                expected_updated_at: record.updated_at,
            };
            match store.update_local_record(workspace_id, kind, &id, update).await {
                Ok(_) => summary.migrated.push(id),
                Err(err) => {
                    warn!(record_id = %id, error = %err, "legacy bag not migrated");
                    summary.failed.push(id);
                }
            }
        }
        cursor = Some(last);
    }

    info!(
        %workspace_id,
        %kind,
        scanned = summary.scanned,
        migrated = summary.migrated.len(),
        failed = summary.failed.len(),
        "normalization finished"
    );
    Ok(summary)
}
