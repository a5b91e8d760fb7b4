//! Per-record Matcher → Collector → Merger workflow.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use recon_adapters::{EnrichmentProvider, ProviderContext};
use recon_core::{
    Identifiers, OverwritePolicy, RecordKind, RecordOutcome, RecordState, SkipReason, WorkspaceId,
};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::collector::Collector;
use crate::matcher::Matcher;
use crate::merge::Merger;
use crate::store::{RecordKey, RecordStore, RecordUpdate};

/// External ids already matched in this run, mapped to the record that took
/// them.
#[derive(Debug, Default)]
pub struct CandidateClaims {
    claimed: StdMutex<HashMap<(RecordKind, String), String>>,
}

impl CandidateClaims {
    /// Claims `external_id` for `record_id`. Re-claiming by the same record
    /// succeeds; otherwise the current owner is returned.
    pub fn claim(&self, kind: RecordKind, external_id: &str, record_id: &str) -> Result<(), String> {
        let mut claimed = match self.claimed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let owner = claimed
            .entry((kind, external_id.to_string()))
            .or_insert_with(|| record_id.to_string());
        if owner == record_id {
            Ok(())
        } else {
            Err(owner.clone())
        }
    }
}

/// Keyed async locks so one record is never worked on twice at once.
#[derive(Debug, Default)]
pub struct RecordLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RecordLocks {
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Settings shared by every record in one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub workspace_id: WorkspaceId,
    pub policy: OverwritePolicy,
    pub claims: Arc<CandidateClaims>,
}

impl RunContext {
    pub fn new(workspace_id: WorkspaceId, policy: OverwritePolicy) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            workspace_id,
            policy,
            claims: Arc::new(CandidateClaims::default()),
        }
    }

    fn provider_context(&self) -> ProviderContext {
        ProviderContext::new(self.run_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordReport {
    pub record_id: Option<String>,
    pub outcome: RecordOutcome,
    /// Every state the record passed through, `Pending` first.
    pub states: Vec<RecordState>,
}

struct Trail {
    states: Vec<RecordState>,
}

impl Trail {
    fn new() -> Self {
        Self {
            states: vec![RecordState::Pending],
        }
    }

    fn current(&self) -> RecordState {
        self.states
            .last()
            .copied()
            .unwrap_or(RecordState::Pending)
    }

    fn advance(&mut self, next: RecordState) {
        debug_assert!(
            self.current().can_transition_to(next),
            "invalid transition {:?} -> {:?}",
            self.current(),
            next
        );
        self.states.push(next);
    }

    fn finish(mut self, record_id: Option<String>, outcome: RecordOutcome) -> RecordReport {
        self.advance(outcome.state());
        RecordReport {
            record_id,
            outcome,
            states: self.states,
        }
    }
}

pub struct EnrichmentWorkflow {
    source: String,
    matcher: Matcher,
    collector: Collector,
    merger: Merger,
    store: Arc<dyn RecordStore>,
    locks: RecordLocks,
}

impl EnrichmentWorkflow {
    pub fn new(
        provider: Arc<dyn EnrichmentProvider>,
        store: Arc<dyn RecordStore>,
        merger: Merger,
    ) -> Self {
        Self {
            source: provider.source_name().to_string(),
            matcher: Matcher::new(provider.clone()),
            collector: Collector::new(provider),
            merger,
            store,
            locks: RecordLocks::default(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Runs one record through match, collect and merge. Never fails: every
    /// problem ends up in the returned outcome.
    pub async fn enrich_record(
        &self,
        ctx: &RunContext,
        kind: RecordKind,
        record_id: &str,
    ) -> RecordReport {
        let span = info_span!(
            "enrich_record",
            run_id = %ctx.run_id,
            workspace_id = %ctx.workspace_id,
            %kind,
            record_id
        );
        async {
            let _guard = self.locks.lock(&format!("{kind}:{record_id}")).await;
            let report = self.run(ctx, kind, record_id).await;
            info!(
                outcome = report.outcome.kind().as_str(),
                "record finished"
            );
            report
        }
        .instrument(span)
        .await
    }

    /// Looks a record up by identifiers within the run's workspace, then
    /// enriches it.
    pub async fn enrich_by_identifiers(
        &self,
        ctx: &RunContext,
        kind: RecordKind,
        identifiers: Identifiers,
    ) -> RecordReport {
        let key = RecordKey::Identifiers(identifiers);
        match self.store.find_local_record(&ctx.workspace_id, kind, &key).await {
            Ok(Some(record)) => self.enrich_record(ctx, kind, &record.id).await,
            Ok(None) => Trail::new().finish(
                None,
                RecordOutcome::PersistenceError {
                    detail: "no local record matches the given identifiers".to_string(),
                },
            ),
            Err(err) => Trail::new().finish(
                None,
                RecordOutcome::PersistenceError {
                    detail: err.to_string(),
                },
            ),
        }
    }

    async fn run(&self, ctx: &RunContext, kind: RecordKind, record_id: &str) -> RecordReport {
        let mut trail = Trail::new();
        let id = Some(record_id.to_string());

        let record = match self
            .store
            .find_local_record(&ctx.workspace_id, kind, &RecordKey::Id(record_id.to_string()))
            .await
        {
            Ok(Some(record)) => record,
            Ok(None) => {
                return trail.finish(
                    id,
                    RecordOutcome::PersistenceError {
                        detail: format!("record {record_id} not found in workspace"),
                    },
                )
            }
            Err(err) => {
                return trail.finish(
                    id,
                    RecordOutcome::PersistenceError {
                        detail: err.to_string(),
                    },
                )
            }
        };

        let provider_ctx = ctx.provider_context();

        trail.advance(RecordState::Matching);
        let candidate = match self
            .matcher
            .find_candidate(&provider_ctx, kind, &record.identifiers())
            .await
        {
            Ok(Some(candidate)) => candidate,
            Ok(None) => return trail.finish(id, RecordOutcome::NoMatchFound),
            Err(err) => return trail.finish(id, err.into()),
        };
        trail.advance(RecordState::Matched);

        trail.advance(RecordState::Collecting);
        let payload = match self
            .collector
            .collect(&provider_ctx, kind, &candidate.external_id)
            .await
        {
            Ok(payload) => payload,
            Err(err) => return trail.finish(id, err.into()),
        };
        trail.advance(RecordState::Collected);

        trail.advance(RecordState::Merging);
        let external_id = payload.external_id.clone();
        if let Err(owner) = ctx.claims.claim(kind, &external_id, &record.id) {
            warn!(%external_id, claimed_by = %owner, "candidate already matched in this run");
            return trail.finish(
                id,
                RecordOutcome::MergeSkipped {
                    external_id,
                    reason: SkipReason::CandidateClaimed { claimed_by: owner },
                },
            );
        }

        let plan = match self.merger.plan(&record, &payload, ctx.policy, Utc::now()) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(error = %err, "refusing to merge into this record");
                return trail.finish(
                    id,
                    RecordOutcome::PersistenceError {
                        detail: err.to_string(),
                    },
                );
            }
        };
        if plan.is_noop() {
            return trail.finish(
                id,
                RecordOutcome::MergeSkipped {
                    external_id,
                    reason: SkipReason::NoChanges,
                },
            );
        }

        let update = RecordUpdate {
            attributes: plan.attributes,
            custom_fields: plan.custom_fields,
            expected_updated_at: record.updated_at,
        };
        match self
            .store
            .update_local_record(&ctx.workspace_id, kind, &record.id, update)
            .await
        {
            Ok(_) => trail.finish(
                id,
                RecordOutcome::Merged {
                    external_id,
                    fields_updated: plan.fields_updated,
                },
            ),
            Err(err) => {
                warn!(error = %err, "merge not persisted");
                trail.finish(
                    id,
                    RecordOutcome::PersistenceError {
                        detail: err.to_string(),
                    },
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_are_exclusive_per_kind() {
        let claims = CandidateClaims::default();
        assert!(claims.claim(RecordKind::Person, "101", "p1").is_ok());
        assert!(claims.claim(RecordKind::Person, "101", "p1").is_ok());
        assert_eq!(
            claims.claim(RecordKind::Person, "101", "p2"),
            Err("p1".to_string())
        );
        assert!(claims.claim(RecordKind::Company, "101", "c1").is_ok());
    }

    #[test]
    fn trail_records_every_state() {
        let mut trail = Trail::new();
        trail.advance(RecordState::Matching);
        let report = trail.finish(Some("p1".into()), RecordOutcome::NoMatchFound);
        assert_eq!(
            report.states,
            vec![
                RecordState::Pending,
                RecordState::Matching,
                RecordState::NoMatchFound
            ]
        );
    }

    #[tokio::test]
    async fn record_locks_serialize_holders() {
        let locks = Arc::new(RecordLocks::default());
        let guard = locks.lock("person:p1").await;
        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _second = locks.lock("person:p1").await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());
        let _other = locks.lock("person:p2").await;
        drop(guard);
        contender.await.expect("second holder");
    }
}
