use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_core::{ExternalCandidate, ExternalPayload, Identifier, IdentifierKind, RecordKind};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{EnrichmentProvider, ProviderContext, ProviderError};

/// Recorded provider responses for offline runs and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub source: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub searches: Vec<FixtureSearch>,
    #[serde(default)]
    pub profiles: Vec<FixtureProfile>,
    /// External ids the provider reports as deleted.
    #[serde(default)]
    pub gone: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureSearch {
    pub kind: RecordKind,
    pub identifier: IdentifierKind,
    /// Raw identifier value; matched after normalization.
    pub value: String,
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureProfile {
    pub kind: RecordKind,
    pub external_id: String,
    pub document: JsonValue,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn identifier_from_parts(kind: RecordKind, identifier: IdentifierKind, value: &str) -> Identifier {
    match identifier {
        IdentifierKind::LinkedinUrl => Identifier::LinkedinUrl(value.to_string()),
        IdentifierKind::Email => Identifier::Email(value.to_string()),
        IdentifierKind::Website => Identifier::Website(value.to_string()),
        IdentifierKind::NameAndCompany => {
            let mut parts = value.splitn(2, '|');
            let name = parts.next().unwrap_or_default().to_string();
            let company = match kind {
                RecordKind::Person => parts.next().map(ToString::to_string),
                RecordKind::Company => None,
            };
            Identifier::NameAndCompany { name, company }
        }
    }
}

type SearchKey = (RecordKind, IdentifierKind, String);

fn search_key(kind: RecordKind, identifier: &Identifier) -> SearchKey {
    (kind, identifier.kind(), identifier.query_value())
}

/// In-process provider answering from recorded searches and profiles.
///
/// Unknown searches return no candidates and unknown profiles are reported
/// as gone. Transient failures can be scheduled to exercise retry paths.
#[derive(Debug, Default)]
pub struct FixtureProvider {
    source: String,
    searches: HashMap<SearchKey, Vec<String>>,
    missing_searches: HashSet<SearchKey>,
    profiles: HashMap<(RecordKind, String), JsonValue>,
    gone: HashSet<String>,
    captured_at: Option<DateTime<Utc>>,
    failing_searches: AtomicUsize,
    failing_collects: AtomicUsize,
    rejected_searches: Option<u16>,
    search_calls: AtomicUsize,
    collect_calls: AtomicUsize,
    search_log: Mutex<Vec<(IdentifierKind, String)>>,
}

impl FixtureProvider {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    pub fn from_bundle(bundle: FixtureBundle) -> Self {
        let mut provider = Self::new(bundle.source);
        provider.captured_at = Some(bundle.captured_at);
        for search in bundle.searches {
            let identifier = identifier_from_parts(search.kind, search.identifier, &search.value);
            provider = provider.with_search(search.kind, &identifier, search.candidates);
        }
        for profile in bundle.profiles {
            provider = provider.with_profile(profile.kind, profile.external_id, profile.document);
        }
        for external_id in bundle.gone {
            provider = provider.with_gone(external_id);
        }
        provider
    }

    pub fn with_search<I, S>(mut self, kind: RecordKind, identifier: &Identifier, candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.searches.insert(
            search_key(kind, identifier),
            candidates.into_iter().map(Into::into).collect(),
        );
        self
    }

    pub fn with_profile(
        mut self,
        kind: RecordKind,
        external_id: impl Into<String>,
        document: JsonValue,
    ) -> Self {
        self.profiles.insert((kind, external_id.into()), document);
        self
    }

    /// Searches for `identifier` answer with a 404 instead of an empty list.
    pub fn with_missing_search(mut self, kind: RecordKind, identifier: &Identifier) -> Self {
        self.missing_searches.insert(search_key(kind, identifier));
        self
    }

    pub fn with_gone(mut self, external_id: impl Into<String>) -> Self {
        self.gone.insert(external_id.into());
        self
    }

    /// The next `count` search calls fail as unavailable.
    pub fn with_transient_search_failures(self, count: usize) -> Self {
        self.failing_searches.store(count, Ordering::SeqCst);
        self
    }

    /// The next `count` collect calls fail as unavailable.
    pub fn with_transient_collect_failures(self, count: usize) -> Self {
        self.failing_collects.store(count, Ordering::SeqCst);
        self
    }

    /// Every search is refused with `status`.
    pub fn with_rejected_searches(mut self, status: u16) -> Self {
        self.rejected_searches = Some(status);
        self
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn collect_calls(&self) -> usize {
        self.collect_calls.load(Ordering::SeqCst)
    }

    /// Identifier kinds and normalized values searched so far, in call order.
    pub fn searched(&self) -> Vec<(IdentifierKind, String)> {
        self.search_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    fn consume_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl EnrichmentProvider for FixtureProvider {
    fn source_name(&self) -> &str {
        &self.source
    }

    async fn search(
        &self,
        _ctx: &ProviderContext,
        kind: RecordKind,
        identifier: &Identifier,
    ) -> Result<Vec<ExternalCandidate>, ProviderError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut log) = self.search_log.lock() {
            log.push((identifier.kind(), identifier.query_value()));
        }

        if let Some(status) = self.rejected_searches {
            return Err(ProviderError::Rejected {
                status,
                detail: "fixture rejects searches".to_string(),
            });
        }
        if Self::consume_failure(&self.failing_searches) {
            return Err(ProviderError::Unavailable(
                "fixture search outage".to_string(),
            ));
        }

        let key = search_key(kind, identifier);
        if self.missing_searches.contains(&key) {
            return Err(ProviderError::NotFound {
                external_id: identifier.query_value(),
            });
        }
        let ids = self
            .searches
            .get(&key)
            .cloned()
            .unwrap_or_default();
        Ok(ids
            .into_iter()
            .enumerate()
            .map(|(rank, external_id)| ExternalCandidate { external_id, rank })
            .collect())
    }

    async fn collect(
        &self,
        _ctx: &ProviderContext,
        kind: RecordKind,
        external_id: &str,
    ) -> Result<ExternalPayload, ProviderError> {
        self.collect_calls.fetch_add(1, Ordering::SeqCst);
        if Self::consume_failure(&self.failing_collects) {
            return Err(ProviderError::Unavailable(
                "fixture collect outage".to_string(),
            ));
        }

        let document = match self.profiles.get(&(kind, external_id.to_string())) {
            Some(document) if !self.gone.contains(external_id) => document.clone(),
            _ => {
                return Err(ProviderError::NotFound {
                    external_id: external_id.to_string(),
                })
            }
        };
        Ok(ExternalPayload {
            external_id: external_id.to_string(),
            source: self.source.clone(),
            fetched_at: self.captured_at.unwrap_or_else(Utc::now),
            document,
        })
    }
}
