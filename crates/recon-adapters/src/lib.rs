//! Enrichment provider contracts, the CoreSignal adapter and fixture-backed providers.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use recon_core::{EnrichmentError, ExternalCandidate, ExternalPayload, Identifier, RecordKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod coresignal;
mod fixture;

pub use coresignal::{CoreSignalConfig, CoreSignalProvider, CORESIGNAL_SOURCE};
pub use fixture::{
    load_fixture_bundle, FixtureBundle, FixtureProfile, FixtureProvider, FixtureSearch,
};

pub const CRATE_NAME: &str = "recon-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderContext {
    pub run_id: Uuid,
}

impl ProviderContext {
    pub fn new(run_id: Uuid) -> Self {
        Self { run_id }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Network failure, timeout, 5xx or 429. Worth retrying later.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("external record {external_id} not found")]
    NotFound { external_id: String },
    /// The provider refused the request and will keep refusing it.
    #[error("provider rejected request ({status}): {detail}")]
    Rejected { status: u16, detail: String },
}

impl From<ProviderError> for EnrichmentError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Unavailable(detail) => EnrichmentError::ProviderUnavailable(detail),
            ProviderError::NotFound { external_id } => EnrichmentError::RecordGone { external_id },
            ProviderError::Rejected { status, detail } => {
                EnrichmentError::ProviderRejected { status, detail }
            }
        }
    }
}

/// An external data provider that can be searched by identifier and asked
/// for full profiles. Implementations must not retry internally.
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    fn source_name(&self) -> &str;

    /// Ranked candidates for one identifier, best first. An empty list means
    /// the provider knows nothing matching.
    async fn search(
        &self,
        ctx: &ProviderContext,
        kind: RecordKind,
        identifier: &Identifier,
    ) -> Result<Vec<ExternalCandidate>, ProviderError>;

    async fn collect(
        &self,
        ctx: &ProviderContext,
        kind: RecordKind,
        external_id: &str,
    ) -> Result<ExternalPayload, ProviderError>;
}

/// Builds the provider for `source`. A fixture bundle, when given, replaces
/// the live adapter and supplies its own source name.
pub fn provider_for_source(
    source: &str,
    coresignal: &CoreSignalConfig,
    fixture_bundle: Option<&Path>,
) -> Result<Arc<dyn EnrichmentProvider>> {
    if let Some(path) = fixture_bundle {
        let bundle = load_fixture_bundle(path)?;
        return Ok(Arc::new(FixtureProvider::from_bundle(bundle)));
    }
    match source {
        CORESIGNAL_SOURCE => Ok(Arc::new(CoreSignalProvider::new(coresignal.clone())?)),
        other => bail!("no enrichment provider registered for {other}"),
    }
}
