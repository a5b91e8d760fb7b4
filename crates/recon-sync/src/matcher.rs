//! Resolves a record's identifiers to at most one external candidate.

use std::sync::Arc;

use recon_adapters::{EnrichmentProvider, ProviderContext, ProviderError};
use recon_core::{EnrichmentError, ExternalCandidate, Identifiers, RecordKind};
use tracing::{debug, info};

#[derive(Clone)]
pub struct Matcher {
    provider: Arc<dyn EnrichmentProvider>,
}

impl Matcher {
    pub fn new(provider: Arc<dyn EnrichmentProvider>) -> Self {
        Self { provider }
    }

    /// Searches one identifier at a time in priority order and stops at the
    /// first one that yields candidates, taking the top-ranked hit.
    ///
    /// `Ok(None)` means every usable identifier came back empty or not
    /// found. Other provider failures end the search immediately; there is
    /// no retry here.
    pub async fn find_candidate(
        &self,
        ctx: &ProviderContext,
        kind: RecordKind,
        identifiers: &Identifiers,
    ) -> Result<Option<ExternalCandidate>, EnrichmentError> {
        let ordered = identifiers.ordered(kind);
        if ordered.is_empty() {
            return Err(EnrichmentError::InsufficientIdentifiers);
        }

        for identifier in &ordered {
            let candidates = match self.provider.search(ctx, kind, identifier).await {
                Ok(candidates) => candidates,
                // A 404 on search has nothing to do with a collected record.
                Err(ProviderError::NotFound { .. }) => {
                    debug!(
                        identifier = identifier.kind().as_str(),
                        "search answered not found"
                    );
                    Vec::new()
                }
                Err(err) => return Err(err.into()),
            };
            debug!(
                identifier = identifier.kind().as_str(),
                candidates = candidates.len(),
                "search finished"
            );
            if let Some(best) = candidates.into_iter().min_by_key(|c| c.rank) {
                info!(
                    identifier = identifier.kind().as_str(),
                    external_id = %best.external_id,
                    "candidate matched"
                );
                return Ok(Some(best));
            }
        }
        Ok(None)
    }
}
