use std::sync::Arc;

use recon_adapters::{EnrichmentProvider, ProviderContext};
use recon_core::{EnrichmentError, ExternalPayload, RecordKind};

/// Fetches the full external document for a matched candidate.
#[derive(Clone)]
pub struct Collector {
    provider: Arc<dyn EnrichmentProvider>,
}

impl Collector {
    pub fn new(provider: Arc<dyn EnrichmentProvider>) -> Self {
        Self { provider }
    }

    pub async fn collect(
        &self,
        ctx: &ProviderContext,
        kind: RecordKind,
        external_id: &str,
    ) -> Result<ExternalPayload, EnrichmentError> {
        let external_id = external_id.trim();
        if external_id.is_empty() {
            return Err(EnrichmentError::InvalidInput(
                "external id must not be empty".to_string(),
            ));
        }
        Ok(self.provider.collect(ctx, kind, external_id).await?)
    }
}
