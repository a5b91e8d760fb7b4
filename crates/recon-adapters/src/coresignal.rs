use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use recon_core::{ExternalCandidate, ExternalPayload, Identifier, RecordKind};
use recon_storage::{
    BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, RequestSpec, RetryDisposition,
};
use reqwest::Url;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::{EnrichmentProvider, ProviderContext, ProviderError};

pub const CORESIGNAL_SOURCE: &str = "coresignal";

const PERSON_DATASET: &str = "employee_multi_source";
const COMPANY_DATASET: &str = "company_multi_source";
const MAX_ERROR_BODY: usize = 300;

#[derive(Debug, Clone)]
pub struct CoreSignalConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for CoreSignalConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.coresignal.com/cdapi/v2".to_string(),
            api_key: None,
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Live CoreSignal multi-source API adapter.
///
/// The HTTP client is built with zero retries; record-level retry belongs to
/// the batch driver.
#[derive(Debug, Clone)]
pub struct CoreSignalProvider {
    http: Arc<HttpFetcher>,
    base_url: String,
    api_key: String,
}

impl CoreSignalProvider {
    pub fn new(config: CoreSignalConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .context("CORESIGNAL_API_KEY is required for live enrichment")?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.timeout,
            user_agent: config.user_agent.clone(),
            global_concurrency: 4,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::none(),
        })?;
        Ok(Self::with_fetcher(Arc::new(http), config.base_url, api_key))
    }

    pub fn with_fetcher(
        http: Arc<HttpFetcher>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn dataset(kind: RecordKind) -> &'static str {
        match kind {
            RecordKind::Person => PERSON_DATASET,
            RecordKind::Company => COMPANY_DATASET,
        }
    }

    /// Profile URL with `external_id` as a single escaped path segment.
    fn collect_url(&self, kind: RecordKind, external_id: &str) -> Result<String, ProviderError> {
        let invalid = |detail: String| ProviderError::Rejected { status: 0, detail };
        let mut url = Url::parse(&self.base_url)
            .map_err(|err| invalid(format!("invalid base url {}: {err}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| invalid(format!("base url {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .push(Self::dataset(kind))
            .push("collect")
            .push(external_id);
        Ok(url.into())
    }

    fn authorized(&self, spec: RequestSpec) -> RequestSpec {
        spec.header("apikey", self.api_key.clone())
            .header("accept", "application/json")
    }
}

/// Elasticsearch DSL body for a single identifier lookup.
pub(crate) fn search_query(kind: RecordKind, identifier: &Identifier) -> JsonValue {
    let must = match (kind, identifier) {
        (_, Identifier::LinkedinUrl(_)) => vec![json!({
            "match_phrase": { "linkedin_url": identifier.query_value() }
        })],
        (RecordKind::Person, Identifier::Email(_)) => vec![json!({
            "term": { "primary_professional_email.exact": identifier.query_value() }
        })],
        (RecordKind::Company, Identifier::Email(_)) => vec![json!({
            "term": { "email": identifier.query_value() }
        })],
        (_, Identifier::Website(_)) => vec![json!({
            "match": { "website.domain_only": identifier.query_value() }
        })],
        (RecordKind::Person, Identifier::NameAndCompany { name, company }) => {
            let mut clauses = vec![json!({ "match_phrase": { "full_name": name.trim() } })];
            if let Some(company) = company {
                clauses.push(json!({
                    "match_phrase": { "active_experience_company_name": company.trim() }
                }));
            }
            clauses
        }
        (RecordKind::Company, Identifier::NameAndCompany { name, .. }) => {
            vec![json!({ "match_phrase": { "company_name": name.trim() } })]
        }
    };
    json!({ "query": { "bool": { "must": must } } })
}

/// Search responses are a ranked array of ids; ids may be numbers or strings.
pub(crate) fn parse_candidates(body: &JsonValue) -> Result<Vec<ExternalCandidate>, ProviderError> {
    let items = body.as_array().ok_or_else(|| ProviderError::Rejected {
        status: 200,
        detail: "search response is not an array".to_string(),
    })?;
    Ok(items
        .iter()
        .filter_map(|item| match item {
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        })
        .enumerate()
        .map(|(rank, external_id)| ExternalCandidate { external_id, rank })
        .collect())
}

fn truncate(detail: &str) -> String {
    detail.chars().take(MAX_ERROR_BODY).collect()
}

fn map_fetch_error(err: FetchError) -> ProviderError {
    if err.disposition() == RetryDisposition::Retryable {
        return ProviderError::Unavailable(err.to_string());
    }
    match err {
        FetchError::HttpStatus { status, body, .. } => ProviderError::Rejected {
            status,
            detail: truncate(&body),
        },
        other => ProviderError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl EnrichmentProvider for CoreSignalProvider {
    fn source_name(&self) -> &str {
        CORESIGNAL_SOURCE
    }

    async fn search(
        &self,
        ctx: &ProviderContext,
        kind: RecordKind,
        identifier: &Identifier,
    ) -> Result<Vec<ExternalCandidate>, ProviderError> {
        let url = format!("{}/{}/search/es_dsl", self.base_url, Self::dataset(kind));
        let spec = self.authorized(RequestSpec::post_json(url, search_query(kind, identifier)));

        let response = match self.http.send(ctx.run_id, CORESIGNAL_SOURCE, spec).await {
            Ok(response) => response,
            Err(FetchError::HttpStatus { status: 404, .. }) => return Ok(Vec::new()),
            Err(err) => return Err(map_fetch_error(err)),
        };
        let body = response.json().map_err(|err| ProviderError::Rejected {
            status: response.status.as_u16(),
            detail: format!("malformed search response: {err}"),
        })?;
        let candidates = parse_candidates(&body)?;
        debug!(
            identifier = identifier.kind().as_str(),
            candidates = candidates.len(),
            "coresignal search"
        );
        Ok(candidates)
    }

    async fn collect(
        &self,
        ctx: &ProviderContext,
        kind: RecordKind,
        external_id: &str,
    ) -> Result<ExternalPayload, ProviderError> {
        let url = self.collect_url(kind, external_id)?;
        let spec = self.authorized(RequestSpec::get(url));

        let response = match self.http.send(ctx.run_id, CORESIGNAL_SOURCE, spec).await {
            Ok(response) => response,
            Err(FetchError::HttpStatus { status: 404, .. }) => {
                return Err(ProviderError::NotFound {
                    external_id: external_id.to_string(),
                })
            }
            Err(err) => return Err(map_fetch_error(err)),
        };
        let document = response.json().map_err(|err| ProviderError::Rejected {
            status: response.status.as_u16(),
            detail: format!("malformed profile response: {err}"),
        })?;

        Ok(ExternalPayload {
            external_id: external_id.to_string(),
            source: CORESIGNAL_SOURCE.to_string(),
            fetched_at: Utc::now(),
            document,
        })
    }
}
