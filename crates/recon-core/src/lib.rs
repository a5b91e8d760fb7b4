//! Core domain model and provenance types for enrichment reconciliation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod bag;

pub use bag::{EnrichmentBag, ExternalEnvelope, FieldSource, BAG_KEY};

pub const CRATE_NAME: &str = "recon-core";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("field {field} does not accept a {got} value")]
    FieldType { field: AllowedField, got: &'static str },
    #[error("unknown {what}: {value}")]
    Unknown { what: &'static str, value: String },
    #[error("unreadable enrichment bag: {0}")]
    MalformedBag(String),
}

/// Tenant boundary. Every read and write is scoped to exactly one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(String);

impl WorkspaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Person,
    Company,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Person => "person",
            RecordKind::Company => "company",
        }
    }

    /// Allow-listed typed fields the merger may write for this kind.
    pub fn allowed_fields(&self) -> &'static [AllowedField] {
        match self {
            RecordKind::Person => &[
                AllowedField::Email,
                AllowedField::Phone,
                AllowedField::Headline,
                AllowedField::Location,
                AllowedField::Experience,
                AllowedField::Skills,
                AllowedField::LinkedinUrl,
            ],
            RecordKind::Company => &[
                AllowedField::Website,
                AllowedField::Phone,
                AllowedField::Industry,
                AllowedField::Description,
                AllowedField::Location,
                AllowedField::EmployeeCount,
                AllowedField::LinkedinUrl,
            ],
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "person" | "people" => Ok(RecordKind::Person),
            "company" | "companies" => Ok(RecordKind::Company),
            other => Err(CoreError::Unknown {
                what: "record kind",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowedField {
    Email,
    Phone,
    Headline,
    Location,
    Experience,
    Skills,
    LinkedinUrl,
    Website,
    Industry,
    Description,
    EmployeeCount,
}

impl AllowedField {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllowedField::Email => "email",
            AllowedField::Phone => "phone",
            AllowedField::Headline => "headline",
            AllowedField::Location => "location",
            AllowedField::Experience => "experience",
            AllowedField::Skills => "skills",
            AllowedField::LinkedinUrl => "linkedin_url",
            AllowedField::Website => "website",
            AllowedField::Industry => "industry",
            AllowedField::Description => "description",
            AllowedField::EmployeeCount => "employee_count",
        }
    }

    pub fn applies_to(&self, kind: RecordKind) -> bool {
        kind.allowed_fields().contains(self)
    }
}

impl fmt::Display for AllowedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllowedField {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let field = match s.trim() {
            "email" => AllowedField::Email,
            "phone" => AllowedField::Phone,
            "headline" => AllowedField::Headline,
            "location" => AllowedField::Location,
            "experience" => AllowedField::Experience,
            "skills" => AllowedField::Skills,
            "linkedin_url" => AllowedField::LinkedinUrl,
            "website" => AllowedField::Website,
            "industry" => AllowedField::Industry,
            "description" => AllowedField::Description,
            "employee_count" => AllowedField::EmployeeCount,
            other => {
                return Err(CoreError::Unknown {
                    what: "field",
                    value: other.to_string(),
                })
            }
        };
        Ok(field)
    }
}

/// A typed attribute value as read from a record or extracted from a payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Number(i64),
    List(Vec<String>),
    Json(JsonValue),
}

impl FieldValue {
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::Number(_) => false,
            FieldValue::List(items) => items.iter().all(|s| s.trim().is_empty()),
            FieldValue::Json(v) => match v {
                JsonValue::Null => true,
                JsonValue::Array(a) => a.is_empty(),
                JsonValue::Object(o) => o.is_empty(),
                JsonValue::String(s) => s.trim().is_empty(),
                _ => false,
            },
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Text(_) => "text",
            FieldValue::Number(_) => "number",
            FieldValue::List(_) => "list",
            FieldValue::Json(_) => "json",
        }
    }
}

/// Typed columns of a local record. Only allow-listed fields are ever written
/// by enrichment; everything else on the row is out of reach.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Attributes {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub headline: Option<String>,
    pub location: Option<String>,
    pub linkedin_url: Option<String>,
    pub website: Option<String>,
    pub industry: Option<String>,
    pub description: Option<String>,
    pub employee_count: Option<i64>,
    pub skills: Option<Vec<String>>,
    pub experience: Option<JsonValue>,
}

impl Attributes {
    fn text_slot(&mut self, field: AllowedField) -> Option<&mut Option<String>> {
        match field {
            AllowedField::Email => Some(&mut self.email),
            AllowedField::Phone => Some(&mut self.phone),
            AllowedField::Headline => Some(&mut self.headline),
            AllowedField::Location => Some(&mut self.location),
            AllowedField::LinkedinUrl => Some(&mut self.linkedin_url),
            AllowedField::Website => Some(&mut self.website),
            AllowedField::Industry => Some(&mut self.industry),
            AllowedField::Description => Some(&mut self.description),
            AllowedField::EmployeeCount | AllowedField::Skills | AllowedField::Experience => None,
        }
    }

    /// Current value of a field; empty values read as `None`.
    pub fn get(&self, field: AllowedField) -> Option<FieldValue> {
        let value = match field {
            AllowedField::Email => self.email.clone().map(FieldValue::Text),
            AllowedField::Phone => self.phone.clone().map(FieldValue::Text),
            AllowedField::Headline => self.headline.clone().map(FieldValue::Text),
            AllowedField::Location => self.location.clone().map(FieldValue::Text),
            AllowedField::LinkedinUrl => self.linkedin_url.clone().map(FieldValue::Text),
            AllowedField::Website => self.website.clone().map(FieldValue::Text),
            AllowedField::Industry => self.industry.clone().map(FieldValue::Text),
            AllowedField::Description => self.description.clone().map(FieldValue::Text),
            AllowedField::EmployeeCount => self.employee_count.map(FieldValue::Number),
            AllowedField::Skills => self.skills.clone().map(FieldValue::List),
            AllowedField::Experience => self.experience.clone().map(FieldValue::Json),
        };
        value.filter(|v| !v.is_empty())
    }

    pub fn set(&mut self, field: AllowedField, value: FieldValue) -> Result<(), CoreError> {
        match (field, value) {
            (AllowedField::EmployeeCount, FieldValue::Number(n)) => {
                self.employee_count = Some(n);
            }
            (AllowedField::Skills, FieldValue::List(items)) => {
                self.skills = Some(items);
            }
            (AllowedField::Experience, FieldValue::Json(v)) => {
                self.experience = Some(v);
            }
            (field, FieldValue::Text(text)) => match self.text_slot(field) {
                Some(slot) => *slot = Some(text),
                None => {
                    return Err(CoreError::FieldType { field, got: "text" });
                }
            },
            (field, other) => {
                return Err(CoreError::FieldType {
                    field,
                    got: other.type_name(),
                })
            }
        }
        Ok(())
    }
}

/// A persisted person or company row owned by a single workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub id: String,
    pub workspace_id: WorkspaceId,
    pub kind: RecordKind,
    /// Full name for persons, company name for companies.
    pub name: String,
    /// Employer name; persons only.
    pub company_name: Option<String>,
    pub attributes: Attributes,
    /// Free-form attribute bag (JSON object).
    pub custom_fields: JsonValue,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl LocalRecord {
    pub fn identifiers(&self) -> Identifiers {
        Identifiers {
            linkedin_url: self.attributes.linkedin_url.clone(),
            email: self.attributes.email.clone(),
            website: self.attributes.website.clone(),
            name: Some(self.name.clone()),
            company_name: self.company_name.clone(),
        }
    }

    pub fn enrichment_bag(&self) -> EnrichmentBag {
        EnrichmentBag::from_custom_fields(&self.custom_fields)
    }
}

/// Identifying keys available for a record. Any of them may be missing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Identifiers {
    pub linkedin_url: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
    pub name: Option<String>,
    pub company_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    LinkedinUrl,
    Email,
    Website,
    #[serde(rename = "name_company")]
    NameAndCompany,
}

impl IdentifierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierKind::LinkedinUrl => "linkedin_url",
            IdentifierKind::Email => "email",
            IdentifierKind::Website => "website",
            IdentifierKind::NameAndCompany => "name_company",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    LinkedinUrl(String),
    Email(String),
    Website(String),
    NameAndCompany { name: String, company: Option<String> },
}

impl Identifier {
    pub fn kind(&self) -> IdentifierKind {
        match self {
            Identifier::LinkedinUrl(_) => IdentifierKind::LinkedinUrl,
            Identifier::Email(_) => IdentifierKind::Email,
            Identifier::Website(_) => IdentifierKind::Website,
            Identifier::NameAndCompany { .. } => IdentifierKind::NameAndCompany,
        }
    }

    /// Normalized lookup value, stable across casing and trailing slashes.
    pub fn query_value(&self) -> String {
        match self {
            Identifier::LinkedinUrl(url) => normalize_url(url),
            Identifier::Email(email) => email.trim().to_ascii_lowercase(),
            Identifier::Website(site) => normalize_domain(site),
            Identifier::NameAndCompany { name, company } => {
                let name = name.trim().to_lowercase();
                match company {
                    Some(company) => format!("{}|{}", name, company.trim().to_lowercase()),
                    None => name,
                }
            }
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

pub fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_ascii_lowercase()
}

pub fn normalize_domain(site: &str) -> String {
    let lower = site.trim().to_ascii_lowercase();
    let without_scheme = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .unwrap_or(&lower);
    let without_www = without_scheme.strip_prefix("www.").unwrap_or(without_scheme);
    without_www
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

impl Identifiers {
    /// Usable identifiers in match priority order: LinkedIn URL first, then
    /// email (persons) or website (companies), then name + company.
    pub fn ordered(&self, kind: RecordKind) -> Vec<Identifier> {
        let mut out = Vec::new();
        if let Some(url) = non_blank(&self.linkedin_url) {
            out.push(Identifier::LinkedinUrl(url));
        }
        match kind {
            RecordKind::Person => {
                if let Some(email) = non_blank(&self.email) {
                    out.push(Identifier::Email(email));
                }
                if let (Some(name), Some(company)) =
                    (non_blank(&self.name), non_blank(&self.company_name))
                {
                    out.push(Identifier::NameAndCompany {
                        name,
                        company: Some(company),
                    });
                }
            }
            RecordKind::Company => {
                if let Some(site) = non_blank(&self.website) {
                    out.push(Identifier::Website(site));
                }
                if let Some(name) = non_blank(&self.name) {
                    out.push(Identifier::NameAndCompany {
                        name,
                        company: None,
                    });
                }
            }
        }
        out
    }

    pub fn is_empty(&self, kind: RecordKind) -> bool {
        self.ordered(kind).is_empty()
    }
}

/// A ranked search hit from the provider; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalCandidate {
    pub external_id: String,
    /// Position in the provider's relevance ordering, 0 is best.
    pub rank: usize,
}

/// Full external document as returned by a provider's collect call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalPayload {
    pub external_id: String,
    pub source: String,
    pub fetched_at: DateTime<Utc>,
    pub document: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverwritePolicy {
    #[default]
    FillEmptyOnly,
    AlwaysOverwrite,
    NeverOverwrite,
}

impl OverwritePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverwritePolicy::FillEmptyOnly => "fillEmptyOnly",
            OverwritePolicy::AlwaysOverwrite => "alwaysOverwrite",
            OverwritePolicy::NeverOverwrite => "neverOverwrite",
        }
    }
}

impl fmt::Display for OverwritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverwritePolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s
            .trim()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "fillemptyonly" => Ok(OverwritePolicy::FillEmptyOnly),
            "alwaysoverwrite" => Ok(OverwritePolicy::AlwaysOverwrite),
            "neveroverwrite" => Ok(OverwritePolicy::NeverOverwrite),
            _ => Err(CoreError::Unknown {
                what: "overwrite policy",
                value: s.to_string(),
            }),
        }
    }
}

/// Per-record lifecycle within one enrichment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Pending,
    Matching,
    InsufficientIdentifiers,
    NoMatchFound,
    Matched,
    Collecting,
    RecordGone,
    Collected,
    Merging,
    Merged,
    MergeSkipped,
    ProviderUnavailable,
    ProviderRejected,
    PersistenceError,
}

impl RecordState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecordState::InsufficientIdentifiers
                | RecordState::NoMatchFound
                | RecordState::RecordGone
                | RecordState::Merged
                | RecordState::MergeSkipped
                | RecordState::ProviderUnavailable
                | RecordState::ProviderRejected
                | RecordState::PersistenceError
        )
    }

    pub fn can_transition_to(&self, next: RecordState) -> bool {
        use RecordState::*;
        matches!(
            (self, next),
            (Pending, Matching)
                | (Pending, PersistenceError)
                | (
                    Matching,
                    InsufficientIdentifiers
                        | NoMatchFound
                        | ProviderUnavailable
                        | ProviderRejected
                        | Matched
                )
                | (Matched, Collecting)
                | (
                    Collecting,
                    RecordGone | ProviderUnavailable | ProviderRejected | Collected
                )
                | (Collected, Merging)
                | (Merging, Merged | MergeSkipped | PersistenceError)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Merged,
    MergeSkipped,
    NoMatchFound,
    RecordGone,
    ProviderUnavailable,
    ProviderRejected,
    InsufficientIdentifiers,
    PersistenceError,
}

impl OutcomeKind {
    pub const ALL: [OutcomeKind; 8] = [
        OutcomeKind::Merged,
        OutcomeKind::MergeSkipped,
        OutcomeKind::NoMatchFound,
        OutcomeKind::RecordGone,
        OutcomeKind::ProviderUnavailable,
        OutcomeKind::ProviderRejected,
        OutcomeKind::InsufficientIdentifiers,
        OutcomeKind::PersistenceError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Merged => "merged",
            OutcomeKind::MergeSkipped => "merge_skipped",
            OutcomeKind::NoMatchFound => "no_match_found",
            OutcomeKind::RecordGone => "record_gone",
            OutcomeKind::ProviderUnavailable => "provider_unavailable",
            OutcomeKind::ProviderRejected => "provider_rejected",
            OutcomeKind::InsufficientIdentifiers => "insufficient_identifiers",
            OutcomeKind::PersistenceError => "persistence_error",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SkipReason {
    /// Nothing new: no field change, same payload, provider already recorded.
    NoChanges,
    /// The candidate was already matched to another record in this run.
    CandidateClaimed { claimed_by: String },
}

/// Terminal result of one record's enrichment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RecordOutcome {
    Merged {
        external_id: String,
        fields_updated: Vec<AllowedField>,
    },
    MergeSkipped {
        external_id: String,
        #[serde(flatten)]
        reason: SkipReason,
    },
    NoMatchFound,
    RecordGone {
        external_id: String,
    },
    ProviderUnavailable {
        detail: String,
    },
    ProviderRejected {
        status: u16,
        detail: String,
    },
    InsufficientIdentifiers,
    PersistenceError {
        detail: String,
    },
}

impl RecordOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            RecordOutcome::Merged { .. } => OutcomeKind::Merged,
            RecordOutcome::MergeSkipped { .. } => OutcomeKind::MergeSkipped,
            RecordOutcome::NoMatchFound => OutcomeKind::NoMatchFound,
            RecordOutcome::RecordGone { .. } => OutcomeKind::RecordGone,
            RecordOutcome::ProviderUnavailable { .. } => OutcomeKind::ProviderUnavailable,
            RecordOutcome::ProviderRejected { .. } => OutcomeKind::ProviderRejected,
            RecordOutcome::InsufficientIdentifiers => OutcomeKind::InsufficientIdentifiers,
            RecordOutcome::PersistenceError { .. } => OutcomeKind::PersistenceError,
        }
    }

    /// Whether the batch driver may retry this record later in the run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RecordOutcome::ProviderUnavailable { .. })
    }

    pub fn state(&self) -> RecordState {
        match self {
            RecordOutcome::Merged { .. } => RecordState::Merged,
            RecordOutcome::MergeSkipped { .. } => RecordState::MergeSkipped,
            RecordOutcome::NoMatchFound => RecordState::NoMatchFound,
            RecordOutcome::RecordGone { .. } => RecordState::RecordGone,
            RecordOutcome::ProviderUnavailable { .. } => RecordState::ProviderUnavailable,
            RecordOutcome::ProviderRejected { .. } => RecordState::ProviderRejected,
            RecordOutcome::InsufficientIdentifiers => RecordState::InsufficientIdentifiers,
            RecordOutcome::PersistenceError { .. } => RecordState::PersistenceError,
        }
    }
}

/// Failures raised by the matcher, collector and persistence steps.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnrichmentError {
    #[error("no usable identifiers supplied")]
    InsufficientIdentifiers,
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("provider rejected request with status {status}: {detail}")]
    ProviderRejected { status: u16, detail: String },
    #[error("external record {external_id} no longer exists")]
    RecordGone { external_id: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("persistence failed: {0}")]
    Persistence(String),
}

impl From<EnrichmentError> for RecordOutcome {
    fn from(err: EnrichmentError) -> Self {
        match err {
            EnrichmentError::InsufficientIdentifiers => RecordOutcome::InsufficientIdentifiers,
            EnrichmentError::ProviderUnavailable(detail) => {
                RecordOutcome::ProviderUnavailable { detail }
            }
            EnrichmentError::ProviderRejected { status, detail } => {
                RecordOutcome::ProviderRejected { status, detail }
            }
            EnrichmentError::RecordGone { external_id } => RecordOutcome::RecordGone { external_id },
            // Only reachable when a provider hands back an unusable id.
            EnrichmentError::InvalidInput(detail) => RecordOutcome::ProviderRejected {
                status: 0,
                detail,
            },
            EnrichmentError::Persistence(detail) => RecordOutcome::PersistenceError { detail },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(
        linkedin: Option<&str>,
        email: Option<&str>,
        name: Option<&str>,
        company: Option<&str>,
    ) -> Identifiers {
        Identifiers {
            linkedin_url: linkedin.map(String::from),
            email: email.map(String::from),
            website: None,
            name: name.map(String::from),
            company_name: company.map(String::from),
        }
    }

    #[test]
    fn person_identifiers_follow_priority_order() {
        let identifiers = ids(
            Some("https://linkedin.com/in/jdoe/"),
            Some("JDoe@Acme.com"),
            Some("Jane Doe"),
            Some("Acme"),
        );
        let kinds = identifiers
            .ordered(RecordKind::Person)
            .iter()
            .map(Identifier::kind)
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                IdentifierKind::LinkedinUrl,
                IdentifierKind::Email,
                IdentifierKind::NameAndCompany
            ]
        );
    }

    #[test]
    fn blank_identifiers_are_ignored() {
        let identifiers = ids(Some("   "), Some(""), Some("Jane Doe"), None);
        assert!(identifiers.is_empty(RecordKind::Person));
    }

    #[test]
    fn company_name_is_usable_without_employer() {
        let identifiers = Identifiers {
            name: Some("Acme Corp".into()),
            website: Some("https://www.acme.com/about".into()),
            ..Default::default()
        };
        let ordered = identifiers.ordered(RecordKind::Company);
        assert_eq!(ordered.len(), 2);
        assert_eq!(ordered[0].query_value(), "acme.com");
        assert_eq!(ordered[1].query_value(), "acme corp");
    }

    #[test]
    fn query_values_are_normalized() {
        assert_eq!(
            Identifier::LinkedinUrl("https://LinkedIn.com/in/JDoe/".into()).query_value(),
            "https://linkedin.com/in/jdoe"
        );
        assert_eq!(
            Identifier::NameAndCompany {
                name: " Jane Doe ".into(),
                company: Some("ACME".into())
            }
            .query_value(),
            "jane doe|acme"
        );
    }

    #[test]
    fn attributes_get_treats_blank_as_missing() {
        let attrs = Attributes {
            email: Some("  ".into()),
            skills: Some(vec![]),
            ..Default::default()
        };
        assert_eq!(attrs.get(AllowedField::Email), None);
        assert_eq!(attrs.get(AllowedField::Skills), None);
    }

    #[test]
    fn attributes_set_rejects_mismatched_types() {
        let mut attrs = Attributes::default();
        assert!(attrs
            .set(AllowedField::EmployeeCount, FieldValue::Text("12".into()))
            .is_err());
        attrs
            .set(AllowedField::EmployeeCount, FieldValue::Number(12))
            .unwrap();
        assert_eq!(attrs.employee_count, Some(12));
        attrs
            .set(AllowedField::Email, FieldValue::Text("a@b.co".into()))
            .unwrap();
        assert_eq!(attrs.email.as_deref(), Some("a@b.co"));
    }

    #[test]
    fn overwrite_policy_parses_both_spellings() {
        assert_eq!(
            "fill-empty-only".parse::<OverwritePolicy>().unwrap(),
            OverwritePolicy::FillEmptyOnly
        );
        assert_eq!(
            "alwaysOverwrite".parse::<OverwritePolicy>().unwrap(),
            OverwritePolicy::AlwaysOverwrite
        );
        assert!("sometimes".parse::<OverwritePolicy>().is_err());
        assert_eq!(OverwritePolicy::default(), OverwritePolicy::FillEmptyOnly);
    }

    #[test]
    fn state_machine_only_allows_documented_edges() {
        assert!(RecordState::Pending.can_transition_to(RecordState::Matching));
        assert!(RecordState::Matching.can_transition_to(RecordState::Matched));
        assert!(RecordState::Collecting.can_transition_to(RecordState::RecordGone));
        assert!(RecordState::Merging.can_transition_to(RecordState::MergeSkipped));
        assert!(!RecordState::Matching.can_transition_to(RecordState::Merged));
        assert!(!RecordState::Matched.can_transition_to(RecordState::Merging));
        assert!(!RecordState::Merged.can_transition_to(RecordState::Matching));
        assert!(RecordState::NoMatchFound.is_terminal());
        assert!(!RecordState::Collected.is_terminal());
    }

    #[test]
    fn only_provider_unavailable_is_retryable() {
        let unavailable = RecordOutcome::ProviderUnavailable {
            detail: "503".into(),
        };
        let gone = RecordOutcome::RecordGone {
            external_id: "1".into(),
        };
        assert!(unavailable.is_retryable());
        assert!(!gone.is_retryable());
        assert_eq!(gone.kind(), OutcomeKind::RecordGone);
    }
}
