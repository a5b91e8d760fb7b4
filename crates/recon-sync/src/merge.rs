//! Maps an external document onto a local record without losing provenance.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use recon_core::{
    AllowedField, Attributes, CoreError, EnrichmentBag, ExternalEnvelope, ExternalPayload,
    FieldSource, LocalRecord, OverwritePolicy,
};
use recon_storage::json_fingerprint;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::rules::FieldRules;

/// Everything a merge would write, computed without touching storage.
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    pub attributes: Attributes,
    pub custom_fields: JsonValue,
    pub fields_updated: Vec<AllowedField>,
    pub payload_changed: bool,
    pub source_added: bool,
}

impl MergePlan {
    pub fn is_noop(&self) -> bool {
        self.fields_updated.is_empty() && !self.payload_changed && !self.source_added
    }
}

#[derive(Debug, Clone)]
pub struct Merger {
    rules: Arc<FieldRules>,
}

impl Merger {
    pub fn new(rules: Arc<FieldRules>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &FieldRules {
        &self.rules
    }

    /// Whether `source` may replace a populated value previously written by
    /// `existing`. Values without provenance count as trust 0.
    fn outranks(&self, source: &str, existing: Option<&str>) -> bool {
        let incoming = self.rules.trust(source);
        let current = existing.map_or(0, |name| self.rules.trust(name));
        incoming >= current
    }

    /// Fails when the record's enrichment bag has a shape that cannot be
    /// written back without replacing foreign data.
    pub fn plan(
        &self,
        record: &LocalRecord,
        payload: &ExternalPayload,
        policy: OverwritePolicy,
        now: DateTime<Utc>,
    ) -> Result<MergePlan, CoreError> {
        let source = payload.source.as_str();
        let mut bag = EnrichmentBag::read(&record.custom_fields)?;
        let mut attributes = record.attributes.clone();
        let mut fields_updated = Vec::new();

        for &field in record.kind.allowed_fields() {
            let Some(incoming) = self.rules.extract(record.kind, field, &payload.document) else {
                continue;
            };
            let current = attributes.get(field);
            if current.as_ref() == Some(&incoming) {
                continue;
            }

            let writable = match policy {
                OverwritePolicy::NeverOverwrite => false,
                OverwritePolicy::FillEmptyOnly => current.is_none(),
                OverwritePolicy::AlwaysOverwrite => {
                    current.is_none() || self.outranks(source, bag.field_source_name(field.as_str()))
                }
            };
            if !writable {
                continue;
            }

            if let Err(err) = attributes.set(field, incoming) {
                warn!(record_id = %record.id, %field, error = %err, "skipping field");
                continue;
            }
            bag.set_field_source(
                field.as_str(),
                FieldSource {
                    source: source.to_string(),
                    at: now,
                },
            );
            fields_updated.push(field);
        }

        let fingerprint = json_fingerprint(&payload.document);
        let payload_changed = bag.fingerprint_for(source) != Some(fingerprint.as_str());
        if payload_changed {
            bag.set_envelope(ExternalEnvelope {
                source: source.to_string(),
                fetched_at: payload.fetched_at,
                external_id: Some(payload.external_id.clone()),
                fingerprint: Some(fingerprint),
                payload: payload.document.clone(),
            });
        }
        let source_added = bag.record_source(source);

        let mut plan = MergePlan {
            attributes,
            custom_fields: JsonValue::Null,
            fields_updated,
            payload_changed,
            source_added,
        };
        if !plan.is_noop() {
            bag.last_enriched_at = Some(now);
        }
        plan.custom_fields = bag.write_into(&record.custom_fields);
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_core::{FieldValue, RecordKind, WorkspaceId};
    use serde_json::json;

    fn merger() -> Merger {
        Merger::new(Arc::new(FieldRules::builtin()))
    }

    fn record(email: Option<&str>, custom_fields: JsonValue) -> LocalRecord {
        LocalRecord {
            id: "p1".into(),
            workspace_id: WorkspaceId::new("ws"),
            kind: RecordKind::Person,
            name: "Jane Doe".into(),
            company_name: Some("Acme".into()),
            attributes: Attributes {
                email: email.map(String::from),
                ..Default::default()
            },
            custom_fields,
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    fn payload(source: &str, document: JsonValue) -> ExternalPayload {
        ExternalPayload {
            external_id: "101".into(),
            source: source.into(),
            fetched_at: Utc::now(),
            document,
        }
    }

    #[test]
    fn fill_empty_only_leaves_populated_fields() {
        let plan = merger().plan(
            &record(Some("jane@old.com"), json!({})),
            &payload(
                "coresignal",
                json!({ "professional_email": "jdoe@acme.com", "headline": "VP" }),
            ),
            OverwritePolicy::FillEmptyOnly,
            Utc::now(),
        )
        .expect("plan");
        assert_eq!(plan.attributes.email.as_deref(), Some("jane@old.com"));
        assert_eq!(plan.attributes.headline.as_deref(), Some("VP"));
        assert_eq!(plan.fields_updated, vec![AllowedField::Headline]);
    }

    #[test]
    fn never_overwrite_only_refreshes_the_envelope() {
        let plan = merger().plan(
            &record(None, json!({ "tier": "gold" })),
            &payload("coresignal", json!({ "professional_email": "jdoe@acme.com" })),
            OverwritePolicy::NeverOverwrite,
            Utc::now(),
        )
        .expect("plan");
        assert!(plan.fields_updated.is_empty());
        assert!(plan.payload_changed);
        assert!(plan.source_added);
        assert_eq!(plan.custom_fields["tier"], "gold");
        let bag = EnrichmentBag::from_custom_fields(&plan.custom_fields);
        assert_eq!(bag.external["coresignal"].external_id.as_deref(), Some("101"));
    }

    #[test]
    fn always_overwrite_respects_higher_trust_provenance() {
        let now = Utc::now();
        let mut bag = EnrichmentBag::default();
        bag.field_sources.insert(
            "email".into(),
            FieldSource {
                source: "user".into(),
                at: now,
            },
        );
        bag.field_sources.insert(
            "headline".into(),
            FieldSource {
                source: "ai".into(),
                at: now,
            },
        );
        let mut local = record(Some("jane@personal.com"), bag.write_into(&json!({})));
        local.attributes.headline = Some("Guess".into());

        let plan = merger().plan(
            &local,
            &payload(
                "coresignal",
                json!({ "professional_email": "jdoe@acme.com", "headline": "VP Revenue" }),
            ),
            OverwritePolicy::AlwaysOverwrite,
            now,
        )
        .expect("plan");
        assert_eq!(plan.attributes.email.as_deref(), Some("jane@personal.com"));
        assert_eq!(plan.attributes.headline.as_deref(), Some("VP Revenue"));
        assert_eq!(plan.fields_updated, vec![AllowedField::Headline]);
        let written = EnrichmentBag::from_custom_fields(&plan.custom_fields);
        assert_eq!(written.field_sources["headline"].source, "coresignal");
        assert_eq!(written.field_sources["email"].source, "user");
    }

    #[test]
    fn replaying_a_merge_is_a_noop() {
        let m = merger();
        let doc = json!({ "professional_email": "jdoe@acme.com", "inferred_skills": ["sql"] });
        let first = m.plan(
            &record(None, json!({})),
            &payload("coresignal", doc.clone()),
            OverwritePolicy::FillEmptyOnly,
            Utc::now(),
        )
        .expect("plan");
        assert!(!first.is_noop());

        let mut merged = record(None, first.custom_fields.clone());
        merged.attributes = first.attributes.clone();
        let second = m.plan(
            &merged,
            &payload("coresignal", doc),
            OverwritePolicy::AlwaysOverwrite,
            Utc::now(),
        )
        .expect("plan");
        assert!(second.is_noop());
        assert_eq!(second.custom_fields, first.custom_fields);
        assert_eq!(
            merged.attributes.get(AllowedField::Skills),
            Some(FieldValue::List(vec!["sql".into()]))
        );
    }

    #[test]
    fn unreadable_provenance_still_guards_the_field() {
        let fields = json!({
            "enrichment": {
                "sources": ["user", "import"],
                "fieldSources": {
                    "headline": { "source": "user", "at": "2025-06-01T00:00:00Z" },
                    "phone": { "source": "import", "at": "2025-06-01" }
                },
                "notes": "kept by another tool"
            }
        });
        let mut local = record(None, fields);
        local.attributes.headline = Some("Founder".into());
        local.attributes.phone = Some("+1 555 0100".into());

        let plan = merger()
            .plan(
                &local,
                &payload(
                    "coresignal",
                    json!({ "headline": "VP Sales", "phone_number": "+1 555 0199" }),
                ),
                OverwritePolicy::AlwaysOverwrite,
                Utc::now(),
            )
            .expect("plan");

        assert_eq!(plan.attributes.headline.as_deref(), Some("Founder"));
        assert_eq!(plan.attributes.phone.as_deref(), Some("+1 555 0199"));
        assert_eq!(plan.fields_updated, vec![AllowedField::Phone]);
        let out = &plan.custom_fields["enrichment"];
        assert_eq!(out["sources"], json!(["user", "import", "coresignal"]));
        assert_eq!(out["notes"], "kept by another tool");
        assert_eq!(out["fieldSources"]["headline"]["source"], "user");
        assert_eq!(out["fieldSources"]["phone"]["source"], "coresignal");
    }

    #[test]
    fn non_object_bag_refuses_to_merge() {
        let result = merger().plan(
            &record(None, json!({ "enrichment": "legacy blob" })),
            &payload("coresignal", json!({ "headline": "VP" })),
            OverwritePolicy::FillEmptyOnly,
            Utc::now(),
        );
        assert!(matches!(result, Err(CoreError::MalformedBag(_))));
    }
}
