//! Canonical enrichment sub-structure of a record's `custom_fields` bag.
//!
//! Layout under `custom_fields.enrichment`:
//!
//! ```json
//! {
//!   "sources": ["coresignal"],
//!   "lastEnrichedAt": "2026-01-01T00:00:00Z",
//!   "fieldSources": { "email": { "source": "coresignal", "at": "..." } },
//!   "external": {
//!     "coresignal": { "source": "coresignal", "fetchedAt": "...", "externalId": "42",
//!                     "fingerprint": "<sha256>", "payload": { ... } }
//!   }
//! }
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::CoreError;

pub const BAG_KEY: &str = "enrichment";

/// Legacy top-level keys that carried raw provider documents, with the source
/// name each one is filed under after normalization.
const LEGACY_PAYLOAD_KEYS: &[(&str, &str)] = &[
    ("coresignalData", "coresignal"),
    ("coresignal_data", "coresignal"),
    ("coreSignalData", "coresignal"),
    ("rawData", "legacy-raw"),
    ("richProfile", "legacy-rich-profile"),
    ("careerData", "legacy-career"),
];

const LEGACY_SOURCES_KEY: &str = "enrichmentSources";
const LEGACY_TIMESTAMP_KEYS: &[&str] = &["lastEnrichedAt", "lastEnriched"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSource {
    pub source: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalEnvelope {
    pub source: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    pub payload: JsonValue,
}

const SOURCES_KEY: &str = "sources";
const LAST_ENRICHED_KEY: &str = "lastEnrichedAt";
const FIELD_SOURCES_KEY: &str = "fieldSources";
const EXTERNAL_KEY: &str = "external";

/// The parsed bag. Entries that cannot be read, and keys this crate does not
/// own, are carried along and written back unchanged.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EnrichmentBag {
    pub sources: Vec<String>,
    pub last_enriched_at: Option<DateTime<Utc>>,
    pub field_sources: BTreeMap<String, FieldSource>,
    pub external: BTreeMap<String, ExternalEnvelope>,
    /// Unknown keys under the bag, plus known keys whose value was unreadable.
    pub extra: Map<String, JsonValue>,
    unreadable_sources: Vec<JsonValue>,
    unreadable_field_sources: Map<String, JsonValue>,
    unreadable_external: Map<String, JsonValue>,
}

impl EnrichmentBag {
    /// Reads the bag out of `custom_fields`, keeping every entry it cannot
    /// parse. Fails when `custom_fields`, the bag, or one of its containers
    /// has the wrong shape, since writing back would then replace foreign
    /// data.
    pub fn read(custom_fields: &JsonValue) -> Result<Self, CoreError> {
        let raw = match custom_fields {
            JsonValue::Null => return Ok(Self::default()),
            JsonValue::Object(map) => match map.get(BAG_KEY) {
                None | Some(JsonValue::Null) => return Ok(Self::default()),
                Some(JsonValue::Object(raw)) => raw,
                Some(_) => {
                    return Err(CoreError::MalformedBag(format!(
                        "`{BAG_KEY}` is not an object"
                    )))
                }
            },
            _ => {
                return Err(CoreError::MalformedBag(
                    "custom_fields is not an object".to_string(),
                ))
            }
        };

        let mut bag = Self::default();
        for (key, value) in raw {
            match (key.as_str(), value) {
                (SOURCES_KEY, JsonValue::Array(items)) => {
                    for item in items {
                        match item {
                            JsonValue::String(source) if !bag.has_source(source) => {
                                bag.sources.push(source.clone())
                            }
                            JsonValue::String(_) => {}
                            other => bag.unreadable_sources.push(other.clone()),
                        }
                    }
                }
                (LAST_ENRICHED_KEY, raw_ts) if parse_timestamp(raw_ts).is_some() => {
                    bag.last_enriched_at = parse_timestamp(raw_ts);
                }
                (FIELD_SOURCES_KEY, JsonValue::Object(entries)) => {
                    for (field, entry) in entries {
                        match serde_json::from_value::<FieldSource>(entry.clone()) {
                            Ok(parsed) => {
                                bag.field_sources.insert(field.clone(), parsed);
                            }
                            Err(_) => {
                                bag.unreadable_field_sources
                                    .insert(field.clone(), entry.clone());
                            }
                        }
                    }
                }
                (EXTERNAL_KEY, JsonValue::Object(entries)) => {
                    for (slot, entry) in entries {
                        match serde_json::from_value::<ExternalEnvelope>(entry.clone()) {
                            Ok(parsed) => {
                                bag.external.insert(slot.clone(), parsed);
                            }
                            Err(_) => {
                                bag.unreadable_external.insert(slot.clone(), entry.clone());
                            }
                        }
                    }
                }
                (SOURCES_KEY | FIELD_SOURCES_KEY | EXTERNAL_KEY, JsonValue::Null) => {}
                (SOURCES_KEY | FIELD_SOURCES_KEY | EXTERNAL_KEY, _) => {
                    return Err(CoreError::MalformedBag(format!(
                        "`{BAG_KEY}.{key}` has the wrong shape"
                    )))
                }
                _ => {
                    bag.extra.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(bag)
    }

    /// Like [`EnrichmentBag::read`], but a bag that is not an object reads as
    /// empty. Only for inspection; never write the result back.
    pub fn from_custom_fields(custom_fields: &JsonValue) -> Self {
        Self::read(custom_fields).unwrap_or_default()
    }

    pub fn to_json(&self) -> JsonValue {
        let mut map = self.extra.clone();

        let mut sources = self
            .sources
            .iter()
            .cloned()
            .map(JsonValue::String)
            .collect::<Vec<_>>();
        sources.extend(self.unreadable_sources.iter().cloned());
        map.insert(SOURCES_KEY.to_string(), JsonValue::Array(sources));

        if let Some(at) = self.last_enriched_at {
            map.insert(LAST_ENRICHED_KEY.to_string(), timestamp_json(at));
        }

        let mut field_sources = self.unreadable_field_sources.clone();
        for (field, fs) in &self.field_sources {
            let mut entry = Map::new();
            entry.insert("source".to_string(), JsonValue::String(fs.source.clone()));
            entry.insert("at".to_string(), timestamp_json(fs.at));
            field_sources.insert(field.clone(), JsonValue::Object(entry));
        }
        map.insert(FIELD_SOURCES_KEY.to_string(), JsonValue::Object(field_sources));

        let mut external = self.unreadable_external.clone();
        for (slot, envelope) in &self.external {
            if let Ok(value) = serde_json::to_value(envelope) {
                external.insert(slot.clone(), value);
            }
        }
        map.insert(EXTERNAL_KEY.to_string(), JsonValue::Object(external));

        JsonValue::Object(map)
    }

    /// Returns a copy of `custom_fields` with this bag stored under
    /// [`BAG_KEY`]. All other keys are left as they are.
    pub fn write_into(&self, custom_fields: &JsonValue) -> JsonValue {
        let mut map = match custom_fields {
            JsonValue::Object(map) => map.clone(),
            _ => Map::new(),
        };
        map.insert(BAG_KEY.to_string(), self.to_json());
        JsonValue::Object(map)
    }

    pub fn has_source(&self, source: &str) -> bool {
        self.sources.iter().any(|s| s == source)
    }

    /// Appends `source` to the provenance list. Returns false when it was
    /// already present.
    pub fn record_source(&mut self, source: &str) -> bool {
        if self.has_source(source) {
            return false;
        }
        self.sources.push(source.to_string());
        true
    }

    pub fn field_source(&self, field: &str) -> Option<&FieldSource> {
        self.field_sources.get(field)
    }

    /// Name of the source that last wrote `field`, read from unparseable
    /// provenance entries too when they still carry a `source` string.
    pub fn field_source_name(&self, field: &str) -> Option<&str> {
        match self.field_sources.get(field) {
            Some(fs) => Some(fs.source.as_str()),
            None => self
                .unreadable_field_sources
                .get(field)
                .and_then(|entry| entry.get("source"))
                .and_then(JsonValue::as_str),
        }
    }

    pub fn set_field_source(&mut self, field: &str, source: FieldSource) {
        self.unreadable_field_sources.remove(field);
        self.field_sources.insert(field.to_string(), source);
    }

    pub fn fingerprint_for(&self, source: &str) -> Option<&str> {
        self.external
            .get(source)
            .and_then(|env| env.fingerprint.as_deref())
    }

    /// Stores `envelope` in its source's slot, replacing whatever was there.
    pub fn set_envelope(&mut self, envelope: ExternalEnvelope) {
        self.unreadable_external.remove(&envelope.source);
        self.external.insert(envelope.source.clone(), envelope);
    }

    fn file_envelope(&mut self, key: &str, envelope: ExternalEnvelope) {
        let taken = self.external.contains_key(&envelope.source)
            || self.unreadable_external.contains_key(&envelope.source);
        let slot = if taken {
            format!("{}:{}", envelope.source, key)
        } else {
            envelope.source.clone()
        };
        self.external.insert(slot, envelope);
    }
}

fn timestamp_json(at: DateTime<Utc>) -> JsonValue {
    JsonValue::String(at.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

fn parse_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

fn legacy_sources(value: &JsonValue) -> Vec<String> {
    match value {
        JsonValue::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str().map(ToString::to_string))
            .collect(),
        // The older desktop client stored a map of field -> source.
        JsonValue::Object(map) => map
            .values()
            .filter_map(|v| match v {
                JsonValue::String(s) => Some(s.clone()),
                JsonValue::Object(o) => o.get("source").and_then(|s| s.as_str()).map(String::from),
                _ => None,
            })
            .collect(),
        JsonValue::String(s) => vec![s.clone()],
        _ => Vec::new(),
    }
}

/// Moves legacy enrichment keys of a `custom_fields` object into the
/// canonical bag. Returns `None` when there is nothing to migrate, or when
/// an existing bag is not an object and cannot be merged into.
///
/// Every legacy payload is kept: when two keys land on the same source slot
/// the later one is filed as `"<source>:<legacyKey>"`.
pub fn normalize_legacy(custom_fields: &JsonValue, migrated_at: DateTime<Utc>) -> Option<JsonValue> {
    let JsonValue::Object(original) = custom_fields else {
        return None;
    };

    let has_legacy = LEGACY_PAYLOAD_KEYS
        .iter()
        .any(|(key, _)| original.contains_key(*key))
        || original.contains_key(LEGACY_SOURCES_KEY)
        || LEGACY_TIMESTAMP_KEYS
            .iter()
            .any(|k| original.get(*k).and_then(parse_timestamp).is_some());
    if !has_legacy {
        return None;
    }

    let mut bag = EnrichmentBag::read(custom_fields).ok()?;
    let mut map = original.clone();

    for (key, source) in LEGACY_PAYLOAD_KEYS {
        let Some(payload) = map.remove(*key) else {
            continue;
        };
        if payload.is_null() {
            continue;
        }
        bag.file_envelope(
            key,
            ExternalEnvelope {
                source: (*source).to_string(),
                fetched_at: migrated_at,
                external_id: None,
                fingerprint: None,
                payload,
            },
        );
        bag.record_source(source);
    }

    if let Some(sources) = map.remove(LEGACY_SOURCES_KEY) {
        for source in legacy_sources(&sources) {
            bag.record_source(&source);
        }
    }

    // Unparseable legacy timestamps stay where they are.
    for key in LEGACY_TIMESTAMP_KEYS {
        let Some(legacy) = map.get(*key).and_then(parse_timestamp) else {
            continue;
        };
        map.remove(*key);
        bag.last_enriched_at = Some(bag.last_enriched_at.map_or(legacy, |c| c.max(legacy)));
    }

    Some(bag.write_into(&JsonValue::Object(map)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .expect("ts")
            .with_timezone(&Utc)
    }

    #[test]
    fn non_object_bag_is_refused() {
        let fields = json!({ "enrichment": "not an object", "tier": "gold" });
        assert!(matches!(
            EnrichmentBag::read(&fields),
            Err(CoreError::MalformedBag(_))
        ));
        assert!(EnrichmentBag::read(&json!(["a"])).is_err());
        assert!(EnrichmentBag::read(&json!({ "enrichment": { "fieldSources": [] } })).is_err());
        assert_eq!(
            EnrichmentBag::read(&json!(null)).expect("null"),
            EnrichmentBag::default()
        );
    }

    #[test]
    fn bad_entries_are_kept_without_hiding_good_ones() {
        let fields = json!({
            "enrichment": {
                "sources": ["user", "import", 7],
                "lastEnrichedAt": "last tuesday",
                "fieldSources": {
                    "headline": { "source": "user", "at": "2025-06-01T00:00:00Z" },
                    "phone": { "source": "import", "at": "2025-06-01" },
                    "email": { "at": "2025-06-01T00:00:00Z" }
                },
                "external": {
                    "coresignal": { "source": "coresignal", "payload": {} }
                },
                "notes": "kept by another tool"
            }
        });
        let mut bag = EnrichmentBag::read(&fields).expect("bag");

        assert_eq!(bag.sources, vec!["user".to_string(), "import".to_string()]);
        assert_eq!(bag.last_enriched_at, None);
        assert_eq!(bag.field_source("headline").map(|fs| fs.source.as_str()), Some("user"));
        assert_eq!(bag.field_source_name("phone"), Some("import"));
        assert_eq!(bag.field_source_name("email"), None);
        assert!(bag.external.is_empty());

        bag.record_source("coresignal");
        let written = bag.write_into(&fields);
        let out = &written["enrichment"];
        assert_eq!(out["notes"], "kept by another tool");
        assert_eq!(out["sources"], json!(["user", "import", "coresignal", 7]));
        assert_eq!(out["lastEnrichedAt"], "last tuesday");
        assert_eq!(out["fieldSources"]["phone"]["at"], "2025-06-01");
        assert_eq!(out["fieldSources"]["email"], json!({ "at": "2025-06-01T00:00:00Z" }));
        assert_eq!(out["fieldSources"]["headline"]["source"], "user");
        assert_eq!(out["external"]["coresignal"]["payload"], json!({}));
    }

    #[test]
    fn overwriting_a_bad_entry_replaces_it() {
        let fields = json!({
            "enrichment": { "fieldSources": { "phone": { "source": "import", "at": "nope" } } }
        });
        let mut bag = EnrichmentBag::read(&fields).expect("bag");
        let at = ts("2026-02-01T00:00:00Z");
        bag.set_field_source(
            "phone",
            FieldSource {
                source: "coresignal".into(),
                at,
            },
        );
        let reread = EnrichmentBag::read(&bag.write_into(&fields)).expect("bag");
        assert_eq!(reread.field_source("phone").map(|fs| fs.at), Some(at));
    }

    #[test]
    fn write_into_preserves_other_keys() {
        let fields = json!({ "tier": "gold", "notes": ["a"] });
        let mut bag = EnrichmentBag::default();
        bag.record_source("coresignal");
        let written = bag.write_into(&fields);
        assert_eq!(written["tier"], "gold");
        assert_eq!(written["notes"], json!(["a"]));
        assert_eq!(written["enrichment"]["sources"], json!(["coresignal"]));
    }

    #[test]
    fn record_source_never_duplicates() {
        let mut bag = EnrichmentBag::default();
        assert!(bag.record_source("coresignal"));
        assert!(!bag.record_source("coresignal"));
        assert_eq!(bag.sources, vec!["coresignal".to_string()]);
    }

    #[test]
    fn normalize_moves_legacy_keys_without_dropping_data() {
        let fields = json!({
            "tier": "gold",
            "coresignalData": { "id": 1 },
            "coresignal_data": { "id": 2 },
            "richProfile": { "bio": "x" },
            "enrichmentSources": ["import"],
            "lastEnriched": "2025-03-01T00:00:00Z"
        });
        let migrated = normalize_legacy(&fields, ts("2026-01-01T00:00:00Z")).expect("migrated");

        assert_eq!(migrated["tier"], "gold");
        assert!(migrated.get("coresignalData").is_none());
        assert!(migrated.get("coresignal_data").is_none());
        assert!(migrated.get("enrichmentSources").is_none());

        let bag = EnrichmentBag::from_custom_fields(&migrated);
        assert_eq!(bag.external["coresignal"].payload, json!({ "id": 1 }));
        assert_eq!(
            bag.external["coresignal:coresignal_data"].payload,
            json!({ "id": 2 })
        );
        assert_eq!(
            bag.external["legacy-rich-profile"].payload,
            json!({ "bio": "x" })
        );
        assert!(bag.has_source("coresignal"));
        assert!(bag.has_source("import"));
        assert_eq!(bag.last_enriched_at, Some(ts("2025-03-01T00:00:00Z")));
    }

    #[test]
    fn unparseable_legacy_timestamps_stay_in_place() {
        let fields = json!({ "rawData": { "a": 1 }, "lastEnriched": "spring 2024" });
        let migrated = normalize_legacy(&fields, Utc::now()).expect("migrated");
        assert_eq!(migrated["lastEnriched"], "spring 2024");
        assert!(migrated["enrichment"].get("lastEnrichedAt").is_none());

        let only_timestamp = json!({ "lastEnriched": "spring 2024" });
        assert!(normalize_legacy(&only_timestamp, Utc::now()).is_none());
    }

    #[test]
    fn normalize_leaves_unreadable_bags_alone() {
        let fields = json!({ "enrichment": 42, "coresignalData": { "id": 1 } });
        assert!(normalize_legacy(&fields, Utc::now()).is_none());
    }

    #[test]
    fn normalize_is_a_noop_on_canonical_bags() {
        let fields = json!({ "enrichment": { "sources": ["coresignal"] } });
        assert!(normalize_legacy(&fields, Utc::now()).is_none());
        assert!(normalize_legacy(&json!(null), Utc::now()).is_none());
    }

    #[test]
    fn legacy_source_map_is_flattened() {
        let fields = json!({
            "enrichmentSources": { "email": { "source": "clay", "at": "x" }, "phone": "user" }
        });
        let migrated = normalize_legacy(&fields, Utc::now()).expect("migrated");
        let bag = EnrichmentBag::from_custom_fields(&migrated);
        assert!(bag.has_source("clay"));
        assert!(bag.has_source("user"));
    }
}
