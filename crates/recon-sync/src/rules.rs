//! Field extraction rules and the source trust table.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use recon_core::{AllowedField, FieldValue, RecordKind};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FieldRulesFile {
    #[serde(default)]
    trust: BTreeMap<String, u8>,
    #[serde(default)]
    person: BTreeMap<AllowedField, Vec<String>>,
    #[serde(default)]
    company: BTreeMap<AllowedField, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRules {
    trust: BTreeMap<String, u8>,
    person: BTreeMap<AllowedField, Vec<String>>,
    company: BTreeMap<AllowedField, Vec<String>>,
}

fn paths(entries: &[(AllowedField, &[&str])]) -> BTreeMap<AllowedField, Vec<String>> {
    entries
        .iter()
        .map(|(field, paths)| (*field, paths.iter().map(|p| p.to_string()).collect()))
        .collect()
}

impl Default for FieldRules {
    fn default() -> Self {
        Self::builtin()
    }
}

impl FieldRules {
    pub fn builtin() -> Self {
        let trust = [("user", 4u8), ("coresignal", 3), ("import", 2), ("ai", 1)]
            .into_iter()
            .map(|(source, level)| (source.to_string(), level))
            .collect();
        let person = paths(&[
            (
                AllowedField::Email,
                &["professional_email", "primary_professional_email"][..],
            ),
            (AllowedField::Phone, &["phone_number", "phone"][..]),
            (AllowedField::Headline, &["headline", "job_title"][..]),
            (AllowedField::Location, &["location_full", "location"][..]),
            (
                AllowedField::LinkedinUrl,
                &["websites_linkedin", "linkedin_url"][..],
            ),
            (AllowedField::Skills, &["inferred_skills", "skills"][..]),
            (AllowedField::Experience, &["experience"][..]),
        ]);
        let company = paths(&[
            (AllowedField::Website, &["website"][..]),
            (AllowedField::Phone, &["phone_number"][..]),
            (AllowedField::Industry, &["industry"][..]),
            (AllowedField::Description, &["description"][..]),
            (AllowedField::Location, &["hq_location", "hq_full_address"][..]),
            (
                AllowedField::EmployeeCount,
                &["employees_count", "size_employees_count"][..],
            ),
            (
                AllowedField::LinkedinUrl,
                &["linkedin_url", "websites_linkedin"][..],
            ),
        ]);
        Self {
            trust,
            person,
            company,
        }
    }

    /// Parses a YAML rules document layered over the built-in rules. Fields
    /// listed in the document replace the built-in paths for that field.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let file: FieldRulesFile = serde_yaml::from_str(text).context("parsing field rules")?;
        let mut rules = Self::builtin();
        rules.trust.extend(file.trust);
        for (kind, overrides) in [
            (RecordKind::Person, file.person),
            (RecordKind::Company, file.company),
        ] {
            for (field, paths) in overrides {
                anyhow::ensure!(
                    field.applies_to(kind),
                    "field {field} is not writable on {kind} records"
                );
                rules.paths_mut(kind).insert(field, paths);
            }
        }
        Ok(rules)
    }

    /// Loads rules from `path`, or the built-in rules when the file is absent.
    pub fn load_or_builtin(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::builtin());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    fn paths_mut(&mut self, kind: RecordKind) -> &mut BTreeMap<AllowedField, Vec<String>> {
        match kind {
            RecordKind::Person => &mut self.person,
            RecordKind::Company => &mut self.company,
        }
    }

    pub fn trust(&self, source: &str) -> u8 {
        self.trust.get(source).copied().unwrap_or(0)
    }

    pub fn paths_for(&self, kind: RecordKind, field: AllowedField) -> &[String] {
        let table = match kind {
            RecordKind::Person => &self.person,
            RecordKind::Company => &self.company,
        };
        table.get(&field).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First non-empty value for `field` in `document`, converted to the
    /// field's type.
    pub fn extract(
        &self,
        kind: RecordKind,
        field: AllowedField,
        document: &JsonValue,
    ) -> Option<FieldValue> {
        self.paths_for(kind, field)
            .iter()
            .filter_map(|path| lookup(document, path))
            .filter_map(|raw| convert(field, raw))
            .find(|value| !value.is_empty())
    }
}

/// Resolves a dotted path. Numeric segments index into arrays.
pub fn lookup<'a>(document: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(document, |current, segment| match current {
            JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            JsonValue::Object(map) => map.get(segment),
            _ => None,
        })
        .filter(|value| !value.is_null())
}

fn convert(field: AllowedField, raw: &JsonValue) -> Option<FieldValue> {
    match field {
        AllowedField::EmployeeCount => match raw {
            JsonValue::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(FieldValue::Number),
            JsonValue::String(s) => s.trim().replace(',', "").parse().ok().map(FieldValue::Number),
            _ => None,
        },
        AllowedField::Skills => match raw {
            JsonValue::Array(items) => {
                let skills = items
                    .iter()
                    .filter_map(|item| match item {
                        JsonValue::String(s) => Some(s.trim().to_string()),
                        JsonValue::Object(o) => {
                            o.get("name").and_then(JsonValue::as_str).map(|s| s.trim().to_string())
                        }
                        _ => None,
                    })
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>();
                Some(FieldValue::List(skills))
            }
            JsonValue::String(s) => Some(FieldValue::List(
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect(),
            )),
            _ => None,
        },
        AllowedField::Experience => match raw {
            JsonValue::Array(_) | JsonValue::Object(_) => Some(FieldValue::Json(raw.clone())),
            _ => None,
        },
        _ => match raw {
            JsonValue::String(s) => Some(FieldValue::Text(s.trim().to_string())),
            JsonValue::Number(n) => Some(FieldValue::Text(n.to_string())),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_walks_objects_and_arrays() {
        let doc = json!({ "experience": [{ "title": "VP" }], "empty": null });
        assert_eq!(lookup(&doc, "experience.0.title"), Some(&json!("VP")));
        assert_eq!(lookup(&doc, "experience.3.title"), None);
        assert_eq!(lookup(&doc, "empty"), None);
    }

    #[test]
    fn extraction_falls_through_empty_paths() {
        let rules = FieldRules::builtin();
        let doc = json!({ "professional_email": "  ", "primary_professional_email": "jdoe@acme.com" });
        assert_eq!(
            rules.extract(RecordKind::Person, AllowedField::Email, &doc),
            Some(FieldValue::Text("jdoe@acme.com".into()))
        );
    }

    #[test]
    fn extraction_converts_to_field_types() {
        let rules = FieldRules::builtin();
        let company = json!({ "employees_count": "1,250" });
        assert_eq!(
            rules.extract(RecordKind::Company, AllowedField::EmployeeCount, &company),
            Some(FieldValue::Number(1250))
        );
        let person = json!({ "inferred_skills": ["sql", { "name": "python" }, 3] });
        assert_eq!(
            rules.extract(RecordKind::Person, AllowedField::Skills, &person),
            Some(FieldValue::List(vec!["sql".into(), "python".into()]))
        );
        assert_eq!(
            rules.extract(RecordKind::Person, AllowedField::Experience, &json!({ "experience": "n/a" })),
            None
        );
    }

    #[test]
    fn yaml_overrides_paths_and_extends_trust() {
        let rules = FieldRules::from_yaml(
            "trust:\n  clay: 3\nperson:\n  headline: [experience.0.title]\n",
        )
        .expect("rules");
        assert_eq!(rules.trust("clay"), 3);
        assert_eq!(rules.trust("user"), 4);
        assert_eq!(rules.trust("somebody"), 0);
        assert_eq!(
            rules.paths_for(RecordKind::Person, AllowedField::Headline),
            ["experience.0.title".to_string()]
        );
        assert_eq!(
            rules.paths_for(RecordKind::Person, AllowedField::Email),
            FieldRules::builtin().paths_for(RecordKind::Person, AllowedField::Email)
        );
    }

    #[test]
    fn yaml_rejects_fields_outside_the_allow_list() {
        assert!(FieldRules::from_yaml("person:\n  employee_count: [size]\n").is_err());
    }

    #[test]
    fn shipped_rules_file_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../rules/fields.yaml");
        let rules = FieldRules::load_or_builtin(&path).expect("rules file");
        assert_eq!(rules.trust("coresignal"), 3);
        assert!(!rules
            .paths_for(RecordKind::Company, AllowedField::EmployeeCount)
            .is_empty());
    }
}
