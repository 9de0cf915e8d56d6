//! Core data models for the extraction pipeline.
//!
//! These types represent the artifacts that flow from the Salesforce org to
//! the vector index. The lifecycle is:
//!
//! ```text
//! Enumerator → ObjectRef → describe() → ObjectRecord
//!                                           ↓ enrichers attach blocks
//!                                      seal() → content_hash
//!                                           ↓
//!                                      emit() → Chunk → upload()
//! ```
//!
//! An [`ObjectRecord`] is created by the describer with fields and
//! relationships populated, enriched in place by the optional enricher
//! blocks, hashed once all enrichers finish, and handed to the emitter.
//! Chunks are ephemeral: produced, uploaded, forgotten.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Opaque stable identifier of a schema object (`QualifiedApiName`).
pub type ObjectRef = String;

/// A single field of an object, as reported by `FieldDefinition`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub external_id: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub precision: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub scale: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub formula: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub relationship_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
}

impl FieldSpec {
    pub fn named(name: &str, field_type: &str) -> Self {
        Self {
            name: name.to_string(),
            label: name.to_string(),
            field_type: field_type.to_string(),
            required: false,
            unique: false,
            external_id: false,
            length: None,
            precision: None,
            scale: None,
            formula: None,
            relationship_to: None,
            description: None,
        }
    }
}

/// A lookup or master-detail edge from one object to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Field on this object that holds the reference.
    pub field: String,
    /// Target object of the reference.
    pub to_object: String,
    /// `"Lookup"` or `"MasterDetail"`.
    pub kind: String,
}

/// Usage statistics sampled from live data.
///
/// Fill rates and picklist distributions come from a bounded sample
/// (`sample_size` rows), not a full scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsBlock {
    pub record_count: u64,
    pub sample_size: u64,
    /// Per-field filled/total counts over the sample.
    #[serde(default)]
    pub field_fill_rates: BTreeMap<String, FillRate>,
    /// Per-picklist-field value distribution over the sample.
    #[serde(default)]
    pub picklist_distributions: BTreeMap<String, BTreeMap<String, u64>>,
    /// Fraction of records modified within the freshness window.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub freshness_fraction: Option<f64>,
    /// Profiles owning the most records, most frequent first.
    #[serde(default)]
    pub top_owner_profiles: Vec<OwnerShare>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FillRate {
    pub filled: u64,
    pub total: u64,
}

impl FillRate {
    pub fn rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.filled as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OwnerShare {
    pub profile: String,
    pub record_count: u64,
}

/// Automation artifacts referencing an object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutomationBlock {
    #[serde(default)]
    pub flows: Vec<FlowRef>,
    #[serde(default)]
    pub triggers: Vec<TriggerRef>,
    #[serde(default)]
    pub validation_rules: Vec<ValidationRuleRef>,
    #[serde(default)]
    pub workflow_rules: Vec<WorkflowRuleRef>,
    /// Per-trigger source complexity, computed locally from fetched bodies.
    #[serde(default)]
    pub complexity: Vec<CodeComplexity>,
}

impl AutomationBlock {
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
            && self.triggers.is_empty()
            && self.validation_rules.is_empty()
            && self.workflow_rules.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowRef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerRef {
    pub name: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationRuleRef {
    pub name: String,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub error_field: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRuleRef {
    pub name: String,
    #[serde(default)]
    pub active: bool,
}

/// Line statistics of an Apex trigger body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeComplexity {
    pub name: String,
    pub total_lines: u64,
    pub comment_lines: u64,
    pub code_lines: u64,
}

impl CodeComplexity {
    /// Count lines of an Apex source body. `//`, `/*`, and `*` continuation
    /// lines count as comments; blank lines count toward neither.
    pub fn from_source(name: &str, body: &str) -> Self {
        let mut total = 0u64;
        let mut comments = 0u64;
        let mut blank = 0u64;
        for line in body.lines() {
            total += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                blank += 1;
            } else if trimmed.starts_with("//")
                || trimmed.starts_with("/*")
                || trimmed.starts_with('*')
            {
                comments += 1;
            }
        }
        Self {
            name: name.to_string(),
            total_lines: total,
            comment_lines: comments,
            code_lines: total - comments - blank,
        }
    }
}

/// Object- and field-level security, per profile and per permission set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityBlock {
    /// Object-level CRUD by profile name.
    #[serde(default)]
    pub profile_permissions: BTreeMap<String, CrudPermissions>,
    /// Object-level CRUD by permission set name.
    #[serde(default)]
    pub permission_set_permissions: BTreeMap<String, CrudPermissions>,
    /// Per-field grants: field name → who may edit / who is read-only.
    #[serde(default)]
    pub field_permissions: BTreeMap<String, FieldAccess>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrudPermissions {
    pub create: bool,
    pub read: bool,
    pub edit: bool,
    pub delete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldAccess {
    #[serde(default)]
    pub editable_by: Vec<String>,
    #[serde(default)]
    pub readonly_by: Vec<String>,
}

/// Audit history of an object's custom fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryBlock {
    /// Field developer name → audit tuple.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldAudit>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldAudit {
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub modified_by: String,
    #[serde(default)]
    pub modified_at: String,
}

/// Tenant-global security entity (profile, permission set, or role).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityPrincipal {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
}

/// Org-wide security metadata collected by the org-security enricher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrgSecurity {
    #[serde(default)]
    pub profiles: Vec<SecurityPrincipal>,
    #[serde(default)]
    pub permission_sets: Vec<SecurityPrincipal>,
    #[serde(default)]
    pub roles: Vec<SecurityPrincipal>,
}

/// The complete per-object record assembled by the describer and enrichers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub name: ObjectRef,
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stats: Option<StatsBlock>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub automation: Option<AutomationBlock>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub security: Option<SecurityBlock>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub history: Option<HistoryBlock>,
    /// Hex SHA-256 of the canonical serialization, set by [`ObjectRecord::seal`].
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub content_hash: String,
}

impl ObjectRecord {
    /// Compute and store the content hash. Idempotent: sealing twice yields
    /// the same hash because the hash field itself is excluded.
    pub fn seal(&mut self) {
        self.content_hash = self.canonical_hash();
    }

    /// Hex SHA-256 over the canonical JSON form: map keys sorted, list
    /// elements sorted by their canonical serialization, `content_hash`
    /// excluded.
    pub fn canonical_hash(&self) -> String {
        let mut value = serde_json::to_value(self).expect("ObjectRecord serializes");
        if let Value::Object(ref mut map) = value {
            map.remove("content_hash");
        }
        let canonical = canonical_value(&value);
        let encoded = serde_json::to_string(&canonical).expect("canonical value serializes");
        let mut hasher = Sha256::new();
        hasher.update(encoded.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Canonicalize a JSON value: object keys sorted, array elements sorted by
/// their own canonical serialization. Every list inside an [`ObjectRecord`]
/// is semantically a set, so element order never carries meaning here.
pub fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<(&String, &Value)> = map.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::new();
            for (key, val) in pairs {
                out.insert(key.clone(), canonical_value(val));
            }
            Value::Object(out)
        }
        Value::Array(arr) => {
            let mut items: Vec<Value> = arr.iter().map(canonical_value).collect();
            items.sort_by_key(|v| serde_json::to_string(v).unwrap_or_default());
            Value::Array(items)
        }
        _ => value.clone(),
    }
}

/// A single line of the JSONL corpus; the atomic unit of vector-index upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// `{prefix}_{object}` or `{prefix}_{object}_part_{n}` (1-indexed).
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub object_name: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub content_hash: String,
    pub part_index: u32,
    pub total_parts: u32,
    pub sibling_ids: Vec<String>,
    #[serde(default)]
    pub fields_count: u64,
    #[serde(default)]
    pub record_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> ObjectRecord {
        let mut owner = FieldSpec::named("OwnerId", "Lookup");
        owner.label = "Owner".into();
        owner.required = true;
        owner.relationship_to = Some("User".into());

        let mut name = FieldSpec::named("Name", "Text");
        name.label = "Account Name".into();
        name.required = true;
        name.length = Some(255);

        ObjectRecord {
            name: "Account".into(),
            label: "Account".into(),
            description: "Standard account".into(),
            fields: vec![name, owner],
            relationships: vec![Relationship {
                field: "OwnerId".into(),
                to_object: "User".into(),
                kind: "Lookup".into(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn hash_ignores_field_order() {
        let a = sample_record();
        let mut b = sample_record();
        b.fields.reverse();
        assert_eq!(a.canonical_hash(), b.canonical_hash());
    }

    #[test]
    fn hash_stable_across_seal() {
        let mut rec = sample_record();
        rec.seal();
        let first = rec.content_hash.clone();
        rec.seal();
        assert_eq!(first, rec.content_hash);
    }

    #[test]
    fn hash_changes_with_content() {
        let a = sample_record();
        let mut b = sample_record();
        let mut extra = FieldSpec::named("Nickname__c", "Text");
        extra.length = Some(80);
        b.fields.push(extra);
        assert_ne!(a.canonical_hash(), b.canonical_hash());
    }

    #[test]
    fn hash_ignores_block_map_order() {
        let mut sec = SecurityBlock::default();
        sec.profile_permissions.insert(
            "Admin".into(),
            CrudPermissions { create: true, read: true, edit: true, delete: true },
        );
        sec.profile_permissions.insert(
            "Standard User".into(),
            CrudPermissions { create: false, read: true, edit: false, delete: false },
        );
        let mut a = sample_record();
        a.security = Some(sec.clone());
        let mut b = sample_record();
        b.security = Some(sec);
        assert_eq!(a.canonical_hash(), b.canonical_hash());
    }

    #[test]
    fn complexity_counts_lines() {
        let body =
            "trigger AccountTrigger on Account (before insert) {\n// guard\n\n    doWork();\n}";
        let c = CodeComplexity::from_source("AccountTrigger", body);
        assert_eq!(c.total_lines, 5);
        assert_eq!(c.comment_lines, 1);
        assert_eq!(c.code_lines, 3);
    }
}
