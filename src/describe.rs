//! Object describer.
//!
//! For each ref in the working set, fetches the entity row and its field
//! definitions, and assembles an [`ObjectRecord`] with fields and
//! relationships populated and `content_hash` unset. Work fans out over a
//! semaphore-bounded pool (default 15 workers); each ref's fetch is guarded
//! by the cache's per-key flight lock so concurrent callers never duplicate
//! the remote call pair.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::bridge::RemoteError;
use crate::coalesce::escape_soql;
use crate::models::{FieldSpec, ObjectRecord, ObjectRef, Relationship};
use crate::progress::PhaseState;
use crate::retry;
use crate::session::Session;

pub const PHASE: &str = "describe";
const DATA_TYPE: &str = "describe";

#[derive(Debug, Default)]
pub struct DescribeOutcome {
    pub records: BTreeMap<ObjectRef, ObjectRecord>,
    pub errors: BTreeMap<ObjectRef, RemoteError>,
    pub from_cache: usize,
}

/// Describe every ref through the worker pool, marking progress per ref.
/// Refs are skipped without marking once the quota wall trips, so a resumed
/// run picks them up untouched.
pub async fn describe_objects(session: &Arc<Session>, refs: &[ObjectRef]) -> DescribeOutcome {
    let semaphore = Arc::new(Semaphore::new(session.config.pools.describe_workers));
    let mut handles = Vec::with_capacity(refs.len());

    for r in refs {
        let session = Arc::clone(session);
        let semaphore = Arc::clone(&semaphore);
        let object_ref = r.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            if session.limiter.quota_walled() {
                return (object_ref, None);
            }
            session
                .progress
                .mark(PHASE, &object_ref, PhaseState::InFlight, None);
            let result = describe_one(&session, &object_ref).await;
            match &result {
                Ok((_, _)) => {
                    session
                        .progress
                        .mark(PHASE, &object_ref, PhaseState::Done, None);
                }
                Err(e) => {
                    session.progress.mark(
                        PHASE,
                        &object_ref,
                        PhaseState::Error,
                        Some(e.to_string()),
                    );
                }
            }
            (object_ref, Some(result))
        }));
    }

    let mut outcome = DescribeOutcome::default();
    for handle in handles {
        match handle.await {
            Ok((object_ref, Some(Ok((record, cached))))) => {
                if cached {
                    outcome.from_cache += 1;
                }
                outcome.records.insert(object_ref, record);
            }
            Ok((object_ref, Some(Err(e)))) => {
                warn!(object_ref = %object_ref, error = %e, "describe failed");
                outcome.errors.insert(object_ref, e);
            }
            Ok((_, None)) => {} // quota-walled, left pending
            Err(e) => warn!(error = %e, "describe task panicked"),
        }
    }
    outcome
}

/// Describe one ref: cache hit or two remote queries, cached as one entry.
/// Returns the record and whether it came from cache.
async fn describe_one(
    session: &Session,
    object_ref: &str,
) -> Result<(ObjectRecord, bool), RemoteError> {
    let no_params: Vec<(String, String)> = Vec::new();
    let _flight = session
        .cache
        .flight_guard(DATA_TYPE, object_ref, &no_params)
        .await;

    if let Some(payload) = session.cache.get(DATA_TYPE, object_ref, &no_params) {
        let record = record_from_payload(object_ref, &payload)?;
        return Ok((record, true));
    }

    let entity_soql = format!(
        "SELECT QualifiedApiName, Label, Description FROM EntityDefinition \
         WHERE QualifiedApiName = '{}'",
        escape_soql(object_ref)
    );
    let entity_rows = retry::call_remote(&session.retry, &session.limiter, DATA_TYPE, || {
        session.cli.query(&entity_soql, false)
    })
    .await?;
    let entity = entity_rows
        .first()
        .cloned()
        .ok_or_else(|| RemoteError::Consistency(format!("no EntityDefinition row for {}", object_ref)))?;

    let fields_soql = format!(
        "SELECT QualifiedApiName, Label, DataType, Description, Length, Precision, Scale, \
         IsNillable, IsUnique, IsExternalId FROM FieldDefinition \
         WHERE EntityDefinition.QualifiedApiName = '{}' ORDER BY QualifiedApiName",
        escape_soql(object_ref)
    );
    let field_rows = retry::call_remote(&session.retry, &session.limiter, DATA_TYPE, || {
        session.cli.query(&fields_soql, false)
    })
    .await?;

    let payload = json!({ "entity": entity, "fields": field_rows });
    session.cache.put(DATA_TYPE, object_ref, &no_params, &payload);

    let record = record_from_payload(object_ref, &payload)?;
    debug!(object_ref, fields = record.fields.len(), "described");
    Ok((record, false))
}

/// Build an [`ObjectRecord`] from the cached describe payload.
fn record_from_payload(object_ref: &str, payload: &Value) -> Result<ObjectRecord, RemoteError> {
    let entity = payload
        .get("entity")
        .ok_or_else(|| RemoteError::Consistency("describe payload missing entity".into()))?;
    let field_rows = payload
        .get("fields")
        .and_then(|f| f.as_array())
        .ok_or_else(|| RemoteError::Consistency("describe payload missing fields".into()))?;

    let label = entity
        .get("Label")
        .and_then(|v| v.as_str())
        .unwrap_or(object_ref)
        .to_string();
    let description = entity
        .get("Description")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let mut fields = Vec::with_capacity(field_rows.len());
    let mut relationships = Vec::new();
    for row in field_rows {
        let field = field_from_row(row)?;
        if let Some(target) = &field.relationship_to {
            relationships.push(Relationship {
                field: field.name.clone(),
                to_object: target.clone(),
                kind: if field.field_type.starts_with("MasterDetail") {
                    "MasterDetail".to_string()
                } else {
                    "Lookup".to_string()
                },
            });
        }
        fields.push(field);
    }

    Ok(ObjectRecord {
        name: object_ref.to_string(),
        label,
        description,
        fields,
        relationships,
        ..Default::default()
    })
}

fn field_from_row(row: &Value) -> Result<FieldSpec, RemoteError> {
    let name = row
        .get("QualifiedApiName")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            RemoteError::Consistency("FieldDefinition row missing QualifiedApiName".into())
        })?;
    let data_type = row
        .get("DataType")
        .and_then(|v| v.as_str())
        .unwrap_or("Unknown")
        .to_string();

    let mut field = FieldSpec::named(name, &data_type);
    field.label = row
        .get("Label")
        .and_then(|v| v.as_str())
        .unwrap_or(name)
        .to_string();
    field.required = row
        .get("IsNillable")
        .and_then(|v| v.as_bool())
        .map(|nillable| !nillable)
        .unwrap_or(false);
    field.unique = row
        .get("IsUnique")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    field.external_id = row
        .get("IsExternalId")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    field.length = row.get("Length").and_then(|v| v.as_u64()).map(|n| n as u32);
    field.precision = row
        .get("Precision")
        .and_then(|v| v.as_u64())
        .map(|n| n as u32);
    field.scale = row.get("Scale").and_then(|v| v.as_u64()).map(|n| n as u32);
    field.description = row
        .get("Description")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());
    field.relationship_to = relationship_target(&data_type);
    Ok(field)
}

/// `FieldDefinition.DataType` renders references as `Lookup(User)` or
/// `Master-Detail Relationship(Order)`; extract the target object.
fn relationship_target(data_type: &str) -> Option<String> {
    let is_ref = data_type.starts_with("Lookup(")
        || data_type.starts_with("MasterDetail(")
        || data_type.starts_with("Master-Detail Relationship(");
    if !is_ref {
        return None;
    }
    let open = data_type.find('(')?;
    let close = data_type.rfind(')')?;
    if close <= open + 1 {
        return None;
    }
    // A polymorphic lookup renders as `Lookup(User,Group)`.
    Some(data_type[open + 1..close].split(',').next()?.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_record_from_payload() {
        let payload = json!({
            "entity": {"QualifiedApiName": "Account", "Label": "Account",
                       "Description": "Core account object"},
            "fields": [
                {"QualifiedApiName": "External_Key__c", "Label": "External Key",
                 "DataType": "Text(40)", "Length": 40, "IsNillable": true,
                 "IsUnique": true, "IsExternalId": true},
                {"QualifiedApiName": "Name", "Label": "Account Name", "DataType": "Text(255)",
                 "Length": 255, "IsNillable": false},
                {"QualifiedApiName": "OwnerId", "Label": "Owner", "DataType": "Lookup(User)",
                 "IsNillable": false},
                {"QualifiedApiName": "AnnualRevenue", "Label": "Annual Revenue",
                 "DataType": "Currency(18, 0)", "Precision": 18, "Scale": 0, "IsNillable": true}
            ]
        });
        let record = record_from_payload("Account", &payload).unwrap();
        assert_eq!(record.label, "Account");
        assert_eq!(record.description, "Core account object");
        assert_eq!(record.fields.len(), 4);
        assert_eq!(record.relationships.len(), 1);
        assert_eq!(record.relationships[0].to_object, "User");
        assert_eq!(record.relationships[0].kind, "Lookup");
        assert!(record.content_hash.is_empty());

        let external_key = &record.fields[0];
        assert!(external_key.unique);
        assert!(external_key.external_id);
        assert!(!external_key.required);
        let name = &record.fields[1];
        assert!(name.required);
        assert!(!name.unique);
        assert!(!name.external_id);
        assert_eq!(name.length, Some(255));
        let revenue = &record.fields[3];
        assert!(!revenue.required);
        assert_eq!(revenue.precision, Some(18));
    }

    #[test]
    fn relationship_target_variants() {
        assert_eq!(relationship_target("Lookup(User)"), Some("User".into()));
        assert_eq!(
            relationship_target("Master-Detail Relationship(Order)"),
            Some("Order".into())
        );
        assert_eq!(relationship_target("Lookup(User,Group)"), Some("User".into()));
        assert_eq!(relationship_target("Text(255)"), None);
        assert_eq!(relationship_target("Number"), None);
    }

    #[test]
    fn zero_field_payload_is_valid() {
        let payload = json!({
            "entity": {"QualifiedApiName": "Empty__c", "Label": "Empty"},
            "fields": []
        });
        let record = record_from_payload("Empty__c", &payload).unwrap();
        assert!(record.fields.is_empty());
        assert!(record.relationships.is_empty());
    }

    #[test]
    fn missing_entity_is_consistency_error() {
        let payload = json!({"fields": []});
        let err = record_from_payload("Account", &payload).unwrap_err();
        assert!(matches!(err, RemoteError::Consistency(_)));
    }
}
