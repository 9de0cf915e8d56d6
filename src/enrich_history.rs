//! Field history enricher.
//!
//! One coalesced Tooling API query over `CustomField` produces the
//! created/modified audit tuple for every custom field of every object in
//! the working set.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::coalesce::{self, CoalescedQuery};
use crate::enrich_automation::EnrichOutcome;
use crate::models::{FieldAudit, HistoryBlock, ObjectRecord, ObjectRef};
use crate::progress::PhaseState;
use crate::session::Session;

pub const PHASE: &str = "history";

const CUSTOM_FIELDS: CoalescedQuery = CoalescedQuery {
    data_type: "field_history",
    template: "SELECT DeveloperName, TableEnumOrId, CreatedBy.Name, CreatedDate, \
               LastModifiedBy.Name, LastModifiedDate FROM CustomField \
               WHERE TableEnumOrId IN ({refs})",
    ref_path: &["TableEnumOrId"],
    tooling: true,
};

pub async fn enrich_history(
    session: &Session,
    records: &mut BTreeMap<ObjectRef, ObjectRecord>,
) -> EnrichOutcome {
    let refs: Vec<ObjectRef> = records.keys().cloned().collect();
    session.progress.seed(PHASE, &refs);

    let fetched = coalesce::coalesce(session, &CUSTOM_FIELDS, &refs).await;
    let mut outcome = EnrichOutcome {
        from_cache: fetched.from_cache,
        ..Default::default()
    };

    for (r, record) in records.iter_mut() {
        if fetched.unprocessed.contains(r) {
            outcome.skipped += 1;
            continue;
        }
        if let Some(e) = fetched.errors.get(r) {
            session
                .progress
                .mark(PHASE, r, PhaseState::Error, Some(e.to_string()));
            outcome.errored += 1;
            continue;
        }
        let rows = fetched.payloads.get(r).map(Vec::as_slice).unwrap_or(&[]);
        record.history = Some(history_from_rows(rows));
        session.progress.mark(PHASE, r, PhaseState::Done, None);
        outcome.ok += 1;
    }
    outcome
}

/// `CustomField.DeveloperName` omits the `__c` suffix the schema uses.
fn history_from_rows(rows: &[Value]) -> HistoryBlock {
    let mut fields = BTreeMap::new();
    for row in rows {
        let developer_name = match row.get("DeveloperName").and_then(|v| v.as_str()) {
            Some(n) => n,
            None => continue,
        };
        fields.insert(
            format!("{}__c", developer_name),
            FieldAudit {
                created_by: nested_name(row, "CreatedBy"),
                created_at: str_of(row, "CreatedDate"),
                modified_by: nested_name(row, "LastModifiedBy"),
                modified_at: str_of(row, "LastModifiedDate"),
            },
        );
    }
    HistoryBlock { fields }
}

fn nested_name(row: &Value, key: &str) -> String {
    row.get(key)
        .and_then(|v| v.get("Name"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn str_of(row: &Value, key: &str) -> String {
    row.get(key).and_then(|v| v.as_str()).unwrap_or("").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn audit_tuple_per_custom_field() {
        let rows = vec![json!({
            "DeveloperName": "Nickname",
            "TableEnumOrId": "Contact",
            "CreatedBy": {"Name": "Ada Admin"},
            "CreatedDate": "2023-04-01T12:00:00.000+0000",
            "LastModifiedBy": {"Name": "Bo Builder"},
            "LastModifiedDate": "2024-11-05T09:30:00.000+0000"
        })];
        let block = history_from_rows(&rows);
        let audit = &block.fields["Nickname__c"];
        assert_eq!(audit.created_by, "Ada Admin");
        assert_eq!(audit.modified_by, "Bo Builder");
        assert!(audit.modified_at.starts_with("2024-11-05"));
    }

    #[test]
    fn object_without_custom_fields_gets_empty_block() {
        let block = history_from_rows(&[]);
        assert!(block.fields.is_empty());
    }
}
