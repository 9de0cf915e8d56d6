//! Query coalescer: many per-object queries, few remote calls.
//!
//! Given a data type and a set of object refs, produces `ref → rows` using
//! the minimum number of remote queries. Refs already covered by the cache
//! never leave the process; the rest are grouped into `IN (...)` batches,
//! dispatched through retry → limiter → bridge, and the returned rows are
//! partitioned back to their refs. A ref the remote returned nothing for
//! gets an empty payload, not an error.
//!
//! A batch that fails syntactically (typically an over-long clause) is
//! halved and retried; a single ref that still fails is reported as errored.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::bridge::RemoteError;
use crate::models::ObjectRef;
use crate::retry;
use crate::session::Session;

/// Upper bound on the rendered `IN (...)` list, under Salesforce's SOQL
/// clause length limits.
const MAX_CLAUSE_CHARS: usize = 3500;

/// A coalescable remote query shape.
///
/// `template` must contain a single `{refs}` hole that receives the quoted,
/// comma-separated ref list. `ref_path` locates the owning ref inside each
/// returned row.
#[derive(Debug, Clone, Copy)]
pub struct CoalescedQuery {
    /// Cache data-type name, also used in logs and progress errors.
    pub data_type: &'static str,
    pub template: &'static str,
    pub ref_path: &'static [&'static str],
    pub tooling: bool,
}

impl CoalescedQuery {
    pub fn render(&self, refs: &[ObjectRef]) -> String {
        let quoted: Vec<String> = refs.iter().map(|r| format!("'{}'", escape_soql(r))).collect();
        self.template.replace("{refs}", &quoted.join(","))
    }

    /// Extract the owning ref of a row, following `ref_path`.
    pub fn ref_of(&self, row: &Value) -> Option<String> {
        let mut cursor = row;
        for segment in self.ref_path {
            cursor = cursor.get(segment)?;
        }
        cursor.as_str().map(|s| s.to_string())
    }
}

/// Escape a value for inclusion in a single-quoted SOQL literal.
pub fn escape_soql(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Result of one coalesced fetch over a working set.
#[derive(Debug, Default)]
pub struct CoalesceOutcome {
    /// Rows per ref; refs the remote knew nothing about map to empty vecs.
    pub payloads: BTreeMap<ObjectRef, Vec<Value>>,
    /// Refs that failed after batch-splitting and retries.
    pub errors: BTreeMap<ObjectRef, RemoteError>,
    /// Refs served from cache without a remote call.
    pub from_cache: usize,
    /// Refs skipped because the quota wall tripped mid-phase.
    pub unprocessed: Vec<ObjectRef>,
}

/// Chunk `refs` into batches that respect both the ref-count cap and the
/// rendered clause budget. Input order is preserved.
pub fn plan_batches(refs: &[ObjectRef], max_refs: usize) -> Vec<Vec<ObjectRef>> {
    let mut batches = Vec::new();
    let mut current: Vec<ObjectRef> = Vec::new();
    let mut current_chars = 0usize;
    for r in refs {
        let quoted_len = escape_soql(r).len() + 3; // quotes + comma
        if !current.is_empty()
            && (current.len() >= max_refs || current_chars + quoted_len > MAX_CLAUSE_CHARS)
        {
            batches.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        current.push(r.clone());
        current_chars += quoted_len;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Partition `rows` back to the refs of one batch. Rows whose ref is not in
/// the batch are dropped; every batch ref appears in the output.
pub fn group_rows(
    query: &CoalescedQuery,
    batch: &[ObjectRef],
    rows: Vec<Value>,
) -> BTreeMap<ObjectRef, Vec<Value>> {
    let mut grouped: BTreeMap<ObjectRef, Vec<Value>> =
        batch.iter().map(|r| (r.clone(), Vec::new())).collect();
    for row in rows {
        if let Some(r) = query.ref_of(&row) {
            if let Some(bucket) = grouped.get_mut(&r) {
                bucket.push(row);
            }
        }
    }
    grouped
}

/// Fetch `query` for every ref in `refs`, coalescing remote calls.
///
/// Refs are processed in sorted order so batch composition is reproducible
/// across runs. Dispatch stops early when the limiter reports a quota wall;
/// the untouched refs come back in `unprocessed`.
pub async fn coalesce(
    session: &Session,
    query: &CoalescedQuery,
    refs: &[ObjectRef],
) -> CoalesceOutcome {
    let mut sorted: Vec<ObjectRef> = refs.to_vec();
    sorted.sort();
    sorted.dedup();

    let mut outcome = CoalesceOutcome::default();
    let no_params: Vec<(String, String)> = Vec::new();

    // Cache partition.
    let mut uncached = Vec::new();
    for r in &sorted {
        match session.cache.get(query.data_type, r, &no_params) {
            Some(Value::Array(rows)) => {
                outcome.payloads.insert(r.clone(), rows);
                outcome.from_cache += 1;
            }
            Some(_) => {
                // Entry from an incompatible writer; treat as a miss.
                warn!(data_type = query.data_type, object_ref = %r, "discarding non-array cache payload");
                uncached.push(r.clone());
            }
            None => uncached.push(r.clone()),
        }
    }
    if uncached.is_empty() {
        return outcome;
    }
    debug!(
        data_type = query.data_type,
        cached = outcome.from_cache,
        uncached = uncached.len(),
        "coalescing"
    );

    // Work stack of batches; syntactic failures push two halves back.
    let mut work: Vec<Vec<ObjectRef>> =
        plan_batches(&uncached, session.config.batch.coalesce_refs);
    work.reverse();

    while let Some(batch) = work.pop() {
        if session.limiter.quota_walled() {
            outcome.unprocessed.extend(batch);
            for remaining in work.drain(..) {
                outcome.unprocessed.extend(remaining);
            }
            break;
        }

        let soql = query.render(&batch);
        let result = retry::call_remote(
            &session.retry,
            &session.limiter,
            query.data_type,
            || session.cli.query(&soql, query.tooling),
        )
        .await;

        match result {
            Ok(rows) => {
                for (r, rows) in group_rows(query, &batch, rows) {
                    session
                        .cache
                        .put(query.data_type, &r, &no_params, &Value::Array(rows.clone()));
                    outcome.payloads.insert(r, rows);
                }
            }
            Err(e) if e.is_syntactic() && batch.len() > 1 => {
                let mid = batch.len() / 2;
                let (left, right) = batch.split_at(mid);
                debug!(
                    data_type = query.data_type,
                    batch = batch.len(),
                    "syntactic failure, halving batch"
                );
                work.push(right.to_vec());
                work.push(left.to_vec());
            }
            Err(e) => {
                warn!(data_type = query.data_type, batch = batch.len(), error = %e, "batch failed");
                for r in batch {
                    outcome.errors.insert(r, e.clone());
                }
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TRIGGERS: CoalescedQuery = CoalescedQuery {
        data_type: "triggers",
        template: "SELECT Name, TableEnumOrId, Body, Status FROM ApexTrigger \
                   WHERE TableEnumOrId IN ({refs})",
        ref_path: &["TableEnumOrId"],
        tooling: true,
    };

    const FLOWS: CoalescedQuery = CoalescedQuery {
        data_type: "flows",
        template: "SELECT Name FROM Flow WHERE TriggerObjectOrEvent.QualifiedApiName IN ({refs})",
        ref_path: &["TriggerObjectOrEvent", "QualifiedApiName"],
        tooling: false,
    };

    #[test]
    fn renders_quoted_in_clause() {
        let soql = TRIGGERS.render(&["Account".into(), "Contact".into()]);
        assert!(soql.contains("IN ('Account','Contact')"));
    }

    #[test]
    fn escapes_quotes_in_refs() {
        assert_eq!(escape_soql("O'Brien"), "O\\'Brien");
        let soql = TRIGGERS.render(&["O'Brien__c".into()]);
        assert!(soql.contains("'O\\'Brien__c'"));
    }

    #[test]
    fn ref_of_follows_nested_path() {
        let row = json!({"Name": "F", "TriggerObjectOrEvent": {"QualifiedApiName": "Account"}});
        assert_eq!(FLOWS.ref_of(&row).unwrap(), "Account");
        assert!(TRIGGERS.ref_of(&row).is_none());
    }

    #[test]
    fn batches_respect_ref_cap() {
        let refs: Vec<String> = (0..450).map(|i| format!("Obj{i}__c")).collect();
        let batches = plan_batches(&refs, 200);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 200);
        assert_eq!(batches[2].len(), 50);
        let total: usize = batches.iter().map(|b| b.len()).sum();
        assert_eq!(total, 450);
    }

    #[test]
    fn batches_respect_clause_budget() {
        // 100-char refs: ~34 fit in the 3500-char budget.
        let refs: Vec<String> = (0..80).map(|i| format!("{:0>100}", i)).collect();
        let batches = plan_batches(&refs, 200);
        assert!(batches.len() > 1);
        for batch in &batches {
            let rendered: usize = batch.iter().map(|r| r.len() + 3).sum();
            assert!(rendered <= MAX_CLAUSE_CHARS);
        }
    }

    #[test]
    fn single_ref_batch_works() {
        let batches = plan_batches(&["Account".to_string()], 200);
        assert_eq!(batches, vec![vec!["Account".to_string()]]);
    }

    #[test]
    fn grouping_gives_missing_refs_empty_payloads() {
        let batch: Vec<String> = vec!["Account".into(), "Contact".into()];
        let rows = vec![
            json!({"Name": "T1", "TableEnumOrId": "Account"}),
            json!({"Name": "T2", "TableEnumOrId": "Account"}),
            json!({"Name": "T3", "TableEnumOrId": "Lead"}),
        ];
        let grouped = group_rows(&TRIGGERS, &batch, rows);
        assert_eq!(grouped["Account"].len(), 2);
        assert!(grouped["Contact"].is_empty());
        assert!(!grouped.contains_key("Lead"));
    }
}
