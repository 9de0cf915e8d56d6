//! Usage statistics enricher.
//!
//! Per object: a record count, field fill rates and picklist distributions
//! computed locally from a bounded sample (`LIMIT sample_n`), a freshness
//! fraction from a date-filtered count, and the top owning profiles from a
//! grouped query. Cross-object SOQL cannot batch per-table counts, so this
//! enricher fans out per-object calls over the worker pool with its own
//! cache data-type; the computed block is what gets cached, keyed by the
//! sample size.
//!
//! The freshness and owner sub-queries are best-effort: objects without
//! `LastModifiedDate` or `OwnerId` skip them, and a failure there degrades
//! the block instead of erroring the ref.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::bridge::RemoteError;
use crate::coalesce::escape_soql;
use crate::enrich_automation::EnrichOutcome;
use crate::models::{FillRate, ObjectRecord, ObjectRef, OwnerShare, StatsBlock};
use crate::progress::PhaseState;
use crate::retry;
use crate::session::Session;

pub const PHASE: &str = "stats";
const DATA_TYPE: &str = "stats";

/// Window for the freshness fraction.
const FRESHNESS_DAYS: u32 = 90;
/// How many owning profiles to keep.
const TOP_OWNERS: usize = 5;

pub async fn enrich_stats(
    session: &Arc<Session>,
    records: &mut BTreeMap<ObjectRef, ObjectRecord>,
) -> EnrichOutcome {
    let refs: Vec<ObjectRef> = records.keys().cloned().collect();
    session.progress.seed(PHASE, &refs);

    let semaphore = Arc::new(Semaphore::new(session.config.pools.enrich_workers));
    let mut handles = Vec::with_capacity(refs.len());

    for (r, record) in records.iter() {
        let session = Arc::clone(session);
        let semaphore = Arc::clone(&semaphore);
        let object_ref = r.clone();
        let fields: Vec<(String, String)> = record
            .fields
            .iter()
            .map(|f| (f.name.clone(), f.field_type.clone()))
            .collect();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            if session.limiter.quota_walled() {
                return (object_ref, None);
            }
            session
                .progress
                .mark(PHASE, &object_ref, PhaseState::InFlight, None);
            let result = stats_for_object(&session, &object_ref, &fields).await;
            match &result {
                Ok(_) => session.progress.mark(PHASE, &object_ref, PhaseState::Done, None),
                Err(e) => session.progress.mark(
                    PHASE,
                    &object_ref,
                    PhaseState::Error,
                    Some(e.to_string()),
                ),
            }
            (object_ref, Some(result))
        }));
    }

    let mut outcome = EnrichOutcome::default();
    for handle in handles {
        match handle.await {
            Ok((object_ref, Some(Ok((block, cached))))) => {
                if cached {
                    outcome.from_cache += 1;
                }
                if let Some(record) = records.get_mut(&object_ref) {
                    record.stats = Some(block);
                }
                outcome.ok += 1;
            }
            Ok((object_ref, Some(Err(e)))) => {
                warn!(object_ref = %object_ref, error = %e, "stats failed");
                outcome.errored += 1;
            }
            Ok((_, None)) => outcome.skipped += 1,
            Err(e) => warn!(error = %e, "stats task panicked"),
        }
    }
    outcome
}

async fn stats_for_object(
    session: &Session,
    object_ref: &str,
    fields: &[(String, String)],
) -> Result<(StatsBlock, bool), RemoteError> {
    let sample_n = session.config.batch.stats_sample;
    let params = vec![("sample_n".to_string(), sample_n.to_string())];
    let _flight = session.cache.flight_guard(DATA_TYPE, object_ref, &params).await;

    if let Some(payload) = session.cache.get(DATA_TYPE, object_ref, &params) {
        if let Ok(block) = serde_json::from_value::<StatsBlock>(payload) {
            return Ok((block, true));
        }
    }

    let escaped = escape_soql(object_ref);
    let count_soql = format!("SELECT COUNT() FROM {}", escaped);
    let record_count = retry::call_remote(&session.retry, &session.limiter, DATA_TYPE, || {
        session.cli.query_count(&count_soql)
    })
    .await?;

    let mut block = StatsBlock {
        record_count,
        ..Default::default()
    };

    if record_count > 0 {
        let sample_soql = format!("SELECT FIELDS(ALL) FROM {} LIMIT {}", escaped, sample_n);
        let sample = retry::call_remote(&session.retry, &session.limiter, DATA_TYPE, || {
            session.cli.query(&sample_soql, false)
        })
        .await?;
        block.sample_size = sample.len() as u64;
        block.field_fill_rates = fill_rates(fields, &sample);
        block.picklist_distributions = picklist_distributions(fields, &sample);

        if has_field(fields, "LastModifiedDate") {
            let fresh_soql = format!(
                "SELECT COUNT() FROM {} WHERE LastModifiedDate = LAST_N_DAYS:{}",
                escaped, FRESHNESS_DAYS
            );
            match retry::call_remote(&session.retry, &session.limiter, DATA_TYPE, || {
                session.cli.query_count(&fresh_soql)
            })
            .await
            {
                Ok(fresh) => {
                    block.freshness_fraction = Some(fresh as f64 / record_count as f64);
                }
                Err(e) => debug!(object_ref, error = %e, "freshness count unavailable"),
            }
        }

        if has_field(fields, "OwnerId") {
            let owners_soql = format!(
                "SELECT Owner.Profile.Name profileName, COUNT(Id) recordTotal FROM {} \
                 GROUP BY Owner.Profile.Name ORDER BY COUNT(Id) DESC LIMIT {}",
                escaped, TOP_OWNERS
            );
            match retry::call_remote(&session.retry, &session.limiter, DATA_TYPE, || {
                session.cli.query(&owners_soql, false)
            })
            .await
            {
                Ok(rows) => block.top_owner_profiles = owner_shares(&rows),
                Err(e) => debug!(object_ref, error = %e, "owner distribution unavailable"),
            }
        }
    }

    let payload = serde_json::to_value(&block)
        .map_err(|e| RemoteError::Consistency(format!("stats block serialization: {}", e)))?;
    session.cache.put(DATA_TYPE, object_ref, &params, &payload);
    Ok((block, false))
}

fn has_field(fields: &[(String, String)], name: &str) -> bool {
    fields.iter().any(|(n, _)| n == name)
}

/// Filled/total per schema field over the sample. `attributes` is CLI
/// bookkeeping, not a field, and never appears here because rates are keyed
/// by the schema's field list rather than the row keys.
fn fill_rates(fields: &[(String, String)], sample: &[Value]) -> BTreeMap<String, FillRate> {
    let total = sample.len() as u64;
    let mut rates = BTreeMap::new();
    if total == 0 {
        return rates;
    }
    for (name, _) in fields {
        let filled = sample
            .iter()
            .filter(|row| match row.get(name) {
                None | Some(Value::Null) => false,
                Some(Value::String(s)) => !s.is_empty(),
                Some(_) => true,
            })
            .count() as u64;
        rates.insert(name.clone(), FillRate { filled, total });
    }
    rates
}

/// Value tallies for picklist-typed fields over the sample.
fn picklist_distributions(
    fields: &[(String, String)],
    sample: &[Value],
) -> BTreeMap<String, BTreeMap<String, u64>> {
    let mut distributions = BTreeMap::new();
    for (name, field_type) in fields {
        if !field_type.starts_with("Picklist") {
            continue;
        }
        let mut tally: BTreeMap<String, u64> = BTreeMap::new();
        for row in sample {
            if let Some(value) = row.get(name).and_then(|v| v.as_str()) {
                if !value.is_empty() {
                    *tally.entry(value.to_string()).or_default() += 1;
                }
            }
        }
        if !tally.is_empty() {
            distributions.insert(name.clone(), tally);
        }
    }
    distributions
}

/// Parse the aliased owner aggregation; rows arrive ordered by count.
fn owner_shares(rows: &[Value]) -> Vec<OwnerShare> {
    rows.iter()
        .filter_map(|row| {
            let profile = row
                .get("profileName")
                .and_then(|v| v.as_str())
                .or_else(|| {
                    row.get("Owner")
                        .and_then(|o| o.get("Profile"))
                        .and_then(|p| p.get("Name"))
                        .and_then(|v| v.as_str())
                })?
                .to_string();
            let record_count = row
                .get("recordTotal")
                .and_then(|v| v.as_u64())
                .or_else(|| row.get("expr0").and_then(|v| v.as_u64()))?;
            Some(OwnerShare {
                profile,
                record_count,
            })
        })
        .collect()
}
