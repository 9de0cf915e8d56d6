//! Top-level orchestration.
//!
//! Parses the phase selector, executes the selected phases in dependency
//! order against one shared [`Session`], and prints the final report. The
//! quota wall is checked between phases: when it trips, in-flight work has
//! already drained, progress and cache are flushed, a resumable snapshot is
//! on disk, and the run exits with code 2 plus a recommended resume command.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use tracing::{info, warn};

use crate::describe;
use crate::embedding;
use crate::emit;
use crate::enrich_automation;
use crate::enrich_history;
use crate::enrich_org_security;
use crate::enrich_security;
use crate::enrich_stats;
use crate::enumerate;
use crate::index;
use crate::models::{ObjectRecord, ObjectRef, OrgSecurity};
use crate::progress::PhaseState;
use crate::session::Session;
use crate::upload;

/// Process exit code for a quota-walled, resumable run.
pub const EXIT_PARTIAL: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Enumerate,
    Describe,
    Stats,
    Automation,
    Security,
    History,
    OrgSecurity,
    Emit,
    Upload,
}

impl Phase {
    pub const ALL: [Phase; 9] = [
        Phase::Enumerate,
        Phase::Describe,
        Phase::Stats,
        Phase::Automation,
        Phase::Security,
        Phase::History,
        Phase::OrgSecurity,
        Phase::Emit,
        Phase::Upload,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Phase::Enumerate => "enumerate",
            Phase::Describe => "describe",
            Phase::Stats => "stats",
            Phase::Automation => "automation",
            Phase::Security => "security",
            Phase::History => "history",
            Phase::OrgSecurity => "org-security",
            Phase::Emit => "emit",
            Phase::Upload => "upload",
        }
    }

    fn parse(name: &str) -> Option<Phase> {
        Phase::ALL.iter().copied().find(|p| p.name() == name)
    }
}

/// Parse a comma-separated phase selector; `all` (or nothing) selects every
/// phase. Output is in dependency order regardless of input order.
pub fn parse_phases(selector: &str) -> Result<Vec<Phase>> {
    let trimmed = selector.trim();
    if trimmed.is_empty() || trimmed == "all" {
        return Ok(Phase::ALL.to_vec());
    }
    let mut selected = Vec::new();
    for part in trimmed.split(',') {
        let name = part.trim();
        match Phase::parse(name) {
            Some(phase) => selected.push(phase),
            None => bail!(
                "unknown phase '{}'; expected subset of: {}",
                name,
                Phase::ALL
                    .iter()
                    .map(|p| p.name())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
    selected.sort();
    selected.dedup();
    Ok(selected)
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub phases: Vec<Phase>,
    pub resume: bool,
    pub dry_run: bool,
    pub incremental: bool,
    pub clear_cache: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            phases: Phase::ALL.to_vec(),
            resume: false,
            dry_run: false,
            incremental: true,
            clear_cache: false,
        }
    }
}

/// Run the pipeline. Returns the process exit code (0 or [`EXIT_PARTIAL`]);
/// fatal configuration errors come back as `Err`.
pub async fn run(session: Session, options: RunOptions) -> Result<i32> {
    let started = Instant::now();
    let session = Arc::new(session);
    let selected = |phase: Phase| options.phases.contains(&phase);

    if options.clear_cache {
        let removed = session.cache.clear(None, None);
        info!(removed, "cleared cache");
    }

    // Working set: enumerate remotely unless we can resume from a snapshot.
    let snapshot = emit::load_schema(&session.config.output.dir)?;
    let refs: Vec<ObjectRef> = if selected(Phase::Enumerate) || snapshot.is_none() {
        let refs = enumerate::enumerate_objects(&session)
            .await
            .map_err(|e| anyhow::anyhow!("enumeration failed: {}", e))?;
        for r in &refs {
            session
                .progress
                .mark(Phase::Enumerate.name(), r, PhaseState::Done, None);
        }
        refs
    } else {
        let snapshot = snapshot.as_ref().unwrap();
        info!(objects = snapshot.len(), "working set from schema.json");
        snapshot.keys().cloned().collect()
    };
    println!("harvest run");
    println!("  working set: {} objects", refs.len());

    // Records: describe remotely, or reuse the snapshot. Under --resume the
    // phase's work set is seeded from pending(), so refs already done make
    // no remote calls at all.
    let mut records: BTreeMap<ObjectRef, ObjectRecord> = if selected(Phase::Describe) {
        session.progress.seed(describe::PHASE, &refs);
        let to_describe: Vec<ObjectRef> = if options.resume {
            let pending = session.progress.pending(describe::PHASE);
            refs.iter()
                .filter(|r| pending.contains(r.as_str()))
                .cloned()
                .collect()
        } else {
            refs.clone()
        };
        let mut outcome = describe::describe_objects(&session, &to_describe).await;
        println!(
            "  describe: {} ok, {} errored, {} cached",
            outcome.records.len(),
            outcome.errors.len(),
            outcome.from_cache
        );
        // Merge fresh records with the previous snapshot: snapshot records
        // stand in for refs not re-described, and enricher blocks carry
        // forward so a phase-subset run does not drop them.
        let mut old = snapshot.unwrap_or_default();
        let mut merged = BTreeMap::new();
        for r in &refs {
            if let Some(mut fresh) = outcome.records.remove(r) {
                if let Some(previous) = old.remove(r) {
                    fresh.stats = fresh.stats.or(previous.stats);
                    fresh.automation = fresh.automation.or(previous.automation);
                    fresh.security = fresh.security.or(previous.security);
                    fresh.history = fresh.history.or(previous.history);
                }
                merged.insert(r.clone(), fresh);
            } else if let Some(previous) = old.remove(r) {
                merged.insert(r.clone(), previous);
            }
            // Refs neither described nor in the snapshot stay absent: they
            // are errored or quota-walled and recorded as such.
        }
        merged
    } else if let Some(snapshot) = snapshot {
        snapshot
    } else {
        bail!("no schema.json in output dir; run the describe phase first");
    };

    if quota_walled(&session).await? {
        emit::write_schema(&session.config.output.dir, &records)?;
        print_report(&session, started, true);
        return Ok(EXIT_PARTIAL);
    }
    emit::write_schema(&session.config.output.dir, &records)?;

    // Enrichers, dependency-free order.
    let mut org_security: Option<OrgSecurity> = None;
    if selected(Phase::Stats) {
        let outcome = enrich_stats::enrich_stats(&session, &mut records).await;
        print_enrich_line("stats", &outcome);
        if quota_walled(&session).await? {
            emit::write_schema(&session.config.output.dir, &records)?;
            print_report(&session, started, true);
            return Ok(EXIT_PARTIAL);
        }
    }
    if selected(Phase::Automation) {
        let outcome = enrich_automation::enrich_automation(&session, &mut records).await;
        print_enrich_line("automation", &outcome);
        if quota_walled(&session).await? {
            emit::write_schema(&session.config.output.dir, &records)?;
            print_report(&session, started, true);
            return Ok(EXIT_PARTIAL);
        }
    }
    if selected(Phase::Security) {
        let outcome = enrich_security::enrich_field_security(&session, &mut records).await;
        print_enrich_line("security", &outcome);
        if quota_walled(&session).await? {
            emit::write_schema(&session.config.output.dir, &records)?;
            print_report(&session, started, true);
            return Ok(EXIT_PARTIAL);
        }
    }
    if selected(Phase::History) {
        let outcome = enrich_history::enrich_history(&session, &mut records).await;
        print_enrich_line("history", &outcome);
        if quota_walled(&session).await? {
            emit::write_schema(&session.config.output.dir, &records)?;
            print_report(&session, started, true);
            return Ok(EXIT_PARTIAL);
        }
    }
    if selected(Phase::OrgSecurity) {
        match enrich_org_security::enrich_org_security(&session, &mut records).await {
            Ok((org, outcome)) => {
                print_enrich_line("org-security", &outcome);
                org_security = Some(org);
            }
            Err(e) => {
                warn!(error = %e, "org-security enumeration failed");
                println!("  org-security: failed ({})", e);
            }
        }
        if quota_walled(&session).await? {
            emit::write_schema(&session.config.output.dir, &records)?;
            print_report(&session, started, true);
            return Ok(EXIT_PARTIAL);
        }
    }

    // Hash once every enricher has finished.
    for record in records.values_mut() {
        record.seal();
    }

    let needs_emit = selected(Phase::Emit) || (selected(Phase::Upload) && !options.dry_run);
    let mut chunks = Vec::new();
    if needs_emit {
        let (emitted, summary) = emit::emit_outputs(
            &session.config.output.dir,
            &session.config.index.corpus_prefix,
            session.config.chunking.max_tokens,
            &records,
            org_security.as_ref(),
        )?;
        for r in records.keys() {
            session
                .progress
                .mark(Phase::Emit.name(), r, PhaseState::Done, None);
        }
        println!(
            "  emit: {} objects, {} chunks",
            summary.objects, summary.chunks
        );
        chunks = emitted;
    } else {
        emit::write_schema(&session.config.output.dir, &records)?;
    }

    if selected(Phase::Upload) && !options.dry_run {
        let embedder: Arc<dyn embedding::Embedder> =
            Arc::from(embedding::create_embedder(&session.config.embedding)?);
        let vector_index: Arc<dyn index::VectorIndex> =
            Arc::from(index::create_index(&session.config.index)?);
        let summary = upload::upload_incremental(
            &session,
            embedder,
            vector_index,
            chunks,
            options.incremental,
        )
        .await
        .map_err(|e| anyhow::anyhow!("upload failed: {}", e))?;
        println!(
            "  upload: {} new, {} changed, {} deleted, {} unchanged; \
             {} chunks upserted, {} deleted, {} failed",
            summary.new_objects,
            summary.changed_objects,
            summary.deleted_objects,
            summary.unchanged_objects,
            summary.upserted_chunks,
            summary.deleted_chunks,
            summary.failed_chunks
        );
        if quota_walled(&session).await? {
            print_report(&session, started, true);
            return Ok(EXIT_PARTIAL);
        }
    } else if options.dry_run && selected(Phase::Upload) {
        println!("  upload: skipped (dry run)");
    }

    session.progress.flush().await;
    print_report(&session, started, false);
    Ok(0)
}

async fn quota_walled(session: &Arc<Session>) -> Result<bool> {
    if !session.limiter.quota_walled() {
        return Ok(false);
    }
    warn!("quota wall reached, halting phase");
    session.progress.flush().await;
    Ok(true)
}

fn print_enrich_line(name: &str, outcome: &enrich_automation::EnrichOutcome) {
    println!(
        "  {}: {} ok, {} errored, {} skipped, {} cached",
        name, outcome.ok, outcome.errored, outcome.skipped, outcome.from_cache
    );
}

fn print_report(session: &Arc<Session>, started: Instant, partial: bool) {
    let cache = session.cache.stats();
    println!(
        "  cache: {} hits / {} misses ({:.1}% hit rate), {} writes, {} files",
        cache.hits,
        cache.misses,
        cache.hit_rate_percent(),
        cache.writes,
        cache.files
    );
    println!(
        "  rate: {:.0} calls/min steady-state",
        session.limiter.current_rate()
    );

    for phase in Phase::ALL {
        let errors = session.progress.top_errors(phase.name(), 3);
        if !errors.is_empty() {
            println!("  {} errors:", phase.name());
            for (r, e) in errors {
                println!("    {}: {}", r, e);
            }
        }
    }

    let elapsed = started.elapsed();
    println!(
        "  elapsed: {}m {}s",
        elapsed.as_secs() / 60,
        elapsed.as_secs() % 60
    );
    if partial {
        println!("partial: daily quota reached; resume with: harvest run --resume");
    } else {
        println!("ok");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_all_by_default() {
        assert_eq!(parse_phases("all").unwrap(), Phase::ALL.to_vec());
        assert_eq!(parse_phases("").unwrap(), Phase::ALL.to_vec());
    }

    #[test]
    fn parse_subset_in_dependency_order() {
        let phases = parse_phases("upload,describe,enumerate").unwrap();
        assert_eq!(
            phases,
            vec![Phase::Enumerate, Phase::Describe, Phase::Upload]
        );
    }

    #[test]
    fn parse_rejects_unknown_phase() {
        assert!(parse_phases("describe,frobnicate").is_err());
    }

    #[test]
    fn parse_dedupes() {
        let phases = parse_phases("emit,emit").unwrap();
        assert_eq!(phases, vec![Phase::Emit]);
    }
}
