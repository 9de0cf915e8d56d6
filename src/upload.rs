//! Incremental vector-index uploader.
//!
//! Diffs the desired chunk set against the index and touches only what
//! changed. Objects are classified by content hash as new, changed, deleted,
//! or unchanged, then deletes are submitted before any upsert so the index
//! never holds both generations of a changed object. Upserts flow through
//! embedding batches and a bounded upsert pool; a batch that fails after
//! retries is logged and its objects re-marked errored, without aborting
//! the rest of the upload.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::embedding::Embedder;
use crate::index::{IndexVector, VectorIndex};
use crate::models::Chunk;
use crate::progress::PhaseState;
use crate::retry;
use crate::session::Session;

pub const PHASE: &str = "upload";

/// Ids per delete request.
const DELETE_BATCH: usize = 100;

#[derive(Debug, Default)]
pub struct UploadSummary {
    pub new_objects: u64,
    pub changed_objects: u64,
    pub deleted_objects: u64,
    pub unchanged_objects: u64,
    pub upserted_chunks: u64,
    pub deleted_chunks: u64,
    pub failed_chunks: u64,
    pub skipped_chunks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectClass {
    New,
    Changed,
    Deleted,
    Unchanged,
}

/// Recover the object name from a chunk id: `{prefix}_{object}` or
/// `{prefix}_{object}_part_{n}`.
pub fn object_of_id<'a>(prefix: &str, id: &'a str) -> Option<&'a str> {
    let rest = id.strip_prefix(prefix)?.strip_prefix('_')?;
    if let Some(pos) = rest.rfind("_part_") {
        let suffix = &rest[pos + "_part_".len()..];
        if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            return Some(&rest[..pos]);
        }
    }
    Some(rest)
}

/// Run the upload. `incremental = false` clears everything under the corpus
/// prefix and re-uploads the full desired set.
pub async fn upload_incremental(
    session: &Arc<Session>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    chunks: Vec<Chunk>,
    incremental: bool,
) -> Result<UploadSummary> {
    let prefix = session.config.index.corpus_prefix.clone();
    let mut summary = UploadSummary::default();

    // Desired state, grouped by object.
    let mut desired: BTreeMap<String, Vec<Chunk>> = BTreeMap::new();
    for chunk in chunks {
        desired
            .entry(chunk.metadata.object_name.clone())
            .or_default()
            .push(chunk);
    }
    let desired_objects: Vec<String> = desired.keys().cloned().collect();
    session.progress.seed(PHASE, &desired_objects);

    // Current state, via the listing API.
    let list_prefix = format!("{}_", prefix);
    let cur_ids = retry::call_remote(&session.retry, &session.limiter, "index-list", || {
        index.list_ids(&list_prefix)
    })
    .await?;
    let mut cur_by_object: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for id in cur_ids {
        if let Some(object) = object_of_id(&prefix, &id) {
            cur_by_object.entry(object.to_string()).or_default().push(id);
        }
    }

    // One representative chunk per object carries the object's hash.
    let representatives: Vec<String> = cur_by_object
        .values()
        .filter_map(|ids| ids.iter().min().cloned())
        .collect();
    let cur_metadata = if representatives.is_empty() {
        BTreeMap::new()
    } else {
        retry::call_remote(&session.retry, &session.limiter, "index-fetch", || {
            index.fetch_metadata(&representatives)
        })
        .await?
    };
    let mut cur_hash: BTreeMap<String, String> = BTreeMap::new();
    for (id, metadata) in &cur_metadata {
        if let (Some(object), Some(hash)) = (
            object_of_id(&prefix, id),
            metadata.get("content_hash").and_then(|v| v.as_str()),
        ) {
            cur_hash.insert(object.to_string(), hash.to_string());
        }
    }

    // Classify.
    let mut classes: BTreeMap<String, ObjectClass> = BTreeMap::new();
    for (object, chunks) in &desired {
        let new_hash = chunks
            .first()
            .map(|c| c.metadata.content_hash.as_str())
            .unwrap_or("");
        let class = if !cur_by_object.contains_key(object) {
            ObjectClass::New
        } else if !incremental {
            ObjectClass::Changed
        } else if cur_hash.get(object).map(|h| h.as_str()) != Some(new_hash) {
            ObjectClass::Changed
        } else {
            ObjectClass::Unchanged
        };
        classes.insert(object.clone(), class);
    }
    for object in cur_by_object.keys() {
        if !desired.contains_key(object) {
            classes.insert(object.clone(), ObjectClass::Deleted);
        }
    }

    // New and changed objects start a fresh generation of upload work, even
    // if an earlier run completed them.
    let refresh: Vec<String> = classes
        .iter()
        .filter(|(_, class)| matches!(class, ObjectClass::New | ObjectClass::Changed))
        .map(|(object, _)| object.clone())
        .collect();
    session.progress.reset(PHASE, &refresh);

    // Deletes first: changed objects lose their old generation, deleted
    // objects disappear entirely.
    let mut to_delete: Vec<String> = Vec::new();
    for (object, class) in &classes {
        match class {
            ObjectClass::Changed | ObjectClass::Deleted => {
                if let Some(ids) = cur_by_object.get(object) {
                    to_delete.extend(ids.iter().cloned());
                }
            }
            _ => {}
        }
        match class {
            ObjectClass::New => summary.new_objects += 1,
            ObjectClass::Changed => summary.changed_objects += 1,
            ObjectClass::Deleted => summary.deleted_objects += 1,
            ObjectClass::Unchanged => summary.unchanged_objects += 1,
        }
    }
    // Per-batch failures are collected, not propagated: the affected
    // objects are skipped downstream and re-marked errored, and the rest of
    // the upload proceeds.
    let mut failed_objects: BTreeSet<String> = BTreeSet::new();
    for batch in to_delete.chunks(DELETE_BATCH) {
        if session.limiter.quota_walled() {
            summary.skipped_chunks += batch.len() as u64;
            continue;
        }
        let batch_vec = batch.to_vec();
        let result = retry::call_remote(&session.retry, &session.limiter, "index-delete", || {
            index.delete(&batch_vec)
        })
        .await;
        match result {
            Ok(()) => summary.deleted_chunks += batch.len() as u64,
            Err(e) => {
                warn!(chunks = batch.len(), error = %e, "delete batch failed");
                summary.failed_chunks += batch.len() as u64;
                for id in batch {
                    if let Some(object) = object_of_id(&prefix, id) {
                        session.progress.mark(
                            PHASE,
                            object,
                            PhaseState::Error,
                            Some(e.to_string()),
                        );
                        failed_objects.insert(object.to_string());
                    }
                }
            }
        }
    }

    // Unchanged objects are done without touching the index.
    for (object, class) in &classes {
        if *class == ObjectClass::Unchanged {
            session.progress.mark(PHASE, object, PhaseState::Done, None);
        }
    }

    // Upserts: embedding batches feed a bounded upsert pool. An object
    // whose delete failed keeps its old generation; upserting the new one
    // would interleave the two, so it sits this run out.
    let upload_chunks: Vec<Chunk> = desired
        .iter()
        .filter(|(object, _)| {
            !failed_objects.contains(*object)
                && matches!(
                    classes.get(*object),
                    Some(ObjectClass::New) | Some(ObjectClass::Changed)
                )
        })
        .flat_map(|(_, chunks)| chunks.iter().cloned())
        .collect();

    let semaphore = Arc::new(Semaphore::new(session.config.pools.upsert_workers));
    let mut handles = Vec::new();

    for batch in upload_chunks.chunks(session.config.batch.embed_chunks) {
        if session.limiter.quota_walled() {
            summary.skipped_chunks += batch.len() as u64;
            continue;
        }
        let batch_objects: BTreeSet<String> = batch
            .iter()
            .map(|c| c.metadata.object_name.clone())
            .collect();
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();

        let embedded = retry::call_remote(&session.retry, &session.limiter, "embed", || {
            embedder.embed(&texts)
        })
        .await;
        let vectors = match embedded {
            Ok(vectors) => vectors,
            Err(e) => {
                warn!(chunks = batch.len(), error = %e, "embedding batch failed");
                summary.failed_chunks += batch.len() as u64;
                failed_objects.extend(batch_objects);
                continue;
            }
        };

        let payload: Vec<IndexVector> = batch
            .iter()
            .zip(vectors)
            .map(|(chunk, values)| IndexVector {
                id: chunk.id.clone(),
                values,
                metadata: serde_json::to_value(&chunk.metadata)
                    .unwrap_or(serde_json::Value::Null),
            })
            .collect();

        let session = Arc::clone(session);
        let index = Arc::clone(&index);
        let semaphore = Arc::clone(&semaphore);
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            let count = payload.len() as u64;
            let result = retry::call_remote(
                &session.retry,
                &session.limiter,
                "index-upsert",
                || index.upsert(&payload),
            )
            .await;
            match result {
                Ok(()) => Ok(count),
                Err(e) => {
                    let ids: Vec<&str> = payload.iter().map(|v| v.id.as_str()).collect();
                    warn!(error = %e, ?ids, "upsert batch failed");
                    Err((batch_objects, count))
                }
            }
        }));
    }

    for handle in handles {
        match handle.await {
            Ok(Ok(count)) => summary.upserted_chunks += count,
            Ok(Err((objects, count))) => {
                summary.failed_chunks += count;
                failed_objects.extend(objects);
            }
            Err(e) => warn!(error = %e, "upsert task panicked"),
        }
    }

    for (object, class) in &classes {
        if matches!(class, ObjectClass::New | ObjectClass::Changed) {
            if failed_objects.contains(object) {
                session.progress.mark(
                    PHASE,
                    object,
                    PhaseState::Error,
                    Some("upload batch failed".into()),
                );
            } else {
                session.progress.mark(PHASE, object, PhaseState::Done, None);
            }
        }
    }

    info!(
        new = summary.new_objects,
        changed = summary.changed_objects,
        deleted = summary.deleted_objects,
        unchanged = summary.unchanged_objects,
        upserted = summary.upserted_chunks,
        failed = summary.failed_chunks,
        "upload complete"
    );
    Ok(summary)
}
