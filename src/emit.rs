//! Corpus emitter.
//!
//! Renders every completed record into a human-readable markdown document,
//! chunks it, and writes the run's outputs: `schema.json` (full working-set
//! snapshot), `objects/<name>.md`, `corpus.jsonl` (one chunk per line,
//! ordered by object then part), and the optional per-phase block files.
//! Pure transformation plus file writes; no remote calls.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::info;

use crate::chunk;
use crate::models::{Chunk, ObjectRecord, ObjectRef, OrgSecurity};

#[derive(Debug, Default)]
pub struct EmitSummary {
    pub objects: u64,
    pub chunks: u64,
}

/// Render, chunk, and write all outputs. Records must be sealed.
pub fn emit_outputs(
    output_dir: &Path,
    corpus_prefix: &str,
    max_tokens: usize,
    records: &BTreeMap<ObjectRef, ObjectRecord>,
    org_security: Option<&OrgSecurity>,
) -> Result<(Vec<Chunk>, EmitSummary)> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;
    let objects_dir = output_dir.join("objects");
    std::fs::create_dir_all(&objects_dir)?;

    // schema.json: the canonical snapshot, keyed by object name.
    let schema = json!({ "objects": records });
    write_atomic(
        &output_dir.join("schema.json"),
        serde_json::to_string_pretty(&schema)?.as_bytes(),
    )?;

    let mut all_chunks: Vec<Chunk> = Vec::new();
    for record in records.values() {
        let document = render_markdown(record);
        write_atomic(
            &objects_dir.join(format!("{}.md", record.name)),
            document.as_bytes(),
        )?;
        all_chunks.extend(chunk::chunk_record(
            corpus_prefix,
            record,
            &document,
            max_tokens,
        ));
    }
    // (object, part_index) ordering for the JSONL file.
    all_chunks.sort_by(|a, b| {
        (&a.metadata.object_name, a.metadata.part_index)
            .cmp(&(&b.metadata.object_name, b.metadata.part_index))
    });

    let mut jsonl = Vec::new();
    for chunk in &all_chunks {
        serde_json::to_writer(&mut jsonl, chunk)?;
        jsonl.push(b'\n');
    }
    write_atomic(&output_dir.join("corpus.jsonl"), &jsonl)?;

    emit_block_files(output_dir, records, org_security)?;

    let summary = EmitSummary {
        objects: records.len() as u64,
        chunks: all_chunks.len() as u64,
    };
    info!(
        objects = summary.objects,
        chunks = summary.chunks,
        "emitted corpus"
    );
    Ok((all_chunks, summary))
}

/// Per-enricher JSON files, written only when the phase produced anything.
fn emit_block_files(
    output_dir: &Path,
    records: &BTreeMap<ObjectRef, ObjectRecord>,
    org_security: Option<&OrgSecurity>,
) -> Result<()> {
    let stats: BTreeMap<_, _> = records
        .iter()
        .filter_map(|(r, rec)| rec.stats.as_ref().map(|b| (r, b)))
        .collect();
    if !stats.is_empty() {
        write_atomic(
            &output_dir.join("stats.json"),
            serde_json::to_string_pretty(&stats)?.as_bytes(),
        )?;
    }

    let automation: BTreeMap<_, _> = records
        .iter()
        .filter_map(|(r, rec)| rec.automation.as_ref().map(|b| (r, b)))
        .collect();
    if !automation.is_empty() {
        write_atomic(
            &output_dir.join("automation.json"),
            serde_json::to_string_pretty(&automation)?.as_bytes(),
        )?;
    }

    let security: BTreeMap<_, _> = records
        .iter()
        .filter_map(|(r, rec)| rec.security.as_ref().map(|b| (r, b)))
        .collect();
    if !security.is_empty() || org_security.is_some() {
        let doc = json!({
            "org": org_security,
            "objects": security,
        });
        write_atomic(
            &output_dir.join("security.json"),
            serde_json::to_string_pretty(&doc)?.as_bytes(),
        )?;
    }
    Ok(())
}

/// Write just the `schema.json` snapshot; the orchestrator calls this as
/// soon as describing finishes so a quota-walled run still leaves a
/// resumable snapshot behind.
pub fn write_schema(output_dir: &Path, records: &BTreeMap<ObjectRef, ObjectRecord>) -> Result<()> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;
    let schema = json!({ "objects": records });
    write_atomic(
        &output_dir.join("schema.json"),
        serde_json::to_string_pretty(&schema)?.as_bytes(),
    )
}

/// Load a previous run's snapshot, if any.
pub fn load_schema(output_dir: &Path) -> Result<Option<BTreeMap<ObjectRef, ObjectRecord>>> {
    let path = output_dir.join("schema.json");
    if !path.exists() {
        return Ok(None);
    }
    let content =
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("parsing {}", path.display()))?;
    let objects = parsed
        .get("objects")
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("schema.json missing objects map"))?;
    Ok(Some(serde_json::from_value(objects)?))
}

/// Render one object's markdown document.
pub fn render_markdown(record: &ObjectRecord) -> String {
    let mut doc = String::new();
    let _ = writeln!(doc, "# Object: {}", record.name);
    doc.push('\n');
    let _ = writeln!(doc, "Label: {}", record.label);
    if !record.description.is_empty() {
        let _ = writeln!(doc, "Description: {}", record.description);
    }
    doc.push('\n');

    let _ = writeln!(doc, "## Fields");
    doc.push('\n');
    if record.fields.is_empty() {
        doc.push_str("No fields.\n");
    } else {
        doc.push_str("| Field | Type | Required | Description |\n");
        doc.push_str("|-------|------|----------|-------------|\n");
        for field in &record.fields {
            let _ = writeln!(
                doc,
                "| {} | {} | {} | {} |",
                field.name,
                field.field_type,
                if field.required { "yes" } else { "no" },
                field.description.as_deref().unwrap_or("")
            );
        }
    }

    if !record.relationships.is_empty() {
        doc.push('\n');
        let _ = writeln!(doc, "## Relationships");
        doc.push('\n');
        for rel in &record.relationships {
            let _ = writeln!(doc, "- {} → {} ({})", rel.field, rel.to_object, rel.kind);
        }
    }

    if let Some(automation) = &record.automation {
        doc.push('\n');
        let _ = writeln!(doc, "## Automation");
        doc.push('\n');
        if automation.is_empty() {
            doc.push_str("No automation references this object.\n");
        } else {
            for flow in &automation.flows {
                let _ = writeln!(doc, "- Flow: {} ({})", flow.name, flow.status);
            }
            for trigger in &automation.triggers {
                let complexity = automation
                    .complexity
                    .iter()
                    .find(|c| c.name == trigger.name);
                match complexity {
                    Some(c) => {
                        let _ = writeln!(
                            doc,
                            "- Trigger: {} ({}): {} lines, {} code, {} comment",
                            trigger.name,
                            trigger.status,
                            c.total_lines,
                            c.code_lines,
                            c.comment_lines
                        );
                    }
                    None => {
                        let _ = writeln!(doc, "- Trigger: {} ({})", trigger.name, trigger.status);
                    }
                }
            }
            for rule in &automation.validation_rules {
                let _ = writeln!(
                    doc,
                    "- Validation rule: {}: {}",
                    rule.name, rule.error_message
                );
            }
            for rule in &automation.workflow_rules {
                let _ = writeln!(
                    doc,
                    "- Workflow rule: {}{}",
                    rule.name,
                    if rule.active { "" } else { " (inactive)" }
                );
            }
        }
    }

    if let Some(security) = &record.security {
        doc.push('\n');
        let _ = writeln!(doc, "## Security");
        doc.push('\n');
        if !security.profile_permissions.is_empty() {
            doc.push_str("Profile permissions:\n");
            for (profile, perms) in &security.profile_permissions {
                let _ = writeln!(
                    doc,
                    "- {}: Create={}, Read={}, Edit={}, Delete={}",
                    profile, perms.create, perms.read, perms.edit, perms.delete
                );
            }
        }
        if !security.permission_set_permissions.is_empty() {
            doc.push_str("Permission set permissions:\n");
            for (ps, perms) in &security.permission_set_permissions {
                let _ = writeln!(
                    doc,
                    "- {}: Create={}, Read={}, Edit={}, Delete={}",
                    ps, perms.create, perms.read, perms.edit, perms.delete
                );
            }
        }
        if !security.field_permissions.is_empty() {
            let _ = writeln!(
                doc,
                "Field-level security: {} fields with explicit grants",
                security.field_permissions.len()
            );
        }
    }

    if let Some(stats) = &record.stats {
        doc.push('\n');
        let _ = writeln!(doc, "## Statistics");
        doc.push('\n');
        let _ = writeln!(doc, "- Record count: {}", stats.record_count);
        if stats.sample_size > 0 {
            let _ = writeln!(doc, "- Sample size: {}", stats.sample_size);
        }
        if let Some(freshness) = stats.freshness_fraction {
            let _ = writeln!(
                doc,
                "- Modified in last 90 days: {:.1}%",
                freshness * 100.0
            );
        }
        if !stats.top_owner_profiles.is_empty() {
            doc.push_str("- Top owning profiles:\n");
            for share in &stats.top_owner_profiles {
                let _ = writeln!(doc, "  - {}: {} records", share.profile, share.record_count);
            }
        }
        let mut sparse: Vec<(&String, f64)> = stats
            .field_fill_rates
            .iter()
            .map(|(name, rate)| (name, rate.rate()))
            .filter(|(_, rate)| *rate < 0.5)
            .collect();
        if !sparse.is_empty() {
            sparse.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            doc.push_str("- Sparsely filled fields (under 50%):\n");
            for (name, rate) in sparse.into_iter().take(10) {
                let _ = writeln!(doc, "  - {}: {:.0}%", name, rate * 100.0);
            }
        }
    }

    if let Some(history) = &record.history {
        if !history.fields.is_empty() {
            doc.push('\n');
            let _ = writeln!(doc, "## Field History");
            doc.push('\n');
            for (field, audit) in &history.fields {
                let _ = writeln!(
                    doc,
                    "- {}: created by {} on {}, last modified by {} on {}",
                    field, audit.created_by, audit.created_at, audit.modified_by, audit.modified_at
                );
            }
        }
    }

    doc
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldSpec, StatsBlock};
    use tempfile::TempDir;

    fn account() -> ObjectRecord {
        let mut rec = ObjectRecord {
            name: "Account".into(),
            label: "Account".into(),
            fields: vec![
                FieldSpec::named("Name", "Text(255)"),
                FieldSpec::named("Industry", "Picklist"),
            ],
            ..Default::default()
        };
        rec.seal();
        rec
    }

    #[test]
    fn markdown_has_header_and_fields_table() {
        let doc = render_markdown(&account());
        assert!(doc.starts_with("# Object: Account"));
        assert!(doc.contains("## Fields"));
        assert!(doc.contains("| Name | Text(255) |"));
    }

    #[test]
    fn zero_field_object_emits_exactly_one_chunk() {
        let mut rec = ObjectRecord {
            name: "Empty__c".into(),
            label: "Empty".into(),
            ..Default::default()
        };
        rec.seal();
        let doc = render_markdown(&rec);
        let chunks = chunk::chunk_record("salesforce_object", &rec, &doc, 700);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("# Object: Empty__c"));
        assert!(chunks[0].text.contains("No fields."));
    }

    #[test]
    fn outputs_written_and_ordered() {
        let dir = TempDir::new().unwrap();
        let mut records = BTreeMap::new();
        let mut contact = ObjectRecord {
            name: "Contact".into(),
            label: "Contact".into(),
            fields: vec![FieldSpec::named("Email", "Email")],
            ..Default::default()
        };
        contact.stats = Some(StatsBlock {
            record_count: 42,
            ..Default::default()
        });
        contact.seal();
        records.insert("Contact".to_string(), contact);
        records.insert("Account".to_string(), account());

        let (chunks, summary) =
            emit_outputs(dir.path(), "salesforce_object", 700, &records, None).unwrap();
        assert_eq!(summary.objects, 2);
        assert!(summary.chunks >= 2);

        // Account sorts before Contact.
        assert!(chunks[0].id.starts_with("salesforce_object_Account"));

        assert!(dir.path().join("schema.json").exists());
        assert!(dir.path().join("corpus.jsonl").exists());
        assert!(dir.path().join("objects/Account.md").exists());
        assert!(dir.path().join("objects/Contact.md").exists());
        // Only the stats block file should exist.
        assert!(dir.path().join("stats.json").exists());
        assert!(!dir.path().join("automation.json").exists());

        let jsonl = std::fs::read_to_string(dir.path().join("corpus.jsonl")).unwrap();
        let first: serde_json::Value =
            serde_json::from_str(jsonl.lines().next().unwrap()).unwrap();
        assert_eq!(first["metadata"]["object_name"], "Account");
        assert_eq!(first["metadata"]["type"], "salesforce_object");
        assert!(first["metadata"]["content_hash"].as_str().unwrap().len() == 64);
    }

    #[test]
    fn chunk_count_covers_whole_document() {
        let mut rec = account();
        // Inflate with many fields to force multiple chunks.
        for i in 0..300 {
            rec.fields.push(FieldSpec::named(
                &format!("Custom_Field_With_A_Long_Name_{i}__c"),
                "Text(255)",
            ));
        }
        rec.seal();
        let doc = render_markdown(&rec);
        let chunks = chunk::chunk_record("salesforce_object", &rec, &doc, 700);
        assert!(chunks.len() >= 2);
        // Every field row lands in some chunk.
        let combined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert!(combined.contains("Custom_Field_With_A_Long_Name_0__c"));
        assert!(combined.contains("Custom_Field_With_A_Long_Name_299__c"));
    }
}
