//! Automation enricher.
//!
//! Attaches an [`AutomationBlock`] to every object record from four
//! coalesced queries over the working set: autolaunched flows, Apex
//! triggers, validation rules, and workflow rules. Code complexity for
//! triggers is computed locally from the fetched source bodies; the enricher
//! makes no other remote calls.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::coalesce::{self, CoalescedQuery};
use crate::models::{
    AutomationBlock, CodeComplexity, FlowRef, ObjectRecord, ObjectRef, TriggerRef,
    ValidationRuleRef, WorkflowRuleRef,
};
use crate::progress::PhaseState;
use crate::session::Session;

pub const PHASE: &str = "automation";

const FLOWS: CoalescedQuery = CoalescedQuery {
    data_type: "flows",
    template: "SELECT Name, Description, TriggerObjectOrEvent.QualifiedApiName, ProcessType, \
               Status FROM Flow WHERE ProcessType = 'AutoLaunchedFlow' AND \
               TriggerObjectOrEvent.QualifiedApiName IN ({refs})",
    ref_path: &["TriggerObjectOrEvent", "QualifiedApiName"],
    tooling: true,
};

const TRIGGERS: CoalescedQuery = CoalescedQuery {
    data_type: "triggers",
    template: "SELECT Name, TableEnumOrId, Body, Status FROM ApexTrigger \
               WHERE TableEnumOrId IN ({refs})",
    ref_path: &["TableEnumOrId"],
    tooling: false,
};

const VALIDATION_RULES: CoalescedQuery = CoalescedQuery {
    data_type: "validation_rules",
    template: "SELECT ValidationName, EntityDefinition.QualifiedApiName, ErrorDisplayField, \
               ErrorMessage FROM ValidationRule \
               WHERE EntityDefinition.QualifiedApiName IN ({refs})",
    ref_path: &["EntityDefinition", "QualifiedApiName"],
    tooling: true,
};

const WORKFLOW_RULES: CoalescedQuery = CoalescedQuery {
    data_type: "workflow_rules",
    template: "SELECT Name, TableEnumOrId, Active FROM WorkflowRule \
               WHERE TableEnumOrId IN ({refs})",
    ref_path: &["TableEnumOrId"],
    tooling: true,
};

#[derive(Debug, Default)]
pub struct EnrichOutcome {
    pub ok: u64,
    pub errored: u64,
    pub skipped: u64,
    pub from_cache: usize,
}

/// Run the four coalesced queries and attach a block per record.
pub async fn enrich_automation(
    session: &Session,
    records: &mut BTreeMap<ObjectRef, ObjectRecord>,
) -> EnrichOutcome {
    let refs: Vec<ObjectRef> = records.keys().cloned().collect();
    session.progress.seed(PHASE, &refs);

    let flows = coalesce::coalesce(session, &FLOWS, &refs).await;
    let triggers = coalesce::coalesce(session, &TRIGGERS, &refs).await;
    let validations = coalesce::coalesce(session, &VALIDATION_RULES, &refs).await;
    let workflows = coalesce::coalesce(session, &WORKFLOW_RULES, &refs).await;

    let mut outcome = EnrichOutcome {
        from_cache: flows.from_cache
            + triggers.from_cache
            + validations.from_cache
            + workflows.from_cache,
        ..Default::default()
    };

    for (r, record) in records.iter_mut() {
        // A quota wall leaves the ref untouched for the next run.
        if flows.unprocessed.contains(r)
            || triggers.unprocessed.contains(r)
            || validations.unprocessed.contains(r)
            || workflows.unprocessed.contains(r)
        {
            outcome.skipped += 1;
            continue;
        }
        let error = [&flows, &triggers, &validations, &workflows]
            .iter()
            .find_map(|o| o.errors.get(r));
        if let Some(e) = error {
            session
                .progress
                .mark(PHASE, r, PhaseState::Error, Some(e.to_string()));
            outcome.errored += 1;
            continue;
        }

        record.automation = Some(build_block(
            flows.payloads.get(r).map(Vec::as_slice).unwrap_or(&[]),
            triggers.payloads.get(r).map(Vec::as_slice).unwrap_or(&[]),
            validations.payloads.get(r).map(Vec::as_slice).unwrap_or(&[]),
            workflows.payloads.get(r).map(Vec::as_slice).unwrap_or(&[]),
        ));
        session.progress.mark(PHASE, r, PhaseState::Done, None);
        outcome.ok += 1;
    }
    outcome
}

fn build_block(
    flows: &[Value],
    triggers: &[Value],
    validations: &[Value],
    workflows: &[Value],
) -> AutomationBlock {
    let mut block = AutomationBlock::default();

    for flow in flows {
        block.flows.push(FlowRef {
            name: str_of(flow, "Name"),
            description: str_of(flow, "Description"),
            status: str_of(flow, "Status"),
        });
    }

    for trigger in triggers {
        let name = str_of(trigger, "Name");
        let body = str_of(trigger, "Body");
        if !body.is_empty() {
            block.complexity.push(CodeComplexity::from_source(&name, &body));
        }
        block.triggers.push(TriggerRef {
            name,
            status: str_of(trigger, "Status"),
        });
    }

    for rule in validations {
        block.validation_rules.push(ValidationRuleRef {
            name: str_of(rule, "ValidationName"),
            error_message: str_of(rule, "ErrorMessage"),
            error_field: str_of(rule, "ErrorDisplayField"),
        });
    }

    for rule in workflows {
        block.workflow_rules.push(WorkflowRuleRef {
            name: str_of(rule, "Name"),
            active: rule.get("Active").and_then(|v| v.as_bool()).unwrap_or(false),
        });
    }

    block
}

fn str_of(row: &Value, key: &str) -> String {
    row.get(key).and_then(|v| v.as_str()).unwrap_or("").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn block_from_rows() {
        let flows = vec![json!({
            "Name": "Route Lead",
            "Description": "Assigns owners",
            "Status": "Active",
            "TriggerObjectOrEvent": {"QualifiedApiName": "Lead"}
        })];
        let triggers = vec![json!({
            "Name": "LeadTrigger",
            "TableEnumOrId": "Lead",
            "Status": "Active",
            "Body": "trigger LeadTrigger on Lead (before insert) {\n// dedupe\nservice.run();\n}"
        })];
        let validations = vec![json!({
            "ValidationName": "Email_Required",
            "ErrorMessage": "Email is required",
            "ErrorDisplayField": "Email"
        })];
        let workflows = vec![json!({"Name": "Notify Sales", "Active": true})];

        let block = build_block(&flows, &triggers, &validations, &workflows);
        assert_eq!(block.flows.len(), 1);
        assert_eq!(block.triggers[0].name, "LeadTrigger");
        assert_eq!(block.validation_rules[0].error_field, "Email");
        assert!(block.workflow_rules[0].active);

        assert_eq!(block.complexity.len(), 1);
        let cx = &block.complexity[0];
        assert_eq!(cx.total_lines, 4);
        assert_eq!(cx.comment_lines, 1);
        assert_eq!(cx.code_lines, 3);
    }

    #[test]
    fn empty_rows_make_empty_block() {
        let block = build_block(&[], &[], &[], &[]);
        assert!(block.is_empty());
        assert!(block.complexity.is_empty());
    }

    #[test]
    fn trigger_without_body_has_no_complexity() {
        let triggers = vec![json!({"Name": "Ghost", "TableEnumOrId": "Lead"})];
        let block = build_block(&[], &triggers, &[], &[]);
        assert_eq!(block.triggers.len(), 1);
        assert!(block.complexity.is_empty());
    }
}
