//! Field-level security enricher.
//!
//! One coalesced `FieldPermissions` query joined to the working set,
//! regrouped into per-field `{editable_by, readonly_by}` lists on each
//! record's [`SecurityBlock`]. The grantee is the owning profile's name when
//! the permission parent is profile-owned, the permission set label
//! otherwise. Object-level CRUD comes from the org-security enricher, which
//! fills the other half of the block.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::coalesce::{self, CoalescedQuery};
use crate::models::{FieldAccess, ObjectRecord, ObjectRef, SecurityBlock};
use crate::progress::PhaseState;
use crate::session::Session;

pub const PHASE: &str = "security";

const FIELD_PERMISSIONS: CoalescedQuery = CoalescedQuery {
    data_type: "field_permissions",
    template: "SELECT Field, SobjectType, PermissionsRead, PermissionsEdit, \
               Parent.IsOwnedByProfile, Parent.Profile.Name, Parent.Label \
               FROM FieldPermissions WHERE SobjectType IN ({refs})",
    ref_path: &["SobjectType"],
    tooling: false,
};

pub async fn enrich_field_security(
    session: &Session,
    records: &mut BTreeMap<ObjectRef, ObjectRecord>,
) -> crate::enrich_automation::EnrichOutcome {
    let refs: Vec<ObjectRef> = records.keys().cloned().collect();
    session.progress.seed(PHASE, &refs);

    let fetched = coalesce::coalesce(session, &FIELD_PERMISSIONS, &refs).await;
    let mut outcome = crate::enrich_automation::EnrichOutcome {
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
        let security = record.security.get_or_insert_with(SecurityBlock::default);
        security.field_permissions = field_access_from_rows(r, rows);
        session.progress.mark(PHASE, r, PhaseState::Done, None);
        outcome.ok += 1;
    }
    outcome
}

/// Group `FieldPermissions` rows into per-field access lists. The `Field`
/// column carries `Object.Field`; the object prefix is stripped.
fn field_access_from_rows(object_ref: &str, rows: &[Value]) -> BTreeMap<String, FieldAccess> {
    let mut access: BTreeMap<String, FieldAccess> = BTreeMap::new();
    let prefix = format!("{}.", object_ref);

    for row in rows {
        let field = match row.get("Field").and_then(|v| v.as_str()) {
            Some(f) => f.strip_prefix(&prefix).unwrap_or(f).to_string(),
            None => continue,
        };
        let grantee = match grantee_name(row) {
            Some(name) => name,
            None => continue,
        };
        let can_edit = row
            .get("PermissionsEdit")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let can_read = row
            .get("PermissionsRead")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let entry = access.entry(field).or_default();
        if can_edit {
            entry.editable_by.push(grantee);
        } else if can_read {
            entry.readonly_by.push(grantee);
        }
    }

    for entry in access.values_mut() {
        entry.editable_by.sort();
        entry.editable_by.dedup();
        entry.readonly_by.sort();
        entry.readonly_by.dedup();
    }
    access
}

fn grantee_name(row: &Value) -> Option<String> {
    let parent = row.get("Parent")?;
    let profile_owned = parent
        .get("IsOwnedByProfile")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let name = if profile_owned {
        parent.get("Profile")?.get("Name")?.as_str()?
    } else {
        parent.get("Label")?.as_str()?
    };
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn profile_row(field: &str, profile: &str, read: bool, edit: bool) -> Value {
        json!({
            "Field": field,
            "SobjectType": "Account",
            "PermissionsRead": read,
            "PermissionsEdit": edit,
            "Parent": {"IsOwnedByProfile": true, "Profile": {"Name": profile}, "Label": "ignored"}
        })
    }

    #[test]
    fn groups_by_field_and_strips_prefix() {
        let rows = vec![
            profile_row("Account.Name", "Admin", true, true),
            profile_row("Account.Name", "Standard User", true, false),
            profile_row("Account.AnnualRevenue", "Admin", true, true),
        ];
        let access = field_access_from_rows("Account", &rows);
        assert_eq!(access["Name"].editable_by, vec!["Admin"]);
        assert_eq!(access["Name"].readonly_by, vec!["Standard User"]);
        assert_eq!(access["AnnualRevenue"].editable_by, vec!["Admin"]);
    }

    #[test]
    fn permission_set_grantee_uses_label() {
        let rows = vec![json!({
            "Field": "Account.Name",
            "SobjectType": "Account",
            "PermissionsRead": true,
            "PermissionsEdit": true,
            "Parent": {"IsOwnedByProfile": false, "Label": "Sales Ops"}
        })];
        let access = field_access_from_rows("Account", &rows);
        assert_eq!(access["Name"].editable_by, vec!["Sales Ops"]);
    }

    #[test]
    fn no_read_no_edit_grants_nothing() {
        let rows = vec![profile_row("Account.SSN__c", "Standard User", false, false)];
        let access = field_access_from_rows("Account", &rows);
        let entry = &access["SSN__c"];
        assert!(entry.editable_by.is_empty());
        assert!(entry.readonly_by.is_empty());
    }

    #[test]
    fn grantees_deduped_and_sorted() {
        let rows = vec![
            profile_row("Account.Name", "Zeta", true, true),
            profile_row("Account.Name", "Alpha", true, true),
            profile_row("Account.Name", "Alpha", true, true),
        ];
        let access = field_access_from_rows("Account", &rows);
        assert_eq!(access["Name"].editable_by, vec!["Alpha", "Zeta"]);
    }
}
