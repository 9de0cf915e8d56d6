//! Org-wide security enricher.
//!
//! Three global listings (profiles, permission sets, roles) followed by one
//! `ObjectPermissions` call per profile and per permission set. The
//! per-principal calls are the pipeline's dominant quota consumer, which is
//! why progress is tracked per principal: a run that hits the quota wall at
//! principal #327 resumes at #328 days later.
//!
//! Results are joined into each record's [`SecurityBlock`] as object-level
//! CRUD grants; the global principal lists are returned for `security.json`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::bridge::RemoteError;
use crate::coalesce::escape_soql;
use crate::enrich_automation::EnrichOutcome;
use crate::models::{
    CrudPermissions, ObjectRecord, ObjectRef, OrgSecurity, SecurityBlock, SecurityPrincipal,
};
use crate::progress::PhaseState;
use crate::retry;
use crate::session::Session;

pub const PHASE: &str = "org-security";
const DATA_TYPE: &str = "object_permissions";

/// Sentinel ref for the tenant-global cache entries.
const ORG_REF: &str = "_org";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrincipalKind {
    Profile,
    PermissionSet,
}

#[derive(Debug, Clone)]
struct Principal {
    kind: PrincipalKind,
    id: String,
    name: String,
}

impl Principal {
    /// Progress/cache ref, stable across runs.
    fn progress_ref(&self) -> String {
        match self.kind {
            PrincipalKind::Profile => format!("profile:{}", self.id),
            PrincipalKind::PermissionSet => format!("permset:{}", self.id),
        }
    }

    fn permissions_soql(&self) -> String {
        let id = escape_soql(&self.id);
        match self.kind {
            PrincipalKind::Profile => format!(
                "SELECT SobjectType, PermissionsCreate, PermissionsRead, PermissionsEdit, \
                 PermissionsDelete FROM ObjectPermissions WHERE Parent.ProfileId = '{}'",
                id
            ),
            PrincipalKind::PermissionSet => format!(
                "SELECT SobjectType, PermissionsCreate, PermissionsRead, PermissionsEdit, \
                 PermissionsDelete FROM ObjectPermissions WHERE ParentId = '{}'",
                id
            ),
        }
    }
}

pub async fn enrich_org_security(
    session: &Arc<Session>,
    records: &mut BTreeMap<ObjectRef, ObjectRecord>,
) -> Result<(OrgSecurity, EnrichOutcome), RemoteError> {
    let profiles = global_list(
        session,
        "profiles",
        "SELECT Id, Name, Description FROM Profile ORDER BY Name",
    )
    .await?;
    let permission_sets = global_list(
        session,
        "permission_sets",
        "SELECT Id, Name, Label, Description FROM PermissionSet \
         WHERE IsOwnedByProfile = false ORDER BY Name",
    )
    .await?;
    let roles = global_list(
        session,
        "roles",
        "SELECT Id, Name FROM UserRole ORDER BY Name",
    )
    .await?;

    let org = OrgSecurity {
        profiles: principals_of(&profiles, "Name"),
        permission_sets: principals_of(&permission_sets, "Label"),
        roles: principals_of(&roles, "Name"),
    };

    let mut principals = Vec::new();
    for row in &profiles {
        if let (Some(id), Some(name)) = (str_field(row, "Id"), str_field(row, "Name")) {
            principals.push(Principal {
                kind: PrincipalKind::Profile,
                id,
                name,
            });
        }
    }
    for row in &permission_sets {
        let name = str_field(row, "Label").or_else(|| str_field(row, "Name"));
        if let (Some(id), Some(name)) = (str_field(row, "Id"), name) {
            principals.push(Principal {
                kind: PrincipalKind::PermissionSet,
                id,
                name,
            });
        }
    }

    let progress_refs: Vec<String> = principals.iter().map(|p| p.progress_ref()).collect();
    session.progress.seed(PHASE, &progress_refs);

    let semaphore = Arc::new(Semaphore::new(session.config.pools.enrich_workers));
    let mut handles = Vec::with_capacity(principals.len());
    for principal in principals {
        let session = Arc::clone(session);
        let semaphore = Arc::clone(&semaphore);
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            if session.limiter.quota_walled() {
                return (principal, None);
            }
            let pref = principal.progress_ref();
            session.progress.mark(PHASE, &pref, PhaseState::InFlight, None);
            let result = permissions_for_principal(&session, &principal).await;
            match &result {
                Ok(_) => session.progress.mark(PHASE, &pref, PhaseState::Done, None),
                Err(e) => {
                    session
                        .progress
                        .mark(PHASE, &pref, PhaseState::Error, Some(e.to_string()))
                }
            }
            (principal, Some(result))
        }));
    }

    let mut outcome = EnrichOutcome::default();
    for handle in handles {
        match handle.await {
            Ok((principal, Some(Ok((rows, cached))))) => {
                if cached {
                    outcome.from_cache += 1;
                }
                join_into_records(records, &principal, &rows);
                outcome.ok += 1;
            }
            Ok((principal, Some(Err(e)))) => {
                warn!(principal = %principal.name, error = %e, "object permissions failed");
                outcome.errored += 1;
            }
            Ok((_, None)) => outcome.skipped += 1,
            Err(e) => warn!(error = %e, "org-security task panicked"),
        }
    }

    Ok((org, outcome))
}

/// Fetch a tenant-global listing through the cache.
async fn global_list(
    session: &Session,
    data_type: &'static str,
    soql: &'static str,
) -> Result<Vec<Value>, RemoteError> {
    let no_params: Vec<(String, String)> = Vec::new();
    let _flight = session.cache.flight_guard(data_type, ORG_REF, &no_params).await;
    if let Some(Value::Array(rows)) = session.cache.get(data_type, ORG_REF, &no_params) {
        return Ok(rows);
    }
    let rows = retry::call_remote(&session.retry, &session.limiter, data_type, || {
        session.cli.query(soql, false)
    })
    .await?;
    session
        .cache
        .put(data_type, ORG_REF, &no_params, &Value::Array(rows.clone()));
    Ok(rows)
}

async fn permissions_for_principal(
    session: &Session,
    principal: &Principal,
) -> Result<(Vec<Value>, bool), RemoteError> {
    let no_params: Vec<(String, String)> = Vec::new();
    let pref = principal.progress_ref();
    let _flight = session.cache.flight_guard(DATA_TYPE, &pref, &no_params).await;
    if let Some(Value::Array(rows)) = session.cache.get(DATA_TYPE, &pref, &no_params) {
        return Ok((rows, true));
    }
    let soql = principal.permissions_soql();
    let rows = retry::call_remote(&session.retry, &session.limiter, DATA_TYPE, || {
        session.cli.query(&soql, false)
    })
    .await?;
    session
        .cache
        .put(DATA_TYPE, &pref, &no_params, &Value::Array(rows.clone()));
    Ok((rows, false))
}

fn join_into_records(
    records: &mut BTreeMap<ObjectRef, ObjectRecord>,
    principal: &Principal,
    rows: &[Value],
) {
    for row in rows {
        let object_ref = match str_field(row, "SobjectType") {
            Some(r) => r,
            None => continue,
        };
        let record = match records.get_mut(&object_ref) {
            Some(rec) => rec,
            None => continue, // outside the working set
        };
        let perms = crud_of(row);
        let security = record.security.get_or_insert_with(SecurityBlock::default);
        match principal.kind {
            PrincipalKind::Profile => {
                security.profile_permissions.insert(principal.name.clone(), perms);
            }
            PrincipalKind::PermissionSet => {
                security
                    .permission_set_permissions
                    .insert(principal.name.clone(), perms);
            }
        }
    }
}

fn crud_of(row: &Value) -> CrudPermissions {
    let flag = |key: &str| row.get(key).and_then(|v| v.as_bool()).unwrap_or(false);
    CrudPermissions {
        create: flag("PermissionsCreate"),
        read: flag("PermissionsRead"),
        edit: flag("PermissionsEdit"),
        delete: flag("PermissionsDelete"),
    }
}

fn principals_of(rows: &[Value], name_key: &str) -> Vec<SecurityPrincipal> {
    rows.iter()
        .filter_map(|row| {
            Some(SecurityPrincipal {
                id: str_field(row, "Id")?,
                name: str_field(row, name_key).or_else(|| str_field(row, "Name"))?,
                description: str_field(row, "Description"),
            })
        })
        .collect()
}

fn str_field(row: &Value, key: &str) -> Option<String> {
    row.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn profile(name: &str) -> Principal {
        Principal {
            kind: PrincipalKind::Profile,
            id: "00e000000000001".into(),
            name: name.into(),
        }
    }

    #[test]
    fn joins_rows_into_working_set_records() {
        let mut records = BTreeMap::new();
        records.insert(
            "Account".to_string(),
            ObjectRecord {
                name: "Account".into(),
                label: "Account".into(),
                ..Default::default()
            },
        );
        let rows = vec![
            json!({"SobjectType": "Account", "PermissionsCreate": true, "PermissionsRead": true,
                   "PermissionsEdit": true, "PermissionsDelete": false}),
            json!({"SobjectType": "Shadow__c", "PermissionsRead": true}),
        ];
        join_into_records(&mut records, &profile("Admin"), &rows);

        let security = records["Account"].security.as_ref().unwrap();
        let perms = security.profile_permissions["Admin"];
        assert!(perms.create && perms.read && perms.edit);
        assert!(!perms.delete);
        // The out-of-working-set row is dropped, not an error.
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn permission_set_rows_fill_their_own_map() {
        let mut records = BTreeMap::new();
        records.insert("Case".to_string(), ObjectRecord::default());
        let ps = Principal {
            kind: PrincipalKind::PermissionSet,
            id: "0PS000000000001".into(),
            name: "Sales Ops".into(),
        };
        let rows = vec![json!({"SobjectType": "Case", "PermissionsRead": true})];
        join_into_records(&mut records, &ps, &rows);
        let security = records["Case"].security.as_ref().unwrap();
        assert!(security.profile_permissions.is_empty());
        assert!(security.permission_set_permissions["Sales Ops"].read);
    }

    #[test]
    fn principal_refs_are_stable() {
        assert_eq!(profile("Admin").progress_ref(), "profile:00e000000000001");
    }

    #[test]
    fn profile_query_filters_by_parent_profile() {
        let soql = profile("Admin").permissions_soql();
        assert!(soql.contains("Parent.ProfileId = '00e000000000001'"));
    }

    #[test]
    fn principals_parse_with_label_fallback() {
        let rows = vec![
            json!({"Id": "0PS1", "Name": "Sales_Ops", "Label": "Sales Ops"}),
            json!({"Id": "0PS2", "Name": "Bare"}),
        ];
        let principals = principals_of(&rows, "Label");
        assert_eq!(principals[0].name, "Sales Ops");
        assert_eq!(principals[1].name, "Bare");
    }
}
