//! End-to-end pipeline tests against a stub `sf` CLI.
//!
//! A shell script standing in for the Salesforce CLI answers each SOQL
//! query with canned JSON, so the full binary can be driven through
//! enumerate → describe → enrich → emit without a real org. Uploads are
//! exercised separately against the in-memory index in `src/upload.rs`;
//! here every run is `--dry-run`.

#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

fn harvest_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // test binary name
    path.pop(); // deps/
    path.push("harvest");
    path
}

/// Stub `sf` that dispatches on the `--query` argument.
const SF_STUB: &str = r#"#!/bin/sh
q=""
prev=""
for a in "$@"; do
  if [ "$prev" = "--query" ]; then q="$a"; fi
  prev="$a"
done

records() {
  printf '{"status":0,"result":{"records":%s,"totalSize":%s,"done":true}}\n' "$1" "$2"
}

case "$q" in
  *"FROM EntityDefinition WHERE IsQueryable"*)
    records '[{"QualifiedApiName":"Account"},{"QualifiedApiName":"Contact"},{"QualifiedApiName":"Account__History"}]' 3
    ;;
  *"FROM EntityDefinition WHERE QualifiedApiName = 'Account'"*)
    records '[{"QualifiedApiName":"Account","Label":"Account","Description":"Core account object"}]' 1
    ;;
  *"FROM EntityDefinition WHERE QualifiedApiName = 'Contact'"*)
    records '[{"QualifiedApiName":"Contact","Label":"Contact","Description":""}]' 1
    ;;
  *"FROM FieldDefinition WHERE EntityDefinition.QualifiedApiName = 'Account'"*)
    records '[{"QualifiedApiName":"Industry","Label":"Industry","DataType":"Picklist","IsNillable":true,"IsUnique":false,"IsExternalId":false},{"QualifiedApiName":"Name","Label":"Account Name","DataType":"Text(255)","Length":255,"IsNillable":false,"IsUnique":false,"IsExternalId":false},{"QualifiedApiName":"OwnerId","Label":"Owner","DataType":"Lookup(User)","IsNillable":false,"IsUnique":false,"IsExternalId":false}]' 3
    ;;
  *"FROM FieldDefinition WHERE EntityDefinition.QualifiedApiName = 'Contact'"*)
    records '[{"QualifiedApiName":"Email","Label":"Email","DataType":"Email","IsNillable":true,"IsUnique":true,"IsExternalId":true},{"QualifiedApiName":"LastName","Label":"Last Name","DataType":"Text(80)","Length":80,"IsNillable":false,"IsUnique":false,"IsExternalId":false}]' 2
    ;;
  *"FROM FieldPermissions"*)
    records '[{"Field":"Account.Name","SobjectType":"Account","PermissionsRead":true,"PermissionsEdit":true,"Parent":{"IsOwnedByProfile":true,"Profile":{"Name":"Admin"}}}]' 1
    ;;
  *"FROM ObjectPermissions"*)
    records '[{"SobjectType":"Account","PermissionsCreate":true,"PermissionsRead":true,"PermissionsEdit":true,"PermissionsDelete":false}]' 1
    ;;
  *"FROM Profile"*)
    records '[{"Id":"00e000000000001","Name":"Admin"}]' 1
    ;;
  *"FROM PermissionSet"*)
    records '[]' 0
    ;;
  *"FROM UserRole"*)
    records '[]' 0
    ;;
  *"FROM ApexTrigger"*)
    records '[{"Name":"AccountTrigger","TableEnumOrId":"Account","Status":"Active","Body":"trigger AccountTrigger on Account (before insert) {\n// guard\nservice.run();\n}"}]' 1
    ;;
  *"FROM Flow"*|*"FROM ValidationRule"*|*"FROM WorkflowRule"*|*"FROM CustomField"*)
    records '[]' 0
    ;;
  *"LAST_N_DAYS"*)
    records '[]' 1
    ;;
  *"SELECT COUNT() FROM Account"*)
    records '[]' 2
    ;;
  *"SELECT COUNT() FROM Contact"*)
    records '[]' 0
    ;;
  *"FIELDS(ALL) FROM Account"*)
    records '[{"attributes":{"type":"Account"},"Name":"Acme","Industry":"Technology","OwnerId":"005x"},{"attributes":{"type":"Account"},"Name":"Globex","Industry":null,"OwnerId":"005x"}]' 2
    ;;
  *"GROUP BY Owner.Profile.Name"*)
    records '[{"profileName":"Admin","recordTotal":2}]' 1
    ;;
  *)
    records '[]' 0
    ;;
esac
"#;

fn setup_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();

    let stub = root.join("sf");
    fs::write(&stub, SF_STUB).unwrap();
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&stub, fs::Permissions::from_mode(0o755)).unwrap();
    }

    let config = format!(
        r#"[org]
alias = "stuborg"
sf_path = "{stub}"

[cache]
dir = "{root}/cache"

[output]
dir = "{root}/output"
"#,
        stub = stub.display(),
        root = root.display()
    );
    let config_path = root.join("harvest.toml");
    fs::write(&config_path, config).unwrap();

    (tmp, config_path)
}

fn run_harvest(config: &Path, args: &[&str]) -> (String, String, Option<i32>) {
    let output = Command::new(harvest_binary())
        .arg("--config")
        .arg(config)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run harvest: {}", e));
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.code(),
    )
}

#[test]
fn dry_run_emits_corpus() {
    let (tmp, config) = setup_env();
    let (stdout, stderr, code) = run_harvest(
        &config,
        &["run", "--phases", "enumerate,describe,emit", "--dry-run"],
    );
    assert_eq!(code, Some(0), "stdout={stdout}\nstderr={stderr}");
    assert!(stdout.contains("working set: 2 objects"), "{stdout}");

    let output = tmp.path().join("output");
    let schema: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(output.join("schema.json")).unwrap()).unwrap();
    let objects = schema["objects"].as_object().unwrap();
    assert_eq!(objects.len(), 2);
    assert!(objects.contains_key("Account"));
    assert!(objects.contains_key("Contact"));
    // The noise filter dropped the derived history object.
    assert!(!objects.contains_key("Account__History"));
    // Relationship extracted from the lookup field.
    assert_eq!(
        objects["Account"]["relationships"][0]["to_object"],
        "User"
    );
    // Entity description and field attribute flags survive the describe.
    assert_eq!(objects["Account"]["description"], "Core account object");
    assert_eq!(objects["Contact"]["description"], "");
    let email = objects["Contact"]["fields"]
        .as_array()
        .unwrap()
        .iter()
        .find(|f| f["name"] == "Email")
        .unwrap();
    assert_eq!(email["unique"], true);
    assert_eq!(email["external_id"], true);
    let last_name = objects["Contact"]["fields"]
        .as_array()
        .unwrap()
        .iter()
        .find(|f| f["name"] == "LastName")
        .unwrap();
    assert_eq!(last_name["unique"], false);
    assert_eq!(last_name["required"], true);

    let jsonl = fs::read_to_string(output.join("corpus.jsonl")).unwrap();
    let ids: Vec<String> = jsonl
        .lines()
        .map(|line| {
            serde_json::from_str::<serde_json::Value>(line).unwrap()["id"]
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect();
    assert!(ids.len() >= 2);
    for id in &ids {
        assert!(
            id.starts_with("salesforce_object_Account") || id.starts_with("salesforce_object_Contact"),
            "unexpected chunk id {id}"
        );
    }

    assert!(output.join("objects/Account.md").exists());
    assert!(output.join("objects/Contact.md").exists());
    assert!(output.join("progress.json").exists());
}

#[test]
fn second_run_hits_cache() {
    let (_tmp, config) = setup_env();
    let args = ["run", "--phases", "enumerate,describe,emit", "--dry-run"];
    let (_, _, code) = run_harvest(&config, &args);
    assert_eq!(code, Some(0));

    let (stdout, stderr, code) = run_harvest(&config, &args);
    assert_eq!(code, Some(0), "stdout={stdout}\nstderr={stderr}");
    assert!(
        stdout.contains("describe: 2 ok, 0 errored, 2 cached"),
        "expected cache hits on rerun: {stdout}"
    );
}

#[test]
fn full_dry_run_attaches_blocks() {
    let (tmp, config) = setup_env();
    let (stdout, stderr, code) = run_harvest(&config, &["run", "--dry-run"]);
    assert_eq!(code, Some(0), "stdout={stdout}\nstderr={stderr}");

    let output = tmp.path().join("output");
    let schema: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(output.join("schema.json")).unwrap()).unwrap();
    let account = &schema["objects"]["Account"];

    // Stats: count 2, freshness 1/2, picklist tally from the sample.
    assert_eq!(account["stats"]["record_count"], 2);
    assert_eq!(account["stats"]["picklist_distributions"]["Industry"]["Technology"], 1);

    // Automation: the stub trigger with locally computed complexity.
    assert_eq!(account["automation"]["triggers"][0]["name"], "AccountTrigger");
    assert_eq!(account["automation"]["complexity"][0]["comment_lines"], 1);

    // Security: FLS from FieldPermissions, CRUD from ObjectPermissions.
    assert_eq!(
        account["security"]["field_permissions"]["Name"]["editable_by"][0],
        "Admin"
    );
    assert_eq!(
        account["security"]["profile_permissions"]["Admin"]["create"],
        true
    );

    assert!(output.join("stats.json").exists());
    assert!(output.join("automation.json").exists());
    assert!(output.join("security.json").exists());

    // Sealed records carry a content hash into chunk metadata.
    let jsonl = fs::read_to_string(output.join("corpus.jsonl")).unwrap();
    let first: serde_json::Value = serde_json::from_str(jsonl.lines().next().unwrap()).unwrap();
    assert_eq!(first["metadata"]["content_hash"].as_str().unwrap().len(), 64);
    assert_eq!(first["metadata"]["type"], "salesforce_object");
}

#[test]
fn resume_after_describe_skips_remote_calls() {
    let (tmp, config) = setup_env();
    let args = ["run", "--phases", "enumerate,describe,emit", "--dry-run"];
    let (_, _, code) = run_harvest(&config, &args);
    assert_eq!(code, Some(0));

    // Resume with describe already done: the phase's work set is empty.
    let (stdout, stderr, code) = run_harvest(
        &config,
        &["run", "--phases", "describe,emit", "--dry-run", "--resume"],
    );
    assert_eq!(code, Some(0), "stdout={stdout}\nstderr={stderr}");
    assert!(
        stdout.contains("describe: 0 ok, 0 errored, 0 cached"),
        "expected no describe work on resume: {stdout}"
    );

    // The snapshot still carries both objects.
    let schema: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(tmp.path().join("output/schema.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(schema["objects"].as_object().unwrap().len(), 2);
}

#[test]
fn unknown_phase_is_fatal() {
    let (_tmp, config) = setup_env();
    let (_, stderr, code) = run_harvest(&config, &["run", "--phases", "describe,frobnicate"]);
    assert_eq!(code, Some(1));
    assert!(stderr.contains("unknown phase"), "{stderr}");
}

#[test]
fn cache_subcommand_reports_and_clears() {
    let (_tmp, config) = setup_env();
    let args = ["run", "--phases", "enumerate,describe,emit", "--dry-run"];
    run_harvest(&config, &args);

    let (stdout, _, code) = run_harvest(&config, &["cache", "stats"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("files:"), "{stdout}");

    let (stdout, _, code) = run_harvest(&config, &["cache", "clear"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("cleared"), "{stdout}");
}
