//! Working-set enumeration.
//!
//! Lists every queryable object in the org, then applies the noise filter
//! (glob patterns for derived objects like `*__Share` and `*__History`) and
//! the namespace exclusion list. Output is lexicographic so downstream
//! batch composition is reproducible run to run.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::info;

use crate::bridge::RemoteError;
use crate::config::FilterConfig;
use crate::models::ObjectRef;
use crate::retry;
use crate::session::Session;

const LIST_QUERY: &str = "SELECT QualifiedApiName FROM EntityDefinition \
                          WHERE IsQueryable = true ORDER BY QualifiedApiName";

/// Compiled filtering policy.
pub struct ObjectFilter {
    noise: GlobSet,
    exclude_namespaces: Vec<String>,
}

impl ObjectFilter {
    pub fn compile(config: &FilterConfig) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.noise_globs {
            builder.add(
                Glob::new(pattern)
                    .with_context(|| format!("invalid noise glob '{}'", pattern))?,
            );
        }
        Ok(Self {
            noise: builder.build()?,
            exclude_namespaces: config.exclude_namespaces.clone(),
        })
    }

    pub fn keeps(&self, object_ref: &str) -> bool {
        if self.noise.is_match(object_ref) {
            return false;
        }
        !self
            .exclude_namespaces
            .iter()
            .any(|ns| object_ref.starts_with(&format!("{}__", ns)))
    }

    /// Filter and sort a raw listing.
    pub fn apply(&self, refs: Vec<ObjectRef>) -> Vec<ObjectRef> {
        let mut kept: Vec<ObjectRef> = refs.into_iter().filter(|r| self.keeps(r)).collect();
        kept.sort();
        kept.dedup();
        kept
    }
}

/// Enumerate the working set: one remote listing, filtered and sorted.
pub async fn enumerate_objects(session: &Session) -> Result<Vec<ObjectRef>, RemoteError> {
    let filter = ObjectFilter::compile(&session.config.filters)
        .map_err(|e| RemoteError::Consistency(format!("filter config: {}", e)))?;

    let rows = retry::call_remote(&session.retry, &session.limiter, "enumerate", || {
        session.cli.query(LIST_QUERY, false)
    })
    .await?;

    let raw: Vec<ObjectRef> = rows
        .iter()
        .filter_map(|row| row.get("QualifiedApiName").and_then(|v| v.as_str()))
        .map(|s| s.to_string())
        .collect();
    let total = raw.len();
    let working_set = filter.apply(raw);
    info!(
        total,
        kept = working_set.len(),
        "enumerated working set"
    );
    Ok(working_set)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(noise: &[&str], namespaces: &[&str]) -> ObjectFilter {
        ObjectFilter::compile(&FilterConfig {
            noise_globs: noise.iter().map(|s| s.to_string()).collect(),
            exclude_namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
        })
        .unwrap()
    }

    #[test]
    fn default_noise_globs_drop_derived_objects() {
        let f = ObjectFilter::compile(&FilterConfig::default()).unwrap();
        assert!(f.keeps("Account"));
        assert!(f.keeps("Invoice__c"));
        assert!(!f.keeps("Account__History"));
        assert!(!f.keeps("Invoice__Share"));
        assert!(!f.keeps("AccountChangeEvent"));
        assert!(!f.keeps("Order_Event__e"));
    }

    #[test]
    fn namespace_exclusion_is_prefix_scoped() {
        let f = filter(&[], &["npsp"]);
        assert!(!f.keeps("npsp__Donation__c"));
        // Only the `ns__` prefix form is excluded, not any substring.
        assert!(f.keeps("npspx__Other__c"));
        assert!(f.keeps("Account"));
    }

    #[test]
    fn output_sorted_and_deduped() {
        let f = filter(&[], &[]);
        let out = f.apply(vec![
            "Contact".into(),
            "Account".into(),
            "Contact".into(),
        ]);
        assert_eq!(out, vec!["Account".to_string(), "Contact".to_string()]);
    }

    #[test]
    fn invalid_glob_is_rejected() {
        let result = ObjectFilter::compile(&FilterConfig {
            noise_globs: vec!["[".into()],
            exclude_namespaces: vec![],
        });
        assert!(result.is_err());
    }
}
