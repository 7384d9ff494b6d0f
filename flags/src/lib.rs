//! Workspace-scoped feature-flag override store, layered over the
//! external oracle. An override entry wins outright; absence defers to
//! the oracle; with neither, flags read as disabled.

use std::{collections::BTreeMap, ops::Deref, sync::Arc};

use anyhow::Result;
use corral_common::args::OracleArgs;
use kube::Client;
use serde::Serialize;

pub mod oracle;
pub mod overrides;

pub use oracle::{FlagContext, Oracle, OracleFlag};
pub use overrides::OverrideStore;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EvalSource {
    Override,
    Oracle,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct Evaluation {
    pub enabled: bool,
    pub source: EvalSource,
}

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FlagDescriptor {
    pub name: String,
    pub effective_enabled: bool,
    pub source: EvalSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Override presence decides everything; this is the whole layering
/// rule, kept pure so it can be tested without a cluster.
pub fn evaluate_value(override_value: Option<bool>, oracle_value: bool) -> Evaluation {
    match override_value {
        Some(enabled) => Evaluation {
            enabled,
            source: EvalSource::Override,
        },
        None => Evaluation {
            enabled: oracle_value,
            source: EvalSource::Oracle,
        },
    }
}

/// Merges the oracle's workspace-configurable flags with a tenant's
/// overrides. Overrides for flags the oracle no longer lists are still
/// surfaced so they can be cleaned up.
pub fn merge_flags(
    oracle_flags: &[OracleFlag],
    overrides: &BTreeMap<String, bool>,
) -> Vec<FlagDescriptor> {
    let mut out: Vec<FlagDescriptor> = oracle_flags
        .iter()
        .map(|f| {
            let eval = evaluate_value(overrides.get(&f.name).copied(), f.enabled);
            FlagDescriptor {
                name: f.name.clone(),
                effective_enabled: eval.enabled,
                source: eval.source,
                description: f.description.clone(),
            }
        })
        .collect();
    for (name, enabled) in overrides {
        if !oracle_flags.iter().any(|f| &f.name == name) {
            out.push(FlagDescriptor {
                name: name.clone(),
                effective_enabled: *enabled,
                source: EvalSource::Override,
                description: None,
            });
        }
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

pub struct FlagStoreInner {
    oracle: Option<Oracle>,
    overrides: OverrideStore,
}

#[derive(Clone)]
pub struct FlagStore {
    inner: Arc<FlagStoreInner>,
}

impl Deref for FlagStore {
    type Target = FlagStoreInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl FlagStore {
    pub fn new(client: Client, args: &OracleArgs) -> Self {
        Self {
            inner: Arc::new(FlagStoreInner {
                oracle: Oracle::from_args(args),
                overrides: OverrideStore::new(client),
            }),
        }
    }

    pub async fn evaluate(
        &self,
        tenant: &str,
        flag: &str,
        ctx: &FlagContext,
    ) -> Result<Evaluation> {
        let overrides = self.overrides.get_all(tenant).await?;
        let override_value = overrides.get(flag).copied();
        // Skip the oracle round-trip when an override decides anyway.
        let oracle_value = if override_value.is_none() {
            match &self.oracle {
                Some(oracle) => oracle.is_enabled_for_context(flag, ctx).await,
                None => false,
            }
        } else {
            false
        };
        Ok(evaluate_value(override_value, oracle_value))
    }

    pub async fn list(&self, tenant: &str) -> Result<Vec<FlagDescriptor>> {
        let overrides = self.overrides.get_all(tenant).await?;
        let oracle_flags = match &self.oracle {
            Some(oracle) => match oracle.list_workspace_flags().await {
                Ok(flags) => flags,
                Err(e) => {
                    corral_common::response::print_warning(
                        e.context("Oracle unreachable; listing overrides only"),
                    );
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        Ok(merge_flags(&oracle_flags, &overrides))
    }

    /// Callers must have passed an access review for the tenant's
    /// override map before reaching this.
    pub async fn set_override(&self, tenant: &str, flag: &str, enabled: bool) -> Result<()> {
        self.overrides.set(tenant, flag, enabled).await
    }

    pub async fn delete_override(&self, tenant: &str, flag: &str) -> Result<()> {
        self.overrides.delete(tenant, flag).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oracle_flag(name: &str, enabled: bool) -> OracleFlag {
        OracleFlag {
            name: name.to_string(),
            enabled,
            description: None,
        }
    }

    #[test]
    fn override_wins_over_oracle() {
        let eval = evaluate_value(Some(true), false);
        assert_eq!(
            eval,
            Evaluation {
                enabled: true,
                source: EvalSource::Override
            }
        );
        let eval = evaluate_value(Some(false), true);
        assert!(!eval.enabled);
        assert_eq!(eval.source, EvalSource::Override);
    }

    #[test]
    fn absence_defers_to_oracle() {
        for oracle_value in [true, false] {
            let eval = evaluate_value(None, oracle_value);
            assert_eq!(eval.enabled, oracle_value);
            assert_eq!(eval.source, EvalSource::Oracle);
        }
    }

    #[test]
    fn deleting_an_override_flips_back_to_oracle() {
        // Mirrors the documented flow: override feature-x=true over an
        // oracle that says false, then remove the override.
        let with_override = evaluate_value(Some(true), false);
        assert!(with_override.enabled);
        assert_eq!(with_override.source, EvalSource::Override);
        let without = evaluate_value(None, false);
        assert!(!without.enabled);
        assert_eq!(without.source, EvalSource::Oracle);
    }

    #[test]
    fn merge_marks_overridden_flags() {
        let oracle_flags = vec![oracle_flag("feature-x", false), oracle_flag("feature-y", true)];
        let mut overrides = BTreeMap::new();
        overrides.insert("feature-x".to_string(), true);
        let merged = merge_flags(&oracle_flags, &overrides);
        assert_eq!(merged.len(), 2);
        let x = merged.iter().find(|f| f.name == "feature-x").unwrap();
        assert!(x.effective_enabled);
        assert_eq!(x.source, EvalSource::Override);
        let y = merged.iter().find(|f| f.name == "feature-y").unwrap();
        assert!(y.effective_enabled);
        assert_eq!(y.source, EvalSource::Oracle);
    }

    #[test]
    fn merge_surfaces_orphaned_overrides() {
        let mut overrides = BTreeMap::new();
        overrides.insert("gone-from-oracle".to_string(), false);
        let merged = merge_flags(&[], &overrides);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].name, "gone-from-oracle");
        assert_eq!(merged[0].source, EvalSource::Override);
        assert!(!merged[0].effective_enabled);
    }
}
