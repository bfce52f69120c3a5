//! Policy validator (C4.7).
//!
//! Stateless given its [`ValidatorConfig`]: consumes one container's merged
//! adjustment plus its ownership map and decides whether the event
//! succeeds. Never mutates anything; every check here is pure policy.

use std::collections::{HashMap, HashSet};

use crate::api;
use crate::error::{Error, Result};
use crate::ownership::OwnershipTracker;

/// Annotation carrying the pod-wide required-plugin list.
pub const REQUIRED_PLUGINS_ANNOTATION: &str = "required-plugins.noderesource.dev";
/// Annotation prefix for a per-container required-plugin list; the full
/// key is `{PREFIX}/container.{name}`.
pub const REQUIRED_PLUGINS_CONTAINER_PREFIX: &str = "required-plugins.noderesource.dev/container.";
const DEFAULT_TOLERATE_MISSING_ANNOTATION: &str = "tolerate-missing-required-plugins.noderesource.dev";

/// Per-role overrides of the default reject flags. `None` means "inherit
/// the default"; `Some(bool)` pins the flag for plugins with that role.
#[derive(Debug, Clone, Default)]
pub struct RoleOverride {
    pub forbid_hooks: Option<bool>,
    pub forbid_namespaces: Option<bool>,
    pub forbid_sysctls: Option<bool>,
    pub forbid_seccomp: Option<HashSet<api::SeccompProfileKind>>,
}

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub forbid_hooks: bool,
    pub forbid_namespaces: bool,
    pub forbid_sysctls: bool,
    pub forbid_seccomp_kinds: HashSet<api::SeccompProfileKind>,
    /// Required plugins from global config, unioned with pod/container
    /// annotations at validation time.
    pub required_plugins: Vec<String>,
    /// Annotation key whose truthy value waives required-plugin checks
    /// for this pod.
    pub tolerate_missing_annotation: String,
    pub role_overrides: HashMap<String, RoleOverride>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        ValidatorConfig {
            forbid_hooks: false,
            forbid_namespaces: false,
            forbid_sysctls: false,
            forbid_seccomp_kinds: HashSet::new(),
            required_plugins: Vec::new(),
            tolerate_missing_annotation: DEFAULT_TOLERATE_MISSING_ANNOTATION.to_string(),
            role_overrides: HashMap::new(),
        }
    }
}

pub struct Validator {
    config: ValidatorConfig,
}

impl Validator {
    pub fn new(config: ValidatorConfig) -> Self {
        Validator { config }
    }

    fn effective_forbid_hooks(&self, role: &str) -> bool {
        self.config
            .role_overrides
            .get(role)
            .and_then(|o| o.forbid_hooks)
            .unwrap_or(self.config.forbid_hooks)
    }

    fn effective_forbid_namespaces(&self, role: &str) -> bool {
        self.config
            .role_overrides
            .get(role)
            .and_then(|o| o.forbid_namespaces)
            .unwrap_or(self.config.forbid_namespaces)
    }

    fn effective_forbid_sysctls(&self, role: &str) -> bool {
        self.config
            .role_overrides
            .get(role)
            .and_then(|o| o.forbid_sysctls)
            .unwrap_or(self.config.forbid_sysctls)
    }

    fn forbids_seccomp_kind(&self, role: &str, kind: api::SeccompProfileKind) -> bool {
        match self.config.role_overrides.get(role).and_then(|o| o.forbid_seccomp.as_ref()) {
            Some(set) => set.contains(&kind),
            None => self.config.forbid_seccomp_kinds.contains(&kind),
        }
    }

    /// Validates the ownership-tagged adjustment for one container.
    /// `role` identifies the plugin whose per-role override table (if
    /// any) should apply — policy is evaluated per the *validating*
    /// plugin's role in this simplified single-validator-pass model.
    pub fn validate(
        &self,
        role: &str,
        container_id: &str,
        seccomp_kind: Option<api::SeccompProfileKind>,
        owners: &OwnershipTracker,
    ) -> Result<()> {
        if self.effective_forbid_hooks(role) {
            if let Some(owner) = owners.hooks_owner(container_id) {
                return Err(Error::ValidationRejected {
                    plugin: owner,
                    reason: "OCI hook injection is forbidden by policy".into(),
                });
            }
        }

        if let Some(kind) = seccomp_kind {
            if self.forbids_seccomp_kind(role, kind) {
                if let Some(owner) = owners.seccomp_policy_owner(container_id) {
                    return Err(Error::ValidationRejected {
                        plugin: owner.to_string(),
                        reason: format!("seccomp policy adjustment ({kind:?}) is forbidden by policy"),
                    });
                }
            }
        }

        if self.effective_forbid_namespaces(role) {
            let ns_owners = owners.namespace_owners(container_id);
            if let Some((_, owner)) = ns_owners.into_iter().next() {
                return Err(Error::ValidationRejected {
                    plugin: owner,
                    reason: "namespace adjustment is forbidden by policy".into(),
                });
            }
        }

        if self.effective_forbid_sysctls(role) {
            let sysctl_keys = owners.compound_keys(container_id, "sysctls");
            if let Some(key) = sysctl_keys.into_iter().next() {
                if let Some(owner) = owners.sysctl_owner(container_id, &key) {
                    return Err(Error::ValidationRejected {
                        plugin: owner.to_string(),
                        reason: format!("sysctl adjustment ({key}) is forbidden by policy"),
                    });
                }
            }
        }

        Ok(())
    }

    /// Resolves the required-plugin set for a pod/container pair: global
    /// config list, unioned with the pod-wide annotation and the
    /// container-scoped annotation, unless the tolerate-missing
    /// annotation is truthy.
    pub fn required_plugins(&self, pod: &api::PodSandbox, container_name: &str) -> Vec<String> {
        if is_truthy_annotation(&pod.annotations, &self.config.tolerate_missing_annotation) {
            return Vec::new();
        }

        let mut required: HashSet<String> = self.config.required_plugins.iter().cloned().collect();
        required.extend(parse_yaml_string_list(&pod.annotations, REQUIRED_PLUGINS_ANNOTATION));

        let container_key = format!("{REQUIRED_PLUGINS_CONTAINER_PREFIX}{container_name}");
        required.extend(parse_yaml_string_list(&pod.annotations, &container_key));

        required.into_iter().collect()
    }

    /// Checks the resolved required-plugin set against the registry's
    /// known plugin base names, failing with the missing subset.
    pub fn check_required_plugins(&self, required: &[String], present: &HashSet<String>) -> Result<()> {
        let missing: Vec<String> = required
            .iter()
            .filter(|name| !present.contains(*name))
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::RequiredPluginMissing(missing))
        }
    }
}

fn is_truthy_annotation(annotations: &HashMap<String, String>, key: &str) -> bool {
    match annotations.get(key) {
        Some(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        None => false,
    }
}

/// Parses a YAML list annotation value like `"[ alpha, beta ]"` into its
/// plugin base names. A missing annotation yields an empty list; a
/// malformed one logs and is treated as empty rather than failing the
/// whole event.
fn parse_yaml_string_list(annotations: &HashMap<String, String>, key: &str) -> Vec<String> {
    let Some(raw) = annotations.get(key) else {
        return Vec::new();
    };
    match serde_yaml::from_str::<Vec<String>>(raw) {
        Ok(list) => list,
        Err(e) => {
            log::warn!("annotation {key:?} is not a valid YAML string list ({e}), ignoring");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hooks_forbidden_and_claimed_rejects() {
        let mut owners = OwnershipTracker::new();
        owners.append_hook_owner("c1", "10-a");
        let v = Validator::new(ValidatorConfig {
            forbid_hooks: true,
            ..Default::default()
        });
        let err = v.validate("default", "c1", None, &owners).unwrap_err();
        assert!(matches!(err, Error::ValidationRejected { .. }));
    }

    #[test]
    fn hooks_forbidden_but_unclaimed_passes() {
        let owners = OwnershipTracker::new();
        let v = Validator::new(ValidatorConfig {
            forbid_hooks: true,
            ..Default::default()
        });
        v.validate("default", "c1", None, &owners).unwrap();
    }

    #[test]
    fn role_override_relaxes_default_forbid() {
        let mut owners = OwnershipTracker::new();
        owners.append_hook_owner("c1", "10-a");
        let mut overrides = HashMap::new();
        overrides.insert(
            "trusted".to_string(),
            RoleOverride {
                forbid_hooks: Some(false),
                ..Default::default()
            },
        );
        let v = Validator::new(ValidatorConfig {
            forbid_hooks: true,
            role_overrides: overrides,
            ..Default::default()
        });
        v.validate("trusted", "c1", None, &owners).unwrap();
    }

    #[test]
    fn required_plugins_union_pod_and_container_annotations() {
        let mut pod = api::PodSandbox::new();
        pod.annotations = HashMap::from([
            (REQUIRED_PLUGINS_ANNOTATION.to_string(), "[alpha]".to_string()),
            (
                format!("{REQUIRED_PLUGINS_CONTAINER_PREFIX}web"),
                "[ beta, gamma ]".to_string(),
            ),
        ]);
        let v = Validator::new(ValidatorConfig::default());
        let mut required = v.required_plugins(&pod, "web");
        required.sort();
        assert_eq!(required, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn tolerate_missing_annotation_waives_required_plugins() {
        let mut pod = api::PodSandbox::new();
        pod.annotations = HashMap::from([
            (REQUIRED_PLUGINS_ANNOTATION.to_string(), "[alpha]".to_string()),
            (DEFAULT_TOLERATE_MISSING_ANNOTATION.to_string(), "true".to_string()),
        ]);
        let v = Validator::new(ValidatorConfig::default());
        assert!(v.required_plugins(&pod, "web").is_empty());
    }

    #[test]
    fn missing_required_plugin_fails() {
        let v = Validator::new(ValidatorConfig::default());
        let present: HashSet<String> = ["alpha".to_string()].into_iter().collect();
        let err = v
            .check_required_plugins(&["alpha".to_string(), "beta".to_string()], &present)
            .unwrap_err();
        match err {
            Error::RequiredPluginMissing(missing) => assert_eq!(missing, vec!["beta".to_string()]),
            _ => panic!("expected RequiredPluginMissing"),
        }
    }
}
