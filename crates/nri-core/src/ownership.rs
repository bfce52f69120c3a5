//! Ownership tracker (C4).
//!
//! Records, for each adjustable field of every container, which plugin
//! first claimed it, and refuses conflicting later claims within the same
//! dispatch. A claim and a "clear" are both forms of ownership: once a key
//! is claimed — set or cleared — only the claiming plugin may touch it
//! again in the same pipeline run.

use std::collections::HashMap;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Claim {
    owner: String,
    cleared: bool,
}

/// Special field name used for the hooks appender list, whose "owner" is a
/// comma-joined set of every plugin that appended a hook rather than a
/// single claimant.
pub const HOOKS_FIELD: &str = "hooks";
pub const SECCOMP_FIELD: &str = "linux.seccomp";

#[derive(Debug, Default)]
struct ContainerOwnership {
    simple: HashMap<String, Claim>,
    compound: HashMap<String, HashMap<String, Claim>>,
    /// Plugins that have appended an OCI hook, in first-append order.
    hook_appenders: Vec<String>,
}

/// Tracks field ownership across all containers touched by one dispatch
/// pipeline run. A fresh tracker is used per event (spec.md: claims are
/// "strictly first-wins within one dispatch").
#[derive(Debug, Default)]
pub struct OwnershipTracker {
    containers: HashMap<String, ContainerOwnership>,
}

impl OwnershipTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, container: &str) -> &mut ContainerOwnership {
        self.containers.entry(container.to_string()).or_default()
    }

    /// Claim a simple (non-compound) field, e.g. `linux.resources.cpu.shares`.
    pub fn claim_simple(&mut self, container: &str, field: &str, plugin: &str) -> Result<()> {
        let c = self.entry(container);
        match c.simple.get(field) {
            Some(existing) if existing.owner != plugin => Err(Error::OwnershipConflict {
                field: field.to_string(),
                key: None,
                owner: existing.owner.clone(),
                rejected: plugin.to_string(),
            }),
            _ => {
                c.simple.insert(
                    field.to_string(),
                    Claim {
                        owner: plugin.to_string(),
                        cleared: false,
                    },
                );
                Ok(())
            }
        }
    }

    pub fn clear_simple(&mut self, container: &str, field: &str, plugin: &str) -> Result<()> {
        let c = self.entry(container);
        match c.simple.get(field) {
            Some(existing) if existing.owner != plugin => Err(Error::OwnershipConflict {
                field: field.to_string(),
                key: None,
                owner: existing.owner.clone(),
                rejected: plugin.to_string(),
            }),
            _ => {
                c.simple.insert(
                    field.to_string(),
                    Claim {
                        owner: plugin.to_string(),
                        cleared: true,
                    },
                );
                Ok(())
            }
        }
    }

    /// Claim one key of a compound field (e.g. mounts by destination,
    /// devices by path, namespaces by type, annotations/env/sysctls by
    /// name, hugepage limits by page size).
    pub fn claim_compound(
        &mut self,
        container: &str,
        field: &str,
        key: &str,
        plugin: &str,
    ) -> Result<()> {
        let c = self.entry(container);
        let keys = c.compound.entry(field.to_string()).or_default();
        match keys.get(key) {
            Some(existing) if existing.owner != plugin => Err(Error::OwnershipConflict {
                field: field.to_string(),
                key: Some(key.to_string()),
                owner: existing.owner.clone(),
                rejected: plugin.to_string(),
            }),
            _ => {
                keys.insert(
                    key.to_string(),
                    Claim {
                        owner: plugin.to_string(),
                        cleared: false,
                    },
                );
                Ok(())
            }
        }
    }

    pub fn clear_compound(
        &mut self,
        container: &str,
        field: &str,
        key: &str,
        plugin: &str,
    ) -> Result<()> {
        let c = self.entry(container);
        let keys = c.compound.entry(field.to_string()).or_default();
        match keys.get(key) {
            Some(existing) if existing.owner != plugin => Err(Error::OwnershipConflict {
                field: field.to_string(),
                key: Some(key.to_string()),
                owner: existing.owner.clone(),
                rejected: plugin.to_string(),
            }),
            _ => {
                keys.insert(
                    key.to_string(),
                    Claim {
                        owner: plugin.to_string(),
                        cleared: true,
                    },
                );
                Ok(())
            }
        }
    }

    /// Record that `plugin` appended one or more OCI hooks. Multiple
    /// plugins may legitimately do this; the validator decides policy over
    /// the whole set.
    pub fn append_hook_owner(&mut self, container: &str, plugin: &str) {
        let c = self.entry(container);
        if !c.hook_appenders.iter().any(|p| p == plugin) {
            c.hook_appenders.push(plugin.to_string());
        }
    }

    /// Comma-joined list of every plugin that appended a hook to this
    /// container, in append order, or `None` if no plugin did.
    pub fn hooks_owner(&self, container: &str) -> Option<String> {
        let c = self.containers.get(container)?;
        if c.hook_appenders.is_empty() {
            None
        } else {
            Some(c.hook_appenders.join(","))
        }
    }

    pub fn seccomp_policy_owner(&self, container: &str) -> Option<&str> {
        self.containers
            .get(container)?
            .simple
            .get(SECCOMP_FIELD)
            .map(|c| c.owner.as_str())
    }

    /// Owning plugin per namespace type for this container.
    pub fn namespace_owners(&self, container: &str) -> HashMap<String, String> {
        self.containers
            .get(container)
            .and_then(|c| c.compound.get("namespaces"))
            .map(|keys| {
                keys.iter()
                    .map(|(k, claim)| (k.clone(), claim.owner.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn sysctl_owner(&self, container: &str, key: &str) -> Option<&str> {
        self.containers
            .get(container)?
            .compound
            .get("sysctls")?
            .get(key)
            .map(|c| c.owner.as_str())
    }

    /// All claimed simple field names for this container, regardless of
    /// cleared state — used by the validator to decide "is this field
    /// claimed at all".
    pub fn simple_claimed(&self, container: &str, field: &str) -> bool {
        self.containers
            .get(container)
            .map(|c| c.simple.contains_key(field))
            .unwrap_or(false)
    }

    /// All claimed keys of a compound field for this container.
    pub fn compound_keys(&self, container: &str, field: &str) -> Vec<String> {
        self.containers
            .get(container)
            .and_then(|c| c.compound.get(field))
            .map(|keys| keys.keys().cloned().collect())
            .unwrap_or_default()
    }
}
