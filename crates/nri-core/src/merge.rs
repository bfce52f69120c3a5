//! Adjustment merger (C5).
//!
//! Applies each plugin's proposed [`api::ContainerAdjustment`] /
//! [`api::ContainerUpdate`]s, in plugin invocation order, into one
//! consolidated adjustment. Every write consults the [`OwnershipTracker`];
//! a conflicting claim aborts the whole merge — partial adjustments are
//! never returned.

use std::collections::BTreeSet;

use crate::api;
use crate::error::{Error, Result};
use crate::ownership::{OwnershipTracker, HOOKS_FIELD, SECCOMP_FIELD};

/// One plugin's proposal for a single dispatched event.
pub struct Proposal {
    pub plugin: String,
    pub adjustment: Option<api::ContainerAdjustment>,
    pub updates: Vec<api::ContainerUpdate>,
}

/// Looks up whether a container id is known and updatable. Implemented by
/// the orchestrator's live container registry; kept as a trait so the
/// merger has no dependency on how that registry is stored.
pub trait ContainerLookup {
    fn exists(&self, container_id: &str) -> bool;
}

/// Output of a successful merge.
#[derive(Default)]
pub struct MergeResult {
    pub adjustment: api::ContainerAdjustment,
    pub updates: Vec<api::ContainerUpdate>,
}

pub fn merge(
    container_id: &str,
    proposals: Vec<Proposal>,
    owners: &mut OwnershipTracker,
    lookup: &dyn ContainerLookup,
) -> Result<MergeResult> {
    let mut out = MergeResult::default();

    for proposal in proposals {
        if let Some(adj) = proposal.adjustment {
            apply_adjustment(container_id, &proposal.plugin, adj, owners, &mut out.adjustment)?;
        }
        for update in proposal.updates {
            apply_update(&proposal.plugin, update, lookup, &mut out.updates)?;
        }
    }

    Ok(out)
}

fn apply_update(
    plugin: &str,
    update: api::ContainerUpdate,
    lookup: &dyn ContainerLookup,
    out: &mut Vec<api::ContainerUpdate>,
) -> Result<()> {
    if !lookup.exists(&update.container_id) {
        if update.ignore_failure {
            log::debug!(
                "plugin {} proposed update for unknown container {}, ignored (ignorable)",
                plugin,
                update.container_id
            );
            return Ok(());
        }
        return Err(Error::ContainerNotFound(update.container_id));
    }
    out.push(update);
    Ok(())
}

fn apply_adjustment(
    container_id: &str,
    plugin: &str,
    adj: api::ContainerAdjustment,
    owners: &mut OwnershipTracker,
    out: &mut api::ContainerAdjustment,
) -> Result<()> {
    merge_annotations_like(container_id, plugin, "annotations", adj.annotations, owners, &mut out.annotations)?;
    merge_annotations_like(container_id, plugin, "env", adj.env, owners, &mut out.env)?;
    merge_mounts(container_id, plugin, adj.mounts, owners, &mut out.mounts)?;
    merge_devices(container_id, plugin, adj.devices, owners, &mut out.devices)?;
    merge_namespaces(container_id, plugin, adj.namespaces, owners, &mut out.namespaces)?;
    merge_resources(container_id, plugin, adj.linux_resources, &adj.linux_resources_clear, owners, out)?;
    merge_cgroups_path(container_id, plugin, adj.cgroups_path, owners, out)?;
    merge_args(container_id, plugin, adj.args, owners, out)?;
    merge_hooks(container_id, plugin, &adj, owners, out)?;
    merge_seccomp(container_id, plugin, adj.seccomp, owners, out)?;
    merge_capabilities(container_id, plugin, adj.capabilities_add, owners, out)?;
    merge_rlimits(container_id, plugin, adj.rlimits, owners, out)?;
    merge_simple_i32(container_id, plugin, "io_priority", adj.io_priority, owners, &mut out.io_priority)?;
    merge_simple_i32(container_id, plugin, "linux.oom_score_adj", adj.oom_score_adj, owners, &mut out.oom_score_adj)?;
    merge_sysctls(container_id, plugin, adj.sysctls_add, adj.sysctls_remove, owners, out)?;

    Ok(())
}

fn merge_simple_i32(
    container_id: &str,
    plugin: &str,
    field: &str,
    value: Option<i32>,
    owners: &mut OwnershipTracker,
    out: &mut Option<i32>,
) -> Result<()> {
    let Some(v) = value else { return Ok(()) };
    owners.claim_simple(container_id, field, plugin)?;
    *out = Some(v);
    Ok(())
}

fn merge_cgroups_path(
    container_id: &str,
    plugin: &str,
    value: Option<String>,
    owners: &mut OwnershipTracker,
    out: &mut api::ContainerAdjustment,
) -> Result<()> {
    let Some(path) = value else { return Ok(()) };
    owners.claim_simple(container_id, "linux.cgroups_path", plugin)?;
    out.cgroups_path = Some(path);
    Ok(())
}

fn merge_args(
    container_id: &str,
    plugin: &str,
    args: Vec<String>,
    owners: &mut OwnershipTracker,
    out: &mut api::ContainerAdjustment,
) -> Result<()> {
    if args.is_empty() {
        return Ok(());
    }
    owners.claim_simple(container_id, "args", plugin)?;
    out.args = args;
    Ok(())
}

/// annotations/env share the same add/remove-by-name shape.
fn merge_annotations_like(
    container_id: &str,
    plugin: &str,
    field: &str,
    delta: protobuf::MessageField<api::StringList>,
    owners: &mut OwnershipTracker,
    out: &mut protobuf::MessageField<api::StringList>,
) -> Result<()> {
    let Some(delta) = delta.into_option() else {
        return Ok(());
    };
    let merged = out.mut_or_insert_default();

    for name in &delta.remove {
        owners.clear_compound(container_id, field, name, plugin)?;
        merged.remove.push(name.clone());
        merged.add.retain(|kv| &kv.key != name);
    }
    for kv in &delta.add {
        owners.claim_compound(container_id, field, &kv.key, plugin)?;
        merged.add.retain(|existing| existing.key != kv.key);
        merged.add.push(kv.clone());
    }
    Ok(())
}

fn merge_mounts(
    container_id: &str,
    plugin: &str,
    delta: protobuf::MessageField<api::MountList>,
    owners: &mut OwnershipTracker,
    out: &mut protobuf::MessageField<api::MountList>,
) -> Result<()> {
    let Some(delta) = delta.into_option() else {
        return Ok(());
    };
    let merged = out.mut_or_insert_default();

    for dest in &delta.remove_by_destination {
        owners.clear_compound(container_id, "mounts", dest, plugin)?;
        merged.remove_by_destination.push(dest.clone());
        merged.add.retain(|m| &m.destination != dest);
    }
    for mount in &delta.add {
        owners.claim_compound(container_id, "mounts", &mount.destination, plugin)?;
        merged.add.retain(|existing| existing.destination != mount.destination);
        merged.add.push(mount.clone());
    }
    Ok(())
}

fn merge_devices(
    container_id: &str,
    plugin: &str,
    delta: protobuf::MessageField<api::DeviceList>,
    owners: &mut OwnershipTracker,
    out: &mut protobuf::MessageField<api::DeviceList>,
) -> Result<()> {
    let Some(delta) = delta.into_option() else {
        return Ok(());
    };
    let merged = out.mut_or_insert_default();

    for path in &delta.remove_by_path {
        owners.clear_compound(container_id, "devices", path, plugin)?;
        merged.remove_by_path.push(path.clone());
        merged.add.retain(|d| &d.path != path);
    }
    for dev in &delta.add {
        owners.claim_compound(container_id, "devices", &dev.path, plugin)?;
        merged.add.retain(|existing| existing.path != dev.path);
        merged.add.push(dev.clone());
    }
    Ok(())
}

fn merge_namespaces(
    container_id: &str,
    plugin: &str,
    delta: protobuf::MessageField<api::NamespaceList>,
    owners: &mut OwnershipTracker,
    out: &mut protobuf::MessageField<api::NamespaceList>,
) -> Result<()> {
    let Some(delta) = delta.into_option() else {
        return Ok(());
    };
    let merged = out.mut_or_insert_default();

    for ns in &delta.replace {
        owners.claim_compound(container_id, "namespaces", &ns.type_, plugin)?;
        merged.replace.retain(|existing| existing.type_ != ns.type_);
        merged.replace.push(ns.clone());
    }
    Ok(())
}

fn merge_hooks(
    container_id: &str,
    plugin: &str,
    adj: &api::ContainerAdjustment,
    owners: &mut OwnershipTracker,
    out: &mut api::ContainerAdjustment,
) -> Result<()> {
    let groups: [(&Vec<api::OCIHook>, &mut Vec<api::OCIHook>); 6] = [
        (&adj.hooks_prestart, &mut out.hooks_prestart),
        (&adj.hooks_create_runtime, &mut out.hooks_create_runtime),
        (&adj.hooks_create_container, &mut out.hooks_create_container),
        (&adj.hooks_start_container, &mut out.hooks_start_container),
        (&adj.hooks_poststart, &mut out.hooks_poststart),
        (&adj.hooks_poststop, &mut out.hooks_poststop),
    ];
    let mut touched = false;
    for (src, dst) in groups {
        if !src.is_empty() {
            dst.extend(src.iter().cloned());
            touched = true;
        }
    }
    if touched {
        owners.append_hook_owner(container_id, plugin);
    }
    let _ = HOOKS_FIELD; // field name kept for validator cross-reference
    Ok(())
}

fn merge_seccomp(
    container_id: &str,
    plugin: &str,
    delta: protobuf::MessageField<api::SeccompProfile>,
    owners: &mut OwnershipTracker,
    out: &mut api::ContainerAdjustment,
) -> Result<()> {
    let Some(profile) = delta.into_option() else {
        return Ok(());
    };
    owners.claim_simple(container_id, SECCOMP_FIELD, plugin)?;
    out.seccomp = protobuf::MessageField::some(profile);
    Ok(())
}

fn merge_capabilities(
    container_id: &str,
    plugin: &str,
    delta: protobuf::MessageField<api::LinuxCapabilities>,
    owners: &mut OwnershipTracker,
    out: &mut api::ContainerAdjustment,
) -> Result<()> {
    let Some(caps) = delta.into_option() else {
        return Ok(());
    };
    let merged = out.capabilities_add.mut_or_insert_default();

    if !caps.bounding.is_empty() {
        owners.claim_simple(container_id, "linux.capabilities.bounding", plugin)?;
        merged.bounding = caps.bounding;
    }
    if !caps.effective.is_empty() {
        owners.claim_simple(container_id, "linux.capabilities.effective", plugin)?;
        merged.effective = caps.effective;
    }
    if !caps.inheritable.is_empty() {
        owners.claim_simple(container_id, "linux.capabilities.inheritable", plugin)?;
        merged.inheritable = caps.inheritable;
    }
    if !caps.permitted.is_empty() {
        owners.claim_simple(container_id, "linux.capabilities.permitted", plugin)?;
        merged.permitted = caps.permitted;
    }
    if !caps.ambient.is_empty() {
        owners.claim_simple(container_id, "linux.capabilities.ambient", plugin)?;
        merged.ambient = caps.ambient;
    }
    Ok(())
}

fn merge_rlimits(
    container_id: &str,
    plugin: &str,
    rlimits: Vec<api::POSIXRlimit>,
    owners: &mut OwnershipTracker,
    out: &mut api::ContainerAdjustment,
) -> Result<()> {
    for rl in rlimits {
        owners.claim_compound(container_id, "rlimits", &rl.type_, plugin)?;
        out.rlimits.retain(|existing| existing.type_ != rl.type_);
        out.rlimits.push(rl);
    }
    Ok(())
}

fn merge_sysctls(
    container_id: &str,
    plugin: &str,
    add: Vec<api::KeyValue>,
    remove: Vec<String>,
    owners: &mut OwnershipTracker,
    out: &mut api::ContainerAdjustment,
) -> Result<()> {
    for key in remove {
        owners.clear_compound(container_id, "sysctls", &key, plugin)?;
        out.sysctls_remove.push(key.clone());
        out.sysctls_add.retain(|kv| kv.key != key);
    }
    for kv in add {
        owners.claim_compound(container_id, "sysctls", &kv.key, plugin)?;
        out.sysctls_add.retain(|existing| existing.key != kv.key);
        out.sysctls_add.push(kv);
    }
    Ok(())
}

fn merge_resources(
    container_id: &str,
    plugin: &str,
    delta: protobuf::MessageField<api::LinuxResourcesAdjustment>,
    clear: &[String],
    owners: &mut OwnershipTracker,
    out: &mut api::ContainerAdjustment,
) -> Result<()> {
    for field in clear {
        owners.claim_simple(container_id, field, plugin)?;
        out.linux_resources_clear.push(field.clone());
    }

    let Some(delta) = delta.into_option() else {
        return Ok(());
    };
    let merged = out.linux_resources.mut_or_insert_default();

    if let Some(v) = delta.cpu_shares {
        owners.claim_simple(container_id, "linux.resources.cpu.shares", plugin)?;
        merged.cpu_shares = Some(v);
    }
    if let Some(v) = delta.cpu_quota {
        owners.claim_simple(container_id, "linux.resources.cpu.quota", plugin)?;
        merged.cpu_quota = Some(v);
    }
    if let Some(v) = delta.cpu_period {
        owners.claim_simple(container_id, "linux.resources.cpu.period", plugin)?;
        merged.cpu_period = Some(v);
    }
    if let Some(v) = delta.memory_limit {
        owners.claim_simple(container_id, "linux.resources.memory.limit", plugin)?;
        merged.memory_limit = Some(v);
    }
    if let Some(v) = delta.block_io_weight {
        owners.claim_simple(container_id, "linux.resources.blockio.weight", plugin)?;
        merged.block_io_weight = Some(v);
    }
    if let Some(v) = delta.pids_limit {
        owners.claim_simple(container_id, "linux.resources.pids.limit", plugin)?;
        merged.pids_limit = Some(v);
    }

    if let Some(cpus) = &delta.cpuset_cpus {
        owners.claim_simple(container_id, "linux.resources.cpu.cpus", plugin)?;
        let op = delta.cpuset_cpus_op.as_deref().unwrap_or("replace");
        merged.cpuset_cpus = Some(apply_mask_op(op, merged.cpuset_cpus.as_deref(), cpus));
    }
    if let Some(mems) = &delta.cpuset_mems {
        owners.claim_simple(container_id, "linux.resources.cpu.mems", plugin)?;
        let op = delta.cpuset_mems_op.as_deref().unwrap_or("replace");
        merged.cpuset_mems = Some(apply_mask_op(op, merged.cpuset_mems.as_deref(), mems));
    }

    for limit in &delta.hugepage_limits_add {
        owners.claim_compound(container_id, "hugepages", &limit.page_size, plugin)?;
        merged
            .hugepage_limits_add
            .retain(|existing| existing.page_size != limit.page_size);
        merged.hugepage_limits_add.push(limit.clone());
    }
    for page_size in &delta.hugepage_limits_remove {
        owners.clear_compound(container_id, "hugepages", page_size, plugin)?;
        merged.hugepage_limits_remove.push(page_size.clone());
    }

    for kv in &delta.unified_add {
        owners.claim_compound(container_id, "unified", &kv.key, plugin)?;
        merged.unified_add.retain(|existing| existing.key != kv.key);
        merged.unified_add.push(kv.clone());
    }
    for key in &delta.unified_remove {
        owners.clear_compound(container_id, "unified", key, plugin)?;
        merged.unified_remove.push(key.clone());
    }

    Ok(())
}

/// Parses a cpuset-style string (`"0,2-4,7"`) into a set of CPU/node ids.
fn parse_mask(s: &str) -> BTreeSet<u32> {
    let mut set = BTreeSet::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if let Some((lo, hi)) = part.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) {
                for n in lo..=hi {
                    set.insert(n);
                }
            }
        } else if let Ok(n) = part.parse::<u32>() {
            set.insert(n);
        }
    }
    set
}

fn format_mask(set: &BTreeSet<u32>) -> String {
    set.iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Applies a union/intersect/replace operator between the current mask
/// string and a plugin's proposed one.
fn apply_mask_op(op: &str, current: Option<&str>, proposed: &str) -> String {
    let proposed_set = parse_mask(proposed);
    let merged = match (op, current) {
        ("replace", _) | (_, None) => proposed_set,
        ("union", Some(cur)) => parse_mask(cur).union(&proposed_set).copied().collect(),
        ("intersect", Some(cur)) => parse_mask(cur).intersection(&proposed_set).copied().collect(),
        (_, Some(cur)) => {
            log::warn!("unknown cpuset merge operator {op:?}, falling back to replace");
            let _ = cur;
            proposed_set
        }
    };
    format_mask(&merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysExists;
    impl ContainerLookup for AlwaysExists {
        fn exists(&self, _id: &str) -> bool {
            true
        }
    }
    struct NeverExists;
    impl ContainerLookup for NeverExists {
        fn exists(&self, _id: &str) -> bool {
            false
        }
    }

    fn cpu_shares_adjustment(shares: i64) -> api::ContainerAdjustment {
        let mut adj = api::ContainerAdjustment::new();
        let mut res = api::LinuxResourcesAdjustment::new();
        res.cpu_shares = Some(shares);
        adj.linux_resources = protobuf::MessageField::some(res);
        adj
    }

    #[test]
    fn disjoint_plugins_both_apply() {
        let mut owners = OwnershipTracker::new();
        let mut adj_a = api::ContainerAdjustment::new();
        adj_a.annotations = protobuf::MessageField::some({
            let mut sl = api::StringList::new();
            sl.add.push({
                let mut kv = api::KeyValue::new();
                kv.key = "a".into();
                kv.value = "1".into();
                kv
            });
            sl
        });
        let mut adj_b = api::ContainerAdjustment::new();
        adj_b.annotations = protobuf::MessageField::some({
            let mut sl = api::StringList::new();
            sl.add.push({
                let mut kv = api::KeyValue::new();
                kv.key = "b".into();
                kv.value = "2".into();
                kv
            });
            sl
        });

        let result = merge(
            "c1",
            vec![
                Proposal { plugin: "10-a".into(), adjustment: Some(adj_a), updates: vec![] },
                Proposal { plugin: "20-b".into(), adjustment: Some(adj_b), updates: vec![] },
            ],
            &mut owners,
            &AlwaysExists,
        )
        .unwrap();

        let annotations = result.adjustment.annotations.unwrap();
        assert_eq!(annotations.add.len(), 2);
    }

    #[test]
    fn conflicting_simple_field_fails_whole_event() {
        let mut owners = OwnershipTracker::new();
        let a = cpu_shares_adjustment(512);
        let b = cpu_shares_adjustment(1024);

        let err = merge(
            "c1",
            vec![
                Proposal { plugin: "10-a".into(), adjustment: Some(a), updates: vec![] },
                Proposal { plugin: "20-b".into(), adjustment: Some(b), updates: vec![] },
            ],
            &mut owners,
            &AlwaysExists,
        )
        .unwrap_err();

        assert!(matches!(err, Error::OwnershipConflict { .. }));
    }

    #[test]
    fn ignorable_update_on_missing_container_is_swallowed() {
        let mut owners = OwnershipTracker::new();
        let mut update = api::ContainerUpdate::new();
        update.container_id = "ghost".into();
        update.ignore_failure = true;

        let result = merge(
            "c1",
            vec![Proposal { plugin: "10-a".into(), adjustment: None, updates: vec![update] }],
            &mut owners,
            &NeverExists,
        )
        .unwrap();

        assert!(result.updates.is_empty());
    }

    #[test]
    fn non_ignorable_update_on_missing_container_fails() {
        let mut owners = OwnershipTracker::new();
        let mut update = api::ContainerUpdate::new();
        update.container_id = "ghost".into();
        update.ignore_failure = false;

        let err = merge(
            "c1",
            vec![Proposal { plugin: "10-a".into(), adjustment: None, updates: vec![update] }],
            &mut owners,
            &NeverExists,
        )
        .unwrap_err();

        assert!(matches!(err, Error::ContainerNotFound(_)));
    }

    #[test]
    fn cpuset_union_merges_ranges() {
        assert_eq!(apply_mask_op("union", Some("0-1"), "2,3"), "0,1,2,3");
        assert_eq!(apply_mask_op("intersect", Some("0-3"), "2,3,4"), "2,3");
        assert_eq!(apply_mask_op("replace", Some("0-3"), "9"), "9");
    }

    #[test]
    fn merge_is_associative_for_conflict_free_proposals() {
        // [A, B] in one event should equal applying A alone, then B alone
        // against the result, when they touch disjoint compound keys.
        let mut owners_ab = OwnershipTracker::new();
        let mut adj_a = api::ContainerAdjustment::new();
        adj_a.mounts = protobuf::MessageField::some({
            let mut ml = api::MountList::new();
            ml.add.push({
                let mut m = api::Mount::new();
                m.destination = "/a".into();
                m
            });
            ml
        });
        let mut adj_b = api::ContainerAdjustment::new();
        adj_b.mounts = protobuf::MessageField::some({
            let mut ml = api::MountList::new();
            ml.add.push({
                let mut m = api::Mount::new();
                m.destination = "/b".into();
                m
            });
            ml
        });

        let combined = merge(
            "c1",
            vec![
                Proposal { plugin: "10-a".into(), adjustment: Some(adj_a.clone()), updates: vec![] },
                Proposal { plugin: "20-b".into(), adjustment: Some(adj_b.clone()), updates: vec![] },
            ],
            &mut owners_ab,
            &AlwaysExists,
        )
        .unwrap();

        let mut owners_a = OwnershipTracker::new();
        let only_a = merge(
            "c1",
            vec![Proposal { plugin: "10-a".into(), adjustment: Some(adj_a), updates: vec![] }],
            &mut owners_a,
            &AlwaysExists,
        )
        .unwrap();
        let mut owners_b = OwnershipTracker::new();
        let only_b = merge(
            "c1",
            vec![Proposal { plugin: "20-b".into(), adjustment: Some(adj_b), updates: vec![] }],
            &mut owners_b,
            &AlwaysExists,
        )
        .unwrap();

        let mut combined_dest: Vec<_> = combined
            .adjustment
            .mounts
            .unwrap()
            .add
            .iter()
            .map(|m| m.destination.clone())
            .collect();
        combined_dest.sort();

        let mut sequential_dest: Vec<_> = only_a
            .adjustment
            .mounts
            .unwrap()
            .add
            .iter()
            .map(|m| m.destination.clone())
            .chain(only_b.adjustment.mounts.unwrap().add.iter().map(|m| m.destination.clone()))
            .collect();
        sequential_dest.sort();

        assert_eq!(combined_dest, sequential_dest);
    }
}
