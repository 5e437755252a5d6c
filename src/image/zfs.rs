//! ZFS pool discovery for images whose data partition is `freebsd-zfs`.
//!
//! Images usually carry a pool named `zroot`, which may collide with the
//! host's own pool. The image pool is therefore imported by GUID under a
//! per-run temporary name. The import listing is validated rather than
//! assumed to contain exactly one pool.

use crate::error::{Error, Result};
use crate::resource::run_scoped_suffix;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolCandidate {
    pub name: String,
    pub guid: String,
}

/// Parse the pool list printed by `zpool import -d <device>` (no pool argument).
pub fn parse_import_listing(output: &str) -> Vec<PoolCandidate> {
    let mut candidates = Vec::new();
    let mut pending_name: Option<String> = None;
    for line in output.lines() {
        let line = line.trim();
        if let Some(name) = line.strip_prefix("pool:") {
            pending_name = Some(name.trim().to_string());
        } else if let Some(guid) = line.strip_prefix("id:") {
            if let Some(name) = pending_name.take() {
                candidates.push(PoolCandidate {
                    name,
                    guid: guid.trim().to_string(),
                });
            }
        }
    }
    candidates
}

/// Exactly one importable pool must be found on the partition.
pub fn select_pool(device: &str, candidates: Vec<PoolCandidate>) -> Result<PoolCandidate> {
    let action = format!("selecting ZFS pool on '{device}'");
    match <[PoolCandidate; 1]>::try_from(candidates) {
        Ok([pool]) => Ok(pool),
        Err(candidates) if candidates.is_empty() => {
            Err(Error::resource(action, "no importable pool found"))
        }
        Err(candidates) => Err(Error::resource(
            action,
            format!(
                "{} candidate pools found ({}); refusing to guess",
                candidates.len(),
                candidates
                    .iter()
                    .map(|c| format!("{} [{}]", c.name, c.guid))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        )),
    }
}

/// Temporary pool name unique to this run.
pub fn scoped_pool_name() -> String {
    format!("repro{}", run_scoped_suffix().replace('-', ""))
}

/// Boot dataset of an imported pool from `zpool get -H -o value bootfs`.
///
/// The property may still name the pool's original name; it is rebased onto
/// the temporary one. Unset (`-`) falls back to `<pool>/ROOT/default`.
pub fn boot_dataset(pool: &str, bootfs_value: &str) -> String {
    let value = bootfs_value.trim();
    if value.is_empty() || value == "-" {
        return format!("{pool}/ROOT/default");
    }
    match value.split_once('/') {
        Some((_, rest)) => format!("{pool}/{rest}"),
        None => pool.to_string(),
    }
}

/// Datasets to mount after the boot dataset, parsed from
/// `zfs list -H -o name,canmount,mountpoint -r <pool>`, shallowest mountpoint first.
pub fn mountable_datasets(listing: &str, boot_dataset: &str) -> Vec<String> {
    let mut datasets: Vec<(String, String)> = listing
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let name = fields.next()?.trim();
            let canmount = fields.next()?.trim();
            let mountpoint = fields.next()?.trim();
            let mountable = canmount == "on"
                && mountpoint.starts_with('/')
                && name != boot_dataset;
            mountable.then(|| (mountpoint.to_string(), name.to_string()))
        })
        .collect();
    datasets.sort_by(|a, b| {
        let depth = |m: &str| m.matches('/').count();
        depth(&a.0).cmp(&depth(&b.0)).then_with(|| a.0.cmp(&b.0))
    });
    datasets.into_iter().map(|(_, name)| name).collect()
}
