//! Atomic bundle replacement.
//!
//! A group's live bundle path is a symlink to a verified version directory.
//! New artifacts are written to a hidden staging directory, parsed back,
//! promoted to a version and swapped in by renaming a fresh symlink over the
//! live one, so the live path always resolves to a complete bundle. The
//! previous version stays reachable as `<group>.prev` until the next
//! replacement.
//!
//! ```text
//! <cert-root>/
//! ├── main -> .main.v-<stamp>        # live bundle
//! ├── main.prev -> .main.v-<stamp>   # previous bundle (rollback target)
//! ├── .main.v-<stamp>/               # verified versions
//! └── .main.new-<uuid>/              # staging, only during install
//! ```
//!
//! A plain directory found at the live path (certificates placed by hand or
//! by another tool) is adopted as a version on the first install.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::bundle::{read_bundle, CertificateBundle, CHAIN, FULLCHAIN, PRIVKEY};
use crate::error::StorageError;
use crate::fsutil::write_atomic;

/// A freshly issued certificate as returned by the authority
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// PEM chain, leaf first
    pub chain_pem: String,
    /// PEM private key of the leaf
    pub key_pem: String,
}

impl IssuedCertificate {
    /// Intermediates of the chain, or the leaf itself for a single-certificate chain
    pub fn intermediates_pem(&self) -> String {
        let blocks = match pem::parse_many(&self.chain_pem) {
            Ok(blocks) => blocks,
            Err(_) => return self.chain_pem.clone(),
        };
        if blocks.len() < 2 {
            return self.chain_pem.clone();
        }
        pem::encode_many(&blocks[1..])
    }
}

const HIDDEN_PREFIX: &str = ".";
const STAGING_MARKER: &str = ".new-";
const VERSION_MARKER: &str = ".v-";
const LINK_MARKER: &str = ".link-";

pub(super) fn group_dir(root: &Path, group: &str) -> PathBuf {
    root.join(group)
}

pub(super) fn prev_dir(root: &Path, group: &str) -> PathBuf {
    root.join(format!("{}.prev", group))
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn staging_dir(root: &Path, group: &str) -> PathBuf {
    root.join(format!(
        "{}{}{}{}",
        HIDDEN_PREFIX,
        group,
        STAGING_MARKER,
        uuid::Uuid::new_v4().simple()
    ))
}

/// Version names sort by creation time
fn version_dir(root: &Path, group: &str) -> PathBuf {
    root.join(format!(
        "{}{}{}{}-{}",
        HIDDEN_PREFIX,
        group,
        VERSION_MARKER,
        Utc::now().format("%Y%m%d%H%M%S%6f"),
        short_id()
    ))
}

/// Point `link` at `target` by renaming a new symlink over it
fn swap_link(root: &Path, link: &Path, target: &Path) -> io::Result<()> {
    let name = link
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let relative = target.file_name().unwrap_or(target.as_os_str());
    let temp = root.join(format!("{}{}{}{}", HIDDEN_PREFIX, name, LINK_MARKER, short_id()));
    symlink(relative, &temp)?;
    if let Err(e) = fs::rename(&temp, link) {
        let _ = fs::remove_file(&temp);
        return Err(e);
    }
    Ok(())
}

/// Version directory `link` points at, if it is a symlink
fn link_target(root: &Path, link: &Path) -> io::Result<Option<PathBuf>> {
    match fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_symlink() => Ok(Some(root.join(fs::read_link(link)?))),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn remove_link(link: &Path) -> io::Result<()> {
    match fs::remove_file(link) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Version currently live for `group`, adopting a plain directory
fn live_version(root: &Path, group: &str) -> Result<Option<PathBuf>, StorageError> {
    let live = group_dir(root, group);
    let meta = match fs::symlink_metadata(&live) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if meta.file_type().is_symlink() {
        return Ok(link_target(root, &live)?);
    }
    if !meta.is_dir() {
        return Err(StorageError::Verification {
            group: group.to_string(),
            reason: format!("{} is neither a directory nor a symlink", live.display()),
        });
    }

    let adopted = version_dir(root, group);
    fs::rename(&live, &adopted)?;
    swap_link(root, &live, &adopted)?;
    info!(group = %group, version = %adopted.display(), "Adopted existing bundle directory");
    Ok(Some(adopted))
}

/// Persist `issued` as the live bundle of `group`
pub(super) fn install(
    root: &Path,
    group: &str,
    issued: &IssuedCertificate,
) -> Result<CertificateBundle, StorageError> {
    fs::create_dir_all(root)?;

    let staging = staging_dir(root, group);
    fs::create_dir_all(&staging)?;

    let bundle = match stage_artifacts(&staging, group, issued) {
        Ok(bundle) => bundle,
        Err(e) => {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }
    };

    let version = version_dir(root, group);
    if let Err(e) = fs::rename(&staging, &version) {
        let _ = fs::remove_dir_all(&staging);
        return Err(e.into());
    }

    activate(root, group, &version, &bundle.fingerprint)
}

/// Make `version` live, keep the replaced version as `.prev` and verify what
/// the serving layer will read. A failed verification restores the previous
/// state; on a first install the group is left without a bundle.
fn activate(
    root: &Path,
    group: &str,
    version: &Path,
    fingerprint: &str,
) -> Result<CertificateBundle, StorageError> {
    let live = group_dir(root, group);
    let prev = prev_dir(root, group);

    let previous = match live_version(root, group) {
        Ok(previous) => previous,
        Err(e) => {
            let _ = fs::remove_dir_all(version);
            return Err(e);
        }
    };
    let stale = link_target(root, &prev)?;

    if let Err(e) = swap_link(root, &live, version) {
        warn!(group = %group, error = %e, "Bundle swap failed, live bundle unchanged");
        let _ = fs::remove_dir_all(version);
        return Err(e.into());
    }
    if let Some(ref previous) = previous {
        swap_link(root, &prev, previous)?;
        debug!(group = %group, prev = %previous.display(), "Retained previous bundle");
    }

    let reason = match read_bundle(&live, group) {
        Ok(installed) if installed.fingerprint == fingerprint => {
            if let Some(stale) = stale.filter(|s| Some(s) != previous.as_ref() && s != version) {
                if let Err(e) = fs::remove_dir_all(&stale) {
                    warn!(group = %group, error = %e, "Failed to remove superseded bundle");
                }
            }
            info!(
                group = %group,
                not_after = %installed.not_after,
                fingerprint = %&installed.fingerprint[..16],
                "Installed certificate bundle"
            );
            return Ok(installed);
        }
        Ok(_) => "installed bundle differs from the staged bundle".to_string(),
        Err(e) => e.to_string(),
    };

    match previous {
        Some(ref previous) => {
            swap_link(root, &live, previous)?;
            match stale {
                Some(ref stale) => swap_link(root, &prev, stale)?,
                None => remove_link(&prev)?,
            }
            warn!(group = %group, "Restored previous bundle after failed verification");
        }
        None => {
            remove_link(&live)?;
            warn!(group = %group, "Withdrew unverified first bundle");
        }
    }
    let _ = fs::remove_dir_all(version);
    Err(StorageError::Verification {
        group: group.to_string(),
        reason,
    })
}

fn stage_artifacts(
    staging: &Path,
    group: &str,
    issued: &IssuedCertificate,
) -> Result<CertificateBundle, StorageError> {
    write_atomic(&staging.join(FULLCHAIN), issued.chain_pem.as_bytes(), Some(0o644))?;
    write_atomic(
        &staging.join(CHAIN),
        issued.intermediates_pem().as_bytes(),
        Some(0o644),
    )?;
    write_atomic(&staging.join(PRIVKEY), issued.key_pem.as_bytes(), Some(0o600))?;

    let bundle = read_bundle(staging, group).map_err(|e| StorageError::Verification {
        group: group.to_string(),
        reason: e.to_string(),
    })?;

    if bundle.is_expired(Utc::now()) {
        return Err(StorageError::Verification {
            group: group.to_string(),
            reason: format!("certificate already expired at {}", bundle.not_after),
        });
    }

    Ok(bundle)
}

/// Point the live bundle back at `<group>.prev`
pub(super) fn rollback(root: &Path, group: &str) -> Result<(), StorageError> {
    let live = group_dir(root, group);
    let prev = prev_dir(root, group);

    let Some(target) = link_target(root, &prev)? else {
        return Err(StorageError::NoPrevious(group.to_string()));
    };
    let failed = link_target(root, &live)?;

    swap_link(root, &live, &target)?;
    fs::remove_file(&prev)?;
    if let Some(failed) = failed.filter(|f| *f != target) {
        fs::remove_dir_all(&failed)?;
    }

    warn!(group = %group, "Rolled certificate bundle back to previous version");
    Ok(())
}

/// Repair swaps interrupted by a crash. Returns the groups that were touched.
///
/// Staging directories and temporary links are removed. A group whose live
/// link is missing or dangling is pointed at its previous version, or at its
/// newest version when none is retained. Versions no link refers to are
/// deleted.
pub(super) fn recover_interrupted(root: &Path) -> Result<Vec<String>, StorageError> {
    let mut recovered: Vec<String> = Vec::new();
    if !root.exists() {
        return Ok(recovered);
    }

    let mut versions: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let Some(rest) = name.strip_prefix(HIDDEN_PREFIX) else {
            continue;
        };

        if let Some((group, _)) = rest.split_once(STAGING_MARKER) {
            fs::remove_dir_all(entry.path())?;
            debug!(group = %group, dir = %name, "Removed leftover staging directory");
            note(&mut recovered, group);
        } else if let Some((group, _)) = rest.split_once(LINK_MARKER) {
            fs::remove_file(entry.path())?;
            debug!(dir = %name, "Removed leftover temporary link");
            let group = group.strip_suffix(".prev").unwrap_or(group);
            note(&mut recovered, group);
        } else if let Some((group, _)) = rest.split_once(VERSION_MARKER) {
            versions.entry(group.to_string()).or_default().push(entry.path());
        }
    }

    for (group, mut dirs) in versions {
        dirs.sort();
        let live = group_dir(root, &group);
        let prev = prev_dir(root, &group);

        let mut current = link_target(root, &live)?.filter(|t| t.is_dir());
        let mut retained = link_target(root, &prev)?.filter(|t| t.is_dir());

        if current.is_none() && !live.is_dir() {
            let target = match retained.take() {
                Some(target) => {
                    remove_link(&prev)?;
                    target
                }
                None => match dirs.last() {
                    Some(newest) => newest.clone(),
                    None => continue,
                },
            };
            swap_link(root, &live, &target)?;
            warn!(group = %group, version = %target.display(), "Restored live bundle from interrupted install");
            current = Some(target);
            note(&mut recovered, &group);
        }

        for dir in dirs {
            if Some(&dir) != current.as_ref() && Some(&dir) != retained.as_ref() {
                fs::remove_dir_all(&dir)?;
                debug!(group = %group, dir = %dir.display(), "Removed unreferenced bundle version");
                note(&mut recovered, &group);
            }
        }
    }

    Ok(recovered)
}

fn note(recovered: &mut Vec<String>, group: &str) {
    if !recovered.iter().any(|g| g == group) {
        recovered.push(group.to_string());
    }
}
