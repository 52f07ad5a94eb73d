//! Read-only drift inspection of a provisioned host

use serde::Serialize;
use std::fmt;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::account::{self, AccountDb, AccountState, ServiceAccount};
use crate::error::{AccountCreationError, FilesystemError, ProvisionError};
use crate::fsops;
use crate::paths::{HostLayout, ASSET_MODE, CONFIG_MODE, DIR_MODE, LOGO_MODE, RC_SCRIPT_MODE};
use crate::source::{self, SourceBundle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Missing,
    Drift,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Ok => "ok",
            Status::Missing => "missing",
            Status::Drift => "drift",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub resource: String,
    pub status: Status,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckReport {
    pub findings: Vec<Finding>,
    pub warnings: Vec<String>,
}

impl CheckReport {
    pub fn converged(&self) -> bool {
        self.findings.iter().all(|f| f.status == Status::Ok)
    }

    pub fn finding(&self, resource: &str) -> Option<&Finding> {
        self.findings.iter().find(|f| f.resource == resource)
    }

    fn push(&mut self, resource: impl Into<String>, status: Status, detail: impl Into<String>) {
        self.findings.push(Finding {
            resource: resource.into(),
            status,
            detail: detail.into(),
        });
    }
}

/// Inspect every provisioned resource without modifying anything.
///
/// With a source bundle, installed content is also compared against it.
pub fn inspect(
    layout: &HostLayout,
    account: &ServiceAccount,
    source: Option<&SourceBundle>,
) -> Result<CheckReport, ProvisionError> {
    let mut report = CheckReport::default();

    let owner = check_account(layout, account, &mut report)?;

    for dir in layout.owned_dirs() {
        check_dir(&dir, owner, &mut report)?;
    }

    check_fonts(layout, source, &mut report)?;

    if let Some(logo) = source.and_then(SourceBundle::logo) {
        check_file(&layout.logo(), LOGO_MODE, Some(logo), &mut report)?;
    }

    check_file(
        &layout.rc_script(),
        RC_SCRIPT_MODE,
        source.map(|s| s.rc_template()).as_deref(),
        &mut report,
    )?;

    // Config content may legitimately differ from the template, so only mode is compared
    let want_config = source.map_or(true, |s| s.config_template().is_some());
    if want_config {
        check_file(&layout.config_file(), CONFIG_MODE, None, &mut report)?;
    }

    Ok(report)
}

fn check_account(
    layout: &HostLayout,
    account: &ServiceAccount,
    report: &mut CheckReport,
) -> Result<Option<(u32, u32)>, ProvisionError> {
    let resource = format!("account {}", account.name);
    let db = AccountDb::load(layout)?;

    match account::inspect(&db, account) {
        Ok(AccountState::Present { uid, gid }) => {
            report.push(resource, Status::Ok, format!("uid {uid}, gid {gid}"));
            Ok(Some((uid, gid)))
        }
        Ok(AccountState::Absent) => {
            report.push(resource, Status::Missing, "not in passwd");
            Ok(None)
        }
        Err(AccountCreationError::Conflict { reason, .. }) => {
            report.push(resource, Status::Drift, reason);
            Ok(db.user(&account.name).map(|u| (u.uid, u.gid)))
        }
        Err(e) => Err(e.into()),
    }
}

fn check_dir(dir: &Path, owner: Option<(u32, u32)>, report: &mut CheckReport) -> Result<(), FilesystemError> {
    let resource = dir.display().to_string();

    let Some(meta) = fsops::metadata(dir)? else {
        report.push(resource, Status::Missing, "does not exist");
        return Ok(());
    };

    let mut problems = Vec::new();
    if !meta.is_dir() {
        problems.push("not a directory".to_string());
    } else {
        if fsops::mode_of(&meta) != DIR_MODE {
            problems.push(format!("mode {:o}, want {:o}", fsops::mode_of(&meta), DIR_MODE));
        }
        if let Some((uid, gid)) = owner {
            if (meta.uid(), meta.gid()) != (uid, gid) {
                problems.push(format!("owned by {}:{}, want {uid}:{gid}", meta.uid(), meta.gid()));
            }
        }
    }

    push_problems(report, resource, problems);
    Ok(())
}

fn check_fonts(
    layout: &HostLayout,
    source: Option<&SourceBundle>,
    report: &mut CheckReport,
) -> Result<(), FilesystemError> {
    let dest = layout.fonts_dir();
    let resource = dest.display().to_string();

    match fsops::metadata(&dest)? {
        None => {
            report.push(resource, Status::Missing, "does not exist");
            return Ok(());
        }
        Some(meta) if !meta.is_dir() => {
            report.push(resource, Status::Drift, "not a directory");
            return Ok(());
        }
        Some(_) => {}
    }

    for font in source::missing_fonts_in(&dest) {
        report.warnings.push(format!("{} is missing {font}", dest.display()));
    }

    let mut problems = Vec::new();
    tree_modes(&dest, &dest, &mut problems)?;
    if let Some(source) = source {
        tree_content(&source.fonts_dir(), &dest, Path::new(""), &mut problems)?;
    }

    push_problems(report, resource, problems);
    Ok(())
}

/// Entries below `dir` whose mode is not the asset mode, and any symlinks
fn tree_modes(base: &Path, dir: &Path, problems: &mut Vec<String>) -> Result<(), FilesystemError> {
    let meta = fs::symlink_metadata(dir).map_err(|e| FilesystemError::io("inspect", dir, e))?;
    let rel = dir.strip_prefix(base).unwrap_or(dir);
    if meta.file_type().is_symlink() {
        problems.push(format!("{} is a symlink", display_rel(rel)));
        return Ok(());
    }
    if fsops::mode_of(&meta) != ASSET_MODE {
        problems.push(format!("{} has mode {:o}", display_rel(rel), fsops::mode_of(&meta)));
    }

    if meta.is_dir() {
        for entry in read_dir(dir)? {
            tree_modes(base, &entry, problems)?;
        }
    }
    Ok(())
}

/// Source files that are absent or different under `dest`
fn tree_content(src: &Path, dest: &Path, rel: &Path, problems: &mut Vec<String>) -> Result<(), FilesystemError> {
    for from in read_dir(src)? {
        let Some(name) = from.file_name() else { continue };
        let to = dest.join(name);
        let rel = rel.join(name);
        let installed = fsops::metadata(&to)?;

        if from.is_dir() {
            if installed.as_ref().is_some_and(|m| m.is_dir()) {
                tree_content(&from, &to, &rel, problems)?;
            } else {
                problems.push(format!("{} missing", display_rel(&rel)));
            }
        } else if from.is_file() {
            if !installed.as_ref().is_some_and(|m| m.is_file()) {
                problems.push(format!("{} missing", display_rel(&rel)));
            } else if !fsops::same_content(&from, &to)? {
                problems.push(format!("{} differs from source", display_rel(&rel)));
            }
        }
    }
    Ok(())
}

fn check_file(
    path: &Path,
    mode: u32,
    expected: Option<&Path>,
    report: &mut CheckReport,
) -> Result<(), FilesystemError> {
    let resource = path.display().to_string();

    let Some(meta) = fsops::metadata(path)? else {
        report.push(resource, Status::Missing, "does not exist");
        return Ok(());
    };

    let mut problems = Vec::new();
    if !meta.is_file() {
        problems.push("not a regular file".to_string());
    } else {
        if fsops::mode_of(&meta) != mode {
            problems.push(format!("mode {:o}, want {:o}", fsops::mode_of(&meta), mode));
        }
        if let Some(expected) = expected {
            if !fsops::same_content(expected, path)? {
                problems.push("differs from source".to_string());
            }
        }
    }

    push_problems(report, resource, problems);
    Ok(())
}

fn push_problems(report: &mut CheckReport, resource: String, problems: Vec<String>) {
    if problems.is_empty() {
        report.push(resource, Status::Ok, "");
    } else {
        report.push(resource, Status::Drift, problems.join("; "));
    }
}

fn read_dir(dir: &Path) -> Result<Vec<PathBuf>, FilesystemError> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| FilesystemError::io("read directory", dir, e))?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| FilesystemError::io("read directory", dir, e))?;
    entries.sort();
    Ok(entries)
}

fn display_rel(rel: &Path) -> String {
    if rel.as_os_str().is_empty() {
        ".".to_string()
    } else {
        rel.display().to_string()
    }
}
