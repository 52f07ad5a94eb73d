//! Ordered, fail-fast provisioning procedure
//!
//! Steps run in a fixed order and each one converges its resource toward the
//! desired state. The first failing step stops the run; nothing is rolled
//! back, and re-running picks up where the failure left off.

use serde::Serialize;
use std::fmt;

use crate::account::{self, AccountBackend, AccountDb, AccountState, ServiceAccount};
use crate::error::{AccountCreationError, FilesystemError, ProvisionError, StepFailure};
use crate::fsops::{self, Outcome};
use crate::paths::{HostLayout, ASSET_MODE, DIR_MODE, LOGO_MODE};
use crate::service;
use crate::source::SourceBundle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    Account,
    Directories,
    Ownership,
    Assets,
    InitScript,
    Config,
}

impl Step {
    /// Execution order
    pub const ALL: [Step; 6] = [
        Step::Account,
        Step::Directories,
        Step::Ownership,
        Step::Assets,
        Step::InitScript,
        Step::Config,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Step::Account => "account",
            Step::Directories => "directories",
            Step::Ownership => "ownership",
            Step::Assets => "assets",
            Step::InitScript => "init-script",
            Step::Config => "config",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of one completed step
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: Step,
    pub outcome: Outcome,
    pub detail: String,
}

impl StepReport {
    fn new(step: Step, outcome: Outcome, detail: impl Into<String>) -> Self {
        Self {
            step,
            outcome,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Whether the process may create accounts
    pub privileged: bool,
    pub install_config: bool,
    pub overwrite_config: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            privileged: false,
            install_config: true,
            overwrite_config: false,
        }
    }
}

pub struct Provisioner<'a> {
    layout: &'a HostLayout,
    source: &'a SourceBundle,
    account: &'a ServiceAccount,
    backend: &'a dyn AccountBackend,
    options: Options,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        layout: &'a HostLayout,
        source: &'a SourceBundle,
        account: &'a ServiceAccount,
        backend: &'a dyn AccountBackend,
        options: Options,
    ) -> Self {
        Self {
            layout,
            source,
            account,
            backend,
            options,
        }
    }

    /// Run every step in order, calling `on_step` after each success.
    pub fn run(&self, mut on_step: impl FnMut(&StepReport)) -> Result<Vec<StepReport>, StepFailure> {
        let mut completed = Vec::with_capacity(Step::ALL.len());

        for step in Step::ALL {
            tracing::info!("Step {}", step);
            match self.run_step(step) {
                Ok(report) => {
                    tracing::info!("Step {}: {} ({})", step, report.outcome, report.detail);
                    on_step(&report);
                    completed.push(report);
                }
                Err(source) => {
                    tracing::error!("Step {} failed: {}", step, source);
                    return Err(StepFailure {
                        step,
                        completed,
                        source,
                    });
                }
            }
        }

        Ok(completed)
    }

    pub fn run_step(&self, step: Step) -> Result<StepReport, ProvisionError> {
        match step {
            Step::Account => self.ensure_account(),
            Step::Directories => self.ensure_directories(),
            Step::Ownership => self.set_ownership(),
            Step::Assets => self.install_assets(),
            Step::InitScript => self.install_init_script(),
            Step::Config => self.install_config(),
        }
    }

    /// Ensure the service account exists and is compatible.
    pub fn ensure_account(&self) -> Result<StepReport, ProvisionError> {
        let name = &self.account.name;
        let db = AccountDb::load(self.layout)?;

        if let AccountState::Present { uid, gid } = account::inspect(&db, self.account)? {
            return Ok(StepReport::new(
                Step::Account,
                Outcome::Unchanged,
                format!("{name} exists (uid {uid}, gid {gid})"),
            ));
        }

        let plan = account::plan_creation(&db, self.account)?;
        if !self.options.privileged {
            return Err(AccountCreationError::InsufficientPrivilege(name.clone()).into());
        }

        if plan.create_group {
            tracing::debug!("Creating group {} (gid {}) via {}", name, plan.gid, self.backend.name());
            self.backend.create_group(self.layout, name, plan.gid)?;
        }
        tracing::debug!("Creating user {} (uid {}) via {}", name, plan.uid, self.backend.name());
        self.backend.create_user(self.layout, self.account, plan.uid, plan.gid)?;

        // Re-read so a backend that silently did something else is caught here
        let db = AccountDb::load(self.layout)?;
        match account::inspect(&db, self.account)? {
            AccountState::Present { uid, gid } => Ok(StepReport::new(
                Step::Account,
                Outcome::Created,
                format!("created {name} (uid {uid}, gid {gid}) with {}", self.backend.name()),
            )),
            AccountState::Absent => Err(AccountCreationError::Conflict {
                name: name.clone(),
                reason: format!("{} reported success but the account is absent", self.backend.name()),
            }
            .into()),
        }
    }

    /// Ensure the log and data directories exist with mode 0755.
    pub fn ensure_directories(&self) -> Result<StepReport, ProvisionError> {
        let mut outcome = Outcome::Unchanged;
        let dirs = self.layout.owned_dirs();

        for dir in &dirs {
            let result = fsops::ensure_dir(dir, DIR_MODE)?;
            tracing::debug!("{}: {}", dir.display(), result);
            outcome = outcome.merge(result);
        }

        Ok(StepReport::new(Step::Directories, outcome, join_paths(&dirs)))
    }

    /// Hand both directories to the service account.
    ///
    /// IDs are resolved before any chown so a missing account changes nothing.
    pub fn set_ownership(&self) -> Result<StepReport, ProvisionError> {
        let name = &self.account.name;
        let db = AccountDb::load(self.layout)?;
        let user = db
            .user(name)
            .ok_or_else(|| FilesystemError::AccountMissing(name.clone()))?;
        let uid = user.uid;
        let gid = db.group(name).map(|g| g.gid).unwrap_or(user.gid);

        let mut outcome = Outcome::Unchanged;
        let dirs = self.layout.owned_dirs();
        for dir in &dirs {
            outcome = outcome.merge(fsops::set_owner(dir, uid, gid)?);
        }

        Ok(StepReport::new(
            Step::Ownership,
            outcome,
            format!("{name}:{name} ({uid}:{gid}) on {}", join_paths(&dirs)),
        ))
    }

    /// Copy fonts (and the logo when shipped) into the data directory.
    pub fn install_assets(&self) -> Result<StepReport, ProvisionError> {
        for font in self.source.missing_fonts() {
            tracing::warn!("Source bundle has no fonts/{}; receiptd will fail to start without it", font);
        }

        let dest = self.layout.fonts_dir();
        let existed = fsops::metadata(&dest)?.is_some();

        let stats = fsops::copy_tree(&self.source.fonts_dir(), &dest)?;
        let modes_fixed = fsops::chmod_tree(&dest, ASSET_MODE)?;

        let mut outcome = if !existed {
            Outcome::Created
        } else if modes_fixed > 0 {
            stats.outcome().merge(Outcome::Updated)
        } else {
            stats.outcome()
        };

        let mut detail = format!(
            "fonts: {} copied, {} unchanged, {} modes fixed",
            stats.copied, stats.unchanged, modes_fixed
        );

        if let Some(logo) = self.source.logo() {
            let result = fsops::install_file(logo, &self.layout.logo(), LOGO_MODE)?;
            outcome = outcome.merge(result);
            detail.push_str(&format!("; logo {result}"));
        }

        Ok(StepReport::new(Step::Assets, outcome, detail))
    }

    pub fn install_init_script(&self) -> Result<StepReport, ProvisionError> {
        let outcome = service::install_init_script(self.layout, self.source)?;
        Ok(StepReport::new(
            Step::InitScript,
            outcome,
            self.layout.rc_script().display().to_string(),
        ))
    }

    pub fn install_config(&self) -> Result<StepReport, ProvisionError> {
        if !self.options.install_config {
            return Ok(StepReport::new(Step::Config, Outcome::Skipped, "disabled"));
        }

        let Some(template) = self.source.config_template() else {
            return Ok(StepReport::new(
                Step::Config,
                Outcome::Skipped,
                "no receiptd.conf in source bundle",
            ));
        };

        let outcome = service::install_config(self.layout, template, self.options.overwrite_config)?;
        let dest = self.layout.config_file();
        let detail = match outcome {
            Outcome::Preserved => format!("{} kept (differs from template)", dest.display()),
            _ => dest.display().to_string(),
        };
        Ok(StepReport::new(Step::Config, outcome, detail))
    }
}

fn join_paths(paths: &[std::path::PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
