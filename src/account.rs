//! Service account database and creation backends
//!
//! The account database is read straight from `<root>/etc/passwd` and
//! `<root>/etc/group` so a staged root can be inspected without touching the
//! running system. Creation is delegated to the platform's account tools.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

use crate::cmd;
use crate::error::AccountCreationError;
use crate::paths::{HostLayout, SERVICE_NAME};

/// Inclusive numeric range service account IDs are drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UidRange {
    min: u32,
    max: u32,
}

impl UidRange {
    /// Range reserved for system daemons
    pub const RESERVED: UidRange = UidRange { min: 100, max: 999 };

    pub fn new(min: u32, max: u32) -> Result<Self, AccountCreationError> {
        if min > max {
            return Err(AccountCreationError::InvalidRange { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn contains(&self, id: u32) -> bool {
        (self.min..=self.max).contains(&id)
    }

    fn exhausted(&self) -> AccountCreationError {
        AccountCreationError::RangeExhausted {
            min: self.min,
            max: self.max,
        }
    }
}

impl Default for UidRange {
    fn default() -> Self {
        Self::RESERVED
    }
}

/// One line of a passwd(5) file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub comment: String,
    pub home: String,
    pub shell: String,
}

impl PasswdEntry {
    pub fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 7 {
            return None;
        }

        Some(Self {
            name: fields[0].to_string(),
            uid: fields[2].parse().ok()?,
            gid: fields[3].parse().ok()?,
            comment: fields[4].to_string(),
            home: fields[5].to_string(),
            shell: fields[6].to_string(),
        })
    }
}

/// One line of a group(5) file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub name: String,
    pub gid: u32,
}

impl GroupEntry {
    pub fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 4 {
            return None;
        }

        Some(Self {
            name: fields[0].to_string(),
            gid: fields[2].parse().ok()?,
        })
    }
}

/// Desired shape of the daemon's account
#[derive(Debug, Clone)]
pub struct ServiceAccount {
    pub name: String,
    pub home: String,
    pub comment: String,
    pub shell: String,
    pub login_class: String,
    pub uid_range: UidRange,
}

impl Default for ServiceAccount {
    fn default() -> Self {
        Self {
            name: SERVICE_NAME.into(),
            home: "/nonexistent".into(),
            comment: "receiptd daemon".into(),
            shell: "/usr/sbin/nologin".into(),
            login_class: "daemon".into(),
            uid_range: UidRange::RESERVED,
        }
    }
}

/// Shells that refuse interactive sessions
pub fn is_login_disabled(shell: &str) -> bool {
    matches!(
        Path::new(shell).file_name().and_then(|n| n.to_str()),
        Some("nologin") | Some("false")
    )
}

/// Snapshot of the host's users and groups
#[derive(Debug, Clone, Default)]
pub struct AccountDb {
    users: Vec<PasswdEntry>,
    groups: Vec<GroupEntry>,
}

impl AccountDb {
    /// Load passwd and group from the host root. Missing files read as empty.
    pub fn load(layout: &HostLayout) -> Result<Self, AccountCreationError> {
        let passwd = read_optional(&layout.passwd())?;
        let group = read_optional(&layout.group())?;
        Ok(Self::parse(&passwd, &group))
    }

    pub fn parse(passwd: &str, group: &str) -> Self {
        Self {
            users: entries(passwd).filter_map(PasswdEntry::parse).collect(),
            groups: entries(group).filter_map(GroupEntry::parse).collect(),
        }
    }

    pub fn user(&self, name: &str) -> Option<&PasswdEntry> {
        self.users.iter().find(|u| u.name == name)
    }

    pub fn group(&self, name: &str) -> Option<&GroupEntry> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn uid_in_use(&self, uid: u32) -> bool {
        self.users.iter().any(|u| u.uid == uid)
    }

    pub fn gid_in_use(&self, gid: u32) -> bool {
        self.groups.iter().any(|g| g.gid == gid)
    }

    /// Lowest ID in `range` free both as a UID and as a GID
    pub fn allocate_id(&self, range: UidRange) -> Option<u32> {
        (range.min..=range.max).find(|id| !self.uid_in_use(*id) && !self.gid_in_use(*id))
    }

    /// Lowest ID in `range` free as a UID
    pub fn allocate_uid(&self, range: UidRange) -> Option<u32> {
        (range.min..=range.max).find(|id| !self.uid_in_use(*id))
    }
}

fn read_optional(path: &Path) -> Result<String, AccountCreationError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(source) => Err(AccountCreationError::Database {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn entries(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
}

/// Current state of the service account on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountState {
    Absent,
    Present { uid: u32, gid: u32 },
}

/// Compare the host's account against the desired one.
///
/// An existing account is accepted only if it cannot log in, sits inside the
/// reserved range, and has the service group as its primary group.
pub fn inspect(db: &AccountDb, account: &ServiceAccount) -> Result<AccountState, AccountCreationError> {
    let Some(user) = db.user(&account.name) else {
        return Ok(AccountState::Absent);
    };

    let conflict = |reason: String| AccountCreationError::Conflict {
        name: account.name.clone(),
        reason,
    };

    if !account.uid_range.contains(user.uid) {
        return Err(conflict(format!(
            "UID {} is outside {}-{}",
            user.uid, account.uid_range.min, account.uid_range.max
        )));
    }

    if !is_login_disabled(&user.shell) {
        return Err(conflict(format!("shell {} permits interactive login", user.shell)));
    }

    match db.group(&account.name) {
        None => Err(conflict(format!("group '{}' does not exist", account.name))),
        Some(group) if group.gid != user.gid => Err(conflict(format!(
            "primary GID {} is not group '{}' ({})",
            user.gid, group.name, group.gid
        ))),
        Some(group) => Ok(AccountState::Present {
            uid: user.uid,
            gid: group.gid,
        }),
    }
}

/// IDs chosen for a new account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountPlan {
    pub uid: u32,
    pub gid: u32,
    pub create_group: bool,
}

/// Pick IDs for a new account, reusing a pre-existing service group.
pub fn plan_creation(db: &AccountDb, account: &ServiceAccount) -> Result<AccountPlan, AccountCreationError> {
    let range = account.uid_range;

    if let Some(group) = db.group(&account.name) {
        // Keep UID == GID when the group's ID is usable as a UID
        let uid = if range.contains(group.gid) && !db.uid_in_use(group.gid) {
            group.gid
        } else {
            db.allocate_uid(range).ok_or_else(|| range.exhausted())?
        };
        return Ok(AccountPlan {
            uid,
            gid: group.gid,
            create_group: false,
        });
    }

    let id = db.allocate_id(range).ok_or_else(|| range.exhausted())?;
    Ok(AccountPlan {
        uid: id,
        gid: id,
        create_group: true,
    })
}

/// Platform tool used to add users and groups
pub trait AccountBackend {
    fn name(&self) -> &'static str;

    fn create_group(&self, layout: &HostLayout, name: &str, gid: u32) -> Result<(), AccountCreationError>;

    fn create_user(
        &self,
        layout: &HostLayout,
        account: &ServiceAccount,
        uid: u32,
        gid: u32,
    ) -> Result<(), AccountCreationError>;
}

/// Available account backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// FreeBSD pw(8)
    Pw,
    /// shadow-utils groupadd(8)/useradd(8)
    Shadow,
}

impl Default for BackendKind {
    fn default() -> Self {
        if cfg!(target_os = "freebsd") {
            BackendKind::Pw
        } else {
            BackendKind::Shadow
        }
    }
}

impl BackendKind {
    pub fn create(self) -> Box<dyn AccountBackend> {
        match self {
            BackendKind::Pw => Box::new(Pw),
            BackendKind::Shadow => Box::new(Shadow),
        }
    }
}

fn require(backend: &'static str, program: &'static str) -> Result<(), AccountCreationError> {
    which::which(program)
        .map(|_| ())
        .map_err(|_| AccountCreationError::BackendUnavailable { backend, program })
}

fn run_backend(backend: &'static str, program: &str, args: &[String]) -> Result<(), AccountCreationError> {
    cmd::run(program, args).map_err(|source| AccountCreationError::Backend { backend, source })
}

pub struct Pw;

impl Pw {
    fn base_args(layout: &HostLayout) -> Vec<String> {
        if layout.is_live() {
            Vec::new()
        } else {
            vec!["-R".into(), layout.root().to_string_lossy().into_owned()]
        }
    }

    fn groupadd_args(layout: &HostLayout, name: &str, gid: u32) -> Vec<String> {
        let mut args = Self::base_args(layout);
        args.extend(["groupadd".into(), name.into(), "-g".into(), gid.to_string()]);
        args
    }

    fn useradd_args(layout: &HostLayout, account: &ServiceAccount, uid: u32, gid: u32) -> Vec<String> {
        let mut args = Self::base_args(layout);
        args.extend([
            "useradd".into(),
            account.name.clone(),
            "-u".into(),
            uid.to_string(),
            "-g".into(),
            gid.to_string(),
            "-d".into(),
            account.home.clone(),
            "-c".into(),
            account.comment.clone(),
            "-L".into(),
            account.login_class.clone(),
            "-s".into(),
            account.shell.clone(),
            "-w".into(),
            "no".into(),
        ]);
        args
    }
}

impl AccountBackend for Pw {
    fn name(&self) -> &'static str {
        "pw"
    }

    fn create_group(&self, layout: &HostLayout, name: &str, gid: u32) -> Result<(), AccountCreationError> {
        require(self.name(), "pw")?;
        run_backend(self.name(), "pw", &Self::groupadd_args(layout, name, gid))
    }

    fn create_user(
        &self,
        layout: &HostLayout,
        account: &ServiceAccount,
        uid: u32,
        gid: u32,
    ) -> Result<(), AccountCreationError> {
        require(self.name(), "pw")?;
        run_backend(self.name(), "pw", &Self::useradd_args(layout, account, uid, gid))
    }
}

pub struct Shadow;

impl Shadow {
    fn base_args(layout: &HostLayout) -> Vec<String> {
        if layout.is_live() {
            Vec::new()
        } else {
            vec!["--root".into(), layout.root().to_string_lossy().into_owned()]
        }
    }

    fn groupadd_args(layout: &HostLayout, name: &str, gid: u32) -> Vec<String> {
        let mut args = Self::base_args(layout);
        args.extend(["--system".into(), "-g".into(), gid.to_string(), name.into()]);
        args
    }

    // useradd has no login classes; the field is ignored here
    fn useradd_args(layout: &HostLayout, account: &ServiceAccount, uid: u32, gid: u32) -> Vec<String> {
        let mut args = Self::base_args(layout);
        args.extend([
            "--system".into(),
            "--no-create-home".into(),
            "-u".into(),
            uid.to_string(),
            "-g".into(),
            gid.to_string(),
            "-d".into(),
            account.home.clone(),
            "-c".into(),
            account.comment.clone(),
            "-s".into(),
            account.shell.clone(),
            account.name.clone(),
        ]);
        args
    }
}

impl AccountBackend for Shadow {
    fn name(&self) -> &'static str {
        "shadow"
    }

    fn create_group(&self, layout: &HostLayout, name: &str, gid: u32) -> Result<(), AccountCreationError> {
        require(self.name(), "groupadd")?;
        run_backend(self.name(), "groupadd", &Self::groupadd_args(layout, name, gid))
    }

    fn create_user(
        &self,
        layout: &HostLayout,
        account: &ServiceAccount,
        uid: u32,
        gid: u32,
    ) -> Result<(), AccountCreationError> {
        require(self.name(), "useradd")?;
        run_backend(self.name(), "useradd", &Self::useradd_args(layout, account, uid, gid))
    }
}
