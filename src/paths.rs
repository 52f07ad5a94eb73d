use std::path::{Path, PathBuf};

/// Name shared by the service account, its group, and the rc.d script
pub const SERVICE_NAME: &str = "receiptd";

/// Log directory, relative to the host root
pub const LOG_DIR: &str = "var/log/receiptd";

/// Data directory (fonts, logo), relative to the host root
pub const DATA_DIR: &str = "var/receiptd";

/// Init script location, relative to the host root
pub const RC_SCRIPT: &str = "etc/rc.d/receiptd";

/// Daemon configuration file, relative to the host root
pub const CONFIG_FILE: &str = "etc/receiptd.conf";

pub const PASSWD_FILE: &str = "etc/passwd";
pub const GROUP_FILE: &str = "etc/group";

/// Source bundle entries
pub const FONTS_SOURCE: &str = "fonts";
pub const RC_TEMPLATE: &str = "receiptd.rc.d";
pub const CONFIG_TEMPLATE: &str = "receiptd.conf";
pub const LOGO_SOURCE: &str = "logo.svg";

pub const DIR_MODE: u32 = 0o755;
pub const ASSET_MODE: u32 = 0o755;
pub const LOGO_MODE: u32 = 0o644;
pub const RC_SCRIPT_MODE: u32 = 0o555;
pub const CONFIG_MODE: u32 = 0o664;

/// Fonts the daemon loads from `<data dir>/fonts` at startup
pub const REQUIRED_FONTS: &[&str] = &[
    "NotoSans-Regular.ttf",
    "NotoSans-Bold.ttf",
    "NotoSansMono-Regular.ttf",
];

/// Resolves the fixed receiptd paths beneath a host root.
///
/// Production runs use `/`; tests point this at a scratch directory.
#[derive(Debug, Clone)]
pub struct HostLayout {
    root: PathBuf,
}

impl HostLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True when the layout addresses the running system rather than a staged root
    pub fn is_live(&self) -> bool {
        self.root == Path::new("/")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join(LOG_DIR)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR)
    }

    pub fn fonts_dir(&self) -> PathBuf {
        self.data_dir().join(FONTS_SOURCE)
    }

    pub fn logo(&self) -> PathBuf {
        self.data_dir().join(LOGO_SOURCE)
    }

    pub fn rc_script(&self) -> PathBuf {
        self.root.join(RC_SCRIPT)
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn passwd(&self) -> PathBuf {
        self.root.join(PASSWD_FILE)
    }

    pub fn group(&self) -> PathBuf {
        self.root.join(GROUP_FILE)
    }

    /// Directories that must exist and belong to the service account
    pub fn owned_dirs(&self) -> [PathBuf; 2] {
        [self.log_dir(), self.data_dir()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_relative_to_root() {
        let layout = HostLayout::new("/mnt/target");
        assert_eq!(layout.log_dir(), Path::new("/mnt/target/var/log/receiptd"));
        assert_eq!(layout.data_dir(), Path::new("/mnt/target/var/receiptd"));
        assert_eq!(layout.rc_script(), Path::new("/mnt/target/etc/rc.d/receiptd"));
        assert_eq!(layout.config_file(), Path::new("/mnt/target/etc/receiptd.conf"));
        assert_eq!(layout.fonts_dir(), Path::new("/mnt/target/var/receiptd/fonts"));
    }

    #[test]
    fn live_root_paths() {
        let layout = HostLayout::new("/");
        assert!(layout.is_live());
        assert_eq!(layout.passwd(), Path::new("/etc/passwd"));
        assert_eq!(layout.rc_script(), Path::new("/etc/rc.d/receiptd"));
    }

    #[test]
    fn staged_root_is_not_live() {
        assert!(!HostLayout::new("/tmp/stage").is_live());
    }

    #[test]
    fn init_script_is_read_execute_only() {
        assert_eq!(RC_SCRIPT_MODE & 0o222, 0);
        assert_eq!(RC_SCRIPT_MODE & 0o111, 0o111);
    }
}
