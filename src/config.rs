//! Tool configuration file (YAML or JSON)
//!
//! Every field is optional. Target paths are fixed and deliberately absent.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::account::{BackendKind, ServiceAccount, UidRange};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisionConfig {
    /// Directory holding fonts/ and the templates
    #[serde(default)]
    pub source_dir: Option<PathBuf>,

    /// Account backend; chosen per OS when unset
    #[serde(default)]
    pub backend: Option<BackendKind>,

    #[serde(default = "default_true")]
    pub install_config: bool,

    #[serde(default)]
    pub overwrite_config: bool,

    #[serde(default)]
    pub account: AccountConfig,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            source_dir: None,
            backend: None,
            install_config: true,
            overwrite_config: false,
            account: AccountConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountConfig {
    #[serde(default = "default_comment")]
    pub comment: String,

    #[serde(default = "default_shell")]
    pub shell: String,

    #[serde(default = "default_login_class")]
    pub login_class: String,

    #[serde(default = "default_uid_min")]
    pub uid_min: u32,

    #[serde(default = "default_uid_max")]
    pub uid_max: u32,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            comment: default_comment(),
            shell: default_shell(),
            login_class: default_login_class(),
            uid_min: default_uid_min(),
            uid_max: default_uid_max(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_comment() -> String {
    ServiceAccount::default().comment
}

fn default_shell() -> String {
    ServiceAccount::default().shell
}

fn default_login_class() -> String {
    ServiceAccount::default().login_class
}

fn default_uid_min() -> u32 {
    UidRange::RESERVED.min()
}

fn default_uid_max() -> u32 {
    UidRange::RESERVED.max()
}

impl ProvisionConfig {
    /// Resolve the desired service account from the account section
    pub fn service_account(&self) -> Result<ServiceAccount> {
        let uid_range = UidRange::new(self.account.uid_min, self.account.uid_max)
            .context("Invalid account.uid_min/uid_max")?;

        Ok(ServiceAccount {
            comment: self.account.comment.clone(),
            shell: self.account.shell.clone(),
            login_class: self.account.login_class.clone(),
            uid_range,
            ..ServiceAccount::default()
        })
    }

    pub fn backend(&self) -> BackendKind {
        self.backend.unwrap_or_default()
    }
}

/// Load the configuration file, or defaults when no path is given
pub fn load(path: Option<&Path>) -> Result<ProvisionConfig> {
    let Some(path) = path else {
        return Ok(ProvisionConfig::default());
    };

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;

    let config = match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "yaml" | "yml" => parse_yaml(&content),
        "json" => parse_json(&content),
        _ => parse_auto(&content),
    }
    .with_context(|| format!("Invalid config: {}", path.display()))?;

    tracing::debug!("Loaded config from {}", path.display());
    Ok(config)
}

fn parse_yaml(content: &str) -> Result<ProvisionConfig> {
    // An empty YAML document deserializes as unit, not as an empty map
    if content.trim().is_empty() {
        return Ok(ProvisionConfig::default());
    }
    serde_yaml::from_str(content).context("Failed to parse YAML config")
}

fn parse_json(content: &str) -> Result<ProvisionConfig> {
    serde_json::from_str(content).context("Failed to parse JSON config")
}

fn parse_auto(content: &str) -> Result<ProvisionConfig> {
    if content.trim_start().starts_with('{') {
        parse_json(content)
    } else {
        parse_yaml(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_no_file() {
        let config = load(None).unwrap();
        assert!(config.install_config);
        assert!(!config.overwrite_config);
        assert!(config.source_dir.is_none());
        assert_eq!(config.account.uid_min, 100);
        assert_eq!(config.account.uid_max, 999);
    }

    #[test]
    fn minimal_yaml() {
        let config = parse_yaml("backend: pw\n").unwrap();
        assert_eq!(config.backend(), BackendKind::Pw);
        assert_eq!(config.account.shell, "/usr/sbin/nologin");
        assert_eq!(config.account.login_class, "daemon");
    }

    #[test]
    fn full_yaml() {
        let yaml = r#"
source_dir: /usr/local/share/receiptd-provision
backend: shadow
install_config: false
overwrite_config: true
account:
  comment: "Receipt printer"
  shell: /bin/false
  uid_min: 200
  uid_max: 299
"#;
        let config = parse_yaml(yaml).unwrap();
        assert_eq!(
            config.source_dir.as_deref(),
            Some(Path::new("/usr/local/share/receiptd-provision"))
        );
        assert!(!config.install_config);
        assert!(config.overwrite_config);

        let account = config.service_account().unwrap();
        assert_eq!(account.name, "receiptd");
        assert_eq!(account.home, "/nonexistent");
        assert_eq!(account.comment, "Receipt printer");
        assert_eq!(account.shell, "/bin/false");
        assert_eq!(account.uid_range, UidRange::new(200, 299).unwrap());
    }

    #[test]
    fn json_detected_from_content() {
        let config = parse_auto(r#"{"overwrite_config": true, "account": {"uid_min": 500}}"#).unwrap();
        assert!(config.overwrite_config);
        assert_eq!(config.account.uid_min, 500);
        assert_eq!(config.account.uid_max, 999);
    }

    #[test]
    fn empty_file_is_defaults() {
        let config = parse_auto("\n").unwrap();
        assert!(config.install_config);
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(parse_yaml("log_dir: /tmp\n").is_err());
    }

    #[test]
    fn inverted_range_rejected() {
        let config = parse_yaml("account:\n  uid_min: 900\n  uid_max: 100\n").unwrap();
        assert!(config.service_account().is_err());
    }

    #[test]
    fn load_from_file_by_extension() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("provision.json");
        fs::write(&path, r#"{"install_config": false}"#).unwrap();

        let config = load(Some(&path)).unwrap();
        assert!(!config.install_config);
    }

    #[test]
    fn load_missing_file_names_path() {
        let err = load(Some(Path::new("/nonexistent/provision.yaml"))).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/provision.yaml"));
    }
}
