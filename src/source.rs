//! Provisioning source bundle
//!
//! A directory holding the artifacts that get installed onto the host.

use std::path::{Path, PathBuf};

use crate::error::FilesystemError;
use crate::paths::{CONFIG_TEMPLATE, FONTS_SOURCE, LOGO_SOURCE, RC_TEMPLATE, REQUIRED_FONTS};

#[derive(Debug, Clone)]
pub struct SourceBundle {
    dir: PathBuf,
    config_template: Option<PathBuf>,
    logo: Option<PathBuf>,
}

impl SourceBundle {
    /// Validate `dir` as a source bundle without touching the host.
    ///
    /// `fonts/` and the init script template are required; the config
    /// template and the logo are picked up when present.
    pub fn locate(dir: impl Into<PathBuf>) -> Result<Self, FilesystemError> {
        let dir = dir.into();

        let fonts = dir.join(FONTS_SOURCE);
        if !fonts.is_dir() {
            return Err(FilesystemError::MissingSource { path: fonts });
        }

        let rc = dir.join(RC_TEMPLATE);
        if !rc.is_file() {
            return Err(FilesystemError::MissingSource { path: rc });
        }

        let config_template = Some(dir.join(CONFIG_TEMPLATE)).filter(|p| p.is_file());
        let logo = Some(dir.join(LOGO_SOURCE)).filter(|p| p.is_file());

        Ok(Self {
            dir,
            config_template,
            logo,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn fonts_dir(&self) -> PathBuf {
        self.dir.join(FONTS_SOURCE)
    }

    pub fn rc_template(&self) -> PathBuf {
        self.dir.join(RC_TEMPLATE)
    }

    pub fn config_template(&self) -> Option<&Path> {
        self.config_template.as_deref()
    }

    pub fn logo(&self) -> Option<&Path> {
        self.logo.as_deref()
    }

    /// Fonts the daemon needs that the bundle does not ship
    pub fn missing_fonts(&self) -> Vec<&'static str> {
        missing_fonts_in(&self.fonts_dir())
    }
}

/// Required font files absent from `dir`
pub fn missing_fonts_in(dir: &Path) -> Vec<&'static str> {
    REQUIRED_FONTS
        .iter()
        .copied()
        .filter(|name| !dir.join(name).is_file())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn bundle(dir: &Path) {
        fs::create_dir_all(dir.join("fonts")).unwrap();
        fs::write(dir.join("receiptd.rc.d"), "#!/bin/sh\n").unwrap();
    }

    #[test]
    fn locate_minimal_bundle() {
        let tmp = tempfile::tempdir().unwrap();
        bundle(tmp.path());

        let source = SourceBundle::locate(tmp.path()).unwrap();
        assert_eq!(source.fonts_dir(), tmp.path().join("fonts"));
        assert!(source.config_template().is_none());
        assert!(source.logo().is_none());
    }

    #[test]
    fn optional_artifacts_are_detected() {
        let tmp = tempfile::tempdir().unwrap();
        bundle(tmp.path());
        fs::write(tmp.path().join("receiptd.conf"), "port=8080\n").unwrap();
        fs::write(tmp.path().join("logo.svg"), "<svg/>").unwrap();

        let source = SourceBundle::locate(tmp.path()).unwrap();
        assert_eq!(source.config_template(), Some(tmp.path().join("receiptd.conf").as_path()));
        assert_eq!(source.logo(), Some(tmp.path().join("logo.svg").as_path()));
    }

    #[test]
    fn missing_fonts_dir_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("receiptd.rc.d"), "").unwrap();

        match SourceBundle::locate(tmp.path()) {
            Err(FilesystemError::MissingSource { path }) => assert!(path.ends_with("fonts")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn missing_rc_template_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("fonts")).unwrap();

        match SourceBundle::locate(tmp.path()) {
            Err(FilesystemError::MissingSource { path }) => assert!(path.ends_with("receiptd.rc.d")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn lists_missing_required_fonts() {
        let tmp = tempfile::tempdir().unwrap();
        bundle(tmp.path());
        fs::write(tmp.path().join("fonts/NotoSans-Regular.ttf"), b"ttf").unwrap();

        let source = SourceBundle::locate(tmp.path()).unwrap();
        assert_eq!(
            source.missing_fonts(),
            vec!["NotoSans-Bold.ttf", "NotoSansMono-Regular.ttf"]
        );
    }
}
