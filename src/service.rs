//! Init script and daemon configuration installs

use std::path::Path;

use crate::error::FilesystemError;
use crate::fsops::{self, Outcome};
use crate::paths::{HostLayout, CONFIG_MODE, RC_SCRIPT_MODE};
use crate::source::SourceBundle;

/// Install the rc.d script, read/execute only.
pub fn install_init_script(layout: &HostLayout, source: &SourceBundle) -> Result<Outcome, FilesystemError> {
    let dest = layout.rc_script();
    let outcome = fsops::install_file(&source.rc_template(), &dest, RC_SCRIPT_MODE)?;
    tracing::debug!("init script {}: {}", dest.display(), outcome);
    Ok(outcome)
}

/// Install the daemon configuration from `template`.
///
/// A differing config already on the host is kept unless `overwrite` is set;
/// its mode is normalized either way unless it is a symlink.
pub fn install_config(layout: &HostLayout, template: &Path, overwrite: bool) -> Result<Outcome, FilesystemError> {
    let dest = layout.config_file();

    let Some(meta) = fsops::metadata(&dest)? else {
        return fsops::install_file(template, &dest, CONFIG_MODE);
    };

    if meta.is_dir() {
        return Err(FilesystemError::PathConflict {
            path: dest,
            expected: "file",
        });
    }

    let is_link = meta.file_type().is_symlink();
    if overwrite || (!is_link && fsops::same_content(template, &dest)?) {
        return fsops::install_file(template, &dest, CONFIG_MODE);
    }

    tracing::warn!(
        "{} differs from the template; keeping it (use --overwrite-config to replace)",
        dest.display()
    );
    if !is_link && fsops::mode_of(&meta) != CONFIG_MODE {
        fsops::set_mode(&dest, CONFIG_MODE)?;
    }
    Ok(Outcome::Preserved)
}
