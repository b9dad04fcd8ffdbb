use std::{
    env, fs,
    path::{Path, PathBuf},
};

#[derive(Debug, thiserror::Error)]
pub enum HomeDirError {
    #[error("{0} environment variable is not set")]
    BaseMissing(&'static str),
    #[error("home_dir must be an absolute path (after ~ expansion): {0}")]
    AbsoluteRequired(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(target_os = "windows")]
const USER_HOME_VARS: &[&str] = &["USERPROFILE", "HOME"];
#[cfg(not(target_os = "windows"))]
const USER_HOME_VARS: &[&str] = &["HOME"];

#[cfg(target_os = "windows")]
const DEFAULT_BASE_VAR: &str = "APPDATA";
#[cfg(not(target_os = "windows"))]
const DEFAULT_BASE_VAR: &str = "HOME";

/// Resolve the host's home directory.
///
/// A configured value may start with `~` and must be absolute after expansion.
/// Without one, `<base>/<default_subdir>` is used, where base is `%APPDATA%`
/// on Windows and `$HOME` elsewhere. With `create`, the directory is created.
pub fn resolve_home_dir(
    config_home: Option<String>,
    default_subdir: &str,
    create: bool,
) -> Result<PathBuf, HomeDirError> {
    let user_home = USER_HOME_VARS
        .iter()
        .find_map(|var| env::var_os(var))
        .map(PathBuf::from);
    let default_base = env::var_os(DEFAULT_BASE_VAR).map(PathBuf::from);

    let path = resolve_with(config_home, default_subdir, user_home, default_base)?;
    if create {
        fs::create_dir_all(&path)?;
    }
    Ok(path)
}

fn resolve_with(
    config_home: Option<String>,
    default_subdir: &str,
    user_home: Option<PathBuf>,
    default_base: Option<PathBuf>,
) -> Result<PathBuf, HomeDirError> {
    let Some(raw) = config_home.filter(|raw| !raw.trim().is_empty()) else {
        let base = default_base.ok_or(HomeDirError::BaseMissing(DEFAULT_BASE_VAR))?;
        return Ok(base.join(default_subdir));
    };

    let expanded = match raw.strip_prefix('~') {
        Some(rest) => {
            let home = user_home.ok_or(HomeDirError::BaseMissing(USER_HOME_VARS[0]))?;
            let rest = rest.trim_start_matches(['/', '\\']);
            if rest.is_empty() {
                home
            } else {
                home.join(rest)
            }
        }
        None => PathBuf::from(&raw),
    };

    if !expanded.is_absolute() {
        return Err(HomeDirError::AbsoluteRequired(
            expanded.to_string_lossy().into_owned(),
        ));
    }
    Ok(expanded)
}

/// Anchor `path` at `base` unless it is already absolute.
pub fn anchor(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
