/// Canonical file locations for the rotor control panel.
///
/// Both files live in one directory:
///   - config.toml  Connection settings, read at startup and written on save.
///   - status.toml  Session snapshot written for external presentation layers.
///
/// The directory is `$XDG_CONFIG_HOME/rotor-control`, falling back to
/// `$HOME/.config/rotor-control` and finally the working directory.
/// `ROTOR_CONTROL_CONFIG` overrides the config file path outright.
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "rotor-control";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";
pub const CONFIG_ENV_VAR: &str = "ROTOR_CONTROL_CONFIG";

/// Returns the application settings directory.
pub fn app_config_dir() -> PathBuf {
    resolve_app_dir(
        std::env::var_os("XDG_CONFIG_HOME").map(PathBuf::from),
        std::env::var_os("HOME").map(PathBuf::from),
    )
}

fn resolve_app_dir(xdg_config_home: Option<PathBuf>, home: Option<PathBuf>) -> PathBuf {
    match (xdg_config_home, home) {
        (Some(xdg), _) if xdg.is_absolute() => xdg.join(APP_DIR_NAME),
        (_, Some(home)) => home.join(".config").join(APP_DIR_NAME),
        _ => PathBuf::from("."),
    }
}

/// Returns the config file path, honouring the `ROTOR_CONTROL_CONFIG` override.
pub fn config_file_path() -> PathBuf {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(p) if !p.is_empty() => PathBuf::from(p),
        _ => app_config_dir().join(CONFIG_FILE_NAME),
    }
}

/// Returns the status file path, next to whichever config file is in use.
pub fn status_file_path(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(dir) => dir.join(STATUS_FILE_NAME),
        None => PathBuf::from(STATUS_FILE_NAME),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xdg_config_home_wins_over_home() {
        let dir = resolve_app_dir(Some("/xdg".into()), Some("/home/op".into()));
        assert_eq!(dir, PathBuf::from("/xdg/rotor-control"));
    }

    #[test]
    fn relative_xdg_config_home_is_ignored() {
        let dir = resolve_app_dir(Some("relative".into()), Some("/home/op".into()));
        assert_eq!(dir, PathBuf::from("/home/op/.config/rotor-control"));
    }

    #[test]
    fn falls_back_to_working_directory() {
        assert_eq!(resolve_app_dir(None, None), PathBuf::from("."));
    }

    #[test]
    fn status_file_shares_config_directory() {
        let config = PathBuf::from("/etc/rotor/config.toml");
        let status = status_file_path(&config);
        assert_eq!(status.parent(), config.parent());
        assert_eq!(status.file_name().unwrap(), STATUS_FILE_NAME);
    }
}
