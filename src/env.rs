//! Environment constants and path utilities.
//!
//! Centralizes configuration file names, discovery locations and the labels
//! put on every managed container.

use std::path::{Path, PathBuf};

/// Hidden per-directory configuration folder
pub const HACKENV_DIR_NAME: &str = ".hackenv";

/// Configuration file name inside [`HACKENV_DIR_NAME`]
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Stand-alone configuration file in the working directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "hackenv.toml";

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV_VAR: &str = "HACKENV_CONFIG";

/// System-wide configuration file
pub const SYSTEM_CONFIG_FILE: &str = "/etc/hackenv/config.toml";

/// Set to `1` to skip tests that need a container daemon
pub const SKIP_CONTAINER_TESTS_ENV_VAR: &str = "SKIP_CONTAINER_TESTS";

/// Labels attached to managed containers
pub mod labels {
    /// Marks a container as created by this crate
    pub const MANAGED: &str = "hackenv.managed";

    pub const INSTANCE: &str = "hackenv.instance";

    pub const TEMPLATE: &str = "hackenv.template";

    pub const SPEC: &str = "hackenv.spec";
}

/// Build config directory path in user's home directory
pub fn user_config_dir_path(home_dir: &Path) -> PathBuf {
    home_dir.join(HACKENV_DIR_NAME)
}

/// Build config file path in user's home directory
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    user_config_dir_path(home_dir).join(CONFIG_FILE_NAME)
}

/// Build local config file path in current directory
pub fn local_config_file_path(current_dir: &Path) -> PathBuf {
    current_dir.join(HACKENV_DIR_NAME).join(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_paths() {
        let home_dir = Path::new("/home/user");
        let current_dir = Path::new("/current/project");

        assert_eq!(
            user_config_file_path(home_dir),
            Path::new("/home/user/.hackenv/config.toml")
        );

        assert_eq!(
            local_config_file_path(current_dir),
            Path::new("/current/project/.hackenv/config.toml")
        );
    }
}
