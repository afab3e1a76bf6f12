//! Platform-specific data directory paths.

use std::path::PathBuf;

/// Data directory for logs and config.
pub fn get_data_dir() -> PathBuf {
    get_config_base().join("ptt-daemon").join("data")
}

pub fn get_config_path() -> PathBuf {
    get_data_dir().join("config.json")
}

fn get_config_base() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join("Library").join("Application Support")
    }

    #[cfg(not(target_os = "macos"))]
    {
        if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg);
        }
        dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".config")
    }
}
