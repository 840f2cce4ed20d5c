//! Settings loading and saving

use std::path::{Path, PathBuf};

use adbridge_core::prelude::*;

use super::types::Settings;

const CONFIG_FILENAME: &str = "config.toml";
const ADBRIDGE_DIR: &str = "adbridge";

/// Environment variable the adb tools use to relocate the daemon port.
pub const ADB_SERVER_PORT_ENV: &str = "ANDROID_ADB_SERVER_PORT";

/// `<config dir>/adbridge/config.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(ADBRIDGE_DIR).join(CONFIG_FILENAME))
}

/// Load settings from the default location.
pub fn load_default_settings() -> Settings {
    match default_config_path() {
        Some(path) => load_settings(&path),
        None => {
            debug!("No config directory on this platform, using defaults");
            let mut settings = Settings::default();
            apply_env_overrides(&mut settings);
            settings
        }
    }
}

/// Load settings from `config_path`.
///
/// A missing or unreadable file yields defaults. Environment overrides are
/// applied either way.
pub fn load_settings(config_path: &Path) -> Settings {
    let mut settings = if !config_path.exists() {
        debug!("No config file at {:?}, using defaults", config_path);
        Settings::default()
    } else {
        match std::fs::read_to_string(config_path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(settings) => {
                    debug!("Loaded settings from {:?}", config_path);
                    settings
                }
                Err(e) => {
                    warn!("Failed to parse {:?}: {}", config_path, e);
                    Settings::default()
                }
            },
            Err(e) => {
                warn!("Failed to read {:?}: {}", config_path, e);
                Settings::default()
            }
        }
    };
    apply_env_overrides(&mut settings);
    settings
}

/// Apply `ANDROID_ADB_SERVER_PORT` when it holds a valid port.
pub fn apply_env_overrides(settings: &mut Settings) {
    let Ok(value) = std::env::var(ADB_SERVER_PORT_ENV) else {
        return;
    };
    match value.trim().parse::<u16>() {
        Ok(port) if port > 0 => {
            debug!("Using daemon port {} from {}", port, ADB_SERVER_PORT_ENV);
            settings.daemon.port = port;
        }
        _ => warn!(
            "Ignoring {}={:?}: not a valid port",
            ADB_SERVER_PORT_ENV, value
        ),
    }
}

/// Write settings to `config_path`, creating parent directories.
pub fn save_settings(config_path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::config(format!("Failed to create config dir: {}", e)))?;
    }

    let content = toml::to_string_pretty(settings)
        .map_err(|e| Error::config(format!("Failed to serialize settings: {}", e)))?;
    let full_content = format!("# adbridge configuration\n\n{}", content);

    // Atomic write: write to temp, then rename
    let temp_path = config_path.with_extension("toml.tmp");
    std::fs::write(&temp_path, &full_content)
        .map_err(|e| Error::config(format!("Failed to write temp file: {}", e)))?;
    std::fs::rename(&temp_path, config_path)
        .map_err(|e| Error::config(format!("Failed to rename temp file: {}", e)))?;

    info!("Saved settings to {:?}", config_path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    #[serial]
    fn test_load_settings_defaults() {
        std::env::remove_var(ADB_SERVER_PORT_ENV);
        let temp = tempdir().unwrap();
        let settings = load_settings(&temp.path().join(CONFIG_FILENAME));
        assert_eq!(settings, Settings::default());
    }

    #[test]
    #[serial]
    fn test_load_settings_custom() {
        std::env::remove_var(ADB_SERVER_PORT_ENV);
        let temp = tempdir().unwrap();
        let path = temp.path().join(CONFIG_FILENAME);
        std::fs::write(
            &path,
            r#"
[daemon]
port = 5039

[monitor]
debug_port_base = 8700
"#,
        )
        .unwrap();

        let settings = load_settings(&path);
        assert_eq!(settings.daemon.port, 5039);
        assert_eq!(settings.monitor.debug_port_base, 8700);
        assert_eq!(settings.daemon.host, "127.0.0.1");
    }

    #[test]
    #[serial]
    fn test_load_settings_invalid_toml() {
        std::env::remove_var(ADB_SERVER_PORT_ENV);
        let temp = tempdir().unwrap();
        let path = temp.path().join(CONFIG_FILENAME);
        std::fs::write(&path, "this is [not valid").unwrap();
        assert_eq!(load_settings(&path), Settings::default());
    }

    #[test]
    #[serial]
    fn test_env_port_override() {
        std::env::set_var(ADB_SERVER_PORT_ENV, "5555");
        let temp = tempdir().unwrap();
        let settings = load_settings(&temp.path().join(CONFIG_FILENAME));
        std::env::remove_var(ADB_SERVER_PORT_ENV);
        assert_eq!(settings.daemon.port, 5555);
    }

    #[test]
    #[serial]
    fn test_env_port_override_ignores_garbage() {
        std::env::set_var(ADB_SERVER_PORT_ENV, "not-a-port");
        let mut settings = Settings::default();
        apply_env_overrides(&mut settings);
        std::env::remove_var(ADB_SERVER_PORT_ENV);
        assert_eq!(settings.daemon.port, 5037);
    }

    #[test]
    #[serial]
    fn test_save_then_load() {
        std::env::remove_var(ADB_SERVER_PORT_ENV);
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join(CONFIG_FILENAME);
        let mut settings = Settings::default();
        settings.monitor.max_reconnect_attempts = Some(5);
        settings.timeouts.shell_inactivity_ms = 0;

        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path), settings);
    }
}
