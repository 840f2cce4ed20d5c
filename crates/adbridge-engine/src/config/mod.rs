//! Configuration for the bridge
//!
//! Supports:
//! - `<config dir>/adbridge/config.toml` - daemon endpoint, timeouts, monitor behavior
//! - `ANDROID_ADB_SERVER_PORT` - overrides the daemon port

pub mod settings;
pub mod types;

pub use settings::{
    apply_env_overrides, default_config_path, load_default_settings, load_settings,
    save_settings, ADB_SERVER_PORT_ENV,
};
pub use types::*;
