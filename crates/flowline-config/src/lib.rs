//! Configuration system for the Flowline pipeline engine.
//!
//! Provides TOML-based configuration with:
//! - Workspace layout (`[workspace]`): root directory and the trigger root
//!   that holds `*.intent.json` pipeline documents
//! - Runner defaults (`[runner]`)
//! - Trigger manager tuning (`[triggers]`): webhook listener, cooldowns, chaining
//! - User capability overrides (`[[mappings]]`)
//! - Config file layering (XDG user config + project-local overrides)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    LoadedConfig, load_config, load_config_file, load_config_with_options, save_config,
    xdg_config_dir, xdg_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
